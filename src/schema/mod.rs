//! Schema discovery and caching

pub mod aliases;
pub mod cache;
pub mod fetcher;
pub mod types;

pub use cache::{Clock, ManualClock, SchemaCache, SystemClock};
pub use fetcher::{DriverSchemaFetcher, SchemaFetcher};
pub use types::{ColumnDef, ConnectionKey, Relationship, SchemaCacheEntry, SchemaSnapshot, TableDef};
