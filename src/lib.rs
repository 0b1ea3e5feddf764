//! querysmith: natural-language questions to validated, reflected SQL.

pub mod config;
pub mod db;
pub mod error;
pub mod execution;
pub mod explain;
pub mod intent;
pub mod llm;
pub mod orchestrator;
pub mod reflection;
pub mod resolver;
pub mod schema;
pub mod sql;

pub use config::EngineConfig;
pub use error::{QueryError, Result};
pub use orchestrator::{ConversionRequest, ConversionResponse, QueryEngine};
