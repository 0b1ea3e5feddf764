pub mod builder;
pub mod generator;
pub mod joins;
pub mod scanner;
pub mod validator;

pub use builder::{BuiltSql, SqlBuilder};
pub use generator::{extract_sql, GenerationContext, SqlGenerator};
pub use joins::{plan_joins, JoinPlan};
pub use scanner::{ScannedStatement, SqlScanner, StatementKind, TokenScanner};
pub use validator::{SqlValidator, ValidationReport};
