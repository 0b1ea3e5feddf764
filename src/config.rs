//! Engine configuration
//!
//! Values come from the environment (a `.env` file is loaded by the binary) with
//! defaults suitable for local use.

use crate::error::{QueryError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_LLM_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// API key for the text-generation service. `None` disables model calls.
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_LLM_BASE_URL.to_string(),
            model: DEFAULT_LLM_MODEL.to_string(),
            timeout_secs: 60,
            max_retries: 2,
            backoff_base_ms: 500,
            temperature: 0.1,
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub llm: LlmConfig,
    /// How long a fetched schema snapshot stays fresh.
    pub schema_ttl_secs: i64,
    /// Upper bound on critique passes per request.
    pub max_iterations: u32,
    /// Row cap injected into SELECT statements before execution.
    pub row_limit: u64,
    /// Rows returned by the unfiltered diagnostic sample query.
    pub diagnostic_sample_rows: u64,
    pub db_timeout_secs: u64,
    pub db_connect_retries: u32,
    /// Minimum reflection rating accepted without regeneration.
    pub min_reflection_rating: u8,
    pub allow_unfiltered_mutations: bool,
    /// Conversation turns forwarded to the intent prompt.
    pub history_turns: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            schema_ttl_secs: 3600,
            max_iterations: 3,
            row_limit: 1000,
            diagnostic_sample_rows: 5,
            db_timeout_secs: 30,
            db_connect_retries: 2,
            min_reflection_rating: 7,
            allow_unfiltered_mutations: false,
            history_turns: 5,
        }
    }
}

impl EngineConfig {
    /// Build configuration from environment variables.
    ///
    /// `OPENAI_API_KEY`, `OPENAI_BASE_URL` and `OPENAI_MODEL` configure the model
    /// endpoint; everything else is read from `QUERYSMITH_*` variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());

        let llm = LlmConfig {
            api_key,
            base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| defaults.llm.base_url.clone()),
            model: std::env::var("OPENAI_MODEL").unwrap_or_else(|_| defaults.llm.model.clone()),
            timeout_secs: env_parse("QUERYSMITH_LLM_TIMEOUT_SECS", defaults.llm.timeout_secs)?,
            max_retries: env_parse("QUERYSMITH_LLM_MAX_RETRIES", defaults.llm.max_retries)?,
            backoff_base_ms: env_parse("QUERYSMITH_LLM_BACKOFF_MS", defaults.llm.backoff_base_ms)?,
            temperature: env_parse("QUERYSMITH_LLM_TEMPERATURE", defaults.llm.temperature)?,
        };

        let config = Self {
            llm,
            schema_ttl_secs: env_parse("QUERYSMITH_SCHEMA_TTL_SECS", defaults.schema_ttl_secs)?,
            max_iterations: env_parse("QUERYSMITH_MAX_ITERATIONS", defaults.max_iterations)?,
            row_limit: env_parse("QUERYSMITH_ROW_LIMIT", defaults.row_limit)?,
            diagnostic_sample_rows: env_parse(
                "QUERYSMITH_DIAGNOSTIC_ROWS",
                defaults.diagnostic_sample_rows,
            )?,
            db_timeout_secs: env_parse("QUERYSMITH_DB_TIMEOUT_SECS", defaults.db_timeout_secs)?,
            db_connect_retries: env_parse(
                "QUERYSMITH_DB_CONNECT_RETRIES",
                defaults.db_connect_retries,
            )?,
            min_reflection_rating: env_parse(
                "QUERYSMITH_MIN_REFLECTION_RATING",
                defaults.min_reflection_rating,
            )?,
            allow_unfiltered_mutations: env_parse(
                "QUERYSMITH_ALLOW_UNFILTERED_MUTATIONS",
                defaults.allow_unfiltered_mutations,
            )?,
            history_turns: env_parse("QUERYSMITH_HISTORY_TURNS", defaults.history_turns)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(QueryError::Config(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if self.min_reflection_rating > 10 {
            return Err(QueryError::Config(format!(
                "min_reflection_rating must be within 0..=10, got {}",
                self.min_reflection_rating
            )));
        }
        if self.schema_ttl_secs < 0 {
            return Err(QueryError::Config("schema_ttl_secs cannot be negative".to_string()));
        }
        Ok(())
    }

    pub fn db_timeout(&self) -> Duration {
        Duration::from_secs(self.db_timeout_secs)
    }

    pub fn schema_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.schema_ttl_secs)
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| QueryError::Config(format!("Invalid value for {}: {} ({})", key, raw, e))),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.min_reflection_rating, 7);
        assert!(!config.allow_unfiltered_mutations);
    }

    #[test]
    fn zero_iterations_rejected() {
        let config = EngineConfig {
            max_iterations: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(QueryError::Config(_))));
    }

    #[test]
    fn env_parse_falls_back_to_default() {
        let value: u64 = env_parse("QUERYSMITH_TEST_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }
}
