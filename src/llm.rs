//! Text-generation service client
//!
//! Every model call site in the pipeline goes through [`TextGenerator`] so the
//! service can be swapped for a scripted fake in tests or disabled entirely.

use crate::config::LlmConfig;
use crate::error::{QueryError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, system_prompt: Option<&str>) -> Result<String>;
}

/// Generator used when no API key is configured. Every call fails, which sends
/// each call site down its non-model fallback.
#[derive(Debug, Default, Clone)]
pub struct DisabledGenerator;

#[async_trait]
impl TextGenerator for DisabledGenerator {
    async fn generate(&self, _prompt: &str, _system_prompt: Option<&str>) -> Result<String> {
        Err(QueryError::Llm("text generation is disabled (no API key configured)".to_string()))
    }
}

/// OpenAI-compatible chat completions client.
#[derive(Clone)]
pub struct LlmClient {
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    max_retries: u32,
    backoff_base: Duration,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| QueryError::Config("LLM API key is not set".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| QueryError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_retries: config.max_retries,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            client,
        })
    }

    fn request_body(&self, prompt: &str, system_prompt: Option<&str>) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(system) = system_prompt {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        messages.push(serde_json::json!({"role": "user", "content": prompt}));

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
        });

        // Reasoning models spend tokens before answering
        if self.model.starts_with("gpt-5") || self.model.contains("o1") {
            body["max_completion_tokens"] = serde_json::json!(2000);
        } else if self.model.starts_with("gpt-4") {
            body["max_completion_tokens"] = serde_json::json!(1000);
        } else {
            body["max_tokens"] = serde_json::json!(1000);
        }
        body
    }

    async fn call_once(&self, body: &serde_json::Value) -> std::result::Result<String, CallFailure> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                let retryable = e.is_timeout() || e.is_connect() || e.is_request();
                CallFailure::new(format!("LLM API call failed: {}", e), retryable)
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            let retryable = status.as_u16() == 429 || status.is_server_error();
            return Err(CallFailure::new(
                format!("LLM API error ({}): {}", status, error_text),
                retryable,
            ));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CallFailure::fatal(format!("Failed to parse LLM response: {}", e)))?;

        if let Some(error) = response_json.get("error") {
            return Err(CallFailure::fatal(format!("LLM API error: {}", error)));
        }

        let choice = response_json
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .ok_or_else(|| CallFailure::fatal("No choices in LLM response".to_string()))?;

        match choice.get("finish_reason").and_then(|r| r.as_str()) {
            Some("length") => warn!("LLM response was truncated due to length limit"),
            Some("content_filter") => {
                return Err(CallFailure::fatal(
                    "LLM response was filtered by content policy".to_string(),
                ))
            }
            _ => {}
        }

        let content = choice["message"]["content"].as_str().unwrap_or_default();
        if content.trim().is_empty() {
            return Err(CallFailure::fatal("Empty content in LLM response".to_string()));
        }
        Ok(content.to_string())
    }
}

#[async_trait]
impl TextGenerator for LlmClient {
    async fn generate(&self, prompt: &str, system_prompt: Option<&str>) -> Result<String> {
        let body = self.request_body(prompt, system_prompt);
        let mut attempt = 0u32;
        loop {
            match self.call_once(&body).await {
                Ok(content) => {
                    debug!(chars = content.len(), attempt, "LLM call succeeded");
                    return Ok(content);
                }
                Err(failure) if failure.retryable && attempt < self.max_retries => {
                    let delay = backoff_delay(self.backoff_base, attempt);
                    warn!(
                        "{} (retrying in {}ms, {} retries left)",
                        failure.message,
                        delay.as_millis(),
                        self.max_retries - attempt
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(failure) => return Err(QueryError::Llm(failure.message)),
            }
        }
    }
}

struct CallFailure {
    message: String,
    retryable: bool,
}

impl CallFailure {
    fn new(message: String, retryable: bool) -> Self {
        Self { message, retryable }
    }

    fn fatal(message: String) -> Self {
        Self::new(message, false)
    }
}

/// Exponential backoff: base, 2*base, 4*base, ... capped at 30s.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    base.saturating_mul(factor).min(Duration::from_secs(30))
}

/// Strip markdown code fences the model wraps around JSON.
pub fn clean_json_response(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```JSON")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Extract the first balanced `{...}` object from a model response.
pub fn extract_json_object(response: &str) -> Option<&str> {
    let cleaned = clean_json_response(response);
    let start = cleaned.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in cleaned[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&cleaned[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a model response into `T`, tolerating fences and surrounding prose.
pub fn parse_json_response<T: DeserializeOwned>(response: &str) -> Result<T> {
    let json = extract_json_object(response).ok_or_else(|| {
        QueryError::Llm(format!(
            "No JSON object in LLM response: {}",
            truncate(response, 200)
        ))
    })?;
    serde_json::from_str(json).map_err(|e| {
        QueryError::Llm(format!(
            "Failed to parse LLM response: {}. Response: {}",
            e,
            truncate(json, 200)
        ))
    })
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}
