use crate::error::{DashboardError, Result};
use crate::prompt::Prompt;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// A language-model completion service. Implementations must not execute SQL.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, prompt: &Prompt) -> Result<String>;
}

/// Chat-completions client for OpenAI-compatible endpoints.
#[derive(Clone)]
pub struct LlmClient {
    api_key: String,
    base_url: String,
    model: String,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Result<Self> {
        Self::with_timeout(api_key, model, base_url, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(
        api_key: String,
        model: String,
        base_url: String,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DashboardError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            http,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request_body(&self, prompt: &Prompt) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": prompt.system},
                {"role": "user", "content": prompt.user}
            ],
            "temperature": 0.0,
        });

        // Newer and reasoning models reject max_tokens
        if self.model.starts_with("gpt-5") || self.model.contains("o1") {
            body["max_completion_tokens"] = serde_json::json!(2000);
        } else if self.model.starts_with("gpt-4") {
            body["max_completion_tokens"] = serde_json::json!(500);
        } else {
            body["max_tokens"] = serde_json::json!(500);
        }

        body
    }
}

#[async_trait]
impl CompletionService for LlmClient {
    async fn complete(&self, prompt: &Prompt) -> Result<String> {
        debug!("Requesting completion from model {}", self.model);

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&self.request_body(prompt))
            .send()
            .await
            .map_err(|e| DashboardError::Generation(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(DashboardError::Generation(format!(
                "LLM API error ({}): {}",
                status, error_text
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| DashboardError::Generation(format!("Failed to parse LLM response: {}", e)))?;

        content_from_response(&response_json)
    }
}

/// Pulls the first choice's message content out of a chat-completions body.
fn content_from_response(response_json: &serde_json::Value) -> Result<String> {
    if let Some(error) = response_json.get("error") {
        return Err(DashboardError::Generation(format!("LLM API error: {}", error)));
    }

    let choice = response_json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|choices| choices.first())
        .ok_or_else(|| DashboardError::Generation("No choices in LLM response".to_string()))?;

    match choice.get("finish_reason").and_then(|r| r.as_str()) {
        Some("length") => warn!("LLM response was truncated due to length limit"),
        Some("content_filter") => {
            return Err(DashboardError::Generation(
                "LLM response was filtered by content policy".to_string(),
            ))
        }
        _ => {}
    }

    let content = choice["message"]["content"].as_str().unwrap_or_default();
    if content.trim().is_empty() {
        return Err(DashboardError::Generation("Empty content in LLM response".to_string()));
    }

    Ok(content.to_string())
}

/// Completion service that always answers with the same text.
///
/// Stands in for the model in tests and offline runs.
#[derive(Debug, Clone)]
pub struct FixedCompletion {
    response: String,
}

impl FixedCompletion {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
        }
    }
}

#[async_trait]
impl CompletionService for FixedCompletion {
    async fn complete(&self, _prompt: &Prompt) -> Result<String> {
        Ok(self.response.clone())
    }
}

const FENCE_LANGUAGES: [&str; 6] = ["sql", "sqlite", "sqlite3", "postgresql", "mysql", "plsql"];

/// Strips Markdown code fences and surrounding whitespace from a model reply.
pub fn extract_statement(raw: &str) -> Result<String> {
    let mut text = raw.trim();

    if let Some(rest) = text.strip_prefix("```") {
        let rest = rest.trim_end().trim_end_matches("```");
        // The info string may be followed by a newline or, on one-line fences, a space
        let word_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let info = &rest[..word_end];
        text = if FENCE_LANGUAGES.iter().any(|l| l.eq_ignore_ascii_case(info)) {
            &rest[word_end..]
        } else {
            rest
        };
    }

    let statement = text.trim();
    if statement.is_empty() {
        return Err(DashboardError::Generation(
            "Model returned no SQL statement".to_string(),
        ));
    }

    Ok(statement.to_string())
}
