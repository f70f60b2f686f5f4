//! Runtime settings
//!
//! Model credentials and endpoint come from the environment (a `.env` file is
//! honoured by the binary); command-line flags override them.

use crate::error::{DashboardError, Result};
use crate::llm::{LlmClient, DEFAULT_BASE_URL, DEFAULT_MODEL, DEFAULT_TIMEOUT_SECS};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl LlmSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let timeout_secs = match lookup("LLM_TIMEOUT_SECS") {
            Some(raw) => raw.trim().parse::<u64>().map_err(|e| {
                DashboardError::Config(format!("LLM_TIMEOUT_SECS '{}' is not a number: {}", raw, e))
            })?,
            None => DEFAULT_TIMEOUT_SECS,
        };

        Ok(Self {
            api_key: lookup("OPENAI_API_KEY").filter(|k| !k.trim().is_empty()),
            model: lookup("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: lookup("OPENAI_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            timeout: Duration::from_secs(timeout_secs),
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        if api_key.is_some() {
            self.api_key = api_key;
        }
        self
    }

    pub fn client(&self) -> Result<LlmClient> {
        let api_key = self.api_key.clone().ok_or_else(|| {
            DashboardError::Config("OPENAI_API_KEY is not set (use --api-key or .env)".to_string())
        })?;
        LlmClient::with_timeout(api_key, self.model.clone(), self.base_url.clone(), self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = LlmSettings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings.model, DEFAULT_MODEL);
        assert_eq!(settings.base_url, DEFAULT_BASE_URL);
        assert_eq!(settings.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert!(settings.api_key.is_none());
        assert!(matches!(settings.client(), Err(DashboardError::Config(_))));
    }

    #[test]
    fn test_env_and_flag_override() {
        let settings = LlmSettings::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "env-key"),
            ("OPENAI_MODEL", "gpt-4o"),
            ("LLM_TIMEOUT_SECS", "5"),
        ]))
        .unwrap();
        assert_eq!(settings.api_key.as_deref(), Some("env-key"));
        assert_eq!(settings.timeout, Duration::from_secs(5));

        let settings = settings.with_api_key(Some("flag-key".to_string()));
        assert_eq!(settings.api_key.as_deref(), Some("flag-key"));
        assert_eq!(settings.client().unwrap().model(), "gpt-4o");
    }

    #[test]
    fn test_bad_timeout_is_config_error() {
        assert!(matches!(
            LlmSettings::from_lookup(lookup(&[("LLM_TIMEOUT_SECS", "soon")])),
            Err(DashboardError::Config(_))
        ));
    }
}
