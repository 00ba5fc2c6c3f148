use crate::crew::{CrewSettings, ProcessMode, RetryPolicy};
use crate::error::ConfigError;
use std::env;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_LANGFUSE_HOST: &str = "https://cloud.langfuse.com";

/// Credentials and endpoint for the OpenAI-compatible backend
#[derive(Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub endpoint: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl fmt::Debug for OpenAiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiConfig")
            .field("api_key", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// Credentials for the Langfuse trace collector
#[derive(Clone)]
pub struct LangfuseConfig {
    pub host: String,
    pub public_key: String,
    pub secret_key: String,
}

impl fmt::Debug for LangfuseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LangfuseConfig")
            .field("host", &self.host)
            .field("public_key", &self.public_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub openai: OpenAiConfig,
    /// `None` means traces are only written to the log
    pub langfuse: Option<LangfuseConfig>,
    pub crew: CrewSettings,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_key = var("OPENAI_API_KEY")
            .ok_or_else(|| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))?;

        let openai = OpenAiConfig {
            api_key,
            endpoint: var("OPENAI_ENDPOINT").unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            model: var("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            timeout_secs: parse_number(&var, "OPENAI_TIMEOUT_SECS", 120)?,
        };

        let langfuse = match (var("LANGFUSE_PUBLIC_KEY"), var("LANGFUSE_SECRET_KEY")) {
            (Some(public_key), Some(secret_key)) => Some(LangfuseConfig {
                host: var("LANGFUSE_HOST")
                    .unwrap_or_else(|| DEFAULT_LANGFUSE_HOST.to_string())
                    .trim_end_matches('/')
                    .to_string(),
                public_key,
                secret_key,
            }),
            (Some(_), None) => {
                return Err(ConfigError::IncompleteTracing {
                    present: "LANGFUSE_PUBLIC_KEY".to_string(),
                    missing: "LANGFUSE_SECRET_KEY".to_string(),
                });
            }
            (None, Some(_)) => {
                return Err(ConfigError::IncompleteTracing {
                    present: "LANGFUSE_SECRET_KEY".to_string(),
                    missing: "LANGFUSE_PUBLIC_KEY".to_string(),
                });
            }
            (None, None) => None,
        };

        let process = match var("CREW_PROCESS") {
            Some(raw) => ProcessMode::from_str(&raw).ok_or_else(|| ConfigError::Invalid {
                var: "CREW_PROCESS".to_string(),
                reason: format!("expected 'sequential' or 'concurrent', got '{}'", raw),
            })?,
            None => ProcessMode::Sequential,
        };

        let max_attempts: u32 = parse_number(&var, "CREW_MAX_RETRIES", 3)?;
        if max_attempts == 0 {
            return Err(ConfigError::Invalid {
                var: "CREW_MAX_RETRIES".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        let backoff_ms: u64 = parse_number(&var, "CREW_BACKOFF_MS", 500)?;

        let crew = CrewSettings {
            process,
            backend_retry: RetryPolicy::new(max_attempts, Duration::from_millis(backoff_ms)),
            tool_retry_budget: parse_number(&var, "CREW_TOOL_RETRIES", 3)?,
            max_tool_calls: parse_number(&var, "CREW_MAX_TOOL_CALLS", 8)?,
            capture_reasoning: var("LANGFUSE_CAPTURE_COT")
                .map(|v| is_truthy(&v))
                .unwrap_or(false),
        };

        Ok(Self {
            port: parse_number(&var, "PORT", 8080)?,
            openai,
            langfuse,
            crew,
        })
    }
}

fn parse_number<T, F>(var: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var: key.to_string(),
            reason: format!("'{}': {}", raw, e),
        }),
        None => Ok(default),
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
