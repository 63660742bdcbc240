use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub model_id: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorCode {
    MissingCredential,
    Http,
    RateLimited,
    InvalidResponse,
}

impl ProviderErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingCredential => "missing_credential",
            Self::Http => "http_error",
            Self::RateLimited => "rate_limited",
            Self::InvalidResponse => "invalid_response",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub code: ProviderErrorCode,
    pub message: String,
}

impl ProviderError {
    pub fn new(code: ProviderErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for ProviderError {}

/// Text generation capability. Implementations never retry.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<String, ProviderError>;
}

/// Chat-completions client for any OpenAI-compatible endpoint.
pub struct OpenAiCompatibleBackend {
    client: Client,
    endpoint: String,
    api_key_env: String,
    api_key: Option<String>,
}

impl OpenAiCompatibleBackend {
    pub fn new(base_url: &str, api_key_env: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout.max(Duration::from_secs(1)))
            .build()
            .context("failed creating model http client")?;
        Ok(Self {
            client,
            endpoint: resolve_chat_completion_endpoint(base_url)?,
            api_key_env: api_key_env.trim().to_owned(),
            api_key: None,
        })
    }

    /// Uses `key` instead of reading the configured environment variable.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn credential(&self) -> Result<String, ProviderError> {
        let key = match &self.api_key {
            Some(key) => Some(key.clone()),
            None => std::env::var(&self.api_key_env).ok(),
        };
        key.map(|key| key.trim().to_owned())
            .filter(|key| !key.is_empty())
            .ok_or_else(|| {
                ProviderError::new(
                    ProviderErrorCode::MissingCredential,
                    format!("environment variable {} is not set", self.api_key_env),
                )
            })
    }
}

#[async_trait]
impl ModelBackend for OpenAiCompatibleBackend {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<String, ProviderError> {
        let api_key = self.credential()?;
        let payload = json!({
            "model": params.model_id,
            "messages": messages,
            "temperature": params.temperature,
            "max_tokens": params.max_output_tokens,
            "stream": false,
        });
        debug!(
            "requesting {} with {} message(s)",
            self.endpoint,
            messages.len()
        );

        let response = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| {
                ProviderError::new(
                    ProviderErrorCode::Http,
                    format!("{}: transport_error: {err}", self.endpoint),
                )
            })?;
        let status = response.status();
        let body = response.text().await.map_err(|err| {
            ProviderError::new(
                ProviderErrorCode::Http,
                format!("{}: body_read_error: {err}", self.endpoint),
            )
        })?;

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::new(
                ProviderErrorCode::RateLimited,
                format!("{}: rate limited: {}", self.endpoint, truncate_text(&body, 240)),
            ));
        }
        if !status.is_success() {
            return Err(ProviderError::new(
                ProviderErrorCode::Http,
                format!(
                    "{}: status={} body={}",
                    self.endpoint,
                    status.as_u16(),
                    truncate_text(&body, 240)
                ),
            ));
        }

        let parsed: Value = serde_json::from_str(&body).map_err(|err| {
            ProviderError::new(
                ProviderErrorCode::InvalidResponse,
                format!("{}: parse_error: {err}", self.endpoint),
            )
        })?;
        parsed
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or_else(|| {
                ProviderError::new(
                    ProviderErrorCode::InvalidResponse,
                    format!(
                        "{}: missing_choices body={}",
                        self.endpoint,
                        truncate_text(&parsed.to_string(), 240)
                    ),
                )
            })
    }
}

fn resolve_chat_completion_endpoint(base_url: &str) -> Result<String> {
    let trimmed = base_url.trim().trim_end_matches('/');
    if trimmed.to_ascii_lowercase().ends_with("/chat/completions") {
        return Ok(Url::parse(trimmed)
            .with_context(|| format!("invalid model base_url {trimmed}"))?
            .to_string());
    }
    let base = Url::parse(&format!("{trimmed}/"))
        .with_context(|| format!("invalid model base_url {trimmed}"))?;
    Ok(base
        .join("chat/completions")
        .context("failed building chat completions endpoint")?
        .to_string())
}

fn truncate_text(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_owned();
    }
    let mut end = max_len;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &value[..end])
}
