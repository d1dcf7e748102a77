//! Minimal Messages API client used for board prioritisation.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::{debug, warn};

use super::config::PrioritizationConfig;

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 1024;

#[derive(Debug, Clone, Error)]
pub enum AiClientError {
    #[error("network error: {0}")]
    Transport(String),
    #[error("timeout")]
    Timeout,
    #[error("rate limited")]
    RateLimited,
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("api key rejected")]
    Unauthorized,
    #[error("no api key in ${0}")]
    MissingApiKey(String),
    #[error("unusable response: {0}")]
    Response(String),
}

impl AiClientError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout | Self::RateLimited => true,
            Self::Http { status, .. } => (500..=599).contains(status),
            _ => false,
        }
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: [UserMessage<'a>; 1],
}

#[derive(Debug, Serialize)]
struct UserMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone)]
pub struct AiClient {
    http: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl AiClient {
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, AiClientError> {
        let http = Client::builder()
            .timeout(Self::REQUEST_TIMEOUT)
            .user_agent(concat!("taskboard/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AiClientError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: MESSAGES_URL.to_string(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    /// Build a client from the prioritisation settings, reading the key from
    /// the configured environment variable.
    pub fn from_config(config: &PrioritizationConfig) -> Result<Self, AiClientError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| AiClientError::MissingApiKey(config.api_key_env.clone()))?;
        Self::new(api_key, config.model.clone())
    }

    /// Point the client at a different Messages endpoint (proxies, tests).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send one prompt and return the text of the reply, retrying transient failures.
    pub async fn ask(&self, system: &str, prompt: &str) -> Result<String, AiClientError> {
        let request = MessagesRequest {
            model: &self.model,
            max_tokens: MAX_TOKENS,
            system,
            messages: [UserMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = (|| async { self.send(&request).await })
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(500))
                    .with_max_delay(Duration::from_secs(10))
                    .with_max_times(3)
                    .with_jitter(),
            )
            .when(AiClientError::is_retryable)
            .notify(|e, dur| {
                warn!(error = %e, "Prioritisation request failed, retrying after {:.2}s", dur.as_secs_f64())
            })
            .await?;

        response
            .content
            .into_iter()
            .find_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Other => None,
            })
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| AiClientError::Response("no text in reply".to_string()))
    }

    /// Like [`AiClient::ask`], parsing the reply as JSON. Fenced code blocks are unwrapped.
    pub async fn ask_json<T: DeserializeOwned>(
        &self,
        system: &str,
        prompt: &str,
    ) -> Result<T, AiClientError> {
        let reply = self.ask(system, prompt).await?;
        let json = extract_json(&reply);
        serde_json::from_str(json).map_err(|e| {
            debug!(reply_len = reply.len(), "Reply was not the expected JSON");
            AiClientError::Response(e.to_string())
        })
    }

    async fn send(&self, request: &MessagesRequest<'_>) -> Result<MessagesResponse, AiClientError> {
        let res = self
            .http
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AiClientError::Timeout
                } else {
                    AiClientError::Transport(e.to_string())
                }
            })?;

        match res.status() {
            s if s.is_success() => res
                .json::<MessagesResponse>()
                .await
                .map_err(|e| AiClientError::Response(e.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AiClientError::Unauthorized),
            StatusCode::TOO_MANY_REQUESTS => Err(AiClientError::RateLimited),
            s => Err(AiClientError::Http {
                status: s.as_u16(),
                body: res.text().await.unwrap_or_default(),
            }),
        }
    }
}

/// Strip a surrounding ```json fence (or a bare ``` fence) if present.
pub fn extract_json(reply: &str) -> &str {
    let reply = reply.trim();
    let Some(open) = reply.find("```") else {
        return reply;
    };
    let body = &reply[open + 3..];
    // Skip the info string, e.g. `json`.
    let body = body.find('\n').map_or(body, |nl| &body[nl + 1..]);
    match body.find("```") {
        Some(close) => body[..close].trim(),
        None => reply,
    }
}
