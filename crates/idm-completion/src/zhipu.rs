use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use idm_types::models::ChatMessage;

use crate::CompletionClient;
use crate::error::CompletionError;
use crate::token::{self, ApiKey, TOKEN_TTL};

pub const DEFAULT_BASE_URL: &str = "https://open.bigmodel.cn/api/paas/v4";
pub const DEFAULT_MODEL: &str = "glm-4";

#[derive(Clone)]
pub struct ZhipuConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: Option<u32>,
    /// Whole-request bound, connect through body.
    pub timeout: Duration,
}

impl ZhipuConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.7,
            top_p: 0.7,
            max_tokens: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl fmt::Debug for ZhipuConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZhipuConfig")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("top_p", &self.top_p)
            .field("max_tokens", &self.max_tokens)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Client for the Zhipu BigModel chat-completions endpoint.
pub struct ZhipuClient {
    http: Client,
    key: ApiKey,
    endpoint: String,
    model: String,
    temperature: f32,
    top_p: f32,
    max_tokens: Option<u32>,
}

impl ZhipuClient {
    pub fn new(config: ZhipuConfig) -> Result<Self, CompletionError> {
        let key: ApiKey = config.api_key.parse()?;

        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CompletionError::Internal(format!("building HTTP client: {}", e)))?;

        Ok(Self {
            http,
            key,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model,
            temperature: config.temperature,
            top_p: config.top_p,
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl CompletionClient for ZhipuClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, CompletionError> {
        // Tokens live ten minutes; signing per call is cheaper than tracking expiry.
        let bearer = token::sign(&self.key, chrono::Utc::now().timestamp_millis(), TOKEN_TTL)?;

        let body = CompletionRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_tokens,
        };

        debug!("Requesting completion: model={}, messages={}", self.model, messages.len());

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(bearer)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!("Completion request failed: {}", e);
                CompletionError::from(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    warn!("Reading completion error body failed: {}", e);
                    String::new()
                }
            };
            warn!("Completion API returned {}: {}", status, body);
            return Err(CompletionError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: CompletionResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                CompletionError::Network(e.to_string())
            } else {
                CompletionError::Internal(format!("unreadable completion response: {}", e))
            }
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| CompletionError::Internal("completion response had no content".into()))
    }
}
