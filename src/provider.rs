//! Model Completion Capability
//!
//! The pipeline depends on a single operation, `complete(messages, model, options)`. The model
//! is chosen per call by the generation worker, so clients are model-agnostic.
//! [`HttpCompletionClient`] speaks the OpenAI-compatible `/chat/completions` protocol.

use crate::config::ProviderSettings;
use crate::error::CompletionError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Chat message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

/// Completion options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionOptions {
    pub temperature: Option<f32>, // 0.0-2.0
    pub max_tokens: Option<u32>,  // Maximum tokens to generate
    pub top_p: Option<f32>,       // Nucleus sampling
    pub stop: Option<Vec<String>>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: Some(1.0),
            max_tokens: None,
            top_p: None,
            stop: None,
        }
    }
}

impl CompletionOptions {
    pub fn from_settings(settings: &ProviderSettings) -> Self {
        Self {
            temperature: Some(settings.temperature),
            max_tokens: Some(settings.max_tokens),
            ..Self::default()
        }
    }
}

/// Token usage information
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Completion response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
    pub usage: Option<TokenUsage>,
}

/// The model-completion capability consumed by the pipeline.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Generate a completion from a list of messages with the given model
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        model: &str,
        options: CompletionOptions,
    ) -> Result<CompletionResponse, CompletionError>;

    /// Get the provider name
    fn provider_name(&self) -> &str;
}

// OpenAI-compatible API request/response structures
#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    stream: bool,
}

#[derive(Serialize, Deserialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    model: Option<String>,
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: OpenAIMessage,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

// Helper function to convert MessageRole to string
fn role_to_string(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}

fn map_status(status: u16, body: String) -> CompletionError {
    match status {
        401 | 403 => CompletionError::AuthFailed(format!("Authentication failed: {}", body)),
        429 => CompletionError::RateLimit(format!("Rate limit exceeded: {}", body)),
        404 => CompletionError::ModelNotFound(format!("Model not found: {}", body)),
        408 | 502 | 503 | 504 => {
            CompletionError::Connection(format!("Upstream unavailable ({}): {}", status, body))
        }
        _ => CompletionError::RequestFailed(format!("Request failed ({}): {}", status, body)),
    }
}

// Helper function to map HTTP errors to CompletionError
fn map_http_error(error: reqwest::Error) -> CompletionError {
    if let Some(status) = error.status() {
        map_status(status.as_u16(), error.to_string())
    } else if error.is_timeout() {
        CompletionError::Timeout(format!("Request timeout: {}", error))
    } else if error.is_connect() {
        CompletionError::Connection(format!("Connection error: {}", error))
    } else {
        CompletionError::Provider(format!("HTTP error: {}", error))
    }
}

/// OpenAI-compatible completion client (OpenAI, OpenRouter, local gateways)
pub struct HttpCompletionClient {
    client: Client,
    api_key: Option<String>,
    base_url: String,
}

impl HttpCompletionClient {
    pub fn new(settings: &ProviderSettings) -> Result<Self, CompletionError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| CompletionError::Provider(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key: settings.resolve_api_key(),
            base_url: settings.endpoint.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        model: &str,
        options: CompletionOptions,
    ) -> Result<CompletionResponse, CompletionError> {
        let request = ChatCompletionRequest {
            model,
            messages: messages
                .into_iter()
                .map(|msg| OpenAIMessage {
                    role: role_to_string(msg.role).to_string(),
                    content: msg.content,
                })
                .collect(),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            top_p: options.top_p,
            stop: options.stop,
            stream: false,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        if let Some(api_key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", api_key));
        }

        debug!(model, url = %url, "Sending completion request");
        let response = builder.json(&request).send().await.map_err(map_http_error)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(map_status(status, error_text));
        }

        let completion: ChatCompletionResponse = response.json().await.map_err(|e| {
            CompletionError::Provider(format!("Failed to parse response: {}", e))
        })?;

        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| CompletionError::Provider("No choices in response".to_string()))?;

        Ok(CompletionResponse {
            content: choice.message.content,
            model: completion.model.unwrap_or_else(|| model.to_string()),
            usage: completion.usage.map(|usage| TokenUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            }),
        })
    }

    fn provider_name(&self) -> &str {
        "openai-compatible"
    }
}
