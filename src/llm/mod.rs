pub mod openai;
pub mod stream;
pub mod transport;

use serde::{Deserialize, Serialize};

pub use openai::{OpenAiClient, Operation};
pub use stream::{ChatDelta, DecodeWarning, DeltaStream, StreamDecoder, StreamEvent};
pub use transport::{HttpTransport, RequestDescriptor, Transport, TransportResponse};

pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/// Where and how to reach the remote model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImageRequest {
    pub prompt: String,
    pub n: u32,
    pub model: String,
    pub size: String,
    pub quality: String,
}

/// Result of a single-shot image generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageResult {
    pub url: String,
}

impl ImageResult {
    /// Markdown reference stored as the assistant reply.
    pub fn to_markdown(&self) -> String {
        format!("![Generated Image]({})", self.url)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Request failed: {status} {body}")]
    RequestFailed { status: u16, body: String },
    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Request timed out")]
    Timeout,
}

impl LlmError {
    pub fn transport(msg: impl Into<String>) -> Self {
        LlmError::Transport(msg.into().into())
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        LlmError::Transport(Box::new(err))
    }
}
