use super::LlmError;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;

/// Fully qualified request, built before anything touches the network.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl RequestDescriptor {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Status line plus a lazily read body.
pub struct TransportResponse {
    pub status: u16,
    pub body: BoxStream<'static, Result<Vec<u8>, LlmError>>,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Reads the whole body as text, replacing invalid UTF-8.
    pub async fn text(self) -> Result<String, LlmError> {
        let bytes: Vec<u8> = self
            .body
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn json<T: DeserializeOwned>(self) -> Result<T, LlmError> {
        let text = self.text().await?;
        serde_json::from_str(&text).map_err(|e| LlmError::Parse(e.to_string()))
    }

    /// Turns a non-2xx response into `RequestFailed` carrying the raw body.
    pub async fn error_for_status(self) -> Result<Self, LlmError> {
        if self.is_success() {
            return Ok(self);
        }
        let status = self.status;
        let body = self.text().await.unwrap_or_default();
        Err(LlmError::RequestFailed { status, body })
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: RequestDescriptor) -> Result<TransportResponse, LlmError>;
}

#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: RequestDescriptor) -> Result<TransportResponse, LlmError> {
        tracing::debug!(method = %request.method, url = %request.url, "sending request");

        let mut req = self.client.request(request.method, &request.url);
        for (name, value) in &request.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(LlmError::from))
            .boxed();

        Ok(TransportResponse { status, body })
    }
}
