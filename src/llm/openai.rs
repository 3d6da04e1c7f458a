use super::{
    ChatMessage, ChatRequest, DeltaStream, EndpointConfig, ImageRequest, ImageResult, LlmError,
    RequestDescriptor, Transport,
};
use crate::db::models::{Message, Role};
use reqwest::Method;
use serde::Deserialize;
use std::sync::Arc;

/// Model names served by the image generation endpoint.
pub const IMAGE_MODELS: &[&str] = &["dall-e-2", "dall-e-3"];
const IMAGE_SIZE: &str = "1024x1792";
const IMAGE_QUALITY: &str = "hd";

/// Which remote operation a model is addressed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    ImageGeneration,
    ChatCompletion,
}

impl Operation {
    pub fn for_model(model: &str) -> Self {
        if IMAGE_MODELS.contains(&model) {
            Operation::ImageGeneration
        } else {
            Operation::ChatCompletion
        }
    }
}

/// What came back from a dispatch, tagged by operation kind.
pub enum ModelReply {
    Image(ImageResult),
    Chat(DeltaStream),
}

#[derive(Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Deserialize)]
struct ImageResponse {
    data: Vec<ImageEntry>,
}

#[derive(Deserialize)]
struct ImageEntry {
    url: Option<String>,
}

/// Prepends `https://` unless the address already uses it.
pub fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        let host = trimmed.strip_prefix("http://").unwrap_or(trimmed);
        format!("https://{}", host)
    }
}

pub struct OpenAiClient {
    config: EndpointConfig,
    base_url: String,
    transport: Arc<dyn Transport>,
}

impl OpenAiClient {
    pub fn new(config: EndpointConfig, transport: Arc<dyn Transport>) -> Self {
        let base_url = normalize_base_url(&config.base_url);
        Self {
            config,
            base_url,
            transport,
        }
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn operation(&self) -> Operation {
        Operation::for_model(&self.config.model)
    }

    fn request(&self, method: Method, path: &str, body: Option<serde_json::Value>) -> RequestDescriptor {
        let mut headers = vec![(
            "Authorization".to_string(),
            format!("Bearer {}", self.config.api_key),
        )];
        if body.is_some() {
            headers.push(("Content-Type".to_string(), "application/json".to_string()));
        }
        RequestDescriptor {
            method,
            url: format!("{}{}", self.base_url, path),
            headers,
            body,
        }
    }

    pub fn models_request(&self) -> RequestDescriptor {
        self.request(Method::GET, "/v1/models", None)
    }

    /// Image prompt is the content of the latest user turn.
    pub fn image_request(&self, history: &[Message]) -> Result<RequestDescriptor, LlmError> {
        let prompt = history
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .ok_or_else(|| LlmError::Parse("no user message to use as prompt".to_string()))?;

        let body = ImageRequest {
            prompt,
            n: 1,
            model: self.config.model.clone(),
            size: IMAGE_SIZE.to_string(),
            quality: IMAGE_QUALITY.to_string(),
        };
        let body = serde_json::to_value(body).map_err(|e| LlmError::Parse(e.to_string()))?;
        Ok(self.request(Method::POST, "/v1/images/generations", Some(body)))
    }

    /// Sends the whole history, minus an unfilled assistant placeholder at the end.
    pub fn chat_request(&self, history: &[Message]) -> Result<RequestDescriptor, LlmError> {
        let history = match history.split_last() {
            Some((last, rest)) if last.role == Role::Assistant && last.content.is_empty() => rest,
            _ => history,
        };
        let messages: Vec<ChatMessage> = history
            .iter()
            .map(|m| ChatMessage {
                role: m.role.as_str().to_string(),
                content: m.content.clone(),
            })
            .collect();

        let body = ChatRequest {
            model: self.config.model.clone(),
            messages,
            stream: true,
        };
        let body = serde_json::to_value(body).map_err(|e| LlmError::Parse(e.to_string()))?;
        Ok(self.request(Method::POST, "/v1/chat/completions", Some(body)))
    }

    pub async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        let resp = self
            .transport
            .send(self.models_request())
            .await?
            .error_for_status()
            .await?;
        let list: ModelList = resp.json().await?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }

    pub async fn generate_image(&self, history: &[Message]) -> Result<ImageResult, LlmError> {
        let resp = self
            .transport
            .send(self.image_request(history)?)
            .await?
            .error_for_status()
            .await?;
        let data: ImageResponse = resp.json().await?;
        data.data
            .into_iter()
            .next()
            .and_then(|entry| entry.url)
            .map(|url| ImageResult { url })
            .ok_or_else(|| LlmError::Parse("image response carries no url".to_string()))
    }

    /// Opens a streaming completion; deltas are read lazily from the returned stream.
    pub async fn chat_stream(&self, history: &[Message]) -> Result<DeltaStream, LlmError> {
        let resp = self
            .transport
            .send(self.chat_request(history)?)
            .await?
            .error_for_status()
            .await?;
        Ok(DeltaStream::new(resp))
    }

    pub async fn send(&self, history: &[Message]) -> Result<ModelReply, LlmError> {
        match self.operation() {
            Operation::ImageGeneration => self.generate_image(history).await.map(ModelReply::Image),
            Operation::ChatCompletion => self.chat_stream(history).await.map(ModelReply::Chat),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::TransportResponse;
    use async_trait::async_trait;
    use futures::stream::{self, StreamExt};
    use serde_json::json;
    use std::sync::Mutex;

    /// Replies with a fixed status and body, remembering what was asked.
    struct Canned {
        status: u16,
        body: &'static str,
        seen: Mutex<Vec<RequestDescriptor>>,
    }

    impl Canned {
        fn new(status: u16, body: &'static str) -> Arc<Self> {
            Arc::new(Self {
                status,
                body,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for Canned {
        async fn send(&self, request: RequestDescriptor) -> Result<TransportResponse, LlmError> {
            self.seen.lock().unwrap().push(request);
            Ok(TransportResponse {
                status: self.status,
                body: stream::iter(vec![Ok(self.body.as_bytes().to_vec())]).boxed(),
            })
        }
    }

    fn client(model: &str, transport: Arc<Canned>) -> OpenAiClient {
        OpenAiClient::new(
            EndpointConfig {
                base_url: "api.example.com/".into(),
                api_key: "sk-test".into(),
                model: model.into(),
            },
            transport,
        )
    }

    #[test]
    fn base_url_gets_secure_scheme() {
        assert_eq!(normalize_base_url("api.example.com"), "https://api.example.com");
        assert_eq!(normalize_base_url("https://api.example.com/"), "https://api.example.com");
        assert_eq!(normalize_base_url(" http://proxy.local "), "https://proxy.local");
    }

    #[test]
    fn operation_follows_model_name() {
        assert_eq!(Operation::for_model("dall-e-3"), Operation::ImageGeneration);
        assert_eq!(Operation::for_model("dall-e-2"), Operation::ImageGeneration);
        assert_eq!(Operation::for_model("dall-e-3-preview"), Operation::ChatCompletion);
        assert_eq!(Operation::for_model("gpt-4o"), Operation::ChatCompletion);
    }

    #[test]
    fn chat_request_drops_trailing_placeholder() {
        let client = client("gpt-4o", Canned::new(200, ""));
        let history = vec![
            Message::user("hi"),
            Message::assistant("hello"),
            Message::user("again"),
            Message::placeholder(),
        ];
        let req = client.chat_request(&history).unwrap();
        assert_eq!(req.method, Method::POST);
        assert_eq!(req.url, "https://api.example.com/v1/chat/completions");
        assert_eq!(req.header("Authorization"), Some("Bearer sk-test"));
        assert_eq!(
            req.body,
            Some(json!({
                "model": "gpt-4o",
                "messages": [
                    {"role": "user", "content": "hi"},
                    {"role": "assistant", "content": "hello"},
                    {"role": "user", "content": "again"},
                ],
                "stream": true,
            }))
        );
    }

    #[test]
    fn image_request_uses_last_user_turn() {
        let client = client("dall-e-3", Canned::new(200, ""));
        let history = vec![Message::user("a dog"), Message::assistant("ok"), Message::user("a cat")];
        let req = client.image_request(&history).unwrap();
        assert_eq!(req.url, "https://api.example.com/v1/images/generations");
        assert_eq!(
            req.body,
            Some(json!({
                "prompt": "a cat",
                "n": 1,
                "model": "dall-e-3",
                "size": "1024x1792",
                "quality": "hd",
            }))
        );
        assert!(client.image_request(&[]).is_err());
    }

    #[tokio::test]
    async fn list_models_collects_ids() {
        let transport = Canned::new(200, r#"{"data":[{"id":"gpt-4o"},{"id":"dall-e-3"}]}"#);
        let models = client("gpt-4o", transport.clone()).list_models().await.unwrap();
        assert_eq!(models, vec!["gpt-4o", "dall-e-3"]);

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].method, Method::GET);
        assert_eq!(seen[0].url, "https://api.example.com/v1/models");
        assert_eq!(seen[0].body, None);
    }

    #[tokio::test]
    async fn generate_image_extracts_url() {
        let transport = Canned::new(200, r#"{"data":[{"url":"https://img.example/cat.png"}]}"#);
        let image = client("dall-e-3", transport)
            .generate_image(&[Message::user("a cat")])
            .await
            .unwrap();
        assert_eq!(image.url, "https://img.example/cat.png");
        assert_eq!(image.to_markdown(), "![Generated Image](https://img.example/cat.png)");
    }

    #[tokio::test]
    async fn generate_image_rejects_empty_data() {
        let transport = Canned::new(200, r#"{"data":[]}"#);
        let result = client("dall-e-3", transport)
            .generate_image(&[Message::user("a cat")])
            .await;
        assert!(matches!(result, Err(LlmError::Parse(_))));
    }

    #[tokio::test]
    async fn failed_status_surfaces_body() {
        let transport = Canned::new(401, "invalid api key");
        let result = client("gpt-4o", transport)
            .chat_stream(&[Message::user("hi")])
            .await;
        match result {
            Err(LlmError::RequestFailed { status, body }) => {
                assert_eq!(status, 401);
                assert_eq!(body, "invalid api key");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn failed_image_request_surfaces_body() {
        let transport = Canned::new(400, "content policy");
        let result = client("dall-e-3", transport.clone())
            .generate_image(&[Message::user("a cat")])
            .await;
        match result {
            Err(LlmError::RequestFailed { status, body }) => {
                assert_eq!(status, 400);
                assert_eq!(body, "content policy");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(transport.seen.lock().unwrap()[0].url.ends_with("/v1/images/generations"));
    }
}
