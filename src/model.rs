//! Chat completion backend.
//!
//! Everything that talks to a language model goes through [`ChatModel`], so the
//! orchestrator can be driven by a scripted model in tests. The production
//! implementation calls an OpenAI-compatible chat completions endpoint
//! (OpenRouter by default).

use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Settings;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    /// User turn with inline images (data URLs or remote URLs).
    pub fn user_with_images(text: impl Into<String>, images: Vec<String>) -> Self {
        if images.is_empty() {
            return Self::user(text);
        }
        let mut parts = vec![ContentPart::Text { text: text.into() }];
        parts.extend(
            images
                .into_iter()
                .map(|url| ContentPart::ImageUrl { image_url: ImageUrl { url } }),
        );
        Self {
            role: Role::User,
            content: MessageContent::Parts(parts),
        }
    }

    /// Plain text of the message, images omitted.
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    /// Tag sent as `X-Title` so usage can be told apart per feature.
    pub purpose: &'static str,
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("OPENROUTER_API_KEY not configured")]
    MissingApiKey,
    #[error("model request failed: {0}")]
    Request(String),
    #[error("model API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("model returned an empty reply")]
    Empty,
}

pub trait ChatModel: Send + Sync {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<String, ModelError>>;
}

pub struct OpenRouterModel {
    client: reqwest::Client,
    api_key: Option<String>,
    model: String,
    url: String,
    referer: String,
}

impl OpenRouterModel {
    pub fn from_settings(settings: &Settings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key: settings.openrouter_api_key.clone(),
            model: settings.model.clone(),
            url: settings.openrouter_url.clone(),
            referer: format!("http://localhost:{}", settings.port),
        }
    }

    async fn send(&self, request: CompletionRequest) -> Result<String, ModelError> {
        let api_key = self.api_key.as_deref().ok_or(ModelError::MissingApiKey)?;

        let mut payload = serde_json::json!({
            "model": self.model,
            "messages": request.messages,
            "stream": false,
        });
        if let Some(t) = request.temperature {
            payload["temperature"] = serde_json::json!(t);
        }

        debug!(model = %self.model, purpose = request.purpose, "Calling chat completions");
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(api_key)
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", format!("Loom - {}", request.purpose))
            .json(&payload)
            .send()
            .await
            .map_err(|e| ModelError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            warn!(status, "Chat completions error");
            return Err(ModelError::Api { status, body });
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ModelError::Request(e.to_string()))?;
        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .trim()
            .to_string();
        if content.is_empty() {
            return Err(ModelError::Empty);
        }
        Ok(content)
    }
}

impl ChatModel for OpenRouterModel {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<String, ModelError>> {
        Box::pin(self.send(request))
    }
}

#[cfg(test)]
pub mod testing {
    //! Scripted model for orchestrator tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct ScriptedModel {
        replies: Mutex<VecDeque<Result<String, String>>>,
        pub requests: Mutex<Vec<CompletionRequest>>,
        pub delay: Option<Duration>,
    }

    impl ScriptedModel {
        pub fn new<I, S>(replies: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            Self {
                replies: Mutex::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
                ..Self::default()
            }
        }

        pub fn failing(message: &str) -> Self {
            Self {
                replies: Mutex::new(VecDeque::from([Err(message.to_string())])),
                ..Self::default()
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    impl ChatModel for ScriptedModel {
        fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<String, ModelError>> {
            Box::pin(async move {
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                self.requests.lock().unwrap().push(request);
                match self.replies.lock().unwrap().pop_front() {
                    Some(Ok(reply)) => Ok(reply),
                    Some(Err(message)) => Err(ModelError::Request(message)),
                    None => Err(ModelError::Empty),
                }
            })
        }
    }
}
