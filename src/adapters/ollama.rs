//! Ollama structured generation over HTTP.
//!
//! Uses `/api/chat` with a JSON schema in `format`, so the model is
//! constrained to the requested shape. The reply is still validated.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{CollaboratorError, StructuredGenerator};
use crate::domain::{OutputShape, StructuredOutput};

pub struct OllamaGenerator {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    format: serde_json::Value,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ReplyMessage,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    content: String,
}

impl OllamaGenerator {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl StructuredGenerator for OllamaGenerator {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate(
        &self,
        prompt: &str,
        shape: OutputShape,
    ) -> Result<StructuredOutput, CollaboratorError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            format: shape.json_schema(),
            stream: false,
        };

        let response = self
            .client
            .post(self.chat_url())
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        let reply: ChatResponse = response
            .json()
            .await
            .map_err(|e| CollaboratorError::Validation(e.to_string()))?;

        tracing::debug!(model = %self.model, chars = reply.message.content.len(), "Ollama replied");
        Ok(shape.parse(&reply.message.content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_url_tolerates_trailing_slash() {
        let g = OllamaGenerator::new("http://127.0.0.1:11434/", "llama3.2:latest");
        assert_eq!(g.chat_url(), "http://127.0.0.1:11434/api/chat");
        assert_eq!(g.name(), "ollama");
    }

    #[test]
    fn test_request_carries_schema() {
        let request = ChatRequest {
            model: "m",
            messages: vec![ChatMessage {
                role: "user",
                content: "p",
            }],
            format: OutputShape::Genre.json_schema(),
            stream: false,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["stream"], false);
        assert_eq!(json["format"]["required"][0], "genre");
    }
}
