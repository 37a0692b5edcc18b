use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::ModelError;
use crate::platform::clip;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One earlier exchange in the conversation, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Page-level key. Empty falls back to the server default.
    pub api_key: String,
    /// Page-level model. Empty falls back to the server default.
    pub model: String,
    pub system_prompt: String,
    pub context: String,
    pub history: Vec<ChatTurn>,
    pub max_tokens: u32,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String, ModelError>;
}

pub struct OpenAiChatModel {
    client: reqwest::Client,
    api_base: String,
    default_api_key: String,
    default_model: String,
    timeout: Duration,
}

impl OpenAiChatModel {
    pub fn new(
        client: reqwest::Client,
        api_base: &str,
        default_api_key: &str,
        default_model: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            default_api_key: default_api_key.trim().to_string(),
            default_model: default_model.trim().to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatModel {
    async fn complete(&self, request: CompletionRequest) -> Result<String, ModelError> {
        let api_key = if request.api_key.trim().is_empty() {
            self.default_api_key.as_str()
        } else {
            request.api_key.trim()
        };
        if api_key.is_empty() {
            return Err(ModelError::MissingApiKey);
        }
        let model = if request.model.trim().is_empty() {
            self.default_model.as_str()
        } else {
            request.model.trim()
        };

        let mut messages = Vec::with_capacity(request.history.len() + 2);
        messages.push(json!({ "role": "system", "content": request.system_prompt }));
        for turn in &request.history {
            messages.push(json!({ "role": turn.role.as_str(), "content": turn.content }));
        }
        messages.push(json!({ "role": "user", "content": request.context }));

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(api_key)
            .timeout(self.timeout)
            .json(&json!({
                "model": model,
                "messages": messages,
                "max_tokens": request.max_tokens.max(1),
                "temperature": 0.2
            }))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Status {
                status,
                body: clip(&body, 220),
            });
        }
        let payload = response.json::<Value>().await.map_err(map_reqwest_error)?;
        let text = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("")
            .to_string();
        if text.is_empty() {
            return Err(ModelError::EmptyReply);
        }
        Ok(text)
    }
}

fn map_reqwest_error(err: reqwest::Error) -> ModelError {
    if err.is_timeout() {
        ModelError::Timeout
    } else {
        ModelError::Request(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn request(api_key: &str) -> CompletionRequest {
        CompletionRequest {
            api_key: api_key.to_string(),
            model: String::new(),
            system_prompt: "be nice".to_string(),
            context: "Customer: hi".to_string(),
            history: Vec::new(),
            max_tokens: 128,
        }
    }

    #[tokio::test]
    async fn page_key_overrides_default_and_content_is_returned() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat/completions")
                    .header("authorization", "Bearer page-key")
                    .body_includes("\"model\":\"gpt-test\"")
                    .body_includes("\"max_tokens\":128");
                then.status(200).json_body(json!({
                    "choices": [{ "message": { "role": "assistant", "content": "  hello there  " } }]
                }));
            })
            .await;

        let model = OpenAiChatModel::new(
            reqwest::Client::new(),
            &server.base_url(),
            "server-key",
            "gpt-test",
            Duration::from_secs(5),
        );
        let text = model.complete(request("page-key")).await.expect("completion");
        assert_eq!(text, "hello there");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn history_turns_are_sent_before_the_context() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat/completions")
                    .body_includes("do you deliver?")
                    .body_includes("Only within the city.")
                    .body_includes("\"assistant\"");
                then.status(200).json_body(json!({
                    "choices": [{ "message": { "content": "Yes." } }]
                }));
            })
            .await;

        let model = OpenAiChatModel::new(
            reqwest::Client::new(),
            &server.base_url(),
            "server-key",
            "gpt-test",
            Duration::from_secs(5),
        );
        let mut req = request("");
        req.history = vec![
            ChatTurn {
                role: ChatRole::User,
                content: "do you deliver?".to_string(),
            },
            ChatTurn {
                role: ChatRole::Assistant,
                content: "Only within the city.".to_string(),
            },
        ];
        assert_eq!(model.complete(req).await.expect("completion"), "Yes.");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn slow_endpoint_maps_to_timeout() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(200)
                    .delay(Duration::from_secs(3))
                    .json_body(json!({ "choices": [{ "message": { "content": "late" } }] }));
            })
            .await;

        let model = OpenAiChatModel::new(
            reqwest::Client::new(),
            &server.base_url(),
            "server-key",
            "gpt-test",
            Duration::from_millis(200),
        );
        let err = model.complete(request("")).await.expect_err("timed out");
        assert!(matches!(err, ModelError::Timeout));
    }

    #[tokio::test]
    async fn missing_key_fails_before_any_request() {
        let model = OpenAiChatModel::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9",
            "",
            "gpt-test",
            Duration::from_secs(1),
        );
        let err = model.complete(request("")).await.expect_err("no key");
        assert!(matches!(err, ModelError::MissingApiKey));
    }

    #[tokio::test]
    async fn blank_content_is_an_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(200)
                    .json_body(json!({ "choices": [{ "message": { "content": "   " } }] }));
            })
            .await;

        let model = OpenAiChatModel::new(
            reqwest::Client::new(),
            &server.base_url(),
            "server-key",
            "gpt-test",
            Duration::from_secs(5),
        );
        let err = model.complete(request("")).await.expect_err("empty");
        assert!(matches!(err, ModelError::EmptyReply));
    }
}
