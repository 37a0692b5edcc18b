use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::PlatformError;
use crate::types::UserProfile;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyTarget {
    /// Send API message to a participant. `human_agent` tags operator replies
    /// so they are allowed outside the standard messaging window.
    Message {
        recipient_id: String,
        human_agent: bool,
    },
    /// Threaded reply under an existing comment.
    Comment { comment_id: String },
}

#[async_trait]
pub trait PlatformApi: Send + Sync {
    async fn get_user_profile(
        &self,
        user_id: &str,
        access_token: &str,
    ) -> Result<UserProfile, PlatformError>;

    /// Returns the platform id of the created message or comment.
    async fn post_reply(
        &self,
        target: &ReplyTarget,
        text: &str,
        access_token: &str,
    ) -> Result<String, PlatformError>;

    async fn is_author_of_page(
        &self,
        object_id: &str,
        page_id: &str,
        access_token: &str,
    ) -> Result<bool, PlatformError>;

    async fn get_comment_text(
        &self,
        comment_id: &str,
        access_token: &str,
    ) -> Result<String, PlatformError>;
}

pub struct GraphApiClient {
    client: reqwest::Client,
    api_base: String,
    timeout: Duration,
    profile_timeout: Duration,
}

impl GraphApiClient {
    pub fn new(
        client: reqwest::Client,
        api_base: &str,
        timeout: Duration,
        profile_timeout: Duration,
    ) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            timeout,
            profile_timeout,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, PlatformError> {
        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        let raw_body = response.text().await.map_err(map_reqwest_error)?;
        if !status.is_success() {
            return Err(PlatformError::Status {
                status: status.as_u16(),
                body: clip(&raw_body, 220),
            });
        }
        Ok(serde_json::from_str::<Value>(&raw_body).unwrap_or_else(|_| json!({ "raw": raw_body })))
    }

    async fn get_fields(
        &self,
        object_id: &str,
        fields: &str,
        access_token: &str,
        timeout: Duration,
    ) -> Result<Value, PlatformError> {
        let request = self
            .client
            .get(format!("{}/{}", self.api_base, object_id))
            .query(&[("fields", fields), ("access_token", access_token)])
            .timeout(timeout);
        self.send(request).await
    }
}

#[async_trait]
impl PlatformApi for GraphApiClient {
    async fn get_user_profile(
        &self,
        user_id: &str,
        access_token: &str,
    ) -> Result<UserProfile, PlatformError> {
        let body = self
            .get_fields(user_id, "name,first_name,last_name", access_token, self.profile_timeout)
            .await?;
        let name = body
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| {
                [body.get("first_name"), body.get("last_name")]
                    .into_iter()
                    .flatten()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(" ")
            });
        Ok(UserProfile {
            id: user_id.to_string(),
            name: name.trim().to_string(),
        })
    }

    async fn post_reply(
        &self,
        target: &ReplyTarget,
        text: &str,
        access_token: &str,
    ) -> Result<String, PlatformError> {
        let (url, payload, id_field) = match target {
            ReplyTarget::Message {
                recipient_id,
                human_agent,
            } => {
                let mut payload = json!({
                    "recipient": { "id": recipient_id },
                    "messaging_type": "RESPONSE",
                    "message": { "text": text },
                });
                if *human_agent {
                    payload["messaging_type"] = json!("MESSAGE_TAG");
                    payload["tag"] = json!("HUMAN_AGENT");
                }
                (format!("{}/me/messages", self.api_base), payload, "message_id")
            }
            ReplyTarget::Comment { comment_id } => (
                format!("{}/{}/comments", self.api_base, comment_id),
                json!({ "message": text }),
                "id",
            ),
        };
        let request = self
            .client
            .post(url)
            .query(&[("access_token", access_token)])
            .json(&payload)
            .timeout(self.timeout);
        let body = self.send(request).await?;
        body.get(id_field)
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or(PlatformError::MissingField("delivery id"))
    }

    async fn is_author_of_page(
        &self,
        object_id: &str,
        page_id: &str,
        access_token: &str,
    ) -> Result<bool, PlatformError> {
        let body = self
            .get_fields(object_id, "from", access_token, self.timeout)
            .await?;
        let author = body
            .get("from")
            .and_then(|from| from.get("id"))
            .and_then(Value::as_str)
            .ok_or(PlatformError::MissingField("from.id"))?;
        Ok(author == page_id)
    }

    async fn get_comment_text(
        &self,
        comment_id: &str,
        access_token: &str,
    ) -> Result<String, PlatformError> {
        let body = self
            .get_fields(comment_id, "message", access_token, self.timeout)
            .await?;
        Ok(body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string())
    }
}

fn map_reqwest_error(err: reqwest::Error) -> PlatformError {
    if err.is_timeout() {
        PlatformError::Timeout
    } else {
        PlatformError::Request(err.to_string())
    }
}

pub(crate) fn clip(text: &str, max_chars: usize) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.chars().count() > max_chars {
        format!("{}...", normalized.chars().take(max_chars).collect::<String>())
    } else {
        normalized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn client(server: &MockServer) -> GraphApiClient {
        GraphApiClient::new(
            reqwest::Client::new(),
            &server.base_url(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn message_reply_returns_message_id() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/me/messages")
                    .query_param("access_token", "tok")
                    .json_body(json!({
                        "recipient": { "id": "u1" },
                        "messaging_type": "RESPONSE",
                        "message": { "text": "hi" },
                    }));
                then.status(200)
                    .json_body(json!({ "recipient_id": "u1", "message_id": "m_1" }));
            })
            .await;

        let target = ReplyTarget::Message {
            recipient_id: "u1".to_string(),
            human_agent: false,
        };
        let id = client(&server)
            .post_reply(&target, "hi", "tok")
            .await
            .expect("delivered");
        assert_eq!(id, "m_1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn comment_reply_posts_under_comment() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/c_9/comments");
                then.status(200).json_body(json!({ "id": "c_10" }));
            })
            .await;

        let target = ReplyTarget::Comment {
            comment_id: "c_9".to_string(),
        };
        let id = client(&server)
            .post_reply(&target, "thanks", "tok")
            .await
            .expect("delivered");
        assert_eq!(id, "c_10");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn error_status_is_surfaced() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/me/messages");
                then.status(400).body("{\"error\":{\"message\":\"bad\"}}");
            })
            .await;

        let target = ReplyTarget::Message {
            recipient_id: "u1".to_string(),
            human_agent: true,
        };
        let err = client(&server)
            .post_reply(&target, "hi", "tok")
            .await
            .expect_err("rejected");
        assert!(matches!(err, PlatformError::Status { status: 400, .. }));
    }

    #[tokio::test]
    async fn author_check_compares_from_id() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/c_1").query_param("fields", "from");
                then.status(200)
                    .json_body(json!({ "from": { "id": "page_1", "name": "Shop" } }));
            })
            .await;

        let graph = client(&server);
        assert!(graph.is_author_of_page("c_1", "page_1", "tok").await.expect("ok"));
        assert!(!graph.is_author_of_page("c_1", "page_2", "tok").await.expect("ok"));
    }

    #[test]
    fn clip_collapses_whitespace() {
        assert_eq!(clip("a\n  b", 10), "a b");
        assert_eq!(clip("abcdef", 3), "abc...");
    }
}
