use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::RetrievalError;
use crate::types::{Channel, Passage};

#[async_trait]
pub trait RetrievalService: Send + Sync {
    async fn search(
        &self,
        query: &str,
        tenant_id: &str,
        page_id: &str,
        channel: Channel,
        top_k: usize,
    ) -> Result<Vec<Passage>, RetrievalError>;
}

/// Used when no retrieval endpoint is configured.
pub struct DisabledRetrieval;

#[async_trait]
impl RetrievalService for DisabledRetrieval {
    async fn search(
        &self,
        _query: &str,
        _tenant_id: &str,
        _page_id: &str,
        _channel: Channel,
        _top_k: usize,
    ) -> Result<Vec<Passage>, RetrievalError> {
        Err(RetrievalError::NotConfigured)
    }
}

/// Talks to an external search endpoint that accepts
/// `{query, tenantId, pageId, channel, topK}` and answers with
/// `{"passages": [...]}` or a bare array.
pub struct HttpRetrieval {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpRetrieval {
    pub fn new(client: reqwest::Client, url: &str, timeout: Duration) -> Self {
        Self {
            client,
            url: url.trim().to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl RetrievalService for HttpRetrieval {
    async fn search(
        &self,
        query: &str,
        tenant_id: &str,
        page_id: &str,
        channel: Channel,
        top_k: usize,
    ) -> Result<Vec<Passage>, RetrievalError> {
        if top_k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&json!({
                "query": query.trim(),
                "tenantId": tenant_id,
                "pageId": page_id,
                "channel": channel.as_str(),
                "topK": top_k,
            }))
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    RetrievalError::Timeout
                } else {
                    RetrievalError::Request(err.to_string())
                }
            })?;
        if !response.status().is_success() {
            return Err(RetrievalError::Status(response.status().as_u16()));
        }
        let payload = response
            .json::<Value>()
            .await
            .map_err(|err| RetrievalError::Request(err.to_string()))?;
        let items = payload
            .get("passages")
            .cloned()
            .unwrap_or(payload);
        let mut passages = serde_json::from_value::<Vec<Passage>>(items)
            .map_err(|err| RetrievalError::Request(format!("unexpected payload: {err}")))?;
        passages.retain(|passage| !passage.text.trim().is_empty());
        passages.truncate(top_k);
        Ok(passages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn search_returns_top_k_non_empty_passages() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/search")
                    .body_includes("\"tenantId\":\"t1\"")
                    .body_includes("\"channel\":\"message\"")
                    .body_includes("\"topK\":2");
                then.status(200).json_body(json!({
                    "passages": [
                        { "sourceId": "kb", "title": "A", "text": "first", "score": 0.9 },
                        { "sourceId": "kb", "title": "B", "text": "  ", "score": 0.8 },
                        { "sourceId": "kb", "title": "C", "text": "second", "score": 0.7 },
                        { "sourceId": "kb", "title": "D", "text": "third", "score": 0.6 }
                    ]
                }));
            })
            .await;

        let retrieval = HttpRetrieval::new(
            reqwest::Client::new(),
            &server.url("/search"),
            Duration::from_secs(5),
        );
        let passages = retrieval
            .search("opening hours", "t1", "p1", Channel::Message, 2)
            .await
            .expect("search");
        let texts = passages.iter().map(|p| p.text.as_str()).collect::<Vec<_>>();
        assert_eq!(texts, vec!["first", "second"]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn server_error_is_reported() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/search");
                then.status(503);
            })
            .await;

        let retrieval = HttpRetrieval::new(
            reqwest::Client::new(),
            &server.url("/search"),
            Duration::from_secs(5),
        );
        let err = retrieval
            .search("q", "t1", "p1", Channel::Comment, 3)
            .await
            .expect_err("503");
        assert!(matches!(err, RetrievalError::Status(503)));
    }
}
