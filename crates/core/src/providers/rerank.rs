use crate::error::CapabilityError;
use crate::providers::endpoint_url;
use crate::traits::Reranker;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use url::Url;

fn backend_error(details: impl Into<String>) -> CapabilityError {
    CapabilityError::BackendResponse {
        backend: "reranker".to_string(),
        details: details.into(),
    }
}

/// Score for text `index` in a `[{index, score}, ...]` rerank response.
pub(crate) fn parse_rerank_score(body: &Value, index: u64) -> Result<f64, CapabilityError> {
    body.as_array()
        .ok_or_else(|| backend_error("rerank response is not a list"))?
        .iter()
        .find(|entry| entry.get("index").and_then(Value::as_u64) == Some(index))
        .and_then(|entry| entry.get("score"))
        .and_then(Value::as_f64)
        .ok_or_else(|| backend_error(format!("rerank response has no score for text {index}")))
}

/// Cross-encoder served over HTTP with a text-embeddings-inference style
/// `/rerank` route.
pub struct HttpReranker {
    url: Url,
    client: Client,
}

impl HttpReranker {
    pub fn new(endpoint: &str) -> Result<Self, CapabilityError> {
        Ok(Self {
            url: endpoint_url(endpoint, "rerank")?,
            client: Client::new(),
        })
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn score(&self, query: &str, chunk_text: &str) -> Result<f64, CapabilityError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&json!({ "query": query, "texts": [chunk_text] }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(backend_error(response.status().to_string()));
        }

        let body: Value = response.json().await?;
        parse_rerank_score(&body, 0)
    }
}
