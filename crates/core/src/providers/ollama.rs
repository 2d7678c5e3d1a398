use crate::answer::grounded_prompt;
use crate::embeddings::Embedder;
use crate::error::CapabilityError;
use crate::providers::endpoint_url;
use crate::traits::Generator;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use url::Url;

fn backend_error(details: impl Into<String>) -> CapabilityError {
    CapabilityError::BackendResponse {
        backend: "ollama".to_string(),
        details: details.into(),
    }
}

pub(crate) fn parse_embedding(
    body: &Value,
    dimensions: usize,
) -> Result<Vec<f32>, CapabilityError> {
    let values = body
        .get("embeddings")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(Value::as_array)
        .ok_or_else(|| backend_error("response has no embeddings"))?;

    let vector = values
        .iter()
        .map(|value| {
            value
                .as_f64()
                .map(|number| number as f32)
                .ok_or_else(|| backend_error("embedding contains a non-number"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if dimensions > 0 && vector.len() != dimensions {
        return Err(backend_error(format!(
            "embedding dimension {} != {}",
            vector.len(),
            dimensions
        )));
    }
    Ok(vector)
}

pub(crate) fn parse_generation(body: &Value) -> Result<String, CapabilityError> {
    body.get("response")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| backend_error("response has no text"))
}

/// Embeddings from an Ollama server's `/api/embed`.
pub struct OllamaEmbedder {
    url: Url,
    model: String,
    dimensions: usize,
    client: Client,
}

impl OllamaEmbedder {
    pub fn new(
        endpoint: &str,
        model: impl Into<String>,
        dimensions: usize,
    ) -> Result<Self, CapabilityError> {
        Ok(Self {
            url: endpoint_url(endpoint, "api/embed")?,
            model: model.into(),
            dimensions,
            client: Client::new(),
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&json!({ "model": self.model, "input": text }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(backend_error(response.status().to_string()));
        }

        let body: Value = response.json().await?;
        parse_embedding(&body, self.dimensions)
    }
}

/// Completions from an Ollama server's `/api/generate`.
pub struct OllamaGenerator {
    url: Url,
    model: String,
    client: Client,
}

impl OllamaGenerator {
    pub fn new(endpoint: &str, model: impl Into<String>) -> Result<Self, CapabilityError> {
        Ok(Self {
            url: endpoint_url(endpoint, "api/generate")?,
            model: model.into(),
            client: Client::new(),
        })
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn generate(&self, prompt: &str, context: &[String]) -> Result<String, CapabilityError> {
        let prompt = if context.is_empty() {
            prompt.to_string()
        } else {
            grounded_prompt(prompt, context)
        };

        let response = self
            .client
            .post(self.url.clone())
            .json(&json!({ "model": self.model, "prompt": prompt, "stream": false }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(backend_error(response.status().to_string()));
        }

        let body: Value = response.json().await?;
        parse_generation(&body)
    }
}
