// ── dere engine: Embedding Client ──────────────────────────────────────────
//
// Calls Ollama or OpenAI-compatible embedding APIs to produce vector
// representations of text. Used by the embedding activity and the context
// builder for semantic recall. Every call runs under the provider gate,
// which owns the rate limits, the circuit breaker, and transient retries;
// `embed_once` only describes a single attempt across the endpoint
// fallback chain.

use super::http::{self, ProviderGate};
use crate::atoms::constants::EMBED_TIMEOUT_SECS;
use crate::atoms::error::{DaemonError, DaemonResult};
use log::info;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

pub struct EmbeddingClient {
    client: Client,
    base_url: String,
    model: String,
    gate: ProviderGate,
}

impl EmbeddingClient {
    pub fn new(base_url: &str, model: &str) -> Self {
        EmbeddingClient {
            client: http::shared_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            // Embedding calls are cheap; allow modest parallelism.
            gate: ProviderGate::new("embedding", 4, 120),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Get an embedding vector for a text string.
    pub async fn embed(&self, text: &str) -> DaemonResult<Vec<f32>> {
        self.gate.run(|| self.embed_once(text)).await
    }

    /// One attempt: the Ollama `/api/embed` endpoint first, then the
    /// legacy `/api/embeddings`, then OpenAI-compatible `/v1/embeddings`.
    async fn embed_once(&self, text: &str) -> DaemonResult<Vec<f32>> {
        let ollama_err = match self.embed_ollama(text).await {
            Ok(vec) => return Ok(vec),
            Err(e) => e,
        };
        match self.embed_openai(text).await {
            Ok(vec) => Ok(vec),
            Err(openai_err) => Err(DaemonError::provider(
                "embedding",
                format!("Ollama: {ollama_err} | OpenAI: {openai_err}"),
                ollama_err.retryable() || openai_err.retryable(),
            )),
        }
    }

    /// Ollama current API: POST /api/embed { model, input } → { embeddings: [[f32…]] }
    /// Falls back to legacy: POST /api/embeddings { model, prompt } → { embedding: [f32…] }
    async fn embed_ollama(&self, text: &str) -> DaemonResult<Vec<f32>> {
        let new_url = format!("{}/api/embed", self.base_url);
        let resp = self
            .client
            .post(&new_url)
            .json(&json!({ "model": self.model, "input": text }))
            .timeout(Duration::from_secs(EMBED_TIMEOUT_SECS))
            .send()
            .await;

        if let Ok(resp) = resp {
            let status = resp.status().as_u16();
            if resp.status().is_success() {
                if let Ok(v) = resp.json::<Value>().await {
                    // New format: { embeddings: [[f32…], …] }
                    if let Some(first) = v["embeddings"]
                        .as_array()
                        .and_then(|e| e.first())
                        .and_then(|e| e.as_array())
                    {
                        let vec = to_f32_vec(first);
                        if !vec.is_empty() {
                            return Ok(vec);
                        }
                    }
                    // Some versions return singular "embedding" even here
                    if let Some(embedding) = v["embedding"].as_array() {
                        let vec = to_f32_vec(embedding);
                        if !vec.is_empty() {
                            return Ok(vec);
                        }
                    }
                }
            } else {
                info!("[clients] /api/embed returned {status} — trying legacy endpoint");
            }
        }

        // ── Legacy /api/embeddings ──
        let legacy_url = format!("{}/api/embeddings", self.base_url);
        let resp = self
            .client
            .post(&legacy_url)
            .json(&json!({ "model": self.model, "prompt": text }))
            .timeout(Duration::from_secs(EMBED_TIMEOUT_SECS))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(DaemonError::provider(
                "ollama",
                format!("embed {status} — {body}"),
                http::is_retryable_status(status),
            ));
        }

        let v: Value = resp.json().await?;
        let embedding = v["embedding"].as_array().ok_or_else(|| {
            DaemonError::provider("ollama", "no 'embedding' array in response", false)
        })?;
        let vec = to_f32_vec(embedding);
        if vec.is_empty() {
            return Err(DaemonError::provider("ollama", "empty embedding vector", false));
        }
        Ok(vec)
    }

    /// OpenAI-compatible format: POST /v1/embeddings { model, input }
    async fn embed_openai(&self, text: &str) -> DaemonResult<Vec<f32>> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&json!({ "model": self.model, "input": text }))
            .timeout(Duration::from_secs(EMBED_TIMEOUT_SECS))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(DaemonError::provider(
                "openai",
                format!("embed {status} — {body}"),
                http::is_retryable_status(status),
            ));
        }

        let v: Value = resp.json().await?;
        let embedding = v["data"][0]["embedding"].as_array().ok_or_else(|| {
            DaemonError::provider("openai", "no 'data[0].embedding' array in response", false)
        })?;
        let vec = to_f32_vec(embedding);
        if vec.is_empty() {
            return Err(DaemonError::provider("openai", "empty embedding vector", false));
        }
        Ok(vec)
    }

    /// Check whether the embedding service is reachable.
    pub async fn check_reachable(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

fn to_f32_vec(values: &[Value]) -> Vec<f32> {
    values
        .iter()
        .filter_map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_numbers_convert() {
        let arr = vec![json!(0.5), json!(-1.25), json!(2)];
        assert_eq!(to_f32_vec(&arr), vec![0.5, -1.25, 2.0]);
    }

    #[test]
    fn non_numbers_skipped() {
        let arr = vec![json!("x"), json!(1.0)];
        assert_eq!(to_f32_vec(&arr), vec![1.0]);
    }
}
