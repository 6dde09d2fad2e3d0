// ── dere engine: LLM Client ────────────────────────────────────────────────
//
// Text generation against a local Ollama server (`/api/generate`) with an
// OpenAI-compatible fallback (`/v1/chat/completions`). Exploration, swarm
// agents, synthesis, missions, and summarization all come through here, so
// this client's gate is the global LLM budget for the whole daemon. The
// gate owns the retry discipline (3 attempts, 1s initial, doubling);
// `call_once` only describes a single attempt.

use super::http::{self, ProviderGate};
use crate::atoms::constants::{LLM_TIMEOUT_SECS, SUMMARY_TIMEOUT_SECS};
use crate::atoms::error::{DaemonError, DaemonResult};
use log::info;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

/// Result of one generation call.
#[derive(Debug, Clone, Default)]
pub struct GenerateResult {
    pub text: String,
    /// Completion tokens reported by the provider (0 when absent).
    pub eval_tokens: i64,
    /// Tool telemetry reported by the backend, when present.
    pub tool_count: i64,
    pub tool_names: Vec<String>,
}

/// Nominal cost model for budget accounting: a flat microdollar rate per
/// 1k completion tokens. Local models are effectively free; the rate
/// exists so daily budgets still bound runaway exploration.
pub fn estimate_cost_microdollars(eval_tokens: i64) -> i64 {
    (eval_tokens.max(0) * 200) / 1000
}

pub struct LlmClient {
    client: Client,
    base_url: String,
    gate: ProviderGate,
}

impl LlmClient {
    pub fn new(base_url: &str) -> Self {
        LlmClient {
            client: http::shared_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            gate: ProviderGate::new("llm", 2, 30),
        }
    }

    /// Generate text. The gate slot is held for the duration; transient
    /// failures retry with backoff, fatal provider errors propagate.
    pub async fn generate(
        &self,
        model: &str,
        system: Option<&str>,
        prompt: &str,
    ) -> DaemonResult<GenerateResult> {
        self.gate
            .run(|| self.call_once(model, system, prompt, LLM_TIMEOUT_SECS))
            .await
    }

    /// Produce a short natural-language summary of `text`. Uses the short
    /// timeout; truncates pathological inputs before sending.
    pub async fn summarize(&self, model: &str, text: &str) -> DaemonResult<String> {
        let clipped = if text.len() > 8_000 { &text[..8_000] } else { text };
        let prompt = format!(
            "Summarize the following in 2-3 sentences. Reply with the summary only.\n\n{clipped}"
        );
        let result = self
            .gate
            .run(|| self.call_once(model, None, &prompt, SUMMARY_TIMEOUT_SECS))
            .await?;
        Ok(result.text.trim().to_string())
    }

    async fn call_once(
        &self,
        model: &str,
        system: Option<&str>,
        prompt: &str,
        timeout_secs: u64,
    ) -> DaemonResult<GenerateResult> {
        match self.generate_ollama(model, system, prompt, timeout_secs).await {
            Ok(result) => Ok(result),
            Err(ollama_err) => {
                info!("[clients] Ollama generate failed ({ollama_err}) — trying OpenAI format");
                self.generate_openai(model, system, prompt, timeout_secs)
                    .await
                    .map_err(|openai_err| {
                        DaemonError::provider(
                            "llm",
                            format!("Ollama: {ollama_err} | OpenAI: {openai_err}"),
                            ollama_err.retryable() || openai_err.retryable(),
                        )
                    })
            }
        }
    }

    /// Ollama: POST /api/generate { model, system?, prompt, stream: false }
    async fn generate_ollama(
        &self,
        model: &str,
        system: Option<&str>,
        prompt: &str,
        timeout_secs: u64,
    ) -> DaemonResult<GenerateResult> {
        let url = format!("{}/api/generate", self.base_url);
        let mut body = json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
        });
        if let Some(sys) = system {
            body["system"] = json!(sys);
        }
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .timeout(Duration::from_secs(timeout_secs))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(DaemonError::provider(
                "ollama",
                format!("generate {status} — {text}"),
                http::is_retryable_status(status),
            ));
        }

        let v: Value = resp.json().await?;
        let text = v["response"]
            .as_str()
            .ok_or_else(|| DaemonError::provider("ollama", "no 'response' in body", false))?
            .to_string();
        Ok(GenerateResult {
            text,
            eval_tokens: v["eval_count"].as_i64().unwrap_or(0),
            tool_count: v["tool_count"].as_i64().unwrap_or(0),
            tool_names: v["tool_names"]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(|t| t.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
        })
    }

    /// OpenAI-compatible: POST /v1/chat/completions
    async fn generate_openai(
        &self,
        model: &str,
        system: Option<&str>,
        prompt: &str,
        timeout_secs: u64,
    ) -> DaemonResult<GenerateResult> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut messages = Vec::new();
        if let Some(sys) = system {
            messages.push(json!({"role": "system", "content": sys}));
        }
        messages.push(json!({"role": "user", "content": prompt}));

        let resp = self
            .client
            .post(&url)
            .json(&json!({ "model": model, "messages": messages }))
            .timeout(Duration::from_secs(timeout_secs))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(DaemonError::provider(
                "openai",
                format!("chat {status} — {text}"),
                http::is_retryable_status(status),
            ));
        }

        let v: Value = resp.json().await?;
        let text = v["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| DaemonError::provider("openai", "no message content", false))?
            .to_string();
        Ok(GenerateResult {
            text,
            eval_tokens: v["usage"]["completion_tokens"].as_i64().unwrap_or(0),
            tool_count: 0,
            tool_names: vec![],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_scales_with_tokens() {
        assert_eq!(estimate_cost_microdollars(0), 0);
        assert_eq!(estimate_cost_microdollars(1000), 200);
        assert_eq!(estimate_cost_microdollars(-5), 0);
    }
}
