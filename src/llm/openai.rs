//! OpenAI-compatible HTTP backend.
//!
//! Calls `POST {base_url}/chat/completions` and `POST {base_url}/embeddings`.
//! The API key is read once from the environment variable named by
//! `llm.api_key_env`.
//!
//! # Retry Strategy
//!
//! - HTTP 429 and 5xx: retry with exponential backoff
//! - HTTP 401/403: fail immediately as [`GatewayError::Authentication`]
//! - other 4xx: fail immediately as [`GatewayError::Api`]
//! - network errors: retry
//! - backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;

use super::LanguageModel;
use crate::config::LlmConfig;
use crate::error::GatewayError;

pub struct OpenAiModel {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    temperature: f32,
    max_retries: u32,
}

impl OpenAiModel {
    /// Build a client from configuration.
    ///
    /// # Errors
    ///
    /// Fails if the API key variable is unset or empty, or the HTTP client
    /// cannot be constructed.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = match std::env::var(&config.api_key_env) {
            Ok(key) if !key.trim().is_empty() => key,
            _ => bail!("{} environment variable not set", config.api_key_env),
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            temperature: config.temperature,
            max_retries: config.max_retries,
        })
    }

    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError> {
        let url = format!("{}/{}", self.base_url, path);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tracing::debug!(attempt, ?delay, url = %url, "retrying language model request");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return response
                            .json()
                            .await
                            .map_err(|e| GatewayError::InvalidResponse(e.to_string()));
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let err = classify_status(status.as_u16(), body_text);

                    // Rate limited or server error: retry
                    if matches!(err, GatewayError::RateLimited(_))
                        || status.is_server_error()
                    {
                        last_err = Some(err);
                        continue;
                    }

                    return Err(err);
                }
                Err(e) => {
                    last_err = Some(GatewayError::Connection(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| GatewayError::Connection("request failed after retries".into())))
    }
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    async fn complete(
        &self,
        model: &str,
        system: &str,
        prompt: &str,
    ) -> Result<String, GatewayError> {
        let body = serde_json::json!({
            "model": model,
            "temperature": self.temperature,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ],
        });
        let json = self.post_json("chat/completions", &body).await?;
        parse_chat_response(&json)
    }

    async fn embed(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError> {
        let body = serde_json::json!({
            "model": model,
            "input": texts,
        });
        let json = self.post_json("embeddings", &body).await?;
        parse_embeddings_response(&json)
    }
}

fn classify_status(status: u16, body: String) -> GatewayError {
    match status {
        401 | 403 => GatewayError::Authentication(format!("HTTP {}: {}", status, body)),
        429 => GatewayError::RateLimited(body),
        _ => GatewayError::Api { status, body },
    }
}

/// Extract `choices[0].message.content`.
fn parse_chat_response(json: &serde_json::Value) -> Result<String, GatewayError> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            GatewayError::InvalidResponse("missing choices[0].message.content".to_string())
        })
}

/// Extract `data[].embedding`, ordered by `data[].index` when present.
fn parse_embeddings_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, GatewayError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| GatewayError::InvalidResponse("missing data array".to_string()))?;

    let mut indexed = Vec::with_capacity(data.len());

    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| GatewayError::InvalidResponse("missing embedding".to_string()))?;

        let vec = embedding
            .iter()
            .map(|v| v.as_f64().map(|f| f as f32))
            .collect::<Option<Vec<f32>>>()
            .ok_or_else(|| GatewayError::InvalidResponse("non-numeric embedding".to_string()))?;

        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, vec)| vec).collect())
}
