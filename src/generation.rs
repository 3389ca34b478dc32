use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::config::GenerationConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Text-generation backend for the reasoning agent. `transcript` carries the
/// running conversation; the system prompt is passed separately so the
/// provider controls message assembly.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn model_name(&self) -> &str;
    async fn generate(&self, system: &str, transcript: &[ChatMessage]) -> Result<String>;
}

/// OpenAI-compatible `/chat/completions` client.
pub struct OpenAiGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    max_retries: u32,
}

impl OpenAiGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            Error::Config(format!(
                "generation API key env var {} is not set",
                config.api_key_env
            ))
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
        })
    }

    fn endpoint(&self) -> String {
        // Accept base URLs given with or without the /v1 suffix.
        if self.base_url.ends_with("/v1") {
            format!("{}/chat/completions", self.base_url)
        } else {
            format!("{}/v1/chat/completions", self.base_url)
        }
    }
}

#[async_trait]
impl GenerationProvider for OpenAiGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, system: &str, transcript: &[ChatMessage]) -> Result<String> {
        let mut messages = vec![json!({"role": "system", "content": system})];
        for msg in transcript {
            messages.push(json!({"role": msg.role, "content": msg.content}));
        }
        let body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let resp = self
                .client
                .post(self.endpoint())
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(r) if r.status().is_success() => {
                    let parsed: serde_json::Value =
                        r.json().await.map_err(|e| Error::ProviderUnavailable {
                            provider: "generation",
                            message: format!("invalid response body: {e}"),
                        })?;
                    let content = parsed["choices"][0]["message"]["content"]
                        .as_str()
                        .ok_or_else(|| Error::ProviderUnavailable {
                            provider: "generation",
                            message: "response missing message content".into(),
                        })?;
                    return Ok(content.to_string());
                }
                Ok(r) => {
                    let status = r.status();
                    let retryable = status.as_u16() == 429 || status.is_server_error();
                    let detail = r.text().await.unwrap_or_default();
                    if !retryable || attempt > self.max_retries {
                        return Err(Error::ProviderUnavailable {
                            provider: "generation",
                            message: format!("HTTP {status}: {detail}"),
                        });
                    }
                    warn!(%status, attempt, "generation request failed, retrying");
                }
                Err(e) => {
                    if attempt > self.max_retries {
                        return Err(Error::ProviderUnavailable {
                            provider: "generation",
                            message: e.to_string(),
                        });
                    }
                    warn!(error = %e, attempt, "generation request failed, retrying");
                }
            }

            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }
    }
}

/// What the model asked the reasoning loop to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// `SEARCH("...")`: run a knowledge-base lookup with the given query.
    Search(String),
    /// `FINAL(...)`: the final answer; the loop stops reasoning.
    Final(String),
    /// Anything else is recorded as a plain thought.
    Unstructured,
}

impl Directive {
    pub fn parse(input: &str) -> Self {
        // FINAL wins when a reply carries both.
        if let Some(answer) = extract_call(input, "FINAL(") {
            return Directive::Final(answer);
        }
        if let Some(query) = extract_call(input, "SEARCH(") {
            if !query.is_empty() {
                return Directive::Search(query);
            }
        }
        Directive::Unstructured
    }
}

/// Extract the argument of `NAME(...)` using paren-counting, stripping one
/// layer of surrounding quotes. Unclosed calls take everything to the end.
fn extract_call(input: &str, opener: &str) -> Option<String> {
    let idx = input.find(opener)?;
    let after = &input[idx + opener.len()..];
    let mut depth = 1i32;
    let mut end = None;

    for (i, ch) in after.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }

    let content = match end {
        Some(e) => &after[..e],
        None => after,
    };

    let trimmed = content.trim();
    let unquoted = if trimmed.len() >= 2
        && ((trimmed.starts_with('"') && trimmed.ends_with('"'))
            || (trimmed.starts_with('\'') && trimmed.ends_with('\'')))
    {
        &trimmed[1..trimmed.len() - 1]
    } else {
        trimmed
    };

    Some(unquoted.to_string())
}

/// The free text preceding the first directive in a reply, used as the
/// step's recorded thought.
pub fn leading_thought(input: &str) -> &str {
    let cut = ["SEARCH(", "FINAL("]
        .iter()
        .filter_map(|p| input.find(p))
        .min()
        .unwrap_or(input.len());
    input[..cut].trim()
}
