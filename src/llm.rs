//! Language backends for chat.
//!
//! [`LanguageBackend`] is the single capability chat needs: turn a prompt
//! into an answer. Two variants ship:
//!
//! | Backend | Endpoint | Answer field |
//! |---|---|---|
//! | `ollama` | `POST {url}/api/generate` (`stream: false`) | `response` |
//! | `openai` | `POST {url}/chat/completions` | `choices[0].message.content` |
//!
//! [`LlmRouter`] picks the variant per request from `[llm]` defaults plus the
//! request's `model_params` overrides.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::embedding::post_with_retry;
use crate::error::{KbError, Result};
use crate::models::{ModelParams, SearchResult};

pub const SYSTEM_PROMPT: &str =
    "You are a helpful assistant that answers questions based on the provided context.";

#[async_trait]
pub trait LanguageBackend: Send + Sync {
    /// Backend identifier reported in chat results (`"ollama"`, `"openai"`).
    fn name(&self) -> &str;
    fn model(&self) -> &str;
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Retrieved passages joined by blank lines, then the question.
pub fn build_prompt(passages: &[SearchResult], query: &str) -> String {
    let context = passages
        .iter()
        .map(|p| p.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        "Context:\n{}\n\nQuestion: {}\n\nAnswer based on the context above:",
        context, query
    )
}

/// First `max_chars` characters followed by `"..."`.
pub fn preview(text: &str, max_chars: usize) -> String {
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}...", cut)
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| KbError::internal(e.to_string()))
}

// ============ Ollama ============

pub struct OllamaBackend {
    client: reqwest::Client,
    url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    max_retries: u32,
}

impl OllamaBackend {
    pub fn new(
        url: &str,
        model: &str,
        temperature: f32,
        max_tokens: u32,
        timeout_secs: u64,
        max_retries: u32,
    ) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout_secs)?,
            url: url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            temperature,
            max_tokens,
            max_retries,
        })
    }

    /// `/api/generate` body. Sampling goes in `options`; Ollama calls the
    /// token cap `num_predict`.
    fn request_body(&self, prompt: &str) -> Value {
        serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": self.temperature,
                "num_predict": self.max_tokens,
            },
        })
    }
}

#[async_trait]
impl LanguageBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = self.request_body(prompt);
        let url = format!("{}/api/generate", self.url);
        let json = post_with_retry(&self.client, &url, None, &body, self.max_retries).await?;
        Ok(json
            .get("response")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }
}

// ============ OpenAI-compatible ============

pub struct OpenAiBackend {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
    temperature: f32,
    max_tokens: u32,
    max_retries: u32,
}

impl OpenAiBackend {
    pub fn new(
        url: &str,
        model: &str,
        api_key: String,
        temperature: f32,
        max_tokens: u32,
        timeout_secs: u64,
        max_retries: u32,
    ) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout_secs)?,
            url: url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
            temperature,
            max_tokens,
            max_retries,
        })
    }
}

#[async_trait]
impl LanguageBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt},
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });
        let url = format!("{}/chat/completions", self.url);
        let json = post_with_retry(
            &self.client,
            &url,
            Some(&self.api_key),
            &body,
            self.max_retries,
        )
        .await?;
        Ok(json
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }
}

// ============ Routing ============

/// Resolves a [`LanguageBackend`] for one chat request.
#[derive(Clone)]
pub enum LlmRouter {
    Configured(LlmConfig),
    /// Every request goes to the same backend regardless of overrides.
    Fixed(Arc<dyn LanguageBackend>),
}

impl LlmRouter {
    pub fn from_config(config: LlmConfig) -> Self {
        Self::Configured(config)
    }

    pub fn fixed(backend: Arc<dyn LanguageBackend>) -> Self {
        Self::Fixed(backend)
    }

    /// Checked at submission so bad overrides never reach the queue.
    pub fn validate(&self, params: &ModelParams) -> Result<()> {
        if let Some(t) = params.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(KbError::validation("temperature must be in [0.0, 2.0]"));
            }
        }
        if params.max_tokens == Some(0) {
            return Err(KbError::validation("max_tokens must be >= 1"));
        }
        match self {
            LlmRouter::Fixed(_) => Ok(()),
            LlmRouter::Configured(config) => match resolve_backend_name(config, params) {
                "ollama" => Ok(()),
                "openai" => openai_key(config).map(|_| ()),
                other => Err(KbError::validation(format!(
                    "unsupported backend: {}. Use 'ollama' or 'openai'",
                    other
                ))),
            },
        }
    }

    pub fn backend_for(&self, params: &ModelParams) -> Result<Arc<dyn LanguageBackend>> {
        let config = match self {
            LlmRouter::Fixed(backend) => return Ok(Arc::clone(backend)),
            LlmRouter::Configured(config) => config,
        };

        match resolve_backend_name(config, params) {
            "ollama" => Ok(Arc::new(OllamaBackend::new(
                params.base_url.as_deref().unwrap_or(&config.ollama_url),
                params.model.as_deref().unwrap_or(&config.ollama_model),
                params.temperature.unwrap_or(config.temperature),
                params.max_tokens.unwrap_or(config.max_tokens),
                config.timeout_secs,
                config.max_retries,
            )?)),
            "openai" => Ok(Arc::new(OpenAiBackend::new(
                params.base_url.as_deref().unwrap_or(&config.openai_url),
                params.model.as_deref().unwrap_or(&config.openai_model),
                openai_key(config)?,
                params.temperature.unwrap_or(config.temperature),
                params.max_tokens.unwrap_or(config.max_tokens),
                config.timeout_secs,
                config.max_retries,
            )?)),
            other => Err(KbError::validation(format!(
                "unsupported backend: {}",
                other
            ))),
        }
    }
}

fn resolve_backend_name<'a>(config: &'a LlmConfig, params: &'a ModelParams) -> &'a str {
    params.backend.as_deref().unwrap_or(&config.backend)
}

fn openai_key(config: &LlmConfig) -> Result<String> {
    std::env::var(&config.openai_api_key_env).map_err(|_| {
        KbError::validation(format!(
            "openai backend requires the {} environment variable",
            config.openai_api_key_env
        ))
    })
}
