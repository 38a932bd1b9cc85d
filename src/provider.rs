// src/provider.rs
//! Provider access layer: binds to the first generative-text backend that
//! passes a liveness probe, in fixed priority order, then caches that
//! binding for the life of the process.
//!
//! Priority puts local/offline candidates before networked ones and cheaper
//! models before dearer ones within a vendor. A candidate whose credential
//! is absent is skipped without any call; a candidate that fails its probe
//! is logged and skipped. Only full exhaustion is an error.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::config::ForecastConfig;
use crate::error::ForecastError;

/// Trivial liveness input sent once per candidate during binding.
const PROBE_PROMPT: &str = "Hello";

/// One generative-text backend. `complete` is a single blocking unit of
/// work from the caller's perspective; retries happen only across
/// candidates in [`ProviderManager`], never against the same backend.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// False when the backend needs a credential that is not configured.
    /// Such candidates are skipped without any network call.
    fn credential_present(&self) -> bool {
        true
    }

    async fn complete(&self, prompt: &str) -> anyhow::Result<String>;
}

pub type DynBackend = Arc<dyn CompletionBackend>;

/// Owns the ordered candidate list and exactly one cached binding.
/// Read-mostly after the first successful probe; safe to share across
/// concurrent pipeline stages behind an `Arc`.
pub struct ProviderManager {
    candidates: Vec<DynBackend>,
    bound: OnceCell<DynBackend>,
}

impl ProviderManager {
    pub fn new(candidates: Vec<DynBackend>) -> Self {
        Self {
            candidates,
            bound: OnceCell::new(),
        }
    }

    /// The production candidate order: Ollama (local, free) first, then
    /// OpenAI, Anthropic and Hugging Face.
    pub fn with_default_candidates(cfg: &ForecastConfig) -> Self {
        Self::new(vec![
            Arc::new(OllamaBackend::new(cfg, None)),
            Arc::new(OpenAiBackend::new(cfg, None)),
            Arc::new(AnthropicBackend::new(cfg, None)),
            Arc::new(HuggingFaceBackend::new(cfg, None)),
        ])
    }

    /// Name of the bound backend, if binding has happened.
    pub fn bound_name(&self) -> Option<&'static str> {
        self.bound.get().map(|b| b.name())
    }

    async fn bind(&self) -> Result<&DynBackend, ForecastError> {
        self.bound
            .get_or_try_init(|| async {
                for candidate in &self.candidates {
                    if !candidate.credential_present() {
                        info!(backend = candidate.name(), "skipping: credential absent");
                        continue;
                    }
                    match candidate.complete(PROBE_PROMPT).await {
                        Ok(text) if !text.trim().is_empty() => {
                            info!(backend = candidate.name(), "bound completion backend");
                            return Ok(Arc::clone(candidate));
                        }
                        Ok(_) => {
                            warn!(backend = candidate.name(), "probe returned empty text");
                        }
                        Err(e) => {
                            warn!(backend = candidate.name(), error = ?e, "probe failed");
                        }
                    }
                }
                Err(ForecastError::ProviderUnavailable(
                    "all completion candidates exhausted".to_string(),
                ))
            })
            .await
    }

    /// Complete a prompt through the bound backend, binding first if
    /// needed. Lower-priority candidates are never probed once a binding
    /// exists.
    pub async fn complete(&self, prompt: &str) -> Result<String, ForecastError> {
        let backend = self.bind().await?;
        backend.complete(prompt).await.map_err(|e| {
            ForecastError::ProviderUnavailable(format!("{} call failed: {e}", backend.name()))
        })
    }
}

fn build_http(cfg: &ForecastConfig) -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent("earnings-forecast-agent/0.1")
        .connect_timeout(Duration::from_secs(cfg.connect_timeout_secs))
        .timeout(Duration::from_secs(cfg.request_timeout_secs))
        .build()
        .expect("reqwest client")
}

// ------------------------------------------------------------
// Concrete backends
// ------------------------------------------------------------

/// Local Ollama instance. No credential; first in priority order.
pub struct OllamaBackend {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaBackend {
    pub fn new(cfg: &ForecastConfig, base_url: Option<&str>) -> Self {
        let base_url = base_url
            .map(str::to_string)
            .or_else(|| std::env::var("OLLAMA_BASE_URL").ok())
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        Self {
            http: build_http(cfg),
            base_url,
            model: "llama3.1:8b".to_string(),
        }
    }
}

#[async_trait]
impl CompletionBackend for OllamaBackend {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            prompt: &'a str,
            stream: bool,
        }
        #[derive(Deserialize)]
        struct Resp {
            response: String,
        }

        let resp = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .json(&Req {
                model: &self.model,
                prompt,
                stream: false,
            })
            .send()
            .await?
            .error_for_status()?;
        let body: Resp = resp.json().await?;
        Ok(body.response)
    }
}

/// OpenAI Chat Completions. Requires `OPENAI_API_KEY`.
pub struct OpenAiBackend {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiBackend {
    /// `model_override`: pass Some("gpt-4o") to override; defaults to gpt-4o-mini.
    pub fn new(cfg: &ForecastConfig, model_override: Option<&str>) -> Self {
        Self {
            http: build_http(cfg),
            api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
            model: model_override.unwrap_or("gpt-4o-mini").to_string(),
        }
    }
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn credential_present(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: String,
        }

        let req = Req {
            model: &self.model,
            messages: vec![Msg {
                role: "user",
                content: prompt,
            }],
            temperature: 0.1,
        };
        let resp = self
            .http
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?
            .error_for_status()?;
        let body: Resp = resp.json().await?;
        Ok(body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default())
    }
}

/// Anthropic Messages API. Requires `ANTHROPIC_API_KEY`.
pub struct AnthropicBackend {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl AnthropicBackend {
    pub fn new(cfg: &ForecastConfig, model_override: Option<&str>) -> Self {
        Self {
            http: build_http(cfg),
            api_key: std::env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
            model: model_override
                .unwrap_or("claude-3-5-sonnet-20241022")
                .to_string(),
        }
    }
}

#[async_trait]
impl CompletionBackend for AnthropicBackend {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn credential_present(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            max_tokens: u32,
            temperature: f32,
            messages: Vec<Msg<'a>>,
        }
        #[derive(Deserialize)]
        struct Resp {
            content: Vec<Block>,
        }
        #[derive(Deserialize)]
        struct Block {
            text: Option<String>,
        }

        let req = Req {
            model: &self.model,
            max_tokens: 4096,
            temperature: 0.1,
            messages: vec![Msg {
                role: "user",
                content: prompt,
            }],
        };
        let resp = self
            .http
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&req)
            .send()
            .await?
            .error_for_status()?;
        let body: Resp = resp.json().await?;
        Ok(body
            .content
            .into_iter()
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join(""))
    }
}

/// Hugging Face Inference API. Requires `HUGGINGFACE_API_TOKEN`.
pub struct HuggingFaceBackend {
    http: reqwest::Client,
    token: String,
    model: String,
}

impl HuggingFaceBackend {
    pub fn new(cfg: &ForecastConfig, model_override: Option<&str>) -> Self {
        Self {
            http: build_http(cfg),
            token: std::env::var("HUGGINGFACE_API_TOKEN").unwrap_or_default(),
            model: model_override
                .unwrap_or("mistralai/Mistral-7B-Instruct-v0.1")
                .to_string(),
        }
    }
}

#[async_trait]
impl CompletionBackend for HuggingFaceBackend {
    fn name(&self) -> &'static str {
        "huggingface"
    }

    fn credential_present(&self) -> bool {
        !self.token.is_empty()
    }

    async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        #[derive(Serialize)]
        struct Req<'a> {
            inputs: &'a str,
        }
        #[derive(Deserialize)]
        struct Generated {
            generated_text: String,
        }

        let resp = self
            .http
            .post(format!(
                "https://api-inference.huggingface.co/models/{}",
                self.model
            ))
            .bearer_auth(&self.token)
            .json(&Req { inputs: prompt })
            .send()
            .await?
            .error_for_status()?;
        let body: Vec<Generated> = resp.json().await?;
        Ok(body
            .into_iter()
            .next()
            .map(|g| g.generated_text)
            .unwrap_or_default())
    }
}

// ------------------------------------------------------------
// Test doubles (public so integration tests can compose pipelines)
// ------------------------------------------------------------

/// Returns a fixed reply and counts calls.
pub struct MockBackend {
    pub label: &'static str,
    pub reply: String,
    pub calls: AtomicUsize,
}

impl MockBackend {
    pub fn new(label: &'static str, reply: impl Into<String>) -> Self {
        Self {
            label,
            reply: reply.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionBackend for MockBackend {
    fn name(&self) -> &'static str {
        self.label
    }

    async fn complete(&self, _prompt: &str) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.reply.clone())
    }
}

/// Fails every call; counts attempts so tests can assert probe behavior.
pub struct FailingBackend {
    pub label: &'static str,
    pub calls: AtomicUsize,
}

impl FailingBackend {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionBackend for FailingBackend {
    fn name(&self) -> &'static str {
        self.label
    }

    async fn complete(&self, _prompt: &str) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("simulated backend failure")
    }
}

/// Reports its credential as missing; any call is a test failure.
pub struct MissingCredentialBackend {
    pub label: &'static str,
    pub calls: AtomicUsize,
}

impl MissingCredentialBackend {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionBackend for MissingCredentialBackend {
    fn name(&self) -> &'static str {
        self.label
    }

    fn credential_present(&self) -> bool {
        false
    }

    async fn complete(&self, _prompt: &str) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok("should never be reached".to_string())
    }
}
