//! LLM provider clients.
//!
//! Every backend answers the same question: given a rendered [`Prompt`], a
//! model name and [`CompletionSettings`], return the model's text. The set of
//! backends is closed ([`ProviderKind`]); adding one means adding a variant
//! here and in [`ProviderClient`].
//!
//! Clients never retry. A failed call surfaces as a [`ProviderError`] that
//! carries the provider, the HTTP status (when there was one) and the raw
//! error body so the caller can decide what to do with it.

pub mod anthropic;
pub mod mock;
pub mod ollama;
pub mod openai_compat;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::prompt::Prompt;

pub use anthropic::AnthropicClient;
pub use mock::{MockClient, ScriptedModel};
pub use ollama::OllamaClient;
pub use openai_compat::OpenAiCompatibleClient;

// ============================================================================
// Provider identity
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAI,
    DeepSeek,
    Gemini,
    OpenRouter,
    Anthropic,
    Ollama,
    /// Deterministic offline backend for demos and smoke tests.
    Mock,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 7] = [
        ProviderKind::OpenAI,
        ProviderKind::DeepSeek,
        ProviderKind::Gemini,
        ProviderKind::OpenRouter,
        ProviderKind::Anthropic,
        ProviderKind::Ollama,
        ProviderKind::Mock,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "openai",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::Gemini => "gemini",
            ProviderKind::OpenRouter => "openrouter",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Mock => "mock",
        }
    }

    /// Case-insensitive lookup by provider name.
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    pub fn default_model(self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "gpt-4o-mini",
            ProviderKind::DeepSeek => "deepseek-chat",
            ProviderKind::Gemini => "gemini-2.0-flash",
            ProviderKind::OpenRouter => "openai/gpt-4o-mini",
            ProviderKind::Anthropic => "claude-3-5-haiku-latest",
            ProviderKind::Ollama => "llama3.2",
            ProviderKind::Mock => "mock",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "https://api.openai.com/v1",
            ProviderKind::DeepSeek => "https://api.deepseek.com",
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
            ProviderKind::OpenRouter => "https://openrouter.ai/api/v1",
            ProviderKind::Anthropic => "https://api.anthropic.com",
            // Prefer IPv4 loopback: `localhost` may resolve to ::1 while Ollama
            // only listens on 127.0.0.1.
            ProviderKind::Ollama => "http://127.0.0.1:11434",
            ProviderKind::Mock => "",
        }
    }

    /// Env var holding the API key, for providers that need one.
    pub fn api_key_env(self) -> Option<&'static str> {
        match self {
            ProviderKind::OpenAI => Some("OPENAI_API_KEY"),
            ProviderKind::DeepSeek => Some("DEEPSEEK_API_KEY"),
            ProviderKind::Gemini => Some("GEMINI_API_KEY"),
            ProviderKind::OpenRouter => Some("OPENROUTER_API_KEY"),
            ProviderKind::Anthropic => Some("ANTHROPIC_API_KEY"),
            ProviderKind::Ollama | ProviderKind::Mock => None,
        }
    }

    pub fn base_url_env(self) -> Option<&'static str> {
        match self {
            ProviderKind::OpenAI => Some("OPENAI_BASE_URL"),
            ProviderKind::DeepSeek => Some("DEEPSEEK_BASE_URL"),
            ProviderKind::Gemini => Some("GEMINI_BASE_URL"),
            ProviderKind::OpenRouter => Some("OPENROUTER_BASE_URL"),
            ProviderKind::Anthropic => Some("ANTHROPIC_BASE_URL"),
            ProviderKind::Ollama => Some("OLLAMA_HOST"),
            ProviderKind::Mock => None,
        }
    }

    /// Providers that speak the OpenAI `/chat/completions` dialect.
    pub fn is_openai_compatible(self) -> bool {
        matches!(
            self,
            ProviderKind::OpenAI
                | ProviderKind::DeepSeek
                | ProviderKind::Gemini
                | ProviderKind::OpenRouter
        )
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Call contract
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionSettings {
    pub max_tokens: u32,
    pub temperature: f32,
    /// Per-request timeout (`None` disables it).
    pub timeout: Option<Duration>,
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            max_tokens: 4000,
            temperature: 0.0,
            timeout: Some(Duration::from_secs(120)),
        }
    }
}

/// A model bound to a provider, ready to complete prompts.
///
/// Planner, reviewer and generator only ever see this trait, which is what
/// lets tests drive them with [`ScriptedModel`].
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn provider_name(&self) -> &str;

    fn model_name(&self) -> &str;

    async fn complete(&self, prompt: &Prompt) -> Result<String, ProviderError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider}: missing API key (set {env_var})")]
    MissingApiKey {
        provider: ProviderKind,
        env_var: &'static str,
    },
    #[error("{provider}: authentication failed (HTTP {status}): {body}")]
    Auth {
        provider: ProviderKind,
        status: u16,
        body: String,
    },
    #[error("{provider}: rate limited (HTTP 429): {body}")]
    RateLimited {
        provider: ProviderKind,
        retry_after_secs: Option<u64>,
        body: String,
    },
    #[error("{provider}: HTTP {status}: {body}")]
    Http {
        provider: ProviderKind,
        status: u16,
        body: String,
    },
    #[error("{provider}: malformed response: {detail}")]
    MalformedResponse {
        provider: ProviderKind,
        detail: String,
    },
    #[error("{provider}: request timed out")]
    Timeout { provider: ProviderKind },
    #[error("{provider}: network error: {detail}")]
    Network {
        provider: ProviderKind,
        detail: String,
    },
}

impl ProviderError {
    /// Classify a non-success HTTP status.
    pub fn from_status(
        provider: ProviderKind,
        status: u16,
        retry_after_secs: Option<u64>,
        body: String,
    ) -> Self {
        match status {
            401 | 403 => ProviderError::Auth {
                provider,
                status,
                body,
            },
            429 => ProviderError::RateLimited {
                provider,
                retry_after_secs,
                body,
            },
            _ => ProviderError::Http {
                provider,
                status,
                body,
            },
        }
    }

    pub(crate) fn from_reqwest(provider: ProviderKind, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout { provider }
        } else if err.is_decode() {
            ProviderError::MalformedResponse {
                provider,
                detail: err.to_string(),
            }
        } else {
            ProviderError::Network {
                provider,
                detail: err.to_string(),
            }
        }
    }

    pub fn provider(&self) -> ProviderKind {
        match self {
            ProviderError::MissingApiKey { provider, .. }
            | ProviderError::Auth { provider, .. }
            | ProviderError::RateLimited { provider, .. }
            | ProviderError::Http { provider, .. }
            | ProviderError::MalformedResponse { provider, .. }
            | ProviderError::Timeout { provider }
            | ProviderError::Network { provider, .. } => *provider,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Auth { status, .. } | ProviderError::Http { status, .. } => {
                Some(*status)
            }
            ProviderError::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    /// Whether a caller could reasonably try the same call again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::RateLimited { .. }
            | ProviderError::Timeout { .. }
            | ProviderError::Network { .. } => true,
            ProviderError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::MissingApiKey { .. } => "missing_api_key",
            ProviderError::Auth { .. } => "auth",
            ProviderError::RateLimited { .. } => "rate_limited",
            ProviderError::Http { .. } => "http",
            ProviderError::MalformedResponse { .. } => "malformed_response",
            ProviderError::Timeout { .. } => "timeout",
            ProviderError::Network { .. } => "network",
        }
    }
}

/// Turn a non-success response into a classified [`ProviderError`].
pub(crate) async fn check_status(
    provider: ProviderKind,
    resp: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let retry_after = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok());
    let body = resp.text().await.unwrap_or_default();
    Err(ProviderError::from_status(
        provider,
        status.as_u16(),
        retry_after,
        body,
    ))
}

pub(crate) fn normalize_base_url(base_url: &str, default: &str) -> String {
    let mut host = base_url.trim().to_string();
    if host.is_empty() {
        host = default.to_string();
    }
    if !host.is_empty() && !host.starts_with("http://") && !host.starts_with("https://") {
        host = format!("https://{host}");
    }
    host.trim_end_matches('/').to_string()
}

// ============================================================================
// Unified client
// ============================================================================

/// Unified client that dispatches to the concrete backend.
#[derive(Debug, Clone)]
pub enum ProviderClient {
    OpenAiCompatible(OpenAiCompatibleClient),
    Anthropic(AnthropicClient),
    Ollama(OllamaClient),
    Mock(MockClient),
}

impl ProviderClient {
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderClient::OpenAiCompatible(c) => c.kind(),
            ProviderClient::Anthropic(_) => ProviderKind::Anthropic,
            ProviderClient::Ollama(_) => ProviderKind::Ollama,
            ProviderClient::Mock(_) => ProviderKind::Mock,
        }
    }

    pub async fn complete(
        &self,
        prompt: &Prompt,
        model: &str,
        settings: &CompletionSettings,
    ) -> Result<String, ProviderError> {
        match self {
            ProviderClient::OpenAiCompatible(c) => c.complete(prompt, model, settings).await,
            ProviderClient::Anthropic(c) => c.complete(prompt, model, settings).await,
            ProviderClient::Ollama(c) => c.complete(prompt, model, settings).await,
            ProviderClient::Mock(c) => c.complete(prompt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_names_round_trip() {
        for kind in ProviderKind::ALL {
            assert_eq!(ProviderKind::parse(kind.name()), Some(kind));
        }
        assert_eq!(ProviderKind::parse("  DeepSeek "), Some(ProviderKind::DeepSeek));
        assert_eq!(ProviderKind::parse("bard"), None);
    }

    #[test]
    fn status_classification() {
        let auth = ProviderError::from_status(ProviderKind::OpenAI, 401, None, "bad key".into());
        assert_eq!(auth.kind(), "auth");
        assert!(!auth.is_retryable());

        let limited =
            ProviderError::from_status(ProviderKind::DeepSeek, 429, Some(30), "slow down".into());
        assert!(matches!(
            limited,
            ProviderError::RateLimited {
                retry_after_secs: Some(30),
                ..
            }
        ));
        assert!(limited.is_retryable());
        assert_eq!(limited.status(), Some(429));

        let server = ProviderError::from_status(ProviderKind::Gemini, 503, None, String::new());
        assert!(server.is_retryable());
        let client = ProviderError::from_status(ProviderKind::Gemini, 400, None, String::new());
        assert!(!client.is_retryable());
        assert_eq!(client.provider(), ProviderKind::Gemini);
    }

    #[test]
    fn base_urls_are_normalized() {
        assert_eq!(
            normalize_base_url("api.deepseek.com/", "https://x"),
            "https://api.deepseek.com"
        );
        assert_eq!(normalize_base_url("  ", "http://127.0.0.1:11434/"), "http://127.0.0.1:11434");
    }
}
