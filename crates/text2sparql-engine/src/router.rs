//! Resolve `(provider?, model?)` to a ready-to-call model.
//!
//! The router is built once from [`AppConfig`] and never mutated; share it
//! behind an `Arc`. All provider clients share one HTTP connection pool.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::config::AppConfig;
use crate::prompt::Prompt;
use crate::provider::{
    AnthropicClient, CompletionSettings, LanguageModel, MockClient, OllamaClient,
    OpenAiCompatibleClient, ProviderClient, ProviderError, ProviderKind,
};

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("unknown provider `{name}` (known: {known})")]
    UnknownProvider { name: String, known: String },
    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

impl RouterError {
    fn unknown(name: &str) -> Self {
        let known: Vec<&str> = ProviderKind::ALL.iter().map(|k| k.name()).collect();
        RouterError::UnknownProvider {
            name: name.to_string(),
            known: known.join(", "),
        }
    }
}

/// A provider client bound to one model and one set of call settings.
#[derive(Debug, Clone)]
pub struct RoutedModel {
    client: ProviderClient,
    provider: ProviderKind,
    model: String,
    settings: CompletionSettings,
}

impl RoutedModel {
    pub fn provider(&self) -> ProviderKind {
        self.provider
    }
}

#[async_trait]
impl LanguageModel for RoutedModel {
    fn provider_name(&self) -> &str {
        self.provider.name()
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &Prompt) -> Result<String, ProviderError> {
        self.client.complete(prompt, &self.model, &self.settings).await
    }
}

#[derive(Debug)]
pub struct ModelRouter {
    clients: BTreeMap<ProviderKind, ProviderClient>,
    default_models: BTreeMap<ProviderKind, String>,
    default_provider: ProviderKind,
    settings: CompletionSettings,
}

impl ModelRouter {
    pub fn from_config(config: &AppConfig) -> Result<Self, RouterError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("text2sparql/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RouterError::HttpClient(e.to_string()))?;

        let mut clients = BTreeMap::new();
        let mut default_models = BTreeMap::new();
        for kind in ProviderKind::ALL {
            let settings = config.provider_settings(kind);
            let base_url = settings.base_url.as_deref();
            let client = match kind {
                ProviderKind::Anthropic => ProviderClient::Anthropic(AnthropicClient::new(
                    http.clone(),
                    base_url,
                    settings.api_key.clone(),
                    settings.api_version.as_deref(),
                )),
                ProviderKind::Ollama => {
                    ProviderClient::Ollama(OllamaClient::new(http.clone(), base_url))
                }
                ProviderKind::Mock => ProviderClient::Mock(MockClient),
                _ => ProviderClient::OpenAiCompatible(OpenAiCompatibleClient::new(
                    kind,
                    http.clone(),
                    base_url,
                    settings.api_key.clone(),
                )),
            };
            clients.insert(kind, client);
            default_models.insert(kind, config.default_model_for(kind));
        }

        tracing::debug!(default_provider = %config.default_provider, "model router ready");
        Ok(Self {
            clients,
            default_models,
            default_provider: config.default_provider,
            settings: config.completion_settings(),
        })
    }

    pub fn default_provider(&self) -> ProviderKind {
        self.default_provider
    }

    pub fn default_model(&self, kind: ProviderKind) -> &str {
        self.default_models
            .get(&kind)
            .map(String::as_str)
            .unwrap_or_else(|| kind.default_model())
    }

    /// Blank provider or model names count as omitted.
    pub fn route(&self, provider: Option<&str>, model: Option<&str>) -> Result<RoutedModel, RouterError> {
        let kind = match provider.map(str::trim).filter(|p| !p.is_empty()) {
            Some(name) => ProviderKind::parse(name).ok_or_else(|| RouterError::unknown(name))?,
            None => self.default_provider,
        };
        let client = self
            .clients
            .get(&kind)
            .cloned()
            .ok_or_else(|| RouterError::unknown(kind.name()))?;
        let model = model
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.default_model(kind).to_string());

        Ok(RoutedModel {
            client,
            provider: kind,
            model,
            settings: self.settings.clone(),
        })
    }
}
