//! Application configuration.
//!
//! Resolution order, later wins:
//!
//! 1. built-in defaults ([`AppConfig::default`]);
//! 2. a JSON file (`--config` or `TEXT2SPARQL_CONFIG`);
//! 3. `TEXT2SPARQL_*` environment overrides;
//! 4. provider credentials and endpoints from the provider env vars.
//!
//! API keys only ever come from the environment; they are never read from or
//! written to the config file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::generator::{DEFAULT_MAX_CORRECTION_CYCLES, MAX_CORRECTION_CYCLES_CAP};
use crate::prompt::Technique;
use crate::provider::{CompletionSettings, ProviderKind};

pub const CONFIG_PATH_ENV: &str = "TEXT2SPARQL_CONFIG";
pub const PROVIDER_ENV: &str = "TEXT2SPARQL_PROVIDER";
pub const MODEL_ENV: &str = "TEXT2SPARQL_MODEL";
pub const MAX_TOKENS_ENV: &str = "TEXT2SPARQL_MAX_TOKENS";
pub const TIMEOUT_SECS_ENV: &str = "TEXT2SPARQL_TIMEOUT_SECS";
pub const MAX_CORRECTIONS_ENV: &str = "TEXT2SPARQL_MAX_CORRECTIONS";
pub const ANTHROPIC_VERSION_ENV: &str = "ANTHROPIC_VERSION";

pub const DEFAULT_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_SPARQL_ENDPOINT: &str = "https://dbpedia.org/sparql";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {var}: {message}")]
    Env { var: String, message: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Per-provider overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderSettings {
    pub base_url: Option<String>,
    /// Model used when this provider is selected without an explicit model.
    pub model: Option<String>,
    pub api_version: Option<String>,
    #[serde(skip)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub default_provider: ProviderKind,
    /// Empty means the provider's own default model.
    pub default_model: String,
    pub default_technique: Technique,
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_correction_cycles: u32,
    pub timeout_secs: u64,
    pub batch_concurrency: usize,
    pub output_file: PathBuf,
    /// Named datasets, e.g. `"qald9_test": "data/qald_9_test.json"`.
    pub dataset_paths: BTreeMap<String, PathBuf>,
    pub sparql_endpoint: String,
    /// Keyed by provider name.
    pub providers: BTreeMap<String, ProviderSettings>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_provider: ProviderKind::DeepSeek,
            default_model: String::new(),
            default_technique: Technique::ZeroShot,
            max_tokens: 4000,
            temperature: 0.0,
            max_correction_cycles: DEFAULT_MAX_CORRECTION_CYCLES,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            batch_concurrency: 4,
            output_file: PathBuf::from("outputs/predicted/predictions.jsonl"),
            dataset_paths: BTreeMap::new(),
            sparql_endpoint: DEFAULT_SPARQL_ENDPOINT.to_string(),
            providers: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    /// Load from `path` (or `TEXT2SPARQL_CONFIG`), then apply the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply overrides from `lookup` (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(provider) = get(PROVIDER_ENV) {
            let kind = ProviderKind::parse(&provider).ok_or_else(|| ConfigError::Env {
                var: PROVIDER_ENV.to_string(),
                message: format!("unknown provider `{provider}`"),
            })?;
            if kind != self.default_provider {
                // A model configured for another provider makes no sense here.
                self.default_model.clear();
            }
            self.default_provider = kind;
        }
        if let Some(model) = get(MODEL_ENV) {
            self.default_model = model;
        }
        if let Some(v) = get(MAX_TOKENS_ENV) {
            self.max_tokens = parse_env(MAX_TOKENS_ENV, &v)?;
        }
        if let Some(v) = get(TIMEOUT_SECS_ENV) {
            self.timeout_secs = parse_env(TIMEOUT_SECS_ENV, &v)?;
        }
        if let Some(v) = get(MAX_CORRECTIONS_ENV) {
            self.max_correction_cycles = parse_env(MAX_CORRECTIONS_ENV, &v)?;
        }

        for kind in ProviderKind::ALL {
            let key = kind.api_key_env().and_then(|var| get(var));
            let base_url = kind.base_url_env().and_then(|var| get(var));
            let version = (kind == ProviderKind::Anthropic)
                .then(|| get(ANTHROPIC_VERSION_ENV))
                .flatten();
            if key.is_none() && base_url.is_none() && version.is_none() {
                continue;
            }
            let settings = self.providers.entry(kind.name().to_string()).or_default();
            if key.is_some() {
                settings.api_key = key;
            }
            if base_url.is_some() {
                settings.base_url = base_url;
            }
            if version.is_some() {
                settings.api_version = version;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for name in self.providers.keys() {
            if ProviderKind::parse(name).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "unknown provider `{name}` in providers"
                )));
            }
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::Invalid("max_tokens must be positive".into()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::Invalid(format!(
                "temperature {} is outside 0.0..=2.0",
                self.temperature
            )));
        }
        if self.max_correction_cycles > MAX_CORRECTION_CYCLES_CAP {
            return Err(ConfigError::Invalid(format!(
                "max_correction_cycles {} exceeds {MAX_CORRECTION_CYCLES_CAP}",
                self.max_correction_cycles
            )));
        }
        if self.batch_concurrency == 0 {
            return Err(ConfigError::Invalid("batch_concurrency must be at least 1".into()));
        }
        url::Url::parse(&self.sparql_endpoint).map_err(|e| {
            ConfigError::Invalid(format!("sparql_endpoint `{}`: {e}", self.sparql_endpoint))
        })?;
        Ok(())
    }

    pub fn provider_settings(&self, kind: ProviderKind) -> ProviderSettings {
        self.providers
            .iter()
            .find(|(name, _)| ProviderKind::parse(name) == Some(kind))
            .map(|(_, s)| s.clone())
            .unwrap_or_default()
    }

    /// Model used for `kind` when the caller names none.
    pub fn default_model_for(&self, kind: ProviderKind) -> String {
        if kind == self.default_provider && !self.default_model.trim().is_empty() {
            return self.default_model.clone();
        }
        self.provider_settings(kind)
            .model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| kind.default_model().to_string())
    }

    pub fn completion_settings(&self) -> CompletionSettings {
        CompletionSettings {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            timeout: (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs)),
        }
    }

    /// Resolve a dataset argument: a configured name, or a path as-is.
    pub fn dataset_path(&self, name_or_path: &str) -> PathBuf {
        self.dataset_paths
            .get(name_or_path)
            .cloned()
            .unwrap_or_else(|| PathBuf::from(name_or_path))
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Env {
        var: var.to_string(),
        message: format!("`{value}`: {e}"),
    })
}
