//! OpenAI `/chat/completions` dialect (OpenAI, DeepSeek, Gemini, OpenRouter).

use serde_json::{json, Value};

use super::{check_status, normalize_base_url, CompletionSettings, ProviderError, ProviderKind};
use crate::prompt::Prompt;

#[derive(Debug, Clone)]
pub struct OpenAiCompatibleClient {
    kind: ProviderKind,
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatibleClient {
    pub fn new(
        kind: ProviderKind,
        http: reqwest::Client,
        base_url: Option<&str>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            kind,
            http,
            base_url: normalize_base_url(base_url.unwrap_or(""), kind.default_base_url()),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn complete(
        &self,
        prompt: &Prompt,
        model: &str,
        settings: &CompletionSettings,
    ) -> Result<String, ProviderError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(ProviderError::MissingApiKey {
                provider: self.kind,
                env_var: self.kind.api_key_env().unwrap_or("API key"),
            })?;

        let body = request_body(prompt, model, settings);
        let url = format!("{}/chat/completions", self.base_url);

        let mut request = self.http.post(&url).bearer_auth(api_key).json(&body);
        if let Some(timeout) = settings.timeout {
            request = request.timeout(timeout);
        }
        if self.kind == ProviderKind::OpenRouter {
            request = request.header("X-Title", "text2sparql");
        }

        tracing::debug!(provider = %self.kind, model, %url, "chat completion request");
        let resp = request
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(self.kind, e))?;
        let resp = check_status(self.kind, resp).await?;
        let value: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::from_reqwest(self.kind, e))?;

        message_content(&value).ok_or_else(|| ProviderError::MalformedResponse {
            provider: self.kind,
            detail: "missing choices[0].message.content".to_string(),
        })
    }
}

fn request_body(prompt: &Prompt, model: &str, settings: &CompletionSettings) -> Value {
    json!({
        "model": model,
        "messages": [
            { "role": "system", "content": prompt.system },
            { "role": "user", "content": prompt.user },
        ],
        "max_tokens": settings.max_tokens,
        "temperature": settings.temperature,
    })
}

/// `choices[0].message.content`, either a string or a list of text parts.
fn message_content(value: &Value) -> Option<String> {
    let content = value
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?;
    match content {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Array(parts) => {
            let text: Vec<&str> = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect();
            if text.is_empty() {
                None
            } else {
                Some(text.join("").trim().to_string())
            }
        }
        _ => None,
    }
}
