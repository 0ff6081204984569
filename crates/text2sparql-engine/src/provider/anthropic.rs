//! Anthropic Messages API.

use serde_json::{json, Value};

use super::{check_status, normalize_base_url, CompletionSettings, ProviderError, ProviderKind};
use crate::prompt::Prompt;

pub const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    api_version: String,
}

impl AnthropicClient {
    pub fn new(
        http: reqwest::Client,
        base_url: Option<&str>,
        api_key: Option<String>,
        api_version: Option<&str>,
    ) -> Self {
        let api_version = api_version
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_ANTHROPIC_VERSION)
            .to_string();
        Self {
            http,
            base_url: normalize_base_url(
                base_url.unwrap_or(""),
                ProviderKind::Anthropic.default_base_url(),
            ),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            api_version,
        }
    }

    pub async fn complete(
        &self,
        prompt: &Prompt,
        model: &str,
        settings: &CompletionSettings,
    ) -> Result<String, ProviderError> {
        let provider = ProviderKind::Anthropic;
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(ProviderError::MissingApiKey {
                provider,
                env_var: "ANTHROPIC_API_KEY",
            })?;

        let body = json!({
            "model": model,
            "system": prompt.system,
            "messages": [{ "role": "user", "content": prompt.user }],
            "max_tokens": settings.max_tokens,
            "temperature": settings.temperature,
        });

        let mut request = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", &self.api_version)
            .json(&body);
        if let Some(timeout) = settings.timeout {
            request = request.timeout(timeout);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(provider, e))?;
        let resp = check_status(provider, resp).await?;
        let value: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::from_reqwest(provider, e))?;

        text_blocks(&value).ok_or_else(|| ProviderError::MalformedResponse {
            provider,
            detail: "no text content blocks".to_string(),
        })
    }
}

/// Concatenate every `{"type": "text"}` block of a Messages response.
fn text_blocks(value: &Value) -> Option<String> {
    let blocks = value.get("content")?.as_array()?;
    let text: Vec<&str> = blocks
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str).unwrap_or("text") == "text")
        .filter_map(|b| b.get("text").and_then(Value::as_str))
        .collect();
    if text.is_empty() {
        return None;
    }
    Some(text.join("").trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_blocks_skip_non_text_content() {
        let v = json!({
            "content": [
                {"type": "thinking", "thinking": "hmm"},
                {"type": "text", "text": "```sparql\nASK {}\n```"}
            ]
        });
        assert_eq!(text_blocks(&v).as_deref(), Some("```sparql\nASK {}\n```"));
        assert_eq!(text_blocks(&json!({"content": []})), None);
    }

    #[test]
    fn version_defaults_when_blank() {
        let c = AnthropicClient::new(reqwest::Client::new(), None, None, Some(" "));
        assert_eq!(c.api_version, DEFAULT_ANTHROPIC_VERSION);
        assert_eq!(c.base_url, "https://api.anthropic.com");
    }
}
