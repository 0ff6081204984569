//! Local Ollama server (`/api/chat`, non-streaming).

use serde_json::{json, Value};

use super::{check_status, normalize_base_url, CompletionSettings, ProviderError, ProviderKind};
use crate::prompt::Prompt;

#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    host: String,
}

impl OllamaClient {
    pub fn new(http: reqwest::Client, host: Option<&str>) -> Self {
        let host = host.unwrap_or("");
        // `OLLAMA_HOST` is commonly set without a scheme.
        let host = if !host.trim().is_empty()
            && !host.starts_with("http://")
            && !host.starts_with("https://")
        {
            format!("http://{}", host.trim())
        } else {
            host.to_string()
        };
        Self {
            http,
            host: normalize_base_url(&host, ProviderKind::Ollama.default_base_url()),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub async fn complete(
        &self,
        prompt: &Prompt,
        model: &str,
        settings: &CompletionSettings,
    ) -> Result<String, ProviderError> {
        let provider = ProviderKind::Ollama;
        let body = json!({
            "model": model,
            "stream": false,
            "messages": [
                { "role": "system", "content": prompt.system },
                { "role": "user", "content": prompt.user },
            ],
            "options": {
                "temperature": settings.temperature,
                "num_predict": settings.max_tokens,
            },
        });

        let mut request = self.http.post(format!("{}/api/chat", self.host)).json(&body);
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

        value
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .ok_or_else(|| ProviderError::MalformedResponse {
                provider,
                detail: "missing message.content".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_gets_http_scheme() {
        let c = OllamaClient::new(reqwest::Client::new(), Some("gpu-box:11434"));
        assert_eq!(c.host(), "http://gpu-box:11434");
        let c = OllamaClient::new(reqwest::Client::new(), None);
        assert_eq!(c.host(), "http://127.0.0.1:11434");
    }
}
