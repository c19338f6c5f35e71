use std::{fmt, str::FromStr, time::Duration};

use reqwest::{StatusCode, blocking::Client};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

/// Failure reported by a chat backend, classified at the HTTP boundary.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Rate or resource exhaustion. Never retried.
    #[error("{provider}: quota exhausted: {detail}")]
    QuotaExhausted {
        provider: &'static str,
        detail: String,
    },

    #[error("{provider}: request failed: {source}")]
    Http {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider}: HTTP {status}: {body}")]
    Status {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("{provider}: unexpected response: {reason}")]
    InvalidResponse {
        provider: &'static str,
        reason: String,
    },
}

impl ProviderError {
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaExhausted { .. })
    }
}

/// A text-in, text-out chat capability.
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn chat(&self, system: &str, user: &str) -> Result<String, ProviderError>;
}

/// Map a non-success HTTP response to a [`ProviderError`].
///
/// HTTP 429 and a structured `error.status` of `RESOURCE_EXHAUSTED` are
/// quota conditions; everything else is a plain status failure.
pub fn classify_failure(
    provider: &'static str,
    status: u16,
    body: &str,
) -> ProviderError {
    let structured = serde_json::from_str::<Value>(body).ok();
    let error_status = structured
        .as_ref()
        .and_then(|v| v.pointer("/error/status"))
        .and_then(Value::as_str);
    let message = structured
        .as_ref()
        .and_then(|v| v.pointer("/error/message"))
        .and_then(Value::as_str)
        .map(str::to_string);

    if status == StatusCode::TOO_MANY_REQUESTS.as_u16()
        || error_status == Some("RESOURCE_EXHAUSTED")
    {
        return ProviderError::QuotaExhausted {
            provider,
            detail: message.unwrap_or_else(|| format!("HTTP {status}")),
        };
    }

    ProviderError::Status {
        provider,
        status,
        body: message.unwrap_or_else(|| truncate(body, 512)),
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((i, _)) => format!("{}...", &s[..i]),
        None => s.to_string(),
    }
}

fn http_client(
    provider: &'static str,
    timeout: Duration,
) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|source| ProviderError::Http { provider, source })
}

fn post_json(
    provider: &'static str,
    request: reqwest::blocking::RequestBuilder,
    body: &Value,
) -> Result<Value, ProviderError> {
    let response = request
        .json(body)
        .send()
        .map_err(|source| ProviderError::Http { provider, source })?;
    let status = response.status();
    let text = response
        .text()
        .map_err(|source| ProviderError::Http { provider, source })?;

    if !status.is_success() {
        return Err(classify_failure(provider, status.as_u16(), &text));
    }

    serde_json::from_str(&text).map_err(|e| ProviderError::InvalidResponse {
        provider,
        reason: format!("body is not JSON: {e}"),
    })
}

/// Google Gemini `generateContent` client.
pub struct GeminiClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl GeminiClient {
    pub const NAME: &'static str = "gemini";

    pub fn new(
        base_url: &str,
        model: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(Self::NAME, timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        )
    }
}

/// Concatenated text parts of the first Gemini candidate.
fn gemini_text(response: &Value) -> Option<String> {
    let parts = response
        .pointer("/candidates/0/content/parts")?
        .as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    (!text.trim().is_empty()).then(|| text.trim().to_string())
}

impl ChatProvider for GeminiClient {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn chat(&self, system: &str, user: &str) -> Result<String, ProviderError> {
        let body = json!({
            "systemInstruction": { "parts": [{ "text": system }] },
            "contents": [{ "role": "user", "parts": [{ "text": user }] }],
        });
        debug!(model = %self.model, "calling gemini");
        let request = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key);
        let response = post_json(Self::NAME, request, &body)?;

        gemini_text(&response).ok_or_else(|| ProviderError::InvalidResponse {
            provider: Self::NAME,
            reason: "no candidate text".to_string(),
        })
    }
}

impl fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiClient")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

/// Local Ollama `/api/chat` client.
pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaClient {
    pub const NAME: &'static str = "ollama";

    pub fn new(
        base_url: &str,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(Self::NAME, timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }
}

impl ChatProvider for OllamaClient {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn chat(&self, system: &str, user: &str) -> Result<String, ProviderError> {
        let body = json!({
            "model": self.model,
            "stream": false,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
        });
        debug!(model = %self.model, "calling ollama");
        let request = self.client.post(format!("{}/api/chat", self.base_url));
        let response = post_json(Self::NAME, request, &body)?;

        response
            .pointer("/message/content")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .ok_or_else(|| ProviderError::InvalidResponse {
                provider: Self::NAME,
                reason: "missing message.content".to_string(),
            })
    }
}

impl fmt::Debug for OllamaClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OllamaClient")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

/// Which chat backend drives extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Gemini,
    Ollama,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gemini => GeminiClient::NAME,
            Self::Ollama => OllamaClient::NAME,
        }
    }

    /// Parse a provider name, falling back to Gemini for unknown values.
    pub fn parse_lenient(value: &str) -> Self {
        value.parse().unwrap_or_else(|_| {
            warn!(provider = value, "unknown LLM provider, falling back to gemini");
            Self::Gemini
        })
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" => Ok(Self::Gemini),
            "ollama" => Ok(Self::Ollama),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

/// The concrete backend, chosen once at construction.
#[derive(Debug)]
pub enum ChatBackend {
    Gemini(GeminiClient),
    Ollama(OllamaClient),
}

impl ChatProvider for ChatBackend {
    fn name(&self) -> &'static str {
        match self {
            Self::Gemini(c) => c.name(),
            Self::Ollama(c) => c.name(),
        }
    }

    fn chat(&self, system: &str, user: &str) -> Result<String, ProviderError> {
        match self {
            Self::Gemini(c) => c.chat(system, user),
            Self::Ollama(c) => c.chat(system, user),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_429_is_quota() {
        let err = classify_failure("gemini", 429, "slow down");
        assert!(err.is_quota());
        assert!(matches!(
            err,
            ProviderError::QuotaExhausted {
                provider: "gemini",
                ..
            }
        ));
    }

    #[test]
    fn resource_exhausted_body_is_quota() {
        let body = r#"{"error": {"code": 403, "message": "Quota exceeded for metric",
                       "status": "RESOURCE_EXHAUSTED"}}"#;
        match classify_failure("gemini", 403, body) {
            ProviderError::QuotaExhausted { detail, .. } => {
                assert_eq!(detail, "Quota exceeded for metric");
            }
            other => panic!("expected quota, got {other:?}"),
        }
    }

    #[test]
    fn quota_word_in_message_is_not_quota() {
        let body = r#"{"error": {"code": 500, "message": "quota 429 internal",
                       "status": "INTERNAL"}}"#;
        let err = classify_failure("gemini", 500, body);
        assert!(!err.is_quota());
        assert!(matches!(err, ProviderError::Status { status: 500, .. }));
    }

    #[test]
    fn gemini_text_joins_parts() {
        let response = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "{\"desc\": " }, { "text": "\"x\"}" }] }
            }]
        });
        assert_eq!(gemini_text(&response).unwrap(), "{\"desc\": \"x\"}");
        assert!(gemini_text(&json!({ "candidates": [] })).is_none());
    }

    #[test]
    fn provider_kind_parsing() {
        assert_eq!("Ollama".parse::<ProviderKind>().unwrap(), ProviderKind::Ollama);
        assert_eq!(ProviderKind::parse_lenient("openai"), ProviderKind::Gemini);
        assert_eq!(ProviderKind::Gemini.to_string(), "gemini");
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(2000);
        match classify_failure("ollama", 500, &body) {
            ProviderError::Status { body, .. } => assert!(body.len() < 600),
            other => panic!("unexpected {other:?}"),
        }
    }
}
