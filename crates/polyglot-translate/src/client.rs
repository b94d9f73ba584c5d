//! Translation API client.
//!
//! Stateless: given a bearer token and text, calls the external API once and
//! classifies the outcome. Retry decisions belong to the dispatch pipeline.

use async_trait::async_trait;
use polyglot_core::config::TranslatorConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// How a translation attempt failed. The classification drives the dispatch
/// pipeline's retry policy.
#[derive(Debug, Error)]
pub enum TranslateError {
    /// The API rejected the bearer token (401/403) despite local
    /// bookkeeping saying it is still valid. Recoverable via one forced
    /// refresh.
    #[error("translation API rejected the access token")]
    AuthRejected,

    /// The API throttled the request (429). Recoverable via one bounded
    /// backoff.
    #[error("translation API rate limit hit")]
    RateLimited,

    /// No credential could be obtained within the wait bound; the process
    /// is likely still starting up or the token issuer is down.
    #[error("translation service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Anything else: malformed input, unsupported language, network error,
    /// deadline expiry. Not retried.
    #[error("translation failed: {0}")]
    Other(String),
}

/// The external translation endpoint.
#[async_trait]
pub trait Translator: Send + Sync {
    /// Translate `text` into `target_language` using `token` to
    /// authenticate. Must not retry internally.
    async fn translate(
        &self,
        token: &str,
        text: &str,
        target_language: &str,
    ) -> Result<String, TranslateError>;
}

#[derive(Serialize)]
struct TranslateRequestBody<'a> {
    #[serde(rename = "Text")]
    text: &'a str,
}

#[derive(Deserialize)]
struct TranslateResponseItem {
    #[serde(default)]
    translations: Vec<TranslatedPiece>,
}

#[derive(Deserialize)]
struct TranslatedPiece {
    #[serde(default)]
    text: String,
}

/// Client for the Microsoft Translator v3 REST API.
pub struct HttpTranslator {
    client: reqwest::Client,
    translate_url: String,
    timeout: Duration,
}

impl HttpTranslator {
    /// Create from config values.
    pub fn from_config(cfg: &TranslatorConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            translate_url: cfg.translate_url.clone(),
            timeout: Duration::from_secs(cfg.translate_timeout_secs),
        }
    }
}

#[async_trait]
impl Translator for HttpTranslator {
    async fn translate(
        &self,
        token: &str,
        text: &str,
        target_language: &str,
    ) -> Result<String, TranslateError> {
        let url = format!(
            "{}/translate?api-version=3.0&to={target_language}",
            self.translate_url
        );
        debug!("translator: POST {url}");

        let body = vec![TranslateRequestBody { text }];
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TranslateError::Other(format!("translation call timed out after {:?}", self.timeout))
                } else {
                    TranslateError::Other(format!("translation request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), detail));
        }

        let parsed: Vec<TranslateResponseItem> = response
            .json()
            .await
            .map_err(|e| TranslateError::Other(format!("failed to parse response: {e}")))?;

        parsed
            .first()
            .and_then(|item| item.translations.first())
            .map(|piece| piece.text.clone())
            .ok_or_else(|| TranslateError::Other("response contained no translation".to_string()))
    }
}

/// Map a non-success HTTP status to the failure taxonomy.
fn classify_status(status: u16, detail: String) -> TranslateError {
    match status {
        401 | 403 => TranslateError::AuthRejected,
        429 => TranslateError::RateLimited,
        _ => TranslateError::Other(format!("API returned {status}: {detail}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_auth_statuses() {
        assert!(matches!(
            classify_status(401, String::new()),
            TranslateError::AuthRejected
        ));
        assert!(matches!(
            classify_status(403, String::new()),
            TranslateError::AuthRejected
        ));
    }

    #[test]
    fn test_classify_rate_limit() {
        assert!(matches!(
            classify_status(429, String::new()),
            TranslateError::RateLimited
        ));
    }

    #[test]
    fn test_classify_other_statuses() {
        for status in [400, 404, 500, 503] {
            match classify_status(status, "boom".into()) {
                TranslateError::Other(detail) => {
                    assert!(detail.contains(&status.to_string()));
                    assert!(detail.contains("boom"));
                }
                other => panic!("status {status} should classify as Other, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_request_body_serialization() {
        let body = vec![TranslateRequestBody { text: "hello" }];
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json[0]["Text"], "hello");
    }

    #[test]
    fn test_response_parsing() {
        let json = r#"[{"detectedLanguage":{"language":"en","score":1.0},"translations":[{"text":"Hallo","to":"de"}]}]"#;
        let parsed: Vec<TranslateResponseItem> = serde_json::from_str(json).unwrap();
        let text = parsed
            .first()
            .and_then(|i| i.translations.first())
            .map(|p| p.text.clone());
        assert_eq!(text, Some("Hallo".into()));
    }

    #[test]
    fn test_empty_response_has_no_translation() {
        let parsed: Vec<TranslateResponseItem> = serde_json::from_str("[]").unwrap();
        assert!(parsed.first().is_none());
    }
}
