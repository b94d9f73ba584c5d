//! Per-request translation dispatch with bounded retries.
//!
//! One `translate` call per inbound request. Every retry here is internal
//! and bounded: at most one extra attempt per failure class, so a request
//! makes at most three API calls before a terminal result.

use crate::client::{TranslateError, Translator};
use crate::refresher::RefresherHandle;
use polyglot_core::config::TranslatorConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// A single translation request, consumed exactly once.
#[derive(Debug, Clone)]
pub struct TranslationRequest {
    pub text: String,
    pub target_language: String,
    /// Opaque identifier for tracing a request through logs.
    pub correlation_id: Uuid,
}

impl TranslationRequest {
    /// Create a request with a fresh correlation id.
    pub fn new(text: impl Into<String>, target_language: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            target_language: target_language.into(),
            correlation_id: Uuid::new_v4(),
        }
    }
}

/// A successful translation.
#[derive(Debug, Clone)]
pub struct Translated {
    pub text: String,
    pub correlation_id: Uuid,
}

/// Per-request wait and retry bounds.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// How long to wait for the first credential before failing with
    /// `ServiceUnavailable`.
    pub startup_wait: Duration,
    /// How long to wait for a forced refresh to complete.
    pub refresh_wait: Duration,
    /// Delay before the single rate-limit retry.
    pub rate_limit_backoff: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            startup_wait: Duration::from_secs(10),
            refresh_wait: Duration::from_secs(10),
            rate_limit_backoff: Duration::from_millis(1_500),
        }
    }
}

impl From<&TranslatorConfig> for DispatchConfig {
    fn from(cfg: &TranslatorConfig) -> Self {
        Self {
            startup_wait: Duration::from_secs(cfg.startup_wait_secs),
            refresh_wait: Duration::from_secs(cfg.refresh_wait_secs),
            rate_limit_backoff: Duration::from_millis(cfg.rate_limit_backoff_ms),
        }
    }
}

/// The dispatch pipeline: obtains a valid credential, calls the translation
/// client, and applies the bounded retry policy.
///
/// Instances are shared across all in-flight requests; each `translate` call
/// is independent and holds only a read reference to the credential store.
/// Requests never block one another except when converging on a single
/// in-flight forced refresh.
pub struct TranslationService {
    translator: Arc<dyn Translator>,
    refresher: RefresherHandle,
    config: DispatchConfig,
}

impl TranslationService {
    pub fn new(
        translator: Arc<dyn Translator>,
        refresher: RefresherHandle,
        config: DispatchConfig,
    ) -> Self {
        Self {
            translator,
            refresher,
            config,
        }
    }

    /// Translate one request to a terminal result.
    ///
    /// Control flow:
    /// 1. Read the credential; if absent, wait (bounded) for the first
    ///    install rather than failing while the process is starting up.
    /// 2. Call the translation client.
    /// 3. On auth rejection, force a refresh, await it, and retry exactly
    ///    once; a second rejection is terminal.
    /// 4. On rate limiting, back off once and retry exactly once; a second
    ///    throttle is terminal.
    /// 5. Anything else is returned as-is.
    pub async fn translate(
        &self,
        request: TranslationRequest,
    ) -> Result<Translated, TranslateError> {
        let correlation_id = request.correlation_id;
        let mut auth_retried = false;
        let mut rate_retried = false;

        loop {
            let (credential, generation) = self
                .refresher
                .wait_for_credential(self.config.startup_wait)
                .await
                .ok_or_else(|| {
                    warn!(%correlation_id, "no credential within the wait bound");
                    TranslateError::ServiceUnavailable(
                        "no valid credential could be obtained".to_string(),
                    )
                })?;

            let outcome = self
                .translator
                .translate(&credential.token, &request.text, &request.target_language)
                .await;

            match outcome {
                Ok(text) => {
                    return Ok(Translated {
                        text,
                        correlation_id,
                    });
                }
                Err(TranslateError::AuthRejected) if !auth_retried => {
                    auth_retried = true;
                    debug!(%correlation_id, generation, "token rejected, forcing refresh");
                    match tokio::time::timeout(
                        self.config.refresh_wait,
                        self.refresher.force_refresh(generation),
                    )
                    .await
                    {
                        Ok(Ok(())) => {}
                        // Retry with whatever is installed; a second auth
                        // rejection is terminal either way.
                        Ok(Err(e)) => warn!(%correlation_id, "forced refresh failed: {e}"),
                        Err(_) => warn!(
                            %correlation_id,
                            "forced refresh still in flight after {:?}", self.config.refresh_wait
                        ),
                    }
                }
                Err(TranslateError::RateLimited) if !rate_retried => {
                    rate_retried = true;
                    debug!(%correlation_id, "rate limited, backing off once");
                    tokio::time::sleep(self.config.rate_limit_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
