//! Background credential renewal.
//!
//! The refresher owns the only write path into the [`CredentialStore`]. It
//! renews the token proactively before local expiry, retries issuance
//! failures with jittered exponential backoff, and accepts out-of-schedule
//! refresh requests from dispatch when the API rejects a token. Concurrent
//! forced refreshes coalesce onto a single issuance call.

use crate::credential::{Credential, CredentialStore};
use async_trait::async_trait;
use chrono::Utc;
use polyglot_core::config::TranslatorConfig;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

/// A freshly issued token and its declared lifetime.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub lifetime: Duration,
}

/// Why a token issuance attempt failed.
#[derive(Debug, Error)]
pub enum IssueError {
    /// The endpoint answered but refused to issue a token.
    #[error("token endpoint rejected the request ({status}): {detail}")]
    Rejected { status: u16, detail: String },

    /// The endpoint could not be reached or returned garbage.
    #[error("token endpoint unreachable: {0}")]
    Transport(String),

    /// The call exceeded its deadline and was abandoned.
    #[error("token issuance timed out after {0:?}")]
    Timeout(Duration),

    /// The declared lifetime does not exceed the safety margin, so the
    /// token has no usable validity window.
    #[error("issued lifetime {lifetime:?} is within the {safety_margin:?} safety margin")]
    Unusable {
        lifetime: Duration,
        safety_margin: Duration,
    },
}

/// The external token issuance endpoint.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Obtain a fresh bearer token.
    async fn issue(&self) -> Result<IssuedToken, IssueError>;
}

/// Refresh policy knobs, split out of [`TranslatorConfig`] so tests can use
/// short durations.
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Subtracted from the issuer-declared lifetime when computing the local
    /// expiry, so consumers never hold a token within this margin of true
    /// expiry.
    pub safety_margin: Duration,
    /// How long before local expiry the proactive renewal fires. Clamped to
    /// half the usable lifetime for very short-lived tokens.
    pub refresh_lead: Duration,
    /// Deadline for a single issuance call.
    pub issue_timeout: Duration,
    /// Initial retry delay after a failed issuance; doubles per failure.
    pub backoff_base: Duration,
    /// Upper bound for the issuance retry delay.
    pub backoff_cap: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            safety_margin: Duration::from_secs(60),
            refresh_lead: Duration::from_secs(60),
            issue_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

impl From<&TranslatorConfig> for RefreshConfig {
    fn from(cfg: &TranslatorConfig) -> Self {
        Self {
            safety_margin: Duration::from_secs(cfg.safety_margin_secs),
            refresh_lead: Duration::from_secs(cfg.refresh_lead_secs),
            issue_timeout: Duration::from_secs(cfg.issue_timeout_secs),
            backoff_base: Duration::from_millis(cfg.backoff_base_ms),
            backoff_cap: Duration::from_millis(cfg.backoff_cap_ms),
        }
    }
}

/// Broadcast after every refresh attempt so waiting requests can stop.
#[derive(Debug, Clone, Copy, Default)]
struct RefreshStatus {
    /// Completed issuance attempts, successful or not.
    attempts: u64,
    /// Store generation after the attempt.
    generation: u64,
}

/// Why an awaited forced refresh did not produce a newer credential.
#[derive(Debug, Error)]
pub enum ForceRefreshError {
    /// The coalesced issuance attempt completed but failed; any previously
    /// installed credential is still in place.
    #[error("the coalesced refresh attempt failed")]
    AttemptFailed,

    /// The refresher task is gone; the process is shutting down.
    #[error("refresher task has shut down")]
    Closed,
}

/// Background task renewing the shared credential.
pub struct Refresher {
    store: Arc<CredentialStore>,
    issuer: Arc<dyn TokenIssuer>,
    config: RefreshConfig,
    wake: Arc<Notify>,
    /// Smallest generation that would satisfy all pending forced refreshes
    /// (max observed generation + 1), or 0 when none are pending.
    pending: Arc<AtomicU64>,
    status_tx: watch::Sender<RefreshStatus>,
}

/// Cheap clonable handle used by dispatch to read the store, wait for the
/// first credential, and trigger forced refreshes.
#[derive(Clone)]
pub struct RefresherHandle {
    store: Arc<CredentialStore>,
    wake: Arc<Notify>,
    pending: Arc<AtomicU64>,
    status_rx: watch::Receiver<RefreshStatus>,
}

impl Refresher {
    /// Spawn the refresh loop on the current tokio runtime.
    ///
    /// The first issuance fires immediately; until it succeeds the store
    /// stays empty and requests wait via
    /// [`RefresherHandle::wait_for_credential`].
    pub fn spawn(
        store: Arc<CredentialStore>,
        issuer: Arc<dyn TokenIssuer>,
        config: RefreshConfig,
    ) -> RefresherHandle {
        let wake = Arc::new(Notify::new());
        let pending = Arc::new(AtomicU64::new(0));
        let (status_tx, status_rx) = watch::channel(RefreshStatus::default());

        let handle = RefresherHandle {
            store: Arc::clone(&store),
            wake: Arc::clone(&wake),
            pending: Arc::clone(&pending),
            status_rx,
        };

        let refresher = Self {
            store,
            issuer,
            config,
            wake,
            pending,
            status_tx,
        };
        tokio::spawn(refresher.run());

        handle
    }

    async fn run(self) {
        let mut backoff = self.config.backoff_base;
        let mut attempts: u64 = 0;
        // None means "refresh now" (startup, or right after a failed attempt).
        let mut next_refresh: Option<Instant> = None;

        loop {
            if let Some(at) = next_refresh {
                let wait = at.saturating_duration_since(Instant::now());
                let forced = tokio::select! {
                    () = tokio::time::sleep(wait) => false,
                    () = self.wake.notified() => true,
                };
                if forced {
                    let need = self.pending.swap(0, Ordering::AcqRel);
                    // A stored wake permit can outlive the refresh that
                    // satisfied it; skip the issuance in that case.
                    let satisfied = if need == 0 {
                        self.store.read().is_some()
                    } else {
                        self.store.generation() >= need
                    };
                    if satisfied {
                        continue;
                    }
                    debug!("refresher: forced refresh requested");
                } else {
                    debug!("refresher: proactive renewal due");
                }
            }

            let observed = self.store.generation();
            let result = match tokio::time::timeout(self.config.issue_timeout, self.issuer.issue())
                .await
            {
                Ok(r) => r,
                Err(_) => Err(IssueError::Timeout(self.config.issue_timeout)),
            };
            attempts += 1;

            // A token whose lifetime is eaten whole by the safety margin is
            // born expired; installing it would schedule the next renewal
            // immediately and spin the issuer. Route it through the failure
            // backoff instead.
            let result = result.and_then(|issued| {
                if issued.lifetime > self.config.safety_margin {
                    Ok(issued)
                } else {
                    Err(IssueError::Unusable {
                        lifetime: issued.lifetime,
                        safety_margin: self.config.safety_margin,
                    })
                }
            });

            match result {
                Ok(issued) => {
                    let usable = issued.lifetime.saturating_sub(self.config.safety_margin);
                    let now = Instant::now();
                    let credential = Credential {
                        token: issued.token,
                        expires_at: now + usable,
                        fetched_at: Utc::now(),
                    };
                    if self.store.compare_and_swap(observed, credential) {
                        info!(
                            generation = self.store.generation(),
                            usable_secs = usable.as_secs(),
                            "installed fresh translation credential"
                        );
                    } else {
                        debug!("refresher: discarding token from a lost generation race");
                    }
                    backoff = self.config.backoff_base;
                    let lead = self.config.refresh_lead.min(usable / 2);
                    next_refresh = Some(now + usable.saturating_sub(lead));
                    let _ = self.status_tx.send(RefreshStatus {
                        attempts,
                        generation: self.store.generation(),
                    });
                }
                Err(e) => {
                    // A stale-but-unexpired credential stays in place while
                    // issuance retries; issuer outages are never fatal.
                    warn!("token issuance failed, retrying in {backoff:?}: {e}");
                    let _ = self.status_tx.send(RefreshStatus {
                        attempts,
                        generation: self.store.generation(),
                    });
                    let delay = jittered(backoff);
                    backoff = (backoff * 2).min(self.config.backoff_cap);
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = self.wake.notified() => {
                            // A forced refresh cuts the backoff short.
                            self.pending.swap(0, Ordering::AcqRel);
                        }
                    }
                    next_refresh = None;
                }
            }
        }
    }
}

impl RefresherHandle {
    /// Non-blocking read of the current credential, see
    /// [`CredentialStore::read`].
    pub fn read(&self) -> Option<(Arc<Credential>, u64)> {
        self.store.read()
    }

    /// Trigger an out-of-schedule refresh and wait until it completes.
    ///
    /// `observed_generation` is the generation of the credential that was
    /// rejected. Returns `Ok(())` once a strictly newer credential is
    /// installed. Concurrent callers coalesce onto a single in-flight
    /// issuance; a refresh that was already in flight when this is called
    /// counts as the coalesced one.
    pub async fn force_refresh(&self, observed_generation: u64) -> Result<(), ForceRefreshError> {
        if self.store.generation() > observed_generation {
            return Ok(());
        }

        let mut rx = self.status_rx.clone();
        let seen = *rx.borrow();
        // A refresh may have completed between the generation check above
        // and the watch subscription; the broadcast status catches it.
        if seen.generation > observed_generation {
            return Ok(());
        }
        self.pending
            .fetch_max(observed_generation + 1, Ordering::AcqRel);
        self.wake.notify_one();

        loop {
            rx.changed().await.map_err(|_| ForceRefreshError::Closed)?;
            let status = *rx.borrow_and_update();
            if status.generation > observed_generation {
                return Ok(());
            }
            if status.attempts > seen.attempts {
                return Err(ForceRefreshError::AttemptFailed);
            }
        }
    }

    /// Wait up to `bound` for a usable credential to appear in the store.
    ///
    /// Used at startup, when requests may arrive before the first issuance
    /// has completed. Returns `None` if the bound elapses first.
    pub async fn wait_for_credential(&self, bound: Duration) -> Option<(Arc<Credential>, u64)> {
        if let Some(found) = self.store.read() {
            return Some(found);
        }

        // Poke the refresher in case it is sitting out a backoff delay.
        self.wake.notify_one();

        let deadline = Instant::now() + bound;
        let mut rx = self.status_rx.clone();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match tokio::time::timeout(remaining, rx.changed()).await {
                Ok(Ok(())) => {
                    if let Some(found) = self.store.read() {
                        return Some(found);
                    }
                }
                // Refresher gone or deadline hit: one last look.
                Ok(Err(_)) | Err(_) => return self.store.read(),
            }
        }
    }
}

/// Add up to 25% random jitter so restarting replicas do not hammer the
/// issuer in lockstep.
fn jittered(base: Duration) -> Duration {
    let quarter = (base.as_millis() as u64 / 4).max(1);
    base + Duration::from_millis(rand::thread_rng().gen_range(0..quarter))
}

/// HTTP issuer for an Azure-style `issueToken` endpoint.
///
/// The endpoint authenticates with a subscription key header and returns the
/// raw bearer token in the response body. It does not declare a lifetime, so
/// the configured lifetime is attached to every issued token.
pub struct HttpTokenIssuer {
    client: reqwest::Client,
    issue_url: String,
    subscription_key: String,
    region: Option<String>,
    lifetime: Duration,
    timeout: Duration,
}

impl HttpTokenIssuer {
    /// Create from config values.
    pub fn from_config(cfg: &TranslatorConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            issue_url: cfg.issue_url.clone(),
            subscription_key: cfg.subscription_key.clone(),
            region: cfg.region.clone(),
            lifetime: Duration::from_secs(cfg.token_lifetime_secs),
            timeout: Duration::from_secs(cfg.issue_timeout_secs),
        }
    }
}

#[async_trait]
impl TokenIssuer for HttpTokenIssuer {
    async fn issue(&self) -> Result<IssuedToken, IssueError> {
        debug!("issuer: POST {}", self.issue_url);

        let mut request = self
            .client
            .post(&self.issue_url)
            .header("Ocp-Apim-Subscription-Key", &self.subscription_key)
            .header("Content-Length", "0")
            .timeout(self.timeout);
        if let Some(ref region) = self.region {
            request = request.header("Ocp-Apim-Subscription-Region", region);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                IssueError::Timeout(self.timeout)
            } else {
                IssueError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(IssueError::Rejected {
                status: status.as_u16(),
                detail: body,
            });
        }

        let token = body.trim().to_string();
        if token.is_empty() {
            return Err(IssueError::Transport(
                "token endpoint returned an empty body".to_string(),
            ));
        }

        Ok(IssuedToken {
            token,
            lifetime: self.lifetime,
        })
    }
}
