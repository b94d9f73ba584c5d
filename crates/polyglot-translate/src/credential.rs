//! Shared store for the translation API bearer token.

use chrono::{DateTime, Utc};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// A bearer token for the translation API plus its validity window.
#[derive(Debug, Clone)]
pub struct Credential {
    pub token: String,
    /// Instant after which consumers must no longer use the token.
    /// The safety margin is already subtracted, so a credential read from
    /// the store is never within the margin of its true expiry.
    pub expires_at: Instant,
    /// Wall-clock fetch time, for diagnostics.
    pub fetched_at: DateTime<Utc>,
}

impl Credential {
    /// Whether the local validity window has passed.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Process-wide store holding at most one credential at a time.
///
/// Reads are concurrent and never block on I/O; the only writer is the
/// refresher, which installs replacements atomically via
/// [`CredentialStore::compare_and_swap`]. The generation counter advances by
/// exactly one per successful install, letting racing refreshes detect that
/// someone else already won and discard their stale result.
#[derive(Debug, Default)]
pub struct CredentialStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    generation: u64,
    credential: Option<Arc<Credential>>,
}

impl CredentialStore {
    /// Create an empty store. No credential is installed until the first
    /// successful refresh.
    pub fn new() -> Self {
        Self::default()
    }

    /// The currently installed credential and its generation, or `None` if
    /// the store is empty or the credential's validity window has passed.
    pub fn read(&self) -> Option<(Arc<Credential>, u64)> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let credential = inner.credential.as_ref()?;
        if credential.is_expired() {
            return None;
        }
        Some((Arc::clone(credential), inner.generation))
    }

    /// Current generation, regardless of whether a credential is installed.
    pub fn generation(&self) -> u64 {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .generation
    }

    /// Install `credential` iff the store's generation still equals
    /// `expected_generation`. Returns whether the swap occurred.
    ///
    /// The old credential, if any, is discarded whole; no field is ever
    /// partially updated.
    pub fn compare_and_swap(&self, expected_generation: u64, credential: Credential) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.generation != expected_generation {
            return false;
        }
        inner.generation += 1;
        inner.credential = Some(Arc::new(credential));
        true
    }
}
