use crate::client::{TranslateError, Translator};
use crate::credential::CredentialStore;
use crate::dispatch::{DispatchConfig, TranslationRequest, TranslationService};
use crate::refresher::{
    ForceRefreshError, IssueError, IssuedToken, RefreshConfig, Refresher, RefresherHandle,
    TokenIssuer,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Issuer stub: counts calls and fails outside the `[fail_first, fail_after)`
/// success window.
struct StubIssuer {
    calls: AtomicUsize,
    fail_first: usize,
    fail_after: usize,
    lifetime: Duration,
}

impl StubIssuer {
    fn ok(lifetime: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_first: 0,
            fail_after: usize::MAX,
            lifetime,
        })
    }

    fn always_failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_first: usize::MAX,
            fail_after: usize::MAX,
            lifetime: Duration::from_secs(60),
        })
    }

    fn failing_after(successes: usize, lifetime: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_first: 0,
            fail_after: successes,
            lifetime,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenIssuer for StubIssuer {
    async fn issue(&self) -> Result<IssuedToken, IssueError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_first || n >= self.fail_after {
            return Err(IssueError::Transport("stub outage".to_string()));
        }
        Ok(IssuedToken {
            token: format!("token-{n}"),
            lifetime: self.lifetime,
        })
    }
}

/// Translator stub driven by a script of outcomes; once the script is
/// exhausted every call succeeds.
struct ScriptedTranslator {
    calls: AtomicUsize,
    script: Mutex<VecDeque<Result<String, TranslateError>>>,
}

impl ScriptedTranslator {
    fn with_script(script: Vec<Result<String, TranslateError>>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            script: Mutex::new(script.into()),
        })
    }

    fn always_ok() -> Arc<Self> {
        Self::with_script(Vec::new())
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Translator for ScriptedTranslator {
    async fn translate(
        &self,
        _token: &str,
        text: &str,
        target_language: &str,
    ) -> Result<String, TranslateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(format!("[{target_language}] {text}")))
    }
}

fn fast_refresh_config() -> RefreshConfig {
    RefreshConfig {
        safety_margin: Duration::from_millis(50),
        refresh_lead: Duration::from_millis(50),
        issue_timeout: Duration::from_secs(1),
        backoff_base: Duration::from_millis(20),
        backoff_cap: Duration::from_millis(100),
    }
}

fn fast_dispatch_config() -> DispatchConfig {
    DispatchConfig {
        startup_wait: Duration::from_millis(500),
        refresh_wait: Duration::from_secs(2),
        rate_limit_backoff: Duration::from_millis(10),
    }
}

fn build_service(
    issuer: Arc<StubIssuer>,
    translator: Arc<ScriptedTranslator>,
) -> (TranslationService, RefresherHandle) {
    let store = Arc::new(CredentialStore::new());
    let handle = Refresher::spawn(store, issuer, fast_refresh_config());
    let service = TranslationService::new(translator, handle.clone(), fast_dispatch_config());
    (service, handle)
}

async fn wait_ready(handle: &RefresherHandle) -> u64 {
    let (_, generation) = handle
        .wait_for_credential(Duration::from_secs(1))
        .await
        .expect("first credential should install quickly");
    generation
}

#[tokio::test]
async fn test_translate_succeeds_with_fresh_credential() {
    let issuer = StubIssuer::ok(Duration::from_secs(60));
    let translator = ScriptedTranslator::always_ok();
    let (service, _handle) = build_service(issuer, translator.clone());

    let result = service
        .translate(TranslationRequest::new("hello", "de"))
        .await
        .expect("translation should succeed");
    assert_eq!(result.text, "[de] hello");
    assert_eq!(translator.calls(), 1);
}

#[tokio::test]
async fn test_service_unavailable_when_issuer_is_down() {
    let issuer = StubIssuer::always_failing();
    let translator = ScriptedTranslator::always_ok();
    let store = Arc::new(CredentialStore::new());
    let handle = Refresher::spawn(store, issuer, fast_refresh_config());
    let service = TranslationService::new(
        translator.clone(),
        handle,
        DispatchConfig {
            startup_wait: Duration::from_millis(150),
            ..fast_dispatch_config()
        },
    );

    let result = service
        .translate(TranslationRequest::new("hello", "fr"))
        .await;
    assert!(matches!(result, Err(TranslateError::ServiceUnavailable(_))));
    assert_eq!(translator.calls(), 0, "no call may fire without a token");
}

#[tokio::test]
async fn test_auth_rejection_recovers_with_one_forced_refresh() {
    let issuer = StubIssuer::ok(Duration::from_secs(60));
    let translator =
        ScriptedTranslator::with_script(vec![Err(TranslateError::AuthRejected)]);
    let (service, handle) = build_service(issuer.clone(), translator.clone());
    wait_ready(&handle).await;

    let result = service
        .translate(TranslationRequest::new("hola", "en"))
        .await
        .expect("retry after forced refresh should succeed");
    assert_eq!(result.text, "[en] hola");
    assert_eq!(translator.calls(), 2, "exactly one retry");
    assert_eq!(issuer.calls(), 2, "startup fetch plus exactly one forced refresh");
}

#[tokio::test]
async fn test_repeated_auth_rejection_is_terminal_after_two_attempts() {
    let issuer = StubIssuer::ok(Duration::from_secs(60));
    let translator = ScriptedTranslator::with_script(vec![
        Err(TranslateError::AuthRejected),
        Err(TranslateError::AuthRejected),
        Err(TranslateError::AuthRejected),
    ]);
    let (service, handle) = build_service(issuer, translator.clone());
    wait_ready(&handle).await;

    let result = service
        .translate(TranslationRequest::new("hola", "en"))
        .await;
    assert!(matches!(result, Err(TranslateError::AuthRejected)));
    assert_eq!(translator.calls(), 2, "must not loop past the second attempt");
}

#[tokio::test]
async fn test_rate_limit_retries_once_then_succeeds() {
    let issuer = StubIssuer::ok(Duration::from_secs(60));
    let translator =
        ScriptedTranslator::with_script(vec![Err(TranslateError::RateLimited)]);
    let (service, handle) = build_service(issuer, translator.clone());
    wait_ready(&handle).await;

    let result = service
        .translate(TranslationRequest::new("ciao", "en"))
        .await
        .expect("single rate limit should be retried");
    assert_eq!(result.text, "[en] ciao");
    assert_eq!(translator.calls(), 2);
}

#[tokio::test]
async fn test_second_rate_limit_is_terminal() {
    let issuer = StubIssuer::ok(Duration::from_secs(60));
    let translator = ScriptedTranslator::with_script(vec![
        Err(TranslateError::RateLimited),
        Err(TranslateError::RateLimited),
    ]);
    let (service, handle) = build_service(issuer, translator.clone());
    wait_ready(&handle).await;

    let result = service
        .translate(TranslationRequest::new("ciao", "en"))
        .await;
    assert!(matches!(result, Err(TranslateError::RateLimited)));
    assert_eq!(translator.calls(), 2);
}

#[tokio::test]
async fn test_other_failure_surfaces_immediately() {
    let issuer = StubIssuer::ok(Duration::from_secs(60));
    let translator = ScriptedTranslator::with_script(vec![Err(TranslateError::Other(
        "unsupported language".to_string(),
    ))]);
    let (service, handle) = build_service(issuer.clone(), translator.clone());
    wait_ready(&handle).await;

    let result = service
        .translate(TranslationRequest::new("hej", "xx"))
        .await;
    assert!(matches!(result, Err(TranslateError::Other(_))));
    assert_eq!(translator.calls(), 1, "other failures are not retried");
    assert_eq!(issuer.calls(), 1, "other failures do not force a refresh");
}

#[tokio::test]
async fn test_concurrent_forced_refreshes_coalesce_into_one_issuance() {
    let issuer = StubIssuer::ok(Duration::from_secs(60));
    let translator = ScriptedTranslator::always_ok();
    let (_service, handle) = build_service(issuer.clone(), translator);
    let generation = wait_ready(&handle).await;
    assert_eq!(issuer.calls(), 1);

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let handle = handle.clone();
            tokio::spawn(async move { handle.force_refresh(generation).await })
        })
        .collect();
    for task in tasks {
        task.await
            .expect("task must not panic")
            .expect("coalesced refresh should succeed");
    }

    // Let any stray wake permit drain before counting.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(issuer.calls(), 2, "50 forces must coalesce into one issuance");
}

#[tokio::test]
async fn test_force_refresh_yields_strictly_newer_generation() {
    let issuer = StubIssuer::ok(Duration::from_secs(60));
    let translator = ScriptedTranslator::always_ok();
    let (_service, handle) = build_service(issuer, translator);
    let generation = wait_ready(&handle).await;

    handle
        .force_refresh(generation)
        .await
        .expect("forced refresh should succeed");
    let (_, new_generation) = handle.read().expect("credential installed");
    assert!(new_generation > generation);
}

#[tokio::test]
async fn test_proactive_renewal_fires_before_expiry() {
    let issuer = StubIssuer::ok(Duration::from_millis(400));
    let store = Arc::new(CredentialStore::new());
    let handle = Refresher::spawn(
        store,
        issuer.clone(),
        RefreshConfig {
            safety_margin: Duration::from_millis(100),
            refresh_lead: Duration::from_millis(50),
            issue_timeout: Duration::from_secs(1),
            backoff_base: Duration::from_millis(20),
            backoff_cap: Duration::from_millis(100),
        },
    );
    wait_ready(&handle).await;

    // Usable lifetime is 300ms and renewal leads expiry by 50ms; after 600ms
    // at least one proactive renewal must have happened and the store must
    // still be serving a live credential.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(issuer.calls() >= 2, "proactive renewal should have fired");
    let (credential, generation) = handle.read().expect("store must keep serving");
    assert!(generation >= 2);
    assert!(!credential.is_expired());
}

#[tokio::test]
async fn test_safety_margin_shortens_local_expiry() {
    let issuer = StubIssuer::ok(Duration::from_secs(10));
    let store = Arc::new(CredentialStore::new());
    let handle = Refresher::spawn(
        store,
        issuer,
        RefreshConfig {
            safety_margin: Duration::from_secs(4),
            ..fast_refresh_config()
        },
    );
    wait_ready(&handle).await;

    let (credential, _) = handle.read().unwrap();
    let remaining = credential
        .expires_at
        .saturating_duration_since(std::time::Instant::now());
    assert!(remaining <= Duration::from_secs(6), "margin must be subtracted");
    assert!(remaining > Duration::from_secs(5), "but only the margin");
}

#[tokio::test]
async fn test_stale_credential_survives_issuance_outage() {
    let issuer = StubIssuer::failing_after(1, Duration::from_secs(60));
    let translator = ScriptedTranslator::always_ok();
    let (_service, handle) = build_service(issuer.clone(), translator);
    let generation = wait_ready(&handle).await;
    let (before, _) = handle.read().unwrap();

    let result = handle.force_refresh(generation).await;
    assert!(matches!(result, Err(ForceRefreshError::AttemptFailed)));

    // The failed refresh must not clear the still-valid token.
    let (after, after_generation) = handle.read().expect("stale token stays usable");
    assert_eq!(before.token, after.token);
    assert_eq!(after_generation, generation);
}

#[tokio::test]
async fn test_lifetime_within_safety_margin_backs_off() {
    // The declared lifetime never exceeds the margin, so no token is ever
    // usable; the refresher must retry on the backoff schedule rather than
    // hammer the issuer.
    let issuer = StubIssuer::ok(Duration::from_millis(50));
    let store = Arc::new(CredentialStore::new());
    let handle = Refresher::spawn(
        store,
        issuer.clone(),
        RefreshConfig {
            safety_margin: Duration::from_millis(50),
            refresh_lead: Duration::from_millis(50),
            issue_timeout: Duration::from_secs(1),
            backoff_base: Duration::from_millis(50),
            backoff_cap: Duration::from_millis(200),
        },
    );

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(handle.read().is_none(), "an unusable token must not be installed");
    assert!(
        issuer.calls() <= 6,
        "issuance must back off, got {} calls in 250ms",
        issuer.calls()
    );
}

#[tokio::test]
async fn test_force_refresh_with_superseded_generation_returns_immediately() {
    // The issuer is down after the first token, but a caller whose observed
    // generation is already behind needs no new issuance at all.
    let issuer = StubIssuer::failing_after(1, Duration::from_secs(60));
    let translator = ScriptedTranslator::always_ok();
    let (_service, handle) = build_service(issuer.clone(), translator);
    let generation = wait_ready(&handle).await;

    handle
        .force_refresh(generation - 1)
        .await
        .expect("a newer credential already satisfies the request");
    assert_eq!(issuer.calls(), 1, "no issuance for a superseded generation");
}

#[tokio::test]
async fn test_wait_for_credential_times_out_cleanly() {
    let issuer = StubIssuer::always_failing();
    let translator = ScriptedTranslator::always_ok();
    let (_service, handle) = build_service(issuer, translator);

    let found = handle.wait_for_credential(Duration::from_millis(120)).await;
    assert!(found.is_none());
}
