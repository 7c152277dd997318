//! Session token lifecycle.
//!
//! `NO_TOKEN -> VALID -> (near expiry | 401) -> REFRESHING -> VALID`
//!
//! The manager owns the one backend session shared by every gateway call.
//! A refresh is a single shared future: callers that find the token absent,
//! expired or rejected while a refresh is running join it instead of
//! logging in again. The in-flight marker is cleared as soon as the refresh
//! settles, success or failure, so a later call can try again.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use encore_core::{GatewayResult, TokenConfig, TransportError};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use secrecy::{ExposeSecret, SecretString};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;

/// A backend session token with its conservative expiry.
#[derive(Clone)]
pub struct Token {
    value: SecretString,
    generation: u64,
    expires_at: Instant,
}

impl Token {
    /// Raw token for the `Authorization` header.
    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }

    /// Refresh that produced this token. Strictly increasing.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn is_valid_at(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("value", &"[REDACTED]")
            .field("generation", &self.generation)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Observable manager state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    NoToken,
    Valid,
    Refreshing,
}

type SharedRefresh = Shared<BoxFuture<'static, GatewayResult<Token>>>;

#[derive(Default)]
struct TokenSlot {
    current: Option<Token>,
    refresh: Option<(u64, SharedRefresh)>,
    next_generation: u64,
}

/// Owner of the backend session token.
pub struct TokenManager {
    backend: Arc<dyn Backend>,
    config: TokenConfig,
    slot: Arc<Mutex<TokenSlot>>,
    logins: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl TokenManager {
    pub fn new(backend: Arc<dyn Backend>, config: TokenConfig) -> Self {
        Self {
            backend,
            config,
            slot: Arc::new(Mutex::new(TokenSlot::default())),
            logins: Arc::new(AtomicU64::new(0)),
            shutdown: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TokenSlot> {
        lock_slot(&self.slot)
    }

    /// A token valid right now, refreshing first if there is none.
    pub async fn ensure_token(&self, cancel: &CancellationToken) -> GatewayResult<Token> {
        let refresh = {
            let mut slot = self.lock();
            if let Some(token) = slot
                .current
                .as_ref()
                .filter(|t| t.is_valid_at(Instant::now()))
            {
                return Ok(token.clone());
            }
            self.join_or_start(&mut slot)
        };
        self.await_refresh(refresh, cancel).await
    }

    /// Replace a token the backend just rejected.
    ///
    /// If another caller already replaced `stale`, its replacement is
    /// returned without a new login.
    pub async fn force_refresh(
        &self,
        stale: &Token,
        cancel: &CancellationToken,
    ) -> GatewayResult<Token> {
        let refresh = {
            let mut slot = self.lock();
            let now = Instant::now();
            if let Some(replacement) = slot
                .current
                .as_ref()
                .filter(|t| t.generation != stale.generation && t.is_valid_at(now))
            {
                return Ok(replacement.clone());
            }
            if slot
                .current
                .as_ref()
                .is_some_and(|t| t.generation == stale.generation)
            {
                slot.current = None;
            }
            self.join_or_start(&mut slot)
        };
        tracing::debug!(stale_generation = stale.generation, "Forcing token refresh");
        self.await_refresh(refresh, cancel).await
    }

    /// Join the running refresh, or start one. Caller holds the slot lock.
    fn join_or_start(&self, slot: &mut TokenSlot) -> SharedRefresh {
        if let Some((_, refresh)) = &slot.refresh {
            return refresh.clone();
        }

        slot.next_generation += 1;
        let generation = slot.next_generation;

        let backend = Arc::clone(&self.backend);
        let slot_handle = Arc::clone(&self.slot);
        let logins = Arc::clone(&self.logins);
        let shutdown = self.shutdown.clone();
        let lifetime = self.config.lifetime;
        let margin = self.config.safety_margin;

        let refresh = async move {
            logins.fetch_add(1, Ordering::Relaxed);
            let started = Instant::now();
            let result = backend.login(&shutdown).await;

            let mut slot = lock_slot(&slot_handle);
            let outcome = result.map(|issued| {
                let lifetime = issued.lifetime.unwrap_or(lifetime);
                let token = Token {
                    value: issued.value,
                    generation,
                    expires_at: Instant::now() + lifetime.saturating_sub(margin),
                };
                slot.current = Some(token.clone());
                token
            });
            if matches!(&slot.refresh, Some((id, _)) if *id == generation) {
                slot.refresh = None;
            }
            drop(slot);

            match &outcome {
                Ok(token) => tracing::info!(
                    generation,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    valid_for_secs = token.expires_at.saturating_duration_since(Instant::now()).as_secs(),
                    "Backend token refreshed"
                ),
                Err(e) => tracing::warn!(generation, error = %e, "Backend token refresh failed"),
            }
            outcome
        }
        .boxed()
        .shared();

        // Driven to completion even if every waiter gives up, so the login
        // never parks inside the throttle.
        tokio::spawn(refresh.clone());
        slot.refresh = Some((generation, refresh.clone()));
        refresh
    }

    async fn await_refresh(
        &self,
        refresh: SharedRefresh,
        cancel: &CancellationToken,
    ) -> GatewayResult<Token> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled.into()),
            result = refresh => result,
        }
    }

    pub fn state(&self) -> TokenState {
        let slot = self.lock();
        if slot.refresh.is_some() {
            TokenState::Refreshing
        } else if slot
            .current
            .as_ref()
            .is_some_and(|t| t.is_valid_at(Instant::now()))
        {
            TokenState::Valid
        } else {
            TokenState::NoToken
        }
    }

    /// Logins started since construction.
    pub fn login_count(&self) -> u64 {
        self.logins.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    /// Abort any running refresh and log out of the current session.
    ///
    /// Logout failures are logged, not returned.
    pub async fn release(&self) {
        self.shutdown.cancel();
        let token = {
            let mut slot = self.lock();
            slot.refresh = None;
            slot.current.take()
        };

        let Some(token) = token else {
            return;
        };
        if let Err(e) = self.backend.logout(token.expose()).await {
            tracing::warn!(error = %e, "Backend session release failed");
        }
    }
}

fn lock_slot(slot: &Mutex<TokenSlot>) -> MutexGuard<'_, TokenSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("state", &self.state())
            .field("logins", &self.login_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendCall, IssuedToken};
    use crate::envelope::BackendReply;
    use async_trait::async_trait;
    use encore_core::{BackendError, GatewayError};
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    /// Login-only backend with a configurable delay and failure switch.
    #[derive(Default)]
    struct LoginBackend {
        calls: AtomicU64,
        fail: AtomicBool,
        logouts: AtomicU64,
    }

    #[async_trait]
    impl Backend for LoginBackend {
        async fn login(&self, _cancel: &CancellationToken) -> GatewayResult<IssuedToken> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(BackendError::Rejected {
                    code: "212".to_string(),
                    message: "Invalid account".to_string(),
                }
                .into());
            }
            Ok(IssuedToken::new(format!("tok-{}", n)))
        }

        async fn logout(&self, _token: &str) -> GatewayResult<()> {
            self.logouts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn execute(
            &self,
            _call: &BackendCall,
            _token: &str,
            _cancel: &CancellationToken,
        ) -> GatewayResult<BackendReply> {
            unimplemented!("login-only backend")
        }
    }

    fn manager(backend: Arc<LoginBackend>) -> Arc<TokenManager> {
        Arc::new(TokenManager::new(
            backend,
            TokenConfig {
                lifetime: Duration::from_secs(600),
                safety_margin: Duration::from_secs(60),
            },
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_token_logs_in_once() {
        let backend = Arc::new(LoginBackend::default());
        let tokens = manager(Arc::clone(&backend));
        assert_eq!(tokens.state(), TokenState::NoToken);

        let cancel = CancellationToken::new();
        let first = tokens.ensure_token(&cancel).await.expect("token");
        let second = tokens.ensure_token(&cancel).await.expect("token");

        assert_eq!(first.expose(), "tok-1");
        assert_eq!(second.generation(), first.generation());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(tokens.state(), TokenState::Valid);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_refresh() {
        let backend = Arc::new(LoginBackend::default());
        let tokens = manager(Arc::clone(&backend));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let tokens = Arc::clone(&tokens);
            handles.push(tokio::spawn(async move {
                tokens.ensure_token(&CancellationToken::new()).await
            }));
        }
        tokio::task::yield_now().await;
        assert_eq!(tokens.state(), TokenState::Refreshing);

        let mut values = Vec::new();
        for handle in handles {
            values.push(handle.await.expect("task panicked").expect("token").expose().to_string());
        }
        assert!(values.iter().all(|v| v == "tok-1"));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(tokens.login_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_applies_safety_margin() {
        let backend = Arc::new(LoginBackend::default());
        let tokens = manager(Arc::clone(&backend));
        let cancel = CancellationToken::new();

        tokens.ensure_token(&cancel).await.expect("token");
        tokio::time::advance(Duration::from_secs(539)).await;
        assert_eq!(tokens.state(), TokenState::Valid);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(tokens.state(), TokenState::NoToken);
        let renewed = tokens.ensure_token(&cancel).await.expect("token");
        assert_eq!(renewed.expose(), "tok-2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_clears_marker() {
        let backend = Arc::new(LoginBackend::default());
        backend.fail.store(true, Ordering::SeqCst);
        let tokens = manager(Arc::clone(&backend));
        let cancel = CancellationToken::new();

        let err = tokens.ensure_token(&cancel).await.expect_err("login fails");
        assert_eq!(err.backend_code(), Some("212"));
        assert_eq!(tokens.state(), TokenState::NoToken);

        backend.fail.store(false, Ordering::SeqCst);
        assert!(tokens.ensure_token(&cancel).await.is_ok());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_refresh_replaces_stale_token_once() {
        let backend = Arc::new(LoginBackend::default());
        let tokens = manager(Arc::clone(&backend));
        let cancel = CancellationToken::new();
        let stale = tokens.ensure_token(&cancel).await.expect("token");

        let (a, b) = tokio::join!(
            tokens.force_refresh(&stale, &cancel),
            tokens.force_refresh(&stale, &cancel),
        );
        let (a, b) = (a.expect("token"), b.expect("token"));
        assert_eq!(a.generation(), b.generation());
        assert!(a.generation() > stale.generation());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);

        // A late caller holding the same stale token reuses the replacement.
        let late = tokens.force_refresh(&stale, &cancel).await.expect("token");
        assert_eq!(late.generation(), a.generation());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_does_not_abort_refresh() {
        let backend = Arc::new(LoginBackend::default());
        let tokens = manager(Arc::clone(&backend));

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            tokens.ensure_token(&cancel).await,
            Err(GatewayError::Transport(TransportError::Cancelled))
        ));

        // The abandoned refresh is joined, not restarted.
        let token = tokens
            .ensure_token(&CancellationToken::new())
            .await
            .expect("token");
        assert_eq!(token.expose(), "tok-1");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_refresh_completes_without_waiters() {
        let backend = Arc::new(LoginBackend::default());
        let tokens = manager(Arc::clone(&backend));

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(tokens.ensure_token(&cancel).await.is_err());
        assert_eq!(tokens.state(), TokenState::Refreshing);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(tokens.state(), TokenState::Valid);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_logs_out() {
        let backend = Arc::new(LoginBackend::default());
        let tokens = manager(Arc::clone(&backend));
        tokens.ensure_token(&CancellationToken::new()).await.expect("token");

        tokens.release().await;
        assert_eq!(backend.logouts.load(Ordering::SeqCst), 1);
        assert_eq!(tokens.state(), TokenState::NoToken);

        // Nothing to release the second time.
        tokens.release().await;
        assert_eq!(backend.logouts.load(Ordering::SeqCst), 1);
    }
}
