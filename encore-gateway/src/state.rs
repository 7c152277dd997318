//! Shared gateway state: one backend chain, one session, one set of caches.

use std::sync::{Arc, Mutex, PoisonError};

use encore_cache::Purge;
use encore_core::{FieldMap, GatewayResult, ItemId, SessionId, TelemetryEnvelope};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, HttpBackend};
use crate::config::GatewayConfig;
use crate::gateway::RecordGateway;
use crate::jobs::{spawn_janitor, JanitorMetrics};
use crate::playback::{EnsureOptions, EnsuredRecord, PlaybackAccumulator, StreamOutcome};
use crate::pool::ConnectionPool;
use crate::throttle::RequestThrottle;
use crate::token::TokenManager;
use crate::transport::RetryPolicy;

/// Everything route handlers need, wired over a single backend.
///
/// Must be created inside a Tokio runtime: the cache janitor is spawned on
/// construction.
pub struct GatewayState {
    config: GatewayConfig,
    backend: Arc<dyn Backend>,
    tokens: Arc<TokenManager>,
    gateway: Arc<RecordGateway>,
    playback: Arc<PlaybackAccumulator>,
    shutdown: CancellationToken,
    janitor: Mutex<Option<JoinHandle<Arc<JanitorMetrics>>>>,
}

impl GatewayState {
    /// Build the HTTP backend chain from `config` and wire the gateway.
    pub fn start(config: GatewayConfig) -> GatewayResult<Self> {
        config.validate()?;

        let pool = Arc::new(ConnectionPool::new(config.pool.clone())?);
        let throttle = Arc::new(RequestThrottle::new(&config.throttle));
        let backend = HttpBackend::new(
            config.backend.clone(),
            pool,
            throttle,
            RetryPolicy::from(&config.transport),
        );

        tracing::info!(
            base_url = backend.base_url(),
            ceiling = config.throttle.ceiling,
            min_start_gap_ms = config.throttle.min_start_gap.as_millis() as u64,
            max_retries = config.transport.max_retries,
            "Gateway starting"
        );
        Ok(Self::from_backend(Arc::new(backend), config))
    }

    /// Wire the gateway over an already-built backend.
    pub fn from_backend(backend: Arc<dyn Backend>, config: GatewayConfig) -> Self {
        let tokens = Arc::new(TokenManager::new(backend.clone(), config.token.clone()));
        let gateway = Arc::new(RecordGateway::new(
            backend.clone(),
            tokens.clone(),
            &config.cache,
        ));
        let playback = Arc::new(PlaybackAccumulator::new(
            gateway.clone(),
            config.playback.clone(),
        ));

        let shutdown = CancellationToken::new();
        let stores: Vec<Arc<dyn Purge>> = vec![
            gateway.record_store().clone() as Arc<dyn Purge>,
            gateway.find_store().clone() as Arc<dyn Purge>,
            playback.links().store().clone() as Arc<dyn Purge>,
        ];
        let janitor = spawn_janitor(stores, config.janitor.clone(), shutdown.clone());

        Self {
            config,
            backend,
            tokens,
            gateway,
            playback,
            shutdown,
            janitor: Mutex::new(Some(janitor)),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn gateway(&self) -> &Arc<RecordGateway> {
        &self.gateway
    }

    pub fn playback(&self) -> &Arc<PlaybackAccumulator> {
        &self.playback
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub async fn ensure_stream_record(
        &self,
        session: &SessionId,
        item: &ItemId,
        initial_fields: FieldMap,
        options: EnsureOptions,
        cancel: &CancellationToken,
    ) -> GatewayResult<EnsuredRecord> {
        self.playback
            .ensure_record(session, item, initial_fields, options, cancel)
            .await
    }

    pub async fn record_playback_event(
        &self,
        envelope: &TelemetryEnvelope,
        cancel: &CancellationToken,
    ) -> GatewayResult<StreamOutcome> {
        self.playback.record_event(envelope, cancel).await
    }

    /// Decode a raw telemetry payload and apply it.
    pub async fn record_playback_payload(
        &self,
        payload: &Value,
        cancel: &CancellationToken,
    ) -> GatewayResult<StreamOutcome> {
        let envelope = TelemetryEnvelope::decode(payload)
            .inspect_err(|e| tracing::debug!(error = %e, "Rejected telemetry payload"))?;
        self.record_playback_event(&envelope, cancel).await
    }

    /// Stop background work, cancel shared fetches, release the backend
    /// session, then close the backend. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let janitor = self
            .janitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = janitor {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Cache janitor did not stop cleanly");
            }
        }

        self.gateway.shutdown();
        self.tokens.release().await;
        self.backend.close().await;

        let records = self.gateway.record_store().total_stats();
        tracing::info!(
            record_hits = records.hits,
            record_misses = records.misses,
            logins = self.tokens.login_count(),
            "Gateway stopped"
        );
    }
}
