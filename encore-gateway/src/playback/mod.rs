//! Playback session accumulator.
//!
//! Turns client telemetry into one backend record per (session, item)
//! stream. A PLAY always opens a new stream record. Later events fold into
//! the linked record, found again through the link cache, the record cache,
//! or a backend find, in that order. END and ERROR close the stream by
//! retiring its link.
//!
//! Events for the same stream are applied one at a time; different streams
//! proceed concurrently.

mod links;
mod reconcile;

pub use links::StreamLinkCache;
pub use reconcile::{event_fields, format_timestamp, identity_fields, reconcile, Reconciled};

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use encore_core::{
    stream_fields, EventKind, FieldMap, FindOptions, GatewayResult, ItemId, RecordId,
    SessionId, SortSpec, StreamSnapshot, TelemetryEnvelope,
};
use serde_json::json;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::config::PlaybackConfig;
use crate::constants::LINK_KEY_SEPARATOR;
use crate::gateway::RecordGateway;

/// How `ensure_record` resolves a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnsureOptions {
    /// Skip lookup and always create a fresh record.
    pub force_new: bool,
}

impl EnsureOptions {
    pub fn force_new() -> Self {
        Self { force_new: true }
    }
}

/// The record a stream writes to.
#[derive(Debug, Clone, PartialEq)]
pub struct EnsuredRecord {
    pub record_id: RecordId,
    /// Stored fields when an existing record was found.
    pub existing: Option<FieldMap>,
    pub created: bool,
}

/// Result of applying one telemetry event.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutcome {
    pub record_id: RecordId,
    pub event: EventKind,
    pub created: bool,
    /// Accumulated values after this event.
    pub snapshot: StreamSnapshot,
    pub delta_seconds: f64,
    /// The stream's link was dropped, so the next event starts over.
    pub link_retired: bool,
}

type StreamLocks = DashMap<String, Arc<Mutex<()>>>;

/// Serializes work on one stream; removes its lock entry when last out.
struct StreamGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    key: String,
    locks: &'a StreamLocks,
}

impl Drop for StreamGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Applies telemetry to stream records through the record gateway.
pub struct PlaybackAccumulator {
    gateway: Arc<RecordGateway>,
    links: StreamLinkCache,
    config: PlaybackConfig,
    locks: StreamLocks,
}

impl PlaybackAccumulator {
    pub fn new(gateway: Arc<RecordGateway>, config: PlaybackConfig) -> Self {
        Self {
            gateway,
            links: StreamLinkCache::new(&config),
            config,
            locks: DashMap::new(),
        }
    }

    pub fn links(&self) -> &StreamLinkCache {
        &self.links
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    /// Streams with an event in flight or queued.
    pub fn active_streams(&self) -> usize {
        self.locks.len()
    }

    async fn lock_stream(&self, session: &SessionId, item: &ItemId) -> StreamGuard<'_> {
        let key = format!("{}{}{}", session, LINK_KEY_SEPARATOR, item);
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        StreamGuard {
            guard: Some(lock.lock_owned().await),
            key,
            locks: &self.locks,
        }
    }

    /// Resolve the record a stream writes to, creating it with
    /// `initial_fields` when none exists.
    pub async fn ensure_record(
        &self,
        session: &SessionId,
        item: &ItemId,
        initial_fields: FieldMap,
        options: EnsureOptions,
        cancel: &CancellationToken,
    ) -> GatewayResult<EnsuredRecord> {
        let _stream = self.lock_stream(session, item).await;
        self.ensure_locked(session, item, initial_fields, options, cancel)
            .await
    }

    async fn ensure_locked(
        &self,
        session: &SessionId,
        item: &ItemId,
        initial_fields: FieldMap,
        options: EnsureOptions,
        cancel: &CancellationToken,
    ) -> GatewayResult<EnsuredRecord> {
        let layout = self.config.stream_layout.as_str();

        if options.force_new {
            self.links.forget(session, item);
        } else {
            if let Some(record_id) = self.links.get(session, item) {
                match self.gateway.get_by_id(layout, &record_id, cancel).await? {
                    Some(record) => {
                        return Ok(EnsuredRecord {
                            record_id,
                            existing: Some(record.fields),
                            created: false,
                        });
                    }
                    None => {
                        tracing::debug!(
                            session_id = %session,
                            item_id = %item,
                            record_id = %record_id,
                            "Linked stream record is gone, dropping link"
                        );
                        self.links.forget(session, item);
                    }
                }
            }

            if let Some(record) = self.find_latest(session, item, cancel).await? {
                self.links
                    .remember(session, item, record.record_id.clone());
                return Ok(EnsuredRecord {
                    record_id: record.record_id,
                    existing: Some(record.fields),
                    created: false,
                });
            }
        }

        let record_id = self
            .gateway
            .create_record(layout, initial_fields, cancel)
            .await?;
        self.links.remember(session, item, record_id.clone());
        tracing::info!(
            session_id = %session,
            item_id = %item,
            record_id = %record_id,
            "Stream record created"
        );
        Ok(EnsuredRecord {
            record_id,
            existing: None,
            created: true,
        })
    }

    /// Most recently updated record of a stream.
    async fn find_latest(
        &self,
        session: &SessionId,
        item: &ItemId,
        cancel: &CancellationToken,
    ) -> GatewayResult<Option<encore_core::Record>> {
        let mut predicate = FieldMap::new();
        predicate.insert(
            stream_fields::SESSION_ID.to_string(),
            json!(format!("=={}", session)),
        );
        predicate.insert(
            stream_fields::ITEM_ID.to_string(),
            json!(format!("=={}", item)),
        );
        let options = FindOptions::new()
            .with_limit(1)
            .with_sort(SortSpec::descending(stream_fields::UPDATED_AT));

        let found = self
            .gateway
            .find(&self.config.stream_layout, &[predicate], &options, cancel)
            .await?;
        Ok(found.into_iter().next())
    }

    /// Fold one telemetry event into its stream record.
    pub async fn record_event(
        &self,
        envelope: &TelemetryEnvelope,
        cancel: &CancellationToken,
    ) -> GatewayResult<StreamOutcome> {
        let session = &envelope.session_id;
        let item = &envelope.item_id;
        let kind = envelope.event.kind();
        let _stream = self.lock_stream(session, item).await;
        let now = Utc::now();

        // A new record gets the event's values in its create call.
        let fresh = reconcile(None, &envelope.event);
        let mut initial = identity_fields(envelope, now);
        initial.extend(event_fields(envelope, &fresh, now));

        let options = EnsureOptions {
            force_new: kind == EventKind::Play,
        };
        let ensured = self
            .ensure_locked(session, item, initial, options, cancel)
            .await?;

        let reconciled = match &ensured.existing {
            None => fresh,
            Some(fields) => {
                let stored = StreamSnapshot::from_fields(fields);
                let reconciled = reconcile(Some(&stored), &envelope.event);
                let mut update = event_fields(envelope, &reconciled, now);
                if let Some(account) = &envelope.account_id {
                    update.insert(stream_fields::ACCOUNT_ID.to_string(), json!(account));
                }

                let written = self
                    .gateway
                    .update_record(&self.config.stream_layout, &ensured.record_id, update, cancel)
                    .await;
                if let Err(e) = written {
                    self.links.forget(session, item);
                    tracing::warn!(
                        session_id = %session,
                        item_id = %item,
                        record_id = %ensured.record_id,
                        event = kind.as_str(),
                        error = %e,
                        "Stream update failed, link retired"
                    );
                    return Err(e);
                }
                reconciled
            }
        };

        let link_retired = kind.is_terminal();
        if link_retired {
            self.links.forget(session, item);
        } else {
            self.links
                .remember(session, item, ensured.record_id.clone());
        }

        tracing::debug!(
            session_id = %session,
            item_id = %item,
            record_id = %ensured.record_id,
            event = kind.as_str(),
            position = reconciled.snapshot.position_seconds,
            total = reconciled.snapshot.total_played_seconds,
            delta = reconciled.delta_seconds,
            "Playback event applied"
        );

        Ok(StreamOutcome {
            record_id: ensured.record_id,
            event: kind,
            created: ensured.created,
            snapshot: reconciled.snapshot,
            delta_seconds: reconciled.delta_seconds,
            link_retired,
        })
    }
}
