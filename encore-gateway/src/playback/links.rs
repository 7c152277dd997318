//! (session, item) → stream record links.

use std::sync::Arc;

use encore_cache::{CacheStats, CacheStore};
use encore_core::{ItemId, RecordId, SessionId};

use crate::config::PlaybackConfig;
use crate::constants::{LINK_KEY_SEPARATOR, STREAM_LINKS_NAMESPACE};

/// Short-TTL cache of which backend record a playback stream writes to.
///
/// Links slide: every hit and every refresh pushes expiry out by the full
/// TTL, so an active stream keeps its link while an abandoned one ages out.
#[derive(Debug, Clone)]
pub struct StreamLinkCache {
    store: Arc<CacheStore<RecordId>>,
}

impl StreamLinkCache {
    pub fn new(config: &PlaybackConfig) -> Self {
        let store = CacheStore::builder()
            .namespace(STREAM_LINKS_NAMESPACE, config.link_namespace())
            .build();
        Self {
            store: Arc::new(store),
        }
    }

    fn key(session: &SessionId, item: &ItemId) -> String {
        format!("{}{}{}", session, LINK_KEY_SEPARATOR, item)
    }

    pub fn get(&self, session: &SessionId, item: &ItemId) -> Option<RecordId> {
        self.store
            .get(STREAM_LINKS_NAMESPACE, &Self::key(session, item))
    }

    /// Link a stream to a record, or refresh the existing link's TTL.
    pub fn remember(&self, session: &SessionId, item: &ItemId, record_id: RecordId) {
        self.store
            .set(STREAM_LINKS_NAMESPACE, Self::key(session, item), record_id);
    }

    /// Drop a link. Returns whether a live link existed.
    pub fn forget(&self, session: &SessionId, item: &ItemId) -> bool {
        self.store
            .delete(STREAM_LINKS_NAMESPACE, &Self::key(session, item))
    }

    pub fn len(&self) -> usize {
        self.store.len(STREAM_LINKS_NAMESPACE)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.store.stats(STREAM_LINKS_NAMESPACE)
    }

    pub fn store(&self) -> &Arc<CacheStore<RecordId>> {
        &self.store
    }
}
