// =============================================================================
// Hub Registry — process-wide map of live hubs
// =============================================================================
//
// Owns every hub. Creation and teardown take a short write lock; lookups take
// a read lock. The registry also owns the grace timer that keeps a hub warm
// for a few seconds after its last detach so rapid client reconnects do not
// thrash the upstream connection.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::binance::ws::UpstreamFeed;
use crate::history::HistorySource;
use crate::hub::stream_hub::{Hub, SubscriberSpec};
use crate::hub::HubKey;
use crate::symbols::SymbolMeta;

pub struct HubRegistry {
    hubs: RwLock<HashMap<HubKey, Arc<Hub>>>,
    feed: Arc<dyn UpstreamFeed>,
    history: Arc<dyn HistorySource>,
    grace: Duration,
    max_book_limit: usize,
}

impl HubRegistry {
    pub fn new(
        feed: Arc<dyn UpstreamFeed>,
        history: Arc<dyn HistorySource>,
        grace: Duration,
        max_book_limit: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            hubs: RwLock::new(HashMap::new()),
            feed,
            history,
            grace,
            max_book_limit,
        })
    }

    /// Existing hub for the key, if any. Never creates.
    pub fn get(&self, key: &HubKey) -> Option<Arc<Hub>> {
        self.hubs.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.hubs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hubs.read().is_empty()
    }

    /// Look up or create the hub for `key` and attach the subscriber to it.
    pub fn attach(&self, key: &HubKey, meta: &SymbolMeta, spec: SubscriberSpec) -> Arc<Hub> {
        let hub = {
            let mut hubs = self.hubs.write();
            hubs.entry(key.clone())
                .or_insert_with(|| {
                    info!(hub = %key, "creating hub");
                    Hub::new(
                        key.clone(),
                        meta.clone(),
                        self.feed.clone(),
                        self.history.clone(),
                        self.max_book_limit,
                    )
                })
                .clone()
        };
        hub.attach(spec);
        hub
    }

    /// Detach a subscriber; when the hub just became empty, schedule its
    /// grace teardown.
    pub fn detach(self: &Arc<Self>, key: &HubKey, session_id: Uuid) {
        let Some(hub) = self.get(key) else {
            return;
        };
        if !hub.detach(session_id) {
            return;
        }

        debug!(hub = %key, grace_ms = self.grace.as_millis() as u64, "last detach, scheduling grace shutdown");
        let registry = self.clone();
        let grace_key = key.clone();
        let grace = self.grace;
        let task = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            registry.try_teardown(&grace_key);
        });
        hub.set_grace_task(task);
    }

    /// Tear a hub down if it is still empty after the grace period.
    fn try_teardown(&self, key: &HubKey) {
        let mut hubs = self.hubs.write();
        let Some(hub) = hubs.get(key) else {
            return;
        };
        if hub.subscriber_count() > 0 {
            return; // re-attached while the timer was in flight
        }
        hub.teardown();
        hubs.remove(key);
        info!(hub = %key, "hub removed after grace shutdown");
    }

    /// Tear down everything; used on process shutdown.
    pub fn shutdown_all(&self) {
        let mut hubs = self.hubs.write();
        for hub in hubs.values() {
            hub.teardown();
        }
        hubs.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================
