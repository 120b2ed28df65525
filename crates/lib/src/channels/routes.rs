//! Direct-reply route cache: correspondent id -> session webhook with its expiry.
//!
//! Expiry uses the platform's Unix-millisecond convention. Expired entries stay in the
//! map until overwritten or purged, but no read ever returns them.

use std::collections::HashMap;
use std::sync::Mutex;

/// One cached reply route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteCacheEntry {
    pub webhook: String,
    /// Unix ms after which the webhook must not be used.
    pub expired_at: i64,
    pub conversation_id: Option<String>,
}

/// Current time in Unix ms.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Per-correspondent reply routes. Safe to use from any thread, with or without a runtime.
#[derive(Default)]
pub struct DeliveryRouteCache {
    entries: Mutex<HashMap<String, RouteCacheEntry>>,
}

impl DeliveryRouteCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RouteCacheEntry>> {
        // A panic while holding the lock cannot leave a half-written entry behind.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record (or replace) the reply route for a correspondent. Last writer wins.
    pub fn remember(
        &self,
        correspondent_id: impl Into<String>,
        webhook: impl Into<String>,
        expired_at: i64,
        conversation_id: Option<String>,
    ) {
        let entry = RouteCacheEntry {
            webhook: webhook.into(),
            expired_at,
            conversation_id,
        };
        self.lock().insert(correspondent_id.into(), entry);
    }

    /// Webhook for the correspondent if one is cached and not yet expired.
    pub fn resolve(&self, correspondent_id: &str) -> Option<String> {
        self.resolve_at(correspondent_id, now_ms())
    }

    /// Same as [`resolve`](Self::resolve) against an explicit clock reading.
    pub fn resolve_at(&self, correspondent_id: &str, now_ms: i64) -> Option<String> {
        self.lock()
            .get(correspondent_id)
            .filter(|e| !e.webhook.is_empty() && now_ms < e.expired_at)
            .map(|e| e.webhook.clone())
    }

    /// Full entry for the correspondent, expired or not.
    pub fn entry(&self, correspondent_id: &str) -> Option<RouteCacheEntry> {
        self.lock().get(correspondent_id).cloned()
    }

    /// Remove entries that expired at or before `now_ms`. Returns how many were removed.
    pub fn purge_expired(&self, now_ms: i64) -> usize {
        let mut g = self.lock();
        let before = g.len();
        g.retain(|_, e| now_ms < e.expired_at);
        before - g.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
