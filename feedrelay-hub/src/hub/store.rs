use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use feedrelay_core::models::{ResourceId, ResourceSnapshot};
use serde_json::Value;
use tracing::debug;

/// Latest snapshot per resource
///
/// Reads are open to anyone. Writes are crate-private and only happen while
/// the registry's guard for the same resource is held.
#[derive(Default)]
pub struct ResourceStore {
    snapshots: DashMap<ResourceId, Arc<ResourceSnapshot>>,
}

impl ResourceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, resource_id: &ResourceId) -> Option<Arc<ResourceSnapshot>> {
        self.snapshots.get(resource_id).map(|s| Arc::clone(s.value()))
    }

    #[must_use]
    pub fn contains(&self, resource_id: &ResourceId) -> bool {
        self.snapshots.contains_key(resource_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Replace the snapshot for `resource_id`, bumping its version
    pub(crate) fn put(&self, resource_id: ResourceId, data: Value) -> Arc<ResourceSnapshot> {
        let version = self
            .snapshots
            .get(&resource_id)
            .map_or(1, |previous| previous.version + 1);
        let snapshot = Arc::new(ResourceSnapshot::new(resource_id.clone(), data, version));
        self.snapshots.insert(resource_id, Arc::clone(&snapshot));
        snapshot
    }

    pub(crate) fn evict(&self, resource_id: &ResourceId) -> Option<Arc<ResourceSnapshot>> {
        let evicted = self.snapshots.remove(resource_id).map(|(_, s)| s);
        if evicted.is_some() {
            debug!(resource_id = %resource_id, "Snapshot evicted");
        }
        evicted
    }

    /// Evict only if the stored snapshot is still older than `max_age`
    pub(crate) fn evict_if_stale(&self, resource_id: &ResourceId, max_age: Duration) -> bool {
        self.snapshots
            .remove_if(resource_id, |_, snapshot| is_stale(snapshot, max_age))
            .is_some()
    }

    /// Resources whose snapshot has not been refreshed for `max_age`
    pub(crate) fn stale_ids(&self, max_age: Duration) -> Vec<ResourceId> {
        self.snapshots
            .iter()
            .filter(|entry| is_stale(entry.value(), max_age))
            .map(|entry| entry.key().clone())
            .collect()
    }
}

fn is_stale(snapshot: &ResourceSnapshot, max_age: Duration) -> bool {
    (Utc::now() - snapshot.received_at)
        .to_std()
        .is_ok_and(|age| age >= max_age)
}
