//! The set of currently known broadcast targets.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use tokio::sync::RwLock;

use crate::types::{EndpointGroup, EndpointKey, EndpointRecord};

/// A point-in-time copy of the registry contents.
pub type Snapshot = Vec<(EndpointKey, EndpointRecord)>;

/// Thread-safe map from endpoint key to record.
///
/// Clones share the same underlying map. Group mutations run under the
/// write lock, so a snapshot never observes half of a group.
#[derive(Clone, Default)]
pub struct AddressRegistry {
    entries: Arc<RwLock<HashMap<EndpointKey, EndpointRecord>>>,
}

impl AddressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts every record of `group`, overwriting existing keys.
    pub async fn add_group(&self, group: &EndpointGroup) {
        let mut entries = self.entries.write().await;
        for record in &group.records {
            entries.insert(record.key.clone(), record.clone());
        }
    }

    /// Removes every key of `group`. Absent keys are ignored.
    pub async fn remove_group(&self, group: &EndpointGroup) {
        let mut entries = self.entries.write().await;
        for record in &group.records {
            entries.remove(&record.key);
        }
    }

    /// Copies the current entries and releases the lock before returning.
    pub async fn snapshot(&self) -> Snapshot {
        let entries = self.entries.read().await;
        entries
            .iter()
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Dumps the registry contents at debug level.
    pub async fn log_contents(&self) {
        if !log::log_enabled!(log::Level::Debug) {
            return;
        }
        let mut snapshot = self.snapshot().await;
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        debug!("Registry holds {} endpoints", snapshot.len());
        for (key, record) in snapshot {
            debug!("  {} ({})", key, record.target.as_deref().unwrap_or("-"));
        }
    }
}
