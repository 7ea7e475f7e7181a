//! Applies discovery events to the address registry.
//!
//! Events are applied one at a time in arrival order. An update is a
//! removal of the old group followed by an insertion of the new one, with no
//! atomicity across the two steps: a snapshot taken in between sees neither
//! the old nor the complete new membership.

use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::SyncError;
use crate::registry::AddressRegistry;
use crate::types::DiscoveryEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Unsynced,
    Synced,
}

pub struct MembershipSync {
    registry: AddressRegistry,
    state: SyncState,
}

impl MembershipSync {
    pub fn new(registry: AddressRegistry) -> Self {
        Self {
            registry,
            state: SyncState::Unsynced,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub async fn apply(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Added(group) => {
                info!("Group added: {} ({} endpoints)", group.name, group.len());
                self.registry.add_group(&group).await;
            }
            DiscoveryEvent::Updated { old, new } => {
                info!(
                    "Group updated: {} ({} -> {} endpoints)",
                    new.name,
                    old.len(),
                    new.len()
                );
                self.registry.remove_group(&old).await;
                self.registry.add_group(&new).await;
            }
            DiscoveryEvent::Deleted(group) => {
                info!("Group deleted: {} ({} endpoints)", group.name, group.len());
                self.registry.remove_group(&group).await;
            }
            DiscoveryEvent::InitialSyncComplete => {
                if self.state == SyncState::Synced {
                    debug!("Ignoring repeated initial sync signal");
                    return;
                }
                info!(
                    "Initial discovery listing complete, {} endpoints registered",
                    self.registry.len().await
                );
                self.state = SyncState::Synced;
            }
        }
        self.registry.log_contents().await;
    }

    /// Applies events until the source reports its initial listing, then
    /// keeps applying the rest of the stream on a background task.
    ///
    /// Fails if the listing does not complete within `sync_timeout` or the
    /// stream closes first.
    pub async fn start(
        mut self,
        mut events: mpsc::Receiver<DiscoveryEvent>,
        sync_timeout: Duration,
    ) -> Result<JoinHandle<()>, SyncError> {
        let initial = timeout(sync_timeout, async {
            while let Some(event) = events.recv().await {
                self.apply(event).await;
                if self.state == SyncState::Synced {
                    return Ok(());
                }
            }
            Err(SyncError::SourceClosed)
        })
        .await;

        match initial {
            Ok(Ok(())) => Ok(tokio::spawn(self.run(events))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SyncError::Timeout(sync_timeout)),
        }
    }

    async fn run(mut self, mut events: mpsc::Receiver<DiscoveryEvent>) {
        while let Some(event) = events.recv().await {
            self.apply(event).await;
        }
        warn!("Discovery event stream closed, registry will no longer change");
    }
}
