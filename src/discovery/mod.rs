use crate::types::DiscoveryEvent;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod docker;
pub mod static_list;
pub use docker::DockerDiscovery;
pub use static_list::StaticDiscovery;

#[async_trait]
pub trait Discovery {
    /// Watch the membership source and report changes on `events`.
    ///
    /// Implementations must send [`DiscoveryEvent::InitialSyncComplete`]
    /// once their first full listing has been delivered.
    async fn watch(&self, events: mpsc::Sender<DiscoveryEvent>) -> Result<()>;
}
