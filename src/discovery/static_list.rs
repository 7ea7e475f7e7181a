use super::Discovery;
use crate::types::{DiscoveryEvent, EndpointGroup, EndpointKey, EndpointRecord};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::info;
use tokio::sync::mpsc;

/// A fixed endpoint list, reported once as a single group.
pub struct StaticDiscovery {
    endpoints: Vec<EndpointKey>,
}

impl StaticDiscovery {
    pub fn new(endpoints: Vec<EndpointKey>) -> Self {
        Self { endpoints }
    }

    pub fn parse(endpoints: &[String]) -> Result<Self> {
        let endpoints = endpoints
            .iter()
            .map(|s| s.parse::<EndpointKey>())
            .collect::<Result<Vec<_>, _>>()
            .context("Invalid static endpoint")?;
        Ok(Self::new(endpoints))
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn watch(&self, events: mpsc::Sender<DiscoveryEvent>) -> Result<()> {
        let records = self
            .endpoints
            .iter()
            .map(|key| EndpointRecord::new(key.clone(), None))
            .collect();
        let group = EndpointGroup::new("static", records);
        info!("Static discovery with {} endpoints", group.len());

        if !group.is_empty() {
            events
                .send(DiscoveryEvent::Added(group))
                .await
                .map_err(|_| anyhow!("Channel closed"))?;
        }
        events
            .send(DiscoveryEvent::InitialSyncComplete)
            .await
            .map_err(|_| anyhow!("Channel closed"))?;

        // The list never changes; hold the sender so the stream stays open.
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reports_one_group_then_sync() {
        let discovery =
            StaticDiscovery::parse(&["10.0.0.1:80".to_string(), "10.0.0.2:6081".to_string()])
                .unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let handle = tokio::spawn(async move { discovery.watch(tx).await });

        match rx.recv().await {
            Some(DiscoveryEvent::Added(group)) => {
                assert_eq!(group.name, "static");
                assert_eq!(group.len(), 2);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(rx.recv().await, Some(DiscoveryEvent::InitialSyncComplete));
        handle.abort();
    }

    #[test]
    fn test_parse_rejects_malformed_endpoint() {
        assert!(StaticDiscovery::parse(&["10.0.0.1".to_string()]).is_err());
    }
}
