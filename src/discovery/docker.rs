use super::Discovery;
use crate::types::{DiscoveryEvent, EndpointGroup};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::network::InspectNetworkOptions;
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

/// Docker Compose sets this on every service container.
pub const DEFAULT_GROUP_LABEL: &str = "com.docker.compose.service";

/// Watches containers on one Docker network and reports them grouped by
/// service.
pub struct DockerDiscovery {
    network_name: Option<String>,
    label_selector: Vec<String>,
    group_label: String,
    target_ports: Vec<u16>,
}

/// A running container as seen on the watched network.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Member {
    group: String,
    ip: String,
}

impl DockerDiscovery {
    pub fn new(
        network_name: Option<String>,
        label_selector: Vec<String>,
        group_label: String,
        target_ports: Vec<u16>,
    ) -> Self {
        Self {
            network_name,
            label_selector,
            group_label,
            target_ports,
        }
    }

    async fn connect() -> Result<Docker> {
        Docker::connect_with_local_defaults().map_err(Into::into)
    }

    /// Inspects the current container to find the first attached overlay network.
    async fn autodetect_overlay_network(docker: &Docker) -> Result<String> {
        info!("No network configured, attempting to auto-detect overlay network...");
        // In a Docker container, the hostname is typically the container ID.
        let hostname = env::var("HOSTNAME")?;
        let container_detail = docker.inspect_container(&hostname, None).await?;

        if let Some(networks) = container_detail
            .network_settings
            .and_then(|s| s.networks)
        {
            for (name, _) in networks {
                let network_detail = docker
                    .inspect_network(&name, None::<InspectNetworkOptions<String>>)
                    .await?;
                if network_detail.driver.as_deref() == Some("overlay") {
                    info!("Auto-detected overlay network: {}", name);
                    return Ok(name);
                }
            }
        }

        Err(anyhow!(
            "Could not auto-detect an overlay network for this container."
        ))
    }

    fn label_filters(&self) -> HashMap<String, Vec<String>> {
        let mut filters = HashMap::new();
        if !self.label_selector.is_empty() {
            filters.insert("label".to_string(), self.label_selector.clone());
        }
        filters
    }

    /// Resolves a container to its group and address on `network_name`.
    async fn inspect_member(
        &self,
        docker: &Docker,
        container: &str,
        network_name: &str,
    ) -> Result<Option<Member>> {
        let detail = docker.inspect_container(container, None).await?;
        let Some(ip) = get_ip_for_network(&detail, network_name) else {
            return Ok(None);
        };
        let group = detail
            .config
            .as_ref()
            .and_then(|c| c.labels.as_ref())
            .and_then(|labels| labels.get(&self.group_label))
            .cloned()
            .unwrap_or_else(|| container.to_string());
        Ok(Some(Member { group, ip }))
    }

    async fn list_members(
        &self,
        docker: &Docker,
        network_name: &str,
    ) -> Result<HashMap<String, Member>> {
        let mut members = HashMap::new();
        let opts = ListContainersOptions::<String> {
            all: false,
            filters: self.label_filters(),
            ..Default::default()
        };
        let containers = docker.list_containers(Some(opts)).await?;

        for c in containers {
            let name = c
                .names
                .as_ref()
                .and_then(|n| n.first())
                .map(|n| n.trim_start_matches('/').to_string());
            let name = match (name, c.id) {
                (Some(n), _) => n,
                (_, Some(id)) => id,
                _ => continue,
            };

            match self.inspect_member(docker, &name, network_name).await {
                Ok(Some(member)) => {
                    members.insert(name, member);
                }
                Ok(None) => debug!("Container {} is not on {}", name, network_name),
                Err(e) => warn!("Failed to inspect container {}: {}", name, e),
            }
        }
        Ok(members)
    }

    fn event_options(&self) -> EventsOptions<String> {
        let mut filters = self.label_filters();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        filters.insert(
            "event".to_string(),
            ["start", "die", "kill", "stop"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        EventsOptions {
            filters,
            ..Default::default()
        }
    }
}

async fn send_all(events: &mpsc::Sender<DiscoveryEvent>, batch: Vec<DiscoveryEvent>) -> Result<()> {
    for event in batch {
        events
            .send(event)
            .await
            .map_err(|_| anyhow!("Channel closed"))?;
    }
    Ok(())
}

#[async_trait]
impl Discovery for DockerDiscovery {
    async fn watch(&self, events: mpsc::Sender<DiscoveryEvent>) -> Result<()> {
        let mut tracker = GroupTracker::new(self.target_ports.clone());

        loop {
            let docker = match Self::connect().await {
                Ok(d) => d,
                Err(e) => {
                    error!("Failed to connect to Docker: {}. Retrying in 5s...", e);
                    sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            let network_name = match &self.network_name {
                Some(name) => name.clone(),
                None => match Self::autodetect_overlay_network(&docker).await {
                    Ok(name) => name,
                    Err(e) => {
                        error!("Network discovery failed: {}. Retrying in 10s...", e);
                        sleep(Duration::from_secs(10)).await;
                        continue;
                    }
                },
            };
            info!("Starting Docker discovery on network: {}", network_name);

            // Full listing, reconciled against whatever was reported before
            // the last reconnect.
            match self.list_members(&docker, &network_name).await {
                Ok(members) => {
                    info!("Listing found {} containers", members.len());
                    let mut batch = tracker.reconcile(members);
                    batch.push(DiscoveryEvent::InitialSyncComplete);
                    send_all(&events, batch).await?;
                }
                Err(e) => {
                    error!("Failed to list containers: {}. Retrying...", e);
                    sleep(Duration::from_secs(5)).await;
                    continue;
                }
            }

            let mut stream = docker.events(Some(self.event_options()));

            info!("Listening for Docker events...");
            while let Some(msg) = stream.next().await {
                let event = match msg {
                    Ok(event) => event,
                    Err(e) => {
                        error!("Error in Docker event stream: {}", e);
                        break;
                    }
                };
                let Some(actor) = event.actor else { continue };
                let name = actor
                    .attributes
                    .as_ref()
                    .and_then(|a| a.get("name"))
                    .filter(|n| !n.is_empty())
                    .cloned()
                    .or(actor.id)
                    .unwrap_or_default();
                if name.is_empty() {
                    continue;
                }

                let action = event.action.unwrap_or_default();
                debug!("Container event: {} for {}", action, name);

                let batch = match action.as_str() {
                    "start" => match self.inspect_member(&docker, &name, &network_name).await {
                        Ok(Some(member)) => {
                            info!(
                                "Container started: {} -> {} ({})",
                                name, member.ip, member.group
                            );
                            tracker.upsert(name, member)
                        }
                        Ok(None) => continue,
                        Err(e) => {
                            warn!("Failed to inspect started container {}: {}", name, e);
                            continue;
                        }
                    },
                    "die" | "kill" | "stop" => {
                        let batch = tracker.remove(&name);
                        if !batch.is_empty() {
                            info!("Container stopped: {}", name);
                        }
                        batch
                    }
                    _ => continue,
                };
                send_all(&events, batch).await?;
            }

            warn!("Docker event stream ended. Reconnecting in 2s...");
            sleep(Duration::from_secs(2)).await;
        }
    }
}

/// Last reported membership, used to turn per-container changes into
/// per-group events.
struct GroupTracker {
    ports: Vec<u16>,
    members: HashMap<String, Member>,
}

impl GroupTracker {
    fn new(ports: Vec<u16>) -> Self {
        Self {
            ports,
            members: HashMap::new(),
        }
    }

    fn group(&self, name: &str) -> EndpointGroup {
        let addresses = self
            .members
            .iter()
            .filter(|(_, m)| m.group == name)
            .map(|(container, m)| (m.ip.as_str(), Some(container.as_str())));
        EndpointGroup::from_addresses(name, addresses, &self.ports)
    }

    fn change(&self, group: &str, old: EndpointGroup) -> Option<DiscoveryEvent> {
        let new = self.group(group);
        match (old.is_empty(), new.is_empty()) {
            _ if old == new => None,
            (true, _) => Some(DiscoveryEvent::Added(new)),
            (_, true) => Some(DiscoveryEvent::Deleted(old)),
            _ => Some(DiscoveryEvent::Updated { old, new }),
        }
    }

    fn upsert(&mut self, container: String, member: Member) -> Vec<DiscoveryEvent> {
        let mut batch = Vec::new();
        match self.members.get(&container).cloned() {
            Some(existing) if existing == member => return batch,
            Some(existing) if existing.group != member.group => {
                batch.extend(self.remove(&container));
            }
            _ => {}
        }
        let old = self.group(&member.group);
        let group = member.group.clone();
        self.members.insert(container, member);
        batch.extend(self.change(&group, old));
        batch
    }

    fn remove(&mut self, container: &str) -> Vec<DiscoveryEvent> {
        let Some(group) = self.members.get(container).map(|m| m.group.clone()) else {
            return Vec::new();
        };
        let old = self.group(&group);
        self.members.remove(container);
        self.change(&group, old).into_iter().collect()
    }

    /// Replaces the tracked membership with a fresh listing.
    fn reconcile(&mut self, fresh: HashMap<String, Member>) -> Vec<DiscoveryEvent> {
        let mut affected: BTreeMap<String, EndpointGroup> = BTreeMap::new();
        for member in self.members.values().chain(fresh.values()) {
            if !affected.contains_key(&member.group) {
                affected.insert(member.group.clone(), self.group(&member.group));
            }
        }
        self.members = fresh;
        affected
            .into_iter()
            .filter_map(|(group, old)| self.change(&group, old))
            .collect()
    }
}

fn get_ip_for_network(
    detail: &bollard::models::ContainerInspectResponse,
    network_name: &str,
) -> Option<String> {
    let net = detail
        .network_settings
        .as_ref()?
        .networks
        .as_ref()?
        .get(network_name)?;
    net.ip_address
        .as_ref()
        .filter(|ip| !ip.is_empty())
        .or_else(|| net.global_ipv6_address.as_ref().filter(|ip| !ip.is_empty()))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(group: &str, ip: &str) -> Member {
        Member {
            group: group.to_string(),
            ip: ip.to_string(),
        }
    }

    fn keys(group: &EndpointGroup) -> Vec<String> {
        group.records.iter().map(|r| r.key.to_string()).collect()
    }

    #[test]
    fn test_first_member_adds_group() {
        let mut tracker = GroupTracker::new(vec![80, 6081]);
        let batch = tracker.upsert("varnish-1".into(), member("varnish", "10.0.0.1"));

        match batch.as_slice() {
            [DiscoveryEvent::Added(group)] => {
                assert_eq!(group.name, "varnish");
                assert_eq!(keys(group), vec!["10.0.0.1:80", "10.0.0.1:6081"]);
                assert_eq!(group.records[0].target.as_deref(), Some("varnish-1"));
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn test_second_member_updates_group() {
        let mut tracker = GroupTracker::new(vec![80]);
        tracker.upsert("varnish-1".into(), member("varnish", "10.0.0.1"));
        let batch = tracker.upsert("varnish-2".into(), member("varnish", "10.0.0.2"));

        match batch.as_slice() {
            [DiscoveryEvent::Updated { old, new }] => {
                assert_eq!(keys(old), vec!["10.0.0.1:80"]);
                assert_eq!(keys(new), vec!["10.0.0.1:80", "10.0.0.2:80"]);
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn test_repeated_start_is_silent() {
        let mut tracker = GroupTracker::new(vec![80]);
        tracker.upsert("varnish-1".into(), member("varnish", "10.0.0.1"));
        assert!(tracker
            .upsert("varnish-1".into(), member("varnish", "10.0.0.1"))
            .is_empty());
    }

    #[test]
    fn test_last_member_stopping_deletes_group() {
        let mut tracker = GroupTracker::new(vec![80]);
        tracker.upsert("varnish-1".into(), member("varnish", "10.0.0.1"));
        tracker.upsert("varnish-2".into(), member("varnish", "10.0.0.2"));

        assert!(matches!(
            tracker.remove("varnish-1").as_slice(),
            [DiscoveryEvent::Updated { .. }]
        ));
        match tracker.remove("varnish-2").as_slice() {
            [DiscoveryEvent::Deleted(group)] => assert_eq!(keys(group), vec!["10.0.0.2:80"]),
            other => panic!("unexpected events {:?}", other),
        }
        // die, kill and stop all arrive for one container.
        assert!(tracker.remove("varnish-2").is_empty());
    }

    #[test]
    fn test_reconcile_reports_only_differences() {
        let mut tracker = GroupTracker::new(vec![80]);
        tracker.upsert("a-1".into(), member("a", "10.0.0.1"));
        tracker.upsert("b-1".into(), member("b", "10.0.1.1"));
        tracker.upsert("c-1".into(), member("c", "10.0.2.1"));

        let fresh = HashMap::from([
            ("a-1".to_string(), member("a", "10.0.0.1")),
            ("b-2".to_string(), member("b", "10.0.1.2")),
            ("d-1".to_string(), member("d", "10.0.3.1")),
        ]);
        let batch = tracker.reconcile(fresh);

        assert_eq!(batch.len(), 3);
        assert!(matches!(&batch[0], DiscoveryEvent::Updated { new, .. } if keys(new) == vec!["10.0.1.2:80"]));
        assert!(matches!(&batch[1], DiscoveryEvent::Deleted(g) if g.name == "c"));
        assert!(matches!(&batch[2], DiscoveryEvent::Added(g) if g.name == "d"));
    }

    #[test]
    fn test_initial_reconcile_adds_every_group() {
        let mut tracker = GroupTracker::new(vec![80]);
        let fresh = HashMap::from([
            ("a-1".to_string(), member("a", "10.0.0.1")),
            ("a-2".to_string(), member("a", "10.0.0.2")),
            ("b-1".to_string(), member("b", "10.0.1.1")),
        ]);

        let batch = tracker.reconcile(fresh);
        match batch.as_slice() {
            [DiscoveryEvent::Added(a), DiscoveryEvent::Added(b)] => {
                assert_eq!(a.len(), 2);
                assert_eq!(b.len(), 1);
            }
            other => panic!("unexpected events {:?}", other),
        }
    }
}
