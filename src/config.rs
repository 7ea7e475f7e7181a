use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::discovery::docker::DEFAULT_GROUP_LABEL;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoverySource {
    Docker,
    Static,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DockerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_name: Option<String>,
    /// Docker label filters, e.g. `role=cache`.
    pub label_selector: Vec<String>,
    /// Label whose value names the group a container belongs to.
    pub group_label: String,
    pub target_ports: Vec<u16>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            network_name: None,
            label_selector: Vec::new(),
            group_label: DEFAULT_GROUP_LABEL.into(),
            target_ports: vec![80],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: SocketAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_ip: Option<String>,
    /// Inbound methods that trigger a broadcast.
    pub methods: Vec<String>,
    /// Outbound method override; the inbound method is reused when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_method: Option<String>,
    pub request_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_idle_per_host: usize,
    pub server_timeout_secs: u64,
    pub sync_timeout_secs: u64,
    pub discovery: DiscoverySource,
    pub docker: DockerConfig,
    pub static_endpoints: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            bind_ip: None,
            methods: vec!["PURGE".into(), "BAN".into()],
            forward_method: None,
            request_timeout_secs: 5,
            idle_timeout_secs: 30,
            max_idle_per_host: 10,
            server_timeout_secs: 10,
            sync_timeout_secs: 60,
            discovery: DiscoverySource::Docker,
            docker: DockerConfig::default(),
            static_endpoints: Vec::new(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("cachecast.toml"))
            .merge(Json::file("cachecast.json"))
            .merge(Env::prefixed("CACHECAST_").split("__"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // If bind_ip is set, override the IP part of listen
        if let Some(ref ip) = config.bind_ip {
            let ip = ip
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid bind_ip: {}", e))?;
            config.listen = SocketAddr::new(ip, config.listen.port());
        }

        // Surface bad method tokens at startup rather than per request.
        config.broadcast_methods()?;
        config.outbound_method()?;

        // The inbound deadline must outlast every per-target call, or the
        // caller gets a bare timeout instead of the per-target report.
        if config.server_timeout_secs <= config.request_timeout_secs {
            anyhow::bail!(
                "server_timeout_secs ({}) must be greater than request_timeout_secs ({})",
                config.server_timeout_secs,
                config.request_timeout_secs
            );
        }

        Ok(config)
    }

    pub fn broadcast_methods(&self) -> anyhow::Result<Vec<Method>> {
        self.methods.iter().map(|m| parse_method(m)).collect()
    }

    pub fn outbound_method(&self) -> anyhow::Result<Option<Method>> {
        self.forward_method.as_deref().map(parse_method).transpose()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn server_timeout(&self) -> Duration {
        Duration::from_secs(self.server_timeout_secs)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }
}

fn parse_method(token: &str) -> anyhow::Result<Method> {
    Method::from_bytes(token.to_ascii_uppercase().as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid HTTP method {:?}: {}", token, e))
}
