//! Data structures shared by the registry, discovery and broadcast layers.
//!
//! Discovery sources describe membership as [`EndpointGroup`]s: the full
//! address × port set of one named service.  Changes to those groups are
//! delivered as [`DiscoveryEvent`]s and applied to the registry, which is
//! keyed by [`EndpointKey`].

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// One broadcast target.
///
/// Two keys with the same IP but different ports are distinct targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey {
    pub ip: String,
    pub port: u16,
}

impl EndpointKey {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ip.contains(':') {
            write!(f, "[{}]:{}", self.ip, self.port)
        } else {
            write!(f, "{}:{}", self.ip, self.port)
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid endpoint `{0}`, expected ip:port")]
pub struct ParseEndpointError(String);

impl FromStr for EndpointKey {
    type Err = ParseEndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ParseEndpointError(s.to_string()))?;
        let ip = ip.trim_start_matches('[').trim_end_matches(']');
        let port = port
            .parse::<u16>()
            .map_err(|_| ParseEndpointError(s.to_string()))?;
        if ip.is_empty() {
            return Err(ParseEndpointError(s.to_string()));
        }
        Ok(Self::new(ip, port))
    }
}

/// A registry entry: the key plus diagnostics-only metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointRecord {
    pub key: EndpointKey,
    /// Owning workload (container or pod name). Never used for routing.
    pub target: Option<String>,
}

impl EndpointRecord {
    pub fn new(key: EndpointKey, target: Option<String>) -> Self {
        Self { key, target }
    }
}

/// The records delivered together by one discovery event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointGroup {
    pub name: String,
    pub records: Vec<EndpointRecord>,
}

impl EndpointGroup {
    /// Builds a group from pre-made records, sorted by key so that two
    /// groups with the same membership compare equal.
    pub fn new(name: impl Into<String>, mut records: Vec<EndpointRecord>) -> Self {
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Self {
            name: name.into(),
            records,
        }
    }

    /// The address × port cartesian product of a service.
    ///
    /// `addresses` pairs an IP with the workload that owns it.
    pub fn from_addresses<'a, I>(name: impl Into<String>, addresses: I, ports: &[u16]) -> Self
    where
        I: IntoIterator<Item = (&'a str, Option<&'a str>)>,
    {
        let mut records = Vec::new();
        for (ip, target) in addresses {
            for port in ports {
                records.push(EndpointRecord::new(
                    EndpointKey::new(ip, *port),
                    target.map(str::to_string),
                ));
            }
        }
        Self::new(name, records)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// A membership change reported by a discovery source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A service appeared.
    Added(EndpointGroup),
    /// A service's membership changed from `old` to `new`.
    Updated {
        old: EndpointGroup,
        new: EndpointGroup,
    },
    /// A service went away. The payload's own records are removed.
    Deleted(EndpointGroup),
    /// The source has delivered its initial full listing.
    InitialSyncComplete,
}
