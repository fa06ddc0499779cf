//! Data model: `PortMapping`, `NetworkInfo`, `ClientRegistration`/`ServerRegistration`
//! and the wire-level JSON shapes exchanged through the signaling endpoint.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Forwarded protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(Error::config(format!("unknown protocol: {other}"))),
        }
    }
}

/// A stable identity for a mapping that survives across Client updates.
/// Used by the Coordinator's reconciliation pass to diff successive
/// `ClientRegistration`s.
pub type MappingId = (Protocol, u16);

/// Immutable `(protocol, localPort, remotePort)` record.
///
/// Invariant: `(protocol, localPort)` is unique within a Client's active set;
/// enforced by `MappingSet::insert`, not by this type itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    pub protocol: Protocol,
    pub local_port: u16,
    pub remote_port: u16,
}

impl PortMapping {
    pub fn new(protocol: Protocol, local_port: u16, remote_port: u16) -> Result<Self> {
        if local_port == 0 || remote_port == 0 {
            return Err(Error::config("ports must be in 1..65535"));
        }
        Ok(Self {
            protocol,
            local_port,
            remote_port,
        })
    }

    pub fn id(&self) -> MappingId {
        (self.protocol, self.local_port)
    }

    /// Parses `"proto:local:remote"`, e.g. `"tcp:5001:5000"`.
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        let proto = parts
            .next()
            .ok_or_else(|| Error::config(format!("malformed mapping: {s}")))?;
        let local = parts
            .next()
            .ok_or_else(|| Error::config(format!("malformed mapping: {s}")))?;
        let remote = parts
            .next()
            .ok_or_else(|| Error::config(format!("malformed mapping: {s}")))?;
        if parts.next().is_some() {
            return Err(Error::config(format!("malformed mapping: {s}")));
        }

        let protocol = Protocol::from_str(proto)?;
        let local_port: u16 = local
            .parse()
            .map_err(|_| Error::config(format!("invalid local port in {s}")))?;
        let remote_port: u16 = remote
            .parse()
            .map_err(|_| Error::config(format!("invalid remote port in {s}")))?;

        PortMapping::new(protocol, local_port, remote_port)
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.protocol, self.local_port, self.remote_port)
    }
}

/// De-duplicated, parsed collection of mappings, keyed by `MappingId`.
#[derive(Debug, Clone, Default)]
pub struct MappingSet {
    inner: std::collections::HashMap<MappingId, PortMapping>,
}

impl MappingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses every string, skipping (and logging) malformed entries -- a
    /// bad entry must not abort reconciliation for the rest of the set.
    pub fn parse_lenient(raw: &[String]) -> Self {
        let mut set = Self::new();
        for s in raw {
            match PortMapping::parse(s) {
                Ok(m) => {
                    set.inner.insert(m.id(), m);
                }
                Err(e) => {
                    tracing::warn!(mapping = %s, error = %e, "skipping malformed mapping");
                }
            }
        }
        set
    }

    /// Strict variant used for config-file loading, where a malformed entry
    /// is a fatal `Config` error rather than a skip.
    pub fn parse_strict(raw: &[String]) -> Result<Self> {
        let mut set = Self::new();
        for s in raw {
            let m = PortMapping::parse(s)?;
            if set.inner.insert(m.id(), m).is_some() {
                return Err(Error::config(format!(
                    "duplicate (protocol, localPort) in mapping set: {s}"
                )));
            }
        }
        Ok(set)
    }

    pub fn ids(&self) -> HashSet<MappingId> {
        self.inner.keys().copied().collect()
    }

    pub fn get(&self, id: MappingId) -> Option<&PortMapping> {
        self.inner.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PortMapping> {
        self.inner.values()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn to_strings(&self) -> Vec<String> {
        self.inner.values().map(|m| m.to_string()).collect()
    }

    /// Returns `(added, removed)` mapping ids relative to `old`.
    pub fn diff(&self, old: &MappingSet) -> (Vec<PortMapping>, Vec<MappingId>) {
        let new_ids = self.ids();
        let old_ids = old.ids();

        let added = new_ids
            .difference(&old_ids)
            .filter_map(|id| self.get(*id).copied())
            .collect();
        let removed = old_ids.difference(&new_ids).copied().collect();

        (added, removed)
    }
}

/// NAT classification, see GLOSSARY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NatType {
    None,
    FullCone,
    RestrictedCone,
    PortRestricted,
    Symmetric,
    Unknown,
}

impl NatType {
    /// Whether this classification is worth attempting hole punching for.
    pub fn can_hole_punch(&self) -> bool {
        !matches!(self, NatType::Symmetric)
    }
}

/// Endpoint + NAT classification learned by the NAT Probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub private_endpoint: SocketAddr,
    pub public_endpoint: SocketAddr,
    pub nat_type: NatType,
    pub hole_punch_endpoint: Option<SocketAddr>,
    /// Derived from `nat_type`, except when the probe degraded to `Unknown`,
    /// in which case this is set optimistically `true` instead -- callers
    /// should prefer this field over re-deriving from `nat_type`.
    pub can_hole_punch: bool,
}

/// Payload a Client publishes to the signaling endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRegistration {
    pub network_info: NetworkInfo,
    pub mappings: Vec<String>,
}

/// One allocation the Server made for a given client mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerAllocation {
    pub client_mapping: String,
    pub allocated_port: u16,
}

/// Payload a Server publishes to the signaling endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRegistration {
    pub network_info: NetworkInfo,
    pub allocations: Vec<ServerAllocation>,
}
