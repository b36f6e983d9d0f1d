//! Port spec resolution
//!
//! Port requests are declared per scope (`all`, `server`, `worker` or an exact
//! node name) as textual specs of the form
//! `[host-ip:][host-port:]container-port[/tcp|/udp]`. This module merges the
//! scopes that apply to one node, parses the result into exposed ports and
//! host bindings, and shifts host ports by a per-worker offset.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Role;

/// Scope key applying to every node
pub const SCOPE_ALL: &str = "all";

/// Host IP used for bindings that don't name one
pub const WILDCARD_HOST_IP: &str = "0.0.0.0";

/// Errors that can occur while resolving port specs
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortSpecError {
    #[error("Malformed port spec '{0}'")]
    Malformed(String),

    #[error("Unknown port scope '{0}': expected 'all', 'server', 'worker' or a node name")]
    UnknownScope(String),

    #[error("Offsetting host port {port} by {offset} exceeds 65535")]
    OffsetOverflow { port: u16, offset: u32 },
}

/// Transport protocol of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A port exposed by the container
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContainerPort {
    pub port: u16,
    pub proto: Protocol,
}

impl fmt::Display for ContainerPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.proto)
    }
}

/// Host side of a published port; `host_port: None` lets the backend pick one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: Option<u16>,
}

/// A single parsed port spec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    pub host_ip: Option<Ipv4Addr>,
    pub host_port: Option<u16>,
    pub container: ContainerPort,
}

impl FromStr for PortSpec {
    type Err = PortSpecError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let malformed = || PortSpecError::Malformed(raw.to_string());

        let (addr, proto) = match raw.split_once('/') {
            Some((addr, "tcp")) => (addr, Protocol::Tcp),
            Some((addr, "udp")) => (addr, Protocol::Udp),
            Some(_) => return Err(malformed()),
            None => (raw, Protocol::Tcp),
        };

        let parts: Vec<&str> = addr.split(':').collect();
        let (ip, host_port, container_port) = match parts.as_slice() {
            [container] => ("", "", *container),
            [host, container] => ("", *host, *container),
            [ip, host, container] => (*ip, *host, *container),
            _ => return Err(malformed()),
        };

        let host_ip = if ip.is_empty() {
            None
        } else {
            Some(ip.parse::<Ipv4Addr>().map_err(|_| malformed())?)
        };
        let host_port = if host_port.is_empty() {
            None
        } else {
            Some(parse_port(host_port).ok_or_else(malformed)?)
        };
        let port = parse_port(container_port).ok_or_else(malformed)?;

        Ok(Self {
            host_ip,
            host_port,
            container: ContainerPort { port, proto },
        })
    }
}

fn parse_port(s: &str) -> Option<u16> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse::<u16>().ok().filter(|p| *p != 0)
}

/// Exposed container ports and their host bindings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishedPorts {
    pub exposed: BTreeSet<ContainerPort>,
    pub bindings: BTreeMap<ContainerPort, Vec<PortBinding>>,
}

impl PublishedPorts {
    pub fn is_empty(&self) -> bool {
        self.exposed.is_empty()
    }

    /// Shift every concrete host port by `offset`; wildcard host ports stay unset
    pub fn offset(&self, offset: u32) -> Result<Self, PortSpecError> {
        let mut shifted = self.clone();
        for bindings in shifted.bindings.values_mut() {
            for binding in bindings.iter_mut() {
                if let Some(port) = binding.host_port {
                    let moved = u32::from(port) + offset;
                    let moved = u16::try_from(moved)
                        .map_err(|_| PortSpecError::OffsetOverflow { port, offset })?;
                    binding.host_port = Some(moved);
                }
            }
        }
        Ok(shifted)
    }

    /// Render back to canonical specs, one per binding
    pub fn to_specs(&self) -> Vec<String> {
        let mut specs = Vec::new();
        for (container, bindings) in &self.bindings {
            for binding in bindings {
                let host_port = binding.host_port.map(|p| p.to_string()).unwrap_or_default();
                specs.push(format!(
                    "{}:{}:{}",
                    binding.host_ip, host_port, container
                ));
            }
        }
        specs
    }
}

// ============================================================================
// SBIO: Pure resolution logic (no I/O)
// ============================================================================

/// Parse specs into exposed ports and bindings. Duplicates are kept.
pub fn create_published_ports(specs: &[String]) -> Result<PublishedPorts, PortSpecError> {
    let mut published = PublishedPorts::default();
    for raw in specs {
        let spec: PortSpec = raw.parse()?;
        published.exposed.insert(spec.container);
        published
            .bindings
            .entry(spec.container)
            .or_default()
            .push(PortBinding {
                host_ip: spec
                    .host_ip
                    .map(|ip| ip.to_string())
                    .unwrap_or_else(|| WILDCARD_HOST_IP.to_string()),
                host_port: spec.host_port,
            });
    }
    Ok(published)
}

/// Collect the specs for one node in scope order `all`, role, node name.
///
/// Intra-scope order is preserved and nothing is deduplicated.
pub fn merge_port_specs(
    port_map: &HashMap<String, Vec<String>>,
    role: Role,
    node_name: &str,
) -> Result<Vec<String>, PortSpecError> {
    let mut merged = Vec::new();
    for scope in [SCOPE_ALL, role.as_str(), node_name] {
        if let Some(specs) = port_map.get(scope) {
            for spec in specs {
                spec.parse::<PortSpec>()?;
                merged.push(spec.clone());
            }
        }
    }
    Ok(merged)
}

/// Validate every scope key and spec before any node gets created
pub fn validate_port_map(
    port_map: &HashMap<String, Vec<String>>,
    node_names: &[String],
) -> Result<(), PortSpecError> {
    for (scope, specs) in port_map {
        let known = scope == SCOPE_ALL
            || scope == Role::Server.as_str()
            || scope == Role::Worker.as_str()
            || node_names.iter().any(|n| n == scope);
        if !known {
            return Err(PortSpecError::UnknownScope(scope.clone()));
        }
        for spec in specs {
            spec.parse::<PortSpec>()?;
        }
    }
    Ok(())
}

/// Parse a CLI `SPEC[@SCOPE]` argument; scope defaults to `all`
pub fn parse_scoped_spec(arg: &str) -> Result<(String, String), PortSpecError> {
    let (spec, scope) = match arg.rsplit_once('@') {
        Some((spec, scope)) if !scope.is_empty() => (spec, scope),
        Some(_) => return Err(PortSpecError::Malformed(arg.to_string())),
        None => (arg, SCOPE_ALL),
    };
    spec.parse::<PortSpec>()?;
    Ok((scope.to_string(), spec.to_string()))
}
