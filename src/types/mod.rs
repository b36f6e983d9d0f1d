//! Node and cluster data model
//!
//! Value types shared by the provisioner, the runtime backends and the
//! kubeconfig engine. Container labels written from these types are the only
//! durable record of a cluster: nothing here is persisted by k3d itself.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::Local;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix for every object (container, network, kubeconfig entry) k3d creates
pub const DEFAULT_OBJECT_NAME_PREFIX: &str = "k3d";

/// Default node image
pub const DEFAULT_IMAGE: &str = "docker.io/rancher/k3s:latest";

/// Default Kubernetes API port exposed by the server node
pub const DEFAULT_API_PORT: u16 = 6443;

/// Host used in kubeconfig server URLs when the server advertises none
pub const DEFAULT_API_HOST: &str = "localhost";

/// Host IP the API port binds to when none is given
pub const DEFAULT_API_HOST_IP: &str = "0.0.0.0";

/// Longest cluster name accepted (keeps derived container names within hostname limits)
pub const MAX_CLUSTER_NAME_LEN: usize = 32;

/// Where the server node writes its admin kubeconfig
pub const KUBECONFIG_OUTPUT_PATH: &str = "/output/kubeconfig.yaml";

/// Tmpfs mounts applied to worker nodes
pub const WORKER_TMPFS_MOUNTS: &[&str] = &["/run", "/var/run"];

/// Container label keys
pub mod labels {
    pub const APP: &str = "app";
    pub const COMPONENT: &str = "component";
    pub const CREATED: &str = "created";
    pub const CLUSTER: &str = "cluster";
    pub const ROLE: &str = "k3d.role";
    pub const K3D_CLUSTER: &str = "k3d.cluster";
    pub const API_HOST: &str = "k3d.master.api.host";
    pub const API_PORT: &str = "k3d.master.api.port";

    /// Value of the `app` label on everything k3d creates
    pub const APP_VALUE: &str = "k3d";
}

/// Errors raised while validating user input for the data model
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecError {
    #[error("Invalid cluster name '{0}': must match [a-zA-Z0-9][a-zA-Z0-9_.-]* and be at most 32 characters")]
    InvalidClusterName(String),

    #[error("Invalid role '{0}': expected 'server' or 'worker'")]
    InvalidRole(String),

    #[error("Invalid API port '{0}'")]
    InvalidApiPort(String),
}

/// Role a node plays in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Server,
    Worker,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Worker => "worker",
        }
    }

    /// k3s subcommand the node container runs
    pub fn default_cmd(&self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Worker => "agent",
        }
    }

    pub fn tmpfs_mounts(&self) -> &'static [&'static str] {
        match self {
            Role::Server => &[],
            Role::Worker => WORKER_TMPFS_MOUNTS,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(Role::Server),
            "worker" => Ok(Role::Worker),
            other => Err(SpecError::InvalidRole(other.to_string())),
        }
    }
}

/// A single container playing the server or worker role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub role: Role,
    pub image: String,
    /// Extra k3s arguments appended after the role's default command
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment as `KEY=VALUE` strings
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Bind mounts as `host:container[:opts]`
    #[serde(default)]
    pub volumes: Vec<String>,
    pub network: String,
    #[serde(default)]
    pub network_aliases: Vec<String>,
    /// Canonical port specs (`host-ip:host-port:container-port/proto`)
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub restart: bool,
    /// Whether the backend reported the container as running
    #[serde(default)]
    pub running: bool,
}

impl Node {
    pub fn new(name: impl Into<String>, role: Role, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role,
            image: image.into(),
            args: Vec::new(),
            env: Vec::new(),
            labels: HashMap::new(),
            volumes: Vec::new(),
            network: String::new(),
            network_aliases: Vec::new(),
            ports: Vec::new(),
            restart: false,
            running: false,
        }
    }

    /// A node reference carrying only its name, for by-name runtime calls
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, Role::Worker, "")
    }

    /// Full container command: role default command followed by extra args
    pub fn command(&self) -> Vec<String> {
        let mut cmd = vec![self.role.default_cmd().to_string()];
        cmd.extend(self.args.iter().cloned());
        cmd
    }

    pub fn cluster_name(&self) -> Option<&str> {
        self.labels
            .get(labels::CLUSTER)
            .or_else(|| self.labels.get(labels::K3D_CLUSTER))
            .map(|s| s.as_str())
    }
}

/// Where the Kubernetes API of the server node is published
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiPort {
    /// Hostname advertised to kubeconfig consumers (empty = default host)
    #[serde(default)]
    pub host: String,
    /// Host IP the port binds to
    #[serde(default = "default_host_ip")]
    pub host_ip: String,
    pub port: u16,
}

fn default_host_ip() -> String {
    DEFAULT_API_HOST_IP.to_string()
}

impl Default for ApiPort {
    fn default() -> Self {
        Self {
            host: String::new(),
            host_ip: DEFAULT_API_HOST_IP.to_string(),
            port: DEFAULT_API_PORT,
        }
    }
}

impl ApiPort {
    /// Parse `[host:]port`; a host that is an IP address is also used as bind IP
    pub fn parse(input: &str) -> Result<Self, SpecError> {
        let invalid = || SpecError::InvalidApiPort(input.to_string());
        let (host, port) = match input.rsplit_once(':') {
            Some((host, port)) => (host, port),
            None => ("", input),
        };
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if port == 0 {
            return Err(invalid());
        }
        let host_ip = match host.parse::<std::net::IpAddr>() {
            Ok(ip) => ip.to_string(),
            Err(_) => DEFAULT_API_HOST_IP.to_string(),
        };
        Ok(Self {
            host: host.to_string(),
            host_ip,
            port,
        })
    }

    pub fn advertised_host(&self) -> &str {
        if self.host.is_empty() {
            DEFAULT_API_HOST
        } else {
            &self.host
        }
    }

    /// Port spec binding the API port on the host
    pub fn port_spec(&self) -> String {
        format!("{}:{}:{}/tcp", self.host_ip, self.port, self.port)
    }
}

/// User-level description of the cluster to create
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub name: String,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default)]
    pub workers: usize,
    #[serde(default)]
    pub server_args: Vec<String>,
    #[serde(default)]
    pub agent_args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    /// Scope key (`all`, `server`, `worker` or a node name) to port specs
    #[serde(default)]
    pub port_specs: HashMap<String, Vec<String>>,
    /// Base host-port offset applied to workers (0 disables offsetting)
    #[serde(default)]
    pub port_auto_offset: u16,
    #[serde(default)]
    pub api_port: ApiPort,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default)]
    pub verbose: bool,
    /// Create workers only, joining an existing server
    #[serde(default)]
    pub agent_only: bool,
    #[serde(default)]
    pub server_url: Option<String>,
}

fn default_image() -> String {
    DEFAULT_IMAGE.to_string()
}

impl ClusterSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: default_image(),
            workers: 0,
            server_args: Vec::new(),
            agent_args: Vec::new(),
            env: Vec::new(),
            port_specs: HashMap::new(),
            port_auto_offset: 0,
            api_port: ApiPort::default(),
            volumes: Vec::new(),
            auto_restart: false,
            verbose: false,
            agent_only: false,
            server_url: None,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_ports(mut self, scope: impl Into<String>, specs: Vec<String>) -> Self {
        self.port_specs.entry(scope.into()).or_default().extend(specs);
        self
    }

    pub fn with_port_auto_offset(mut self, offset: u16) -> Self {
        self.port_auto_offset = offset;
        self
    }

    pub fn network_name(&self) -> String {
        network_name(&self.name)
    }

    /// Agent-only topology joining an external server
    pub fn joins_external_server(&self) -> bool {
        self.agent_only && self.server_url.as_deref().is_some_and(|u| !u.is_empty())
    }
}

/// A cluster as observed through the runtime (never persisted)
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub name: String,
    pub server: Option<Node>,
    pub workers: Vec<Node>,
}

impl Cluster {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            server: None,
            workers: Vec::new(),
        }
    }

    /// Server first, then workers
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.server.iter().chain(self.workers.iter())
    }

    pub fn node_count(&self) -> usize {
        self.nodes().count()
    }

    pub fn network_name(&self) -> String {
        network_name(&self.name)
    }
}

// ============================================================================
// SBIO: Pure naming and labeling (no I/O)
// ============================================================================

/// Check that a cluster name can be embedded in container and network names
pub fn validate_cluster_name(name: &str) -> Result<(), SpecError> {
    let matches = Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$")
        .map(|re| re.is_match(name))
        .unwrap_or(false);
    if name.len() > MAX_CLUSTER_NAME_LEN || !matches {
        return Err(SpecError::InvalidClusterName(name.to_string()));
    }
    Ok(())
}

/// Deterministic node name: ordinal `-1` is the single server, `>= 0` are workers
pub fn node_name(role: Role, cluster: &str, ordinal: i32) -> String {
    if ordinal < 0 {
        format!("{}-{}-{}", DEFAULT_OBJECT_NAME_PREFIX, cluster, role)
    } else {
        format!(
            "{}-{}-{}-{}",
            DEFAULT_OBJECT_NAME_PREFIX, cluster, role, ordinal
        )
    }
}

/// Name of the network shared by all nodes of a cluster
pub fn network_name(cluster: &str) -> String {
    format!("{}-{}", DEFAULT_OBJECT_NAME_PREFIX, cluster)
}

/// Label set written on every node of a cluster
pub fn node_labels(cluster: &str, role: Role) -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert(labels::APP.to_string(), labels::APP_VALUE.to_string());
    map.insert(labels::COMPONENT.to_string(), role.to_string());
    map.insert(
        labels::CREATED.to_string(),
        Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
    );
    map.insert(labels::CLUSTER.to_string(), cluster.to_string());
    map.insert(labels::ROLE.to_string(), role.to_string());
    map.insert(labels::K3D_CLUSTER.to_string(), cluster.to_string());
    map
}

/// Labels selecting every node of a cluster, optionally narrowed to one role
pub fn cluster_selector(cluster: &str, role: Option<Role>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert(labels::APP.to_string(), labels::APP_VALUE.to_string());
    map.insert(labels::K3D_CLUSTER.to_string(), cluster.to_string());
    if let Some(role) = role {
        map.insert(labels::ROLE.to_string(), role.to_string());
    }
    map
}
