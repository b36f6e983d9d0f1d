//! Node provisioner: turns a [`ClusterSpec`] into running nodes
//!
//! Every node descriptor is built and validated up front, so a bad port spec
//! or an offset overflow aborts before the runtime is touched. Side effects
//! then run strictly in order: network, server, workers one by one.

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::ports::{create_published_ports, merge_port_specs, validate_port_map, PortSpecError};
use crate::runtime::{Runtime, RuntimeError};
use crate::types::{
    labels, network_name, node_labels, node_name, validate_cluster_name, ClusterSpec, Node, Role,
    SpecError, KUBECONFIG_OUTPUT_PATH,
};

/// Errors that abort a cluster create
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error(transparent)]
    Ports(#[from] PortSpecError),

    #[error("Failed to create node '{node}': {source}")]
    NodeCreateFailed {
        node: String,
        #[source]
        source: RuntimeError,
    },

    #[error("Agent-only clusters need a server URL")]
    MissingServerUrl,

    #[error("Server node '{0}' not found")]
    ServerNotFound(String),

    #[error("Server node '{0}' carries no cluster label, cannot determine its network")]
    ServerWithoutCluster(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// What to do when a worker fails to come up after the server is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum WorkerFailurePolicy {
    /// Stop at the failing worker, leave already created nodes in place
    #[default]
    Abort,
    /// Keep creating the remaining workers and report every outcome
    Continue,
    /// Delete the workers created by this run, then fail
    Rollback,
}

/// Result of creating a single worker
#[derive(Debug)]
pub struct WorkerOutcome {
    pub name: String,
    pub error: Option<RuntimeError>,
}

impl WorkerOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Summary of a cluster create
#[derive(Debug)]
pub struct ProvisionReport {
    /// Server node name, `None` for agent-only clusters
    pub server: Option<String>,
    pub network: String,
    pub workers: Vec<WorkerOutcome>,
}

impl ProvisionReport {
    pub fn failed_workers(&self) -> impl Iterator<Item = &WorkerOutcome> {
        self.workers.iter().filter(|w| !w.succeeded())
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// URL workers use to reach the cluster's own server
pub fn server_connection_url(spec: &ClusterSpec) -> String {
    format!(
        "https://{}:{}",
        node_name(Role::Server, &spec.name, -1),
        spec.api_port.port
    )
}

/// Normalise a user supplied server URL to `https://host:port`
pub fn external_server_url(server_url: &str) -> String {
    if server_url.contains("://") {
        server_url.to_string()
    } else {
        format!("https://{}", server_url)
    }
}

/// Node name part of a server URL (`https://k3d-x-server:6443` -> `k3d-x-server`)
pub fn server_host(server_url: &str) -> &str {
    let rest = server_url
        .split_once("://")
        .map_or(server_url, |(_, rest)| rest);
    rest.split(['/', ':']).next().unwrap_or(rest)
}

/// Descriptor of the cluster's server node
pub fn server_node(spec: &ClusterSpec) -> Result<Node, ProvisionError> {
    let name = node_name(Role::Server, &spec.name, -1);

    let mut specs = merge_port_specs(&spec.port_specs, Role::Server, &name)?;
    specs.push(spec.api_port.port_spec());
    let published = create_published_ports(&specs)?;

    let mut node = Node::new(&name, Role::Server, &spec.image);
    node.labels = node_labels(&spec.name, Role::Server);
    node.labels.insert(
        labels::API_HOST.to_string(),
        spec.api_port.advertised_host().to_string(),
    );
    node.labels
        .insert(labels::API_PORT.to_string(), spec.api_port.port.to_string());
    node.args = spec.server_args.clone();
    node.args.push("--https-listen-port".to_string());
    node.args.push(spec.api_port.port.to_string());
    node.env = spec.env.clone();
    node.env
        .push(format!("K3S_KUBECONFIG_OUTPUT={}", KUBECONFIG_OUTPUT_PATH));
    node.volumes = spec.volumes.clone();
    node.network = spec.network_name();
    node.network_aliases = vec![name];
    node.ports = published.to_specs();
    node.restart = spec.auto_restart;
    Ok(node)
}

/// Descriptor of worker `ordinal`, attached to `network`
pub fn worker_node(spec: &ClusterSpec, ordinal: usize, network: &str) -> Result<Node, ProvisionError> {
    let name = node_name(Role::Worker, &spec.name, ordinal as i32);

    let specs = merge_port_specs(&spec.port_specs, Role::Worker, &name)?;
    let mut published = create_published_ports(&specs)?;
    if spec.port_auto_offset > 0 {
        published = published.offset(ordinal as u32 + u32::from(spec.port_auto_offset))?;
    }

    let mut node = Node::new(&name, Role::Worker, &spec.image);
    node.labels = node_labels(&spec.name, Role::Worker);
    node.args = spec.agent_args.clone();
    node.env = spec.env.clone();
    match spec.server_url.as_deref() {
        Some(url) if spec.joins_external_server() => {
            node.env.push(format!("K3S_URL={}", external_server_url(url)));
        }
        _ => {
            node.env
                .push(format!("K3S_URL={}", server_connection_url(spec)));
            node.network_aliases = vec![name];
        }
    }
    node.volumes = spec.volumes.clone();
    node.network = network.to_string();
    node.ports = published.to_specs();
    node.restart = spec.auto_restart;
    Ok(node)
}

/// Names of every node the spec would create
pub fn planned_node_names(spec: &ClusterSpec) -> Vec<String> {
    let mut names = Vec::with_capacity(spec.workers + 1);
    if !spec.agent_only {
        names.push(node_name(Role::Server, &spec.name, -1));
    }
    names.extend((0..spec.workers).map(|i| node_name(Role::Worker, &spec.name, i as i32)));
    names
}

// ============================================================================
// I/O boundary functions
// ============================================================================

/// Create a node, pulling its image and retrying once if it is missing locally
pub async fn create_node_with_pull(runtime: &dyn Runtime, node: &Node) -> Result<(), RuntimeError> {
    match runtime.create_node(node).await {
        Err(RuntimeError::ImageNotFound(image)) => {
            info!("Image '{}' not found locally, pulling", image);
            runtime.pull_image(&image).await?;
            runtime.create_node(node).await
        }
        other => other,
    }
}

/// Create then start a node
pub async fn start_new_node(runtime: &dyn Runtime, node: &Node) -> Result<(), RuntimeError> {
    create_node_with_pull(runtime, node).await?;
    runtime.start_node(node).await?;
    debug!("Node '{}' is up", node.name);
    Ok(())
}

/// Network of the external server an agent-only cluster joins
pub async fn resolve_worker_network(
    runtime: &dyn Runtime,
    server_url: &str,
) -> Result<String, ProvisionError> {
    let host = server_host(server_url);
    let server = runtime
        .get_node(host)
        .await?
        .ok_or_else(|| ProvisionError::ServerNotFound(host.to_string()))?;
    let cluster = server
        .cluster_name()
        .ok_or_else(|| ProvisionError::ServerWithoutCluster(host.to_string()))?;
    Ok(network_name(cluster))
}

/// Create a cluster: network, then server, then workers in ordinal order
///
/// A server failure aborts before any worker is attempted. Worker failures
/// are handled according to `policy`.
pub async fn create_cluster(
    runtime: &dyn Runtime,
    spec: &ClusterSpec,
    policy: WorkerFailurePolicy,
) -> Result<ProvisionReport, ProvisionError> {
    validate_cluster_name(&spec.name)?;
    validate_port_map(&spec.port_specs, &planned_node_names(spec))?;

    let network = if spec.agent_only {
        let url = spec
            .server_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or(ProvisionError::MissingServerUrl)?;
        resolve_worker_network(runtime, url).await?
    } else {
        spec.network_name()
    };

    let server = if spec.agent_only {
        None
    } else {
        Some(server_node(spec)?)
    };
    let workers = (0..spec.workers)
        .map(|i| worker_node(spec, i, &network))
        .collect::<Result<Vec<_>, _>>()?;
    for node in server.iter().chain(workers.iter()) {
        if spec.verbose {
            info!("Planned node '{}' ({}) ports {:?}", node.name, node.image, node.ports);
        } else {
            debug!("Planned node '{}' ({}) ports {:?}", node.name, node.image, node.ports);
        }
    }

    if !spec.agent_only {
        let (id, existed) = runtime.create_network_if_not_present(&network).await?;
        if existed {
            info!("Using existing network '{}' ({})", network, id);
        } else {
            info!("Created network '{}' ({})", network, id);
        }
    }

    if let Some(server) = &server {
        info!("Creating server node '{}'", server.name);
        start_new_node(runtime, server)
            .await
            .map_err(|source| ProvisionError::NodeCreateFailed {
                node: server.name.clone(),
                source,
            })?;
    }

    let mut outcomes = Vec::with_capacity(workers.len());
    for worker in &workers {
        info!("Creating worker node '{}'", worker.name);
        let Err(source) = start_new_node(runtime, worker).await else {
            outcomes.push(WorkerOutcome {
                name: worker.name.clone(),
                error: None,
            });
            continue;
        };

        error!("Worker '{}' failed: {}", worker.name, source);
        match policy {
            WorkerFailurePolicy::Continue => outcomes.push(WorkerOutcome {
                name: worker.name.clone(),
                error: Some(source),
            }),
            WorkerFailurePolicy::Abort => {
                return Err(ProvisionError::NodeCreateFailed {
                    node: worker.name.clone(),
                    source,
                })
            }
            WorkerFailurePolicy::Rollback => {
                let created = outcomes.iter().map(|o| o.name.as_str());
                rollback_workers(runtime, created.chain([worker.name.as_str()])).await;
                return Err(ProvisionError::NodeCreateFailed {
                    node: worker.name.clone(),
                    source,
                });
            }
        }
    }

    Ok(ProvisionReport {
        server: server.map(|s| s.name),
        network,
        workers: outcomes,
    })
}

/// Best-effort removal of workers; errors are logged only
async fn rollback_workers<'a>(runtime: &dyn Runtime, names: impl Iterator<Item = &'a str>) {
    for name in names {
        match runtime.delete_node(&Node::named(name)).await {
            Ok(()) => info!("Rolled back worker '{}'", name),
            Err(RuntimeError::NodeNotFound(_)) => {}
            Err(e) => warn!("Failed to roll back worker '{}': {}", name, e),
        }
    }
}
