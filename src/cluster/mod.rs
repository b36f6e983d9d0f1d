//! # Cluster lifecycle
//!
//! A cluster only exists as the set of containers carrying its labels:
//!
//! ```text
//!   ClusterSpec ──► provisioner ──► Runtime ──► running nodes
//!                                                  │
//!                    kubeconfig ◄──────────────────┤
//!                    image      ◄──────────────────┘
//! ```
//!
//! Queries here rebuild a [`Cluster`] from the runtime every time they run.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::runtime::{Runtime, RuntimeError};
use crate::types::{cluster_selector, labels, Cluster, Node, Role};

pub mod image;
pub mod kubeconfig;
pub mod provisioner;

pub use image::{import_images, ImportError, ImportReport, NodeImportError, NodeImportResult};
pub use kubeconfig::{
    get_and_write_kubeconfig, get_kubeconfig, merge_kubeconfig, remove_cluster_from_kubeconfig,
    EntryKind, Kubeconfig, KubeconfigError, WriteKubeconfigOptions,
};
pub use provisioner::{
    create_cluster, ProvisionError, ProvisionReport, WorkerFailurePolicy, WorkerOutcome,
};

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Group nodes into clusters by their cluster label, sorted by cluster name
///
/// Nodes without a cluster label are ignored. When several server nodes are
/// present the first one is kept as the cluster's server.
pub fn group_nodes(nodes: Vec<Node>) -> Vec<Cluster> {
    let mut clusters: BTreeMap<String, Cluster> = BTreeMap::new();
    for node in nodes {
        let Some(name) = node.cluster_name().map(|s| s.to_string()) else {
            debug!("Ignoring node '{}' without cluster label", node.name);
            continue;
        };
        let cluster = clusters
            .entry(name.clone())
            .or_insert_with(|| Cluster::new(name));
        match node.role {
            Role::Server if cluster.server.is_none() => cluster.server = Some(node),
            Role::Server => warn!(
                "Cluster '{}' has more than one server, ignoring '{}'",
                cluster.name, node.name
            ),
            Role::Worker => cluster.workers.push(node),
        }
    }
    for cluster in clusters.values_mut() {
        cluster
            .workers
            .sort_by_cached_key(|w| (worker_ordinal(&w.name), w.name.clone()));
    }
    clusters.into_values().collect()
}

/// Numeric suffix of a worker name (`k3d-dev-worker-10` gives 10)
fn worker_ordinal(name: &str) -> Option<u32> {
    name.rsplit_once('-').and_then(|(_, n)| n.parse().ok())
}

// ============================================================================
// I/O boundary functions
// ============================================================================

/// Look up a single cluster; `Ok(None)` if no node carries its label
pub async fn get_cluster(runtime: &dyn Runtime, name: &str) -> Result<Option<Cluster>, RuntimeError> {
    let nodes = runtime
        .get_nodes_by_label(&cluster_selector(name, None))
        .await?;
    Ok(group_nodes(nodes).into_iter().find(|c| c.name == name))
}

/// All clusters managed by k3d
pub async fn get_clusters(runtime: &dyn Runtime) -> Result<Vec<Cluster>, RuntimeError> {
    let mut selector = std::collections::HashMap::new();
    selector.insert(labels::APP.to_string(), labels::APP_VALUE.to_string());
    let nodes = runtime.get_nodes_by_label(&selector).await?;
    Ok(group_nodes(nodes))
}

/// Start the server, then every worker
pub async fn start_cluster(runtime: &dyn Runtime, cluster: &Cluster) -> Result<(), RuntimeError> {
    info!("Starting cluster '{}'", cluster.name);
    for node in cluster.nodes() {
        runtime.start_node(node).await?;
        debug!("Started node '{}'", node.name);
    }
    Ok(())
}

/// Stop every worker, then the server
pub async fn stop_cluster(runtime: &dyn Runtime, cluster: &Cluster) -> Result<(), RuntimeError> {
    info!("Stopping cluster '{}'", cluster.name);
    for node in cluster.workers.iter().chain(cluster.server.iter()) {
        runtime.stop_node(node).await?;
        debug!("Stopped node '{}'", node.name);
    }
    Ok(())
}

/// Force-delete every node of the cluster and its network
///
/// Agent-only clusters never own a network, so a missing network is fine.
pub async fn delete_cluster(runtime: &dyn Runtime, cluster: &Cluster) -> Result<(), RuntimeError> {
    info!("Deleting cluster '{}'", cluster.name);
    for node in cluster.workers.iter().chain(cluster.server.iter()) {
        runtime.delete_node(node).await?;
    }

    let network = cluster.network_name();
    match runtime.delete_network(&network).await {
        Ok(()) => info!("Deleted network '{}'", network),
        Err(RuntimeError::NetworkNotFound(_)) => {
            debug!("Network '{}' not present, nothing to delete", network)
        }
        Err(e) => return Err(e),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::node_labels;

    fn node(name: &str, cluster: &str, role: Role) -> Node {
        let mut node = Node::new(name, role, "img");
        node.labels = node_labels(cluster, role);
        node
    }

    #[test]
    fn test_group_nodes() {
        let nodes = vec![
            node("k3d-b-worker-1", "b", Role::Worker),
            node("k3d-a-server", "a", Role::Server),
            node("k3d-b-worker-0", "b", Role::Worker),
            node("k3d-b-server", "b", Role::Server),
            Node::new("stray", Role::Worker, "img"),
        ];

        let clusters = group_nodes(nodes);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].name, "a");
        assert_eq!(clusters[0].node_count(), 1);

        let b = &clusters[1];
        assert_eq!(b.server.as_ref().unwrap().name, "k3d-b-server");
        let workers: Vec<_> = b.workers.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(workers, vec!["k3d-b-worker-0", "k3d-b-worker-1"]);
    }

    #[test]
    fn test_group_nodes_orders_workers_numerically() {
        let nodes = (0..12)
            .rev()
            .map(|i| node(&format!("k3d-big-worker-{}", i), "big", Role::Worker))
            .collect();

        let clusters = group_nodes(nodes);
        let workers: Vec<_> = clusters[0].workers.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(workers[1], "k3d-big-worker-1");
        assert_eq!(workers[2], "k3d-big-worker-2");
        assert_eq!(workers[10], "k3d-big-worker-10");
        assert_eq!(workers[11], "k3d-big-worker-11");
    }

    #[test]
    fn test_worker_ordinal() {
        assert_eq!(worker_ordinal("k3d-dev-worker-10"), Some(10));
        assert_eq!(worker_ordinal("k3d-dev-server"), None);
    }

    #[test]
    fn test_group_nodes_agent_only_cluster() {
        let clusters = group_nodes(vec![node("k3d-edge-worker-0", "edge", Role::Worker)]);
        assert_eq!(clusters.len(), 1);
        assert!(clusters[0].server.is_none());
    }

    #[test]
    fn test_group_nodes_empty() {
        assert!(group_nodes(Vec::new()).is_empty());
    }
}
