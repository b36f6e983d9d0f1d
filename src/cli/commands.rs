//! Command implementations for the CLI
//!
//! SBIO pattern: Commands return Results, printing is handled by the caller

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ClusterSelection, CreateClusterArgs, GetKubeconfigArgs, LoadImageArgs};
use crate::cluster::kubeconfig::remove_cluster_from_default_kubeconfig;
use crate::cluster::{
    self, get_and_write_kubeconfig, import_images, ImportError, ImportReport, KubeconfigError,
    ProvisionError, ProvisionReport, WriteKubeconfigOptions,
};
use crate::config::{expand_path, ConfigError, Settings};
use crate::ports::{parse_scoped_spec, PortSpecError};
use crate::runtime::{Runtime, RuntimeError};
use crate::types::{validate_cluster_name, ApiPort, Cluster, ClusterSpec, Node, SpecError};

/// Attempts made while waiting for a new server to write its kubeconfig
const KUBECONFIG_WAIT_ATTEMPTS: u32 = 60;
const KUBECONFIG_WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// Errors that can occur during command execution
#[derive(Error, Debug)]
pub enum CommandError {
    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error(transparent)]
    Ports(#[from] PortSpecError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Import(#[from] ImportError),

    #[error(transparent)]
    Kubeconfig(#[from] KubeconfigError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Cluster '{0}' not found")]
    ClusterNotFound(String),

    #[error("Node '{0}' not found")]
    NodeNotFound(String),

    #[error("No cluster selected: give cluster names or --all")]
    NothingSelected,

    #[error("IO error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for commands
pub type CommandResult<T> = Result<T, CommandError>;

// ============================================================================
// Create (pure part)
// ============================================================================

/// Expand `~` in the host side of a `HOST:CONTAINER[:OPTS]` volume
pub fn expand_volume(volume: &str) -> String {
    match volume.split_once(':') {
        Some((host, rest)) => format!("{}:{}", expand_path(host).display(), rest),
        None => volume.to_string(),
    }
}

/// Build a [`ClusterSpec`] from parsed arguments
///
/// `secret` is shared by server and agents so they can join each other.
pub fn build_cluster_spec(args: &CreateClusterArgs, secret: &str) -> CommandResult<ClusterSpec> {
    validate_cluster_name(&args.name)?;

    let mut port_specs: HashMap<String, Vec<String>> = HashMap::new();
    for arg in &args.ports {
        let (scope, spec) = parse_scoped_spec(arg)?;
        port_specs.entry(scope).or_default().push(spec);
    }

    let mut env = args.env.clone();
    env.push(format!("K3S_CLUSTER_SECRET={}", secret));

    Ok(ClusterSpec {
        name: args.name.clone(),
        image: args.image.clone(),
        workers: args.workers,
        server_args: args.server_args.clone(),
        agent_args: args.agent_args.clone(),
        env,
        port_specs,
        port_auto_offset: args.port_auto_offset,
        api_port: ApiPort::parse(&args.api_port)?,
        volumes: args.volumes.iter().map(|v| expand_volume(v)).collect(),
        auto_restart: args.auto_restart,
        verbose: false,
        agent_only: args.agent_only,
        server_url: args.server_url.clone(),
    })
}

// ============================================================================
// Create / get kubeconfig
// ============================================================================

fn kubeconfig_not_ready(err: &KubeconfigError) -> bool {
    matches!(
        err,
        KubeconfigError::Fetch { .. }
            | KubeconfigError::Truncated { .. }
            | KubeconfigError::Parse(_)
            | KubeconfigError::MissingEntry { .. }
    )
}

/// Write the kubeconfig of a freshly created cluster, retrying while the
/// server is still generating it
async fn write_new_kubeconfig(
    runtime: &dyn Runtime,
    settings: &Settings,
    cluster: &str,
    options: WriteKubeconfigOptions,
) -> CommandResult<Option<PathBuf>> {
    let framing = settings.kubeconfig_framing(runtime);
    let mut attempt = 1;
    loop {
        match get_and_write_kubeconfig(runtime, cluster, framing, None, options).await {
            Ok(path) => return Ok(path),
            Err(e) if kubeconfig_not_ready(&e) && attempt < KUBECONFIG_WAIT_ATTEMPTS => {
                debug!("Kubeconfig of '{}' not ready yet ({}), retrying", cluster, e);
                attempt += 1;
                tokio::time::sleep(KUBECONFIG_WAIT_INTERVAL).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Create a cluster and, unless disabled, merge its kubeconfig
pub async fn create_cluster(
    runtime: &dyn Runtime,
    settings: &Settings,
    args: &CreateClusterArgs,
    verbose: bool,
) -> CommandResult<ProvisionReport> {
    let secret = Uuid::new_v4().simple().to_string();
    let mut spec = build_cluster_spec(args, &secret)?;
    spec.verbose = verbose;

    let report = cluster::create_cluster(runtime, &spec, args.on_worker_failure).await?;

    if !args.no_kubeconfig && !spec.agent_only {
        let options = WriteKubeconfigOptions {
            update_existing: true,
            update_current_context: args.switch_context,
            overwrite_existing: false,
        };
        write_new_kubeconfig(runtime, settings, &spec.name, options).await?;
    }
    Ok(report)
}

/// Fetch a cluster's kubeconfig into `--output` or the default kubeconfig
pub async fn get_kubeconfig(
    runtime: &dyn Runtime,
    settings: &Settings,
    args: &GetKubeconfigArgs,
) -> CommandResult<Option<PathBuf>> {
    let options = WriteKubeconfigOptions {
        update_existing: args.update,
        update_current_context: args.switch_context,
        overwrite_existing: args.overwrite,
    };
    let path = get_and_write_kubeconfig(
        runtime,
        &args.name,
        settings.kubeconfig_framing(runtime),
        args.output.as_deref(),
        options,
    )
    .await?;
    Ok(path)
}

// ============================================================================
// Cluster lifecycle
// ============================================================================

/// Resolve a name list or `--all` to clusters
pub async fn select_clusters(
    runtime: &dyn Runtime,
    selection: &ClusterSelection,
) -> CommandResult<Vec<Cluster>> {
    if selection.all {
        return Ok(cluster::get_clusters(runtime).await?);
    }
    if selection.names.is_empty() {
        return Err(CommandError::NothingSelected);
    }
    let mut clusters = Vec::with_capacity(selection.names.len());
    for name in &selection.names {
        let found = cluster::get_cluster(runtime, name)
            .await?
            .ok_or_else(|| CommandError::ClusterNotFound(name.clone()))?;
        clusters.push(found);
    }
    Ok(clusters)
}

async fn remove_cluster_dir(dir: &Path) -> CommandResult<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {
            debug!("Removed '{}'", dir.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(CommandError::Io {
            path: dir.to_path_buf(),
            source,
        }),
    }
}

/// Delete clusters, their kubeconfig entries and working directories
pub async fn delete_clusters(
    runtime: &dyn Runtime,
    settings: &Settings,
    selection: &ClusterSelection,
) -> CommandResult<Vec<String>> {
    let mut deleted = Vec::new();
    for target in select_clusters(runtime, selection).await? {
        cluster::delete_cluster(runtime, &target).await?;

        match remove_cluster_from_default_kubeconfig(&target.name) {
            Ok(true) => info!("Removed cluster '{}' from default kubeconfig", target.name),
            Ok(false) => {}
            Err(e) => warn!(
                "Failed to remove cluster '{}' from default kubeconfig: {}",
                target.name, e
            ),
        }
        remove_cluster_dir(&settings.cluster_dir(&target.name)).await?;
        deleted.push(target.name);
    }
    Ok(deleted)
}

pub async fn start_clusters(
    runtime: &dyn Runtime,
    selection: &ClusterSelection,
) -> CommandResult<Vec<String>> {
    let mut started = Vec::new();
    for target in select_clusters(runtime, selection).await? {
        cluster::start_cluster(runtime, &target).await?;
        started.push(target.name);
    }
    Ok(started)
}

pub async fn stop_clusters(
    runtime: &dyn Runtime,
    selection: &ClusterSelection,
) -> CommandResult<Vec<String>> {
    let mut stopped = Vec::new();
    for target in select_clusters(runtime, selection).await? {
        cluster::stop_cluster(runtime, &target).await?;
        stopped.push(target.name);
    }
    Ok(stopped)
}

async fn find_node(runtime: &dyn Runtime, name: &str) -> CommandResult<Node> {
    runtime
        .get_node(name)
        .await?
        .ok_or_else(|| CommandError::NodeNotFound(name.to_string()))
}

pub async fn start_node(runtime: &dyn Runtime, name: &str) -> CommandResult<()> {
    let node = find_node(runtime, name).await?;
    runtime.start_node(&node).await?;
    Ok(())
}

pub async fn stop_node(runtime: &dyn Runtime, name: &str) -> CommandResult<()> {
    let node = find_node(runtime, name).await?;
    runtime.stop_node(&node).await?;
    Ok(())
}

/// All clusters, or only the named ones
pub async fn list_clusters(runtime: &dyn Runtime, names: &[String]) -> CommandResult<Vec<Cluster>> {
    let clusters = cluster::get_clusters(runtime).await?;
    if names.is_empty() {
        return Ok(clusters);
    }
    if let Some(missing) = names.iter().find(|n| !clusters.iter().any(|c| &c.name == *n)) {
        return Err(CommandError::ClusterNotFound(missing.clone()));
    }
    Ok(clusters
        .into_iter()
        .filter(|c| names.contains(&c.name))
        .collect())
}

// ============================================================================
// Images
// ============================================================================

pub async fn load_images(
    runtime: &dyn Runtime,
    settings: &Settings,
    args: &LoadImageArgs,
) -> CommandResult<ImportReport> {
    let report = import_images(
        runtime,
        &args.cluster,
        &args.images,
        &settings.cluster_dir(&args.cluster),
    )
    .await?;
    Ok(report)
}
