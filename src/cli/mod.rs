//! CLI module for k3d
//!
//! Provides kubectl-like subcommands:
//! - `k3d create cluster` - Create a server and workers on a shared network
//! - `k3d delete cluster` - Delete clusters and their kubeconfig entries
//! - `k3d start`/`stop` - Start or stop clusters and single nodes
//! - `k3d get` - List clusters or fetch a cluster's kubeconfig
//! - `k3d load image` - Import local images into every node of a cluster

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use crate::cluster::WorkerFailurePolicy;
use crate::runtime::RuntimeKind;
use crate::types::{DEFAULT_API_PORT, DEFAULT_IMAGE};

mod commands;
mod display;

pub use commands::*;
pub use display::*;

/// Cluster name used when none is given
pub const DEFAULT_CLUSTER_NAME: &str = "k3s-default";

#[derive(Parser, Debug)]
#[command(name = "k3d")]
#[command(about = "Run k3s clusters in containers")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (--verbose, --verbose --verbose)
    #[arg(long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Container runtime backend (default: from settings, else docker)
    #[arg(short, long, value_enum, global = true)]
    pub runtime: Option<RuntimeKind>,

    /// Path to settings file (default: ~/.config/k3d/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a resource
    Create(CreateArgs),

    /// Delete a resource
    Delete(DeleteArgs),

    /// Start a stopped resource
    Start(StartArgs),

    /// Stop a running resource
    Stop(StopArgs),

    /// Get/list resources
    Get(GetArgs),

    /// Load resources into a cluster
    Load(LoadArgs),
}

#[derive(Parser, Debug)]
pub struct CreateArgs {
    #[command(subcommand)]
    pub resource: CreateResource,
}

#[derive(Subcommand, Debug)]
pub enum CreateResource {
    /// Create a cluster
    #[command(name = "cluster", visible_alias = "c")]
    Cluster(CreateClusterArgs),
}

/// Arguments for `create cluster`
#[derive(Parser, Debug, Clone)]
pub struct CreateClusterArgs {
    /// Cluster name
    #[arg(default_value = DEFAULT_CLUSTER_NAME)]
    pub name: String,

    /// Node image
    #[arg(short, long, default_value = DEFAULT_IMAGE)]
    pub image: String,

    /// Number of worker nodes
    #[arg(short, long, default_value = "0")]
    pub workers: usize,

    /// Kubernetes API port, `[HOST:]PORT`
    #[arg(short, long, default_value_t = DEFAULT_API_PORT.to_string())]
    pub api_port: String,

    /// Publish ports, `[IP:][HOSTPORT:]PORT[/PROTO][@SCOPE]` with scope
    /// `all` (default), `server`, `worker` or a node name
    #[arg(short, long = "port", value_name = "SPEC")]
    pub ports: Vec<String>,

    /// Base offset added to worker host ports (worker N gets base + N)
    #[arg(long, default_value = "0")]
    pub port_auto_offset: u16,

    /// Bind mounts, `HOST:CONTAINER[:OPTS]`
    #[arg(short = 'v', long = "volume")]
    pub volumes: Vec<String>,

    /// Environment variables, `KEY=VALUE`
    #[arg(short, long = "env")]
    pub env: Vec<String>,

    /// Extra arguments for the k3s server
    #[arg(long = "server-arg", allow_hyphen_values = true)]
    pub server_args: Vec<String>,

    /// Extra arguments for the k3s agents
    #[arg(long = "agent-arg", allow_hyphen_values = true)]
    pub agent_args: Vec<String>,

    /// Restart nodes automatically unless stopped explicitly
    #[arg(long)]
    pub auto_restart: bool,

    /// Only create workers, joining the server at --server-url
    #[arg(long, requires = "server_url")]
    pub agent_only: bool,

    /// URL of an existing server, e.g. `https://k3d-main-server:6443`
    #[arg(long)]
    pub server_url: Option<String>,

    /// What to do when a worker fails to start
    #[arg(long, value_enum, default_value = "abort")]
    pub on_worker_failure: WorkerFailurePolicy,

    /// Don't write the cluster's kubeconfig
    #[arg(long)]
    pub no_kubeconfig: bool,

    /// Make the new cluster the current kubeconfig context
    #[arg(long)]
    pub switch_context: bool,
}

/// Selects clusters by name or all of them
#[derive(Parser, Debug, Clone)]
pub struct ClusterSelection {
    /// Cluster names
    pub names: Vec<String>,

    /// Select every cluster
    #[arg(short, long, conflicts_with = "names")]
    pub all: bool,
}

#[derive(Parser, Debug)]
pub struct DeleteArgs {
    #[command(subcommand)]
    pub resource: DeleteResource,
}

#[derive(Subcommand, Debug)]
pub enum DeleteResource {
    /// Delete clusters
    #[command(name = "cluster", visible_alias = "c")]
    Cluster(ClusterSelection),
}

#[derive(Parser, Debug)]
pub struct StartArgs {
    #[command(subcommand)]
    pub resource: LifecycleResource,
}

#[derive(Parser, Debug)]
pub struct StopArgs {
    #[command(subcommand)]
    pub resource: LifecycleResource,
}

#[derive(Subcommand, Debug)]
pub enum LifecycleResource {
    /// Clusters (server before workers on start, workers first on stop)
    #[command(name = "cluster", visible_alias = "c")]
    Cluster(ClusterSelection),

    /// A single node
    #[command(name = "node", visible_alias = "no")]
    Node {
        /// Node name
        name: String,
    },
}

#[derive(Parser, Debug)]
pub struct GetArgs {
    /// Resource type to get
    #[command(subcommand)]
    pub resource: GetResource,
}

#[derive(Subcommand, Debug)]
pub enum GetResource {
    /// List clusters
    #[command(name = "clusters", visible_alias = "cluster", visible_alias = "c")]
    Clusters {
        /// Only show these clusters
        names: Vec<String>,
    },

    /// Fetch a cluster's kubeconfig
    #[command(name = "kubeconfig", visible_alias = "kc")]
    Kubeconfig(GetKubeconfigArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct GetKubeconfigArgs {
    /// Cluster name
    #[arg(default_value = DEFAULT_CLUSTER_NAME)]
    pub name: String,

    /// Output file, `-` for stdout (default: $KUBECONFIG or ~/.kube/config)
    #[arg(short, long)]
    pub output: Option<String>,

    /// Replace the whole output file instead of merging into it
    #[arg(long)]
    pub overwrite: bool,

    /// Replace existing entries with the same names
    #[arg(short, long)]
    pub update: bool,

    /// Make the cluster the current context
    #[arg(short, long)]
    pub switch_context: bool,
}

#[derive(Parser, Debug)]
pub struct LoadArgs {
    #[command(subcommand)]
    pub resource: LoadResource,
}

#[derive(Subcommand, Debug)]
pub enum LoadResource {
    /// Import local images into every node of a cluster
    #[command(name = "image", visible_alias = "images")]
    Image(LoadImageArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct LoadImageArgs {
    /// Images to import
    #[arg(required = true)]
    pub images: Vec<String>,

    /// Target cluster
    #[arg(short, long, default_value = DEFAULT_CLUSTER_NAME)]
    pub cluster: String,
}
