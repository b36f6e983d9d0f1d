//! Kubeconfig fetch, rewrite and merge
//!
//! The admin kubeconfig written by a server node uses `default` for its
//! cluster, user and context entries. Before it reaches the user's file the
//! entries are renamed to `k3d-<cluster>` (cluster, context) and
//! `admin@k3d-<cluster>` (user), so several clusters can live side by side.
//! Writes always go through a temporary sibling file that is renamed over
//! the target.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use crate::config::{default_kubeconfig_path, expand_path, ConfigError};
use crate::runtime::{PayloadFraming, Runtime, RuntimeError};
use crate::types::{
    cluster_selector, labels, Node, Role, DEFAULT_API_HOST, DEFAULT_API_PORT,
    DEFAULT_OBJECT_NAME_PREFIX,
};

/// Output target meaning "write to stdout"
pub const STDOUT_SENTINEL: &str = "-";

/// Entry name k3s uses in the kubeconfig it generates
const K3S_DEFAULT_ENTRY: &str = "default";

/// Kind of a named kubeconfig entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Cluster,
    User,
    Context,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntryKind::Cluster => "cluster",
            EntryKind::User => "user",
            EntryKind::Context => "context",
        })
    }
}

#[derive(Error, Debug)]
pub enum KubeconfigError {
    #[error("No running server node found for cluster '{0}'")]
    NoServerNode(String),

    #[error("Failed to fetch kubeconfig from node '{node}': {source}")]
    Fetch {
        node: String,
        #[source]
        source: RuntimeError,
    },

    #[error("Failed to read kubeconfig from node '{node}': {source}")]
    Read {
        node: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Kubeconfig payload from node '{node}' is {len} bytes, shorter than its {header_len} byte header")]
    Truncated {
        node: String,
        len: usize,
        header_len: usize,
    },

    #[error("Failed to parse kubeconfig: {0}")]
    Parse(String),

    #[error("Failed to serialize kubeconfig: {0}")]
    Serialize(String),

    #[error("Kubeconfig has no {kind} entry named '{name}'")]
    MissingEntry { kind: EntryKind, name: String },

    #[error("Kubeconfig already contains a {kind} named '{name}' (use overwrite to replace it)")]
    NameConflict { kind: EntryKind, name: String },

    #[error("IO error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> KubeconfigError {
    let path = path.to_path_buf();
    move |source| KubeconfigError::Io { path, source }
}

// ============================================================================
// Document model
// ============================================================================

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A kubeconfig file; fields k3d doesn't touch are carried through verbatim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kubeconfig {
    #[serde(rename = "apiVersion", default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub clusters: Vec<NamedCluster>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub users: Vec<NamedAuthInfo>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub contexts: Vec<NamedContext>,
    #[serde(rename = "current-context", default, deserialize_with = "null_as_default")]
    pub current_context: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

fn default_api_version() -> String {
    "v1".to_string()
}

fn default_kind() -> String {
    "Config".to_string()
}

impl Default for Kubeconfig {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            clusters: Vec::new(),
            users: Vec::new(),
            contexts: Vec::new(),
            current_context: String::new(),
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: ClusterInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterInfo {
    #[serde(default)]
    pub server: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedAuthInfo {
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub user: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: ContextInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextInfo {
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub user: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

trait Named {
    const KIND: EntryKind;
    fn name(&self) -> &str;
    fn set_name(&mut self, name: String);
}

impl Named for NamedCluster {
    const KIND: EntryKind = EntryKind::Cluster;
    fn name(&self) -> &str {
        &self.name
    }
    fn set_name(&mut self, name: String) {
        self.name = name;
    }
}

impl Named for NamedAuthInfo {
    const KIND: EntryKind = EntryKind::User;
    fn name(&self) -> &str {
        &self.name
    }
    fn set_name(&mut self, name: String) {
        self.name = name;
    }
}

impl Named for NamedContext {
    const KIND: EntryKind = EntryKind::Context;
    fn name(&self) -> &str {
        &self.name
    }
    fn set_name(&mut self, name: String) {
        self.name = name;
    }
}

fn find_conflict<T: Named>(existing: &[T], incoming: &[T]) -> Option<KubeconfigError> {
    incoming
        .iter()
        .find(|new| existing.iter().any(|old| old.name() == new.name()))
        .map(|new| KubeconfigError::NameConflict {
            kind: T::KIND,
            name: new.name().to_string(),
        })
}

fn upsert<T: Named + Clone>(list: &mut Vec<T>, item: &T) {
    match list.iter_mut().find(|e| e.name() == item.name()) {
        Some(existing) => *existing = item.clone(),
        None => list.push(item.clone()),
    }
}

fn remove_named<T: Named>(list: &mut Vec<T>, name: &str) -> bool {
    let before = list.len();
    list.retain(|e| e.name() != name);
    list.len() != before
}

fn rename_entry<T: Named>(list: &mut [T], from: &str, to: &str) -> Result<(), KubeconfigError> {
    let entry = list
        .iter_mut()
        .find(|e| e.name() == from)
        .ok_or_else(|| KubeconfigError::MissingEntry {
            kind: T::KIND,
            name: from.to_string(),
        })?;
    entry.set_name(to.to_string());
    Ok(())
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Cluster and context entry name: `k3d-<cluster>`
pub fn cluster_entry_name(cluster: &str) -> String {
    format!("{}-{}", DEFAULT_OBJECT_NAME_PREFIX, cluster)
}

/// User entry name: `admin@k3d-<cluster>`
pub fn user_entry_name(cluster: &str) -> String {
    format!("admin@{}", cluster_entry_name(cluster))
}

pub fn parse_kubeconfig(content: &[u8]) -> Result<Kubeconfig, KubeconfigError> {
    if content.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(Kubeconfig::default());
    }
    serde_yaml::from_slice(content).map_err(|e| KubeconfigError::Parse(e.to_string()))
}

pub fn serialize_kubeconfig(kubeconfig: &Kubeconfig) -> Result<String, KubeconfigError> {
    serde_yaml::to_string(kubeconfig).map_err(|e| KubeconfigError::Serialize(e.to_string()))
}

/// Rename the k3s `default` entries to cluster-qualified names, point the
/// server URL at `api_host:api_port` and make the new context current
pub fn rewrite_kubeconfig(
    mut kubeconfig: Kubeconfig,
    cluster: &str,
    api_host: &str,
    api_port: &str,
) -> Result<Kubeconfig, KubeconfigError> {
    let cluster_name = cluster_entry_name(cluster);
    let user_name = user_entry_name(cluster);

    rename_entry(&mut kubeconfig.clusters, K3S_DEFAULT_ENTRY, &cluster_name)?;
    rename_entry(&mut kubeconfig.users, K3S_DEFAULT_ENTRY, &user_name)?;
    rename_entry(&mut kubeconfig.contexts, K3S_DEFAULT_ENTRY, &cluster_name)?;

    for entry in kubeconfig.clusters.iter_mut().filter(|c| c.name == cluster_name) {
        entry.cluster.server = format!("https://{}:{}", api_host, api_port);
    }
    for entry in kubeconfig.contexts.iter_mut().filter(|c| c.name == cluster_name) {
        entry.context.cluster = cluster_name.clone();
        entry.context.user = user_name.clone();
    }
    kubeconfig.current_context = cluster_name;
    Ok(kubeconfig)
}

/// Merge `new` into `existing`
///
/// Without `overwrite_conflicting` any entry name already present in
/// `existing` fails the whole merge before anything is changed. The current
/// context moves to `new`'s only if `existing` had none or
/// `update_current_context` is set.
pub fn merge_kubeconfig(
    new: &Kubeconfig,
    existing: &mut Kubeconfig,
    overwrite_conflicting: bool,
    update_current_context: bool,
) -> Result<(), KubeconfigError> {
    if !overwrite_conflicting {
        let conflict = find_conflict(&existing.clusters, &new.clusters)
            .or_else(|| find_conflict(&existing.users, &new.users))
            .or_else(|| find_conflict(&existing.contexts, &new.contexts));
        if let Some(err) = conflict {
            return Err(err);
        }
    }

    for cluster in &new.clusters {
        upsert(&mut existing.clusters, cluster);
    }
    for user in &new.users {
        upsert(&mut existing.users, user);
    }
    for context in &new.contexts {
        upsert(&mut existing.contexts, context);
    }

    if existing.current_context.is_empty() || update_current_context {
        existing.current_context = new.current_context.clone();
    }
    Ok(())
}

/// Drop the entries of `cluster`; returns whether anything was removed
///
/// If the current context pointed at the removed context it moves to the
/// first remaining context, or is cleared when none are left.
pub fn remove_cluster_from_kubeconfig(kubeconfig: &mut Kubeconfig, cluster: &str) -> bool {
    let entry_name = cluster_entry_name(cluster);
    let removed_cluster = remove_named(&mut kubeconfig.clusters, &entry_name);
    let removed_user = remove_named(&mut kubeconfig.users, &user_entry_name(cluster));
    let removed_context = remove_named(&mut kubeconfig.contexts, &entry_name);

    if kubeconfig.current_context == entry_name {
        kubeconfig.current_context = kubeconfig
            .contexts
            .first()
            .map(|c| c.name.clone())
            .unwrap_or_default();
    }
    removed_cluster || removed_user || removed_context
}

/// API host and port a server node advertises through its labels
fn advertised_api(node: &Node) -> (String, String) {
    let host = node
        .labels
        .get(labels::API_HOST)
        .cloned()
        .unwrap_or_else(|| DEFAULT_API_HOST.to_string());
    let port = node
        .labels
        .get(labels::API_PORT)
        .cloned()
        .unwrap_or_else(|| DEFAULT_API_PORT.to_string());
    (host, port)
}

/// Running server to read from, preferring one that advertises its API port
pub fn choose_server(servers: &[Node]) -> Option<&Node> {
    let running = || servers.iter().filter(|n| n.running);
    running()
        .find(|n| n.labels.contains_key(labels::API_PORT))
        .or_else(|| running().next())
}

// ============================================================================
// I/O boundary functions
// ============================================================================

/// Fetch the admin kubeconfig of `cluster` and rewrite it for local use
pub async fn get_kubeconfig(
    runtime: &dyn Runtime,
    cluster: &str,
    framing: PayloadFraming,
) -> Result<Kubeconfig, KubeconfigError> {
    let servers = runtime
        .get_nodes_by_label(&cluster_selector(cluster, Some(Role::Server)))
        .await?;
    let server =
        choose_server(&servers).ok_or_else(|| KubeconfigError::NoServerNode(cluster.to_string()))?;
    let (api_host, api_port) = advertised_api(server);
    debug!("Reading kubeconfig from server node '{}'", server.name);

    let mut stream = runtime
        .get_kubeconfig(server)
        .await
        .map_err(|source| KubeconfigError::Fetch {
            node: server.name.clone(),
            source,
        })?;
    let mut raw = Vec::new();
    stream
        .read_to_end(&mut raw)
        .await
        .map_err(|source| KubeconfigError::Read {
            node: server.name.clone(),
            source,
        })?;

    let body = framing
        .extract(&raw)
        .ok_or_else(|| KubeconfigError::Truncated {
            node: server.name.clone(),
            len: raw.len(),
            header_len: framing.header_len,
        })?;
    rewrite_kubeconfig(parse_kubeconfig(body)?, cluster, &api_host, &api_port)
}

fn temp_path_for(target: &Path) -> PathBuf {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "kubeconfig".to_string());
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.{}.{}.tmp", file_name, std::process::id(), nanos))
}

/// Write `contents` completely to a temporary sibling of `target`
pub fn write_temp_file(target: &Path, contents: &str) -> Result<PathBuf, KubeconfigError> {
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    let temp = temp_path_for(target);

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&temp).map_err(io_error(&temp))?;
    file.write_all(contents.as_bytes()).map_err(io_error(&temp))?;
    file.sync_all().map_err(io_error(&temp))?;
    Ok(temp)
}

/// Move a completed temporary file over `target`
pub fn commit(temp: &Path, target: &Path) -> Result<(), KubeconfigError> {
    if let Err(source) = std::fs::rename(temp, target) {
        std::fs::remove_file(temp).ok();
        return Err(KubeconfigError::Io {
            path: target.to_path_buf(),
            source,
        });
    }
    Ok(())
}

/// Atomically replace `path` with `kubeconfig`
pub fn write_kubeconfig(kubeconfig: &Kubeconfig, path: &Path) -> Result<(), KubeconfigError> {
    let contents = serialize_kubeconfig(kubeconfig)?;
    let temp = write_temp_file(path, &contents)?;
    commit(&temp, path)?;
    debug!("Wrote kubeconfig '{}'", path.display());
    Ok(())
}

/// Write to `output`, where `-` means stdout
pub fn write_kubeconfig_to_path(kubeconfig: &Kubeconfig, output: &str) -> Result<(), KubeconfigError> {
    if output == STDOUT_SENTINEL {
        print!("{}", serialize_kubeconfig(kubeconfig)?);
        return Ok(());
    }
    write_kubeconfig(kubeconfig, &expand_path(output))
}

/// Load a kubeconfig, creating an empty one on first use
pub fn load_or_create(path: &Path) -> Result<Kubeconfig, KubeconfigError> {
    match std::fs::read(path) {
        Ok(content) => parse_kubeconfig(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("Creating kubeconfig '{}'", path.display());
            let empty = Kubeconfig::default();
            write_kubeconfig(&empty, path)?;
            Ok(empty)
        }
        Err(source) => Err(KubeconfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// How [`get_and_write_kubeconfig`] treats an existing target file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteKubeconfigOptions {
    /// Replace same-named entries instead of failing with `NameConflict`
    pub update_existing: bool,
    /// Switch current-context to the new cluster
    pub update_current_context: bool,
    /// Replace the whole file instead of merging
    pub overwrite_existing: bool,
}

/// Fetch the cluster's kubeconfig and write or merge it into `output`
/// (default kubeconfig when `None`). Returns the path written, `None` for stdout.
pub async fn get_and_write_kubeconfig(
    runtime: &dyn Runtime,
    cluster: &str,
    framing: PayloadFraming,
    output: Option<&str>,
    options: WriteKubeconfigOptions,
) -> Result<Option<PathBuf>, KubeconfigError> {
    let kubeconfig = get_kubeconfig(runtime, cluster, framing).await?;

    let path = match output {
        Some(STDOUT_SENTINEL) => {
            write_kubeconfig_to_path(&kubeconfig, STDOUT_SENTINEL)?;
            return Ok(None);
        }
        Some(path) => expand_path(path),
        None => default_kubeconfig_path()?,
    };

    if options.overwrite_existing {
        write_kubeconfig(&kubeconfig, &path)?;
    } else {
        let mut existing = load_or_create(&path)?;
        merge_kubeconfig(
            &kubeconfig,
            &mut existing,
            options.update_existing,
            options.update_current_context,
        )?;
        write_kubeconfig(&existing, &path)?;
    }
    info!("Wrote kubeconfig for cluster '{}' to '{}'", cluster, path.display());
    Ok(Some(path))
}

/// Remove the cluster's entries from the kubeconfig at `path`, if any
pub fn remove_cluster_from_kubeconfig_file(path: &Path, cluster: &str) -> Result<bool, KubeconfigError> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(source) => {
            return Err(KubeconfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let mut kubeconfig = parse_kubeconfig(&content)?;
    if !remove_cluster_from_kubeconfig(&mut kubeconfig, cluster) {
        return Ok(false);
    }
    write_kubeconfig(&kubeconfig, path)?;
    Ok(true)
}

pub fn remove_cluster_from_default_kubeconfig(cluster: &str) -> Result<bool, KubeconfigError> {
    remove_cluster_from_kubeconfig_file(&default_kubeconfig_path()?, cluster)
}
