//! Docker backend
//!
//! Drives the `docker` CLI through `tokio::process`. Argument generation and
//! output parsing are pure functions; [`DockerRuntime`] only spawns the
//! commands and maps failures onto [`RuntimeError`].

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::path::Path;
use std::process::Output;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use super::{ByteStream, PayloadFraming, Runtime, RuntimeError};
use crate::ports::create_published_ports;
use crate::types::{labels, Node, Role, KUBECONFIG_OUTPUT_PATH};

/// Default docker socket
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/docker.sock";

/// Restart policy applied when a node asks to be restarted automatically
pub const RESTART_POLICY: &str = "unless-stopped";

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Generate `docker create` arguments for a node
///
/// Image pulls are disabled so that a missing image surfaces as
/// `ImageNotFound` and the caller owns the pull-and-retry policy.
pub fn generate_create_args(node: &Node) -> Result<Vec<String>, RuntimeError> {
    let published = create_published_ports(&node.ports).map_err(|e| RuntimeError::InvalidNode {
        node: node.name.clone(),
        reason: e.to_string(),
    })?;

    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        node.name.clone(),
        "--hostname".to_string(),
        node.name.clone(),
        "--pull".to_string(),
        "never".to_string(),
        "--privileged".to_string(),
    ];

    // Sorted for stable output
    let sorted: BTreeMap<_, _> = node.labels.iter().collect();
    for (key, value) in sorted {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }

    for env in &node.env {
        args.push("-e".to_string());
        args.push(env.clone());
    }

    for mount in node.role.tmpfs_mounts() {
        args.push("--tmpfs".to_string());
        args.push(mount.to_string());
    }

    if node.restart {
        args.push("--restart".to_string());
        args.push(RESTART_POLICY.to_string());
    }

    for volume in &node.volumes {
        args.push("-v".to_string());
        args.push(volume.clone());
    }

    for spec in published.to_specs() {
        args.push("-p".to_string());
        args.push(spec);
    }

    if !node.network.is_empty() {
        args.push("--network".to_string());
        args.push(node.network.clone());
        for alias in &node.network_aliases {
            args.push("--network-alias".to_string());
            args.push(alias.clone());
        }
    }

    args.push(node.image.clone());
    args.extend(node.command());

    Ok(args)
}

/// Generate `docker ps` arguments listing container IDs matching all labels
pub fn generate_list_args(labels: &HashMap<String, String>) -> Vec<String> {
    let mut args = vec![
        "ps".to_string(),
        "-a".to_string(),
        "-q".to_string(),
        "--no-trunc".to_string(),
    ];
    let sorted: BTreeMap<_, _> = labels.iter().collect();
    for (key, value) in sorted {
        args.push("--filter".to_string());
        args.push(format!("label={}={}", key, value));
    }
    args
}

/// Generate `docker rm` arguments: forced, anonymous volumes included
pub fn generate_rm_args(name: &str) -> Vec<String> {
    vec![
        "rm".to_string(),
        "-f".to_string(),
        "-v".to_string(),
        name.to_string(),
    ]
}

/// Generate `docker exec` arguments
pub fn generate_exec_args(name: &str, cmd: &[String]) -> Vec<String> {
    let mut args = vec!["exec".to_string(), name.to_string()];
    args.extend(cmd.iter().cloned());
    args
}

/// Generate `docker save` arguments
pub fn generate_save_args(images: &[String], dest: &Path) -> Vec<String> {
    let mut args = vec![
        "save".to_string(),
        "-o".to_string(),
        dest.to_string_lossy().to_string(),
    ];
    args.extend(images.iter().cloned());
    args
}

fn is_missing_image(stderr: &str) -> bool {
    stderr.contains("No such image") || stderr.contains("Unable to find image")
}

fn is_daemon_unreachable(stderr: &str) -> bool {
    stderr.contains("Cannot connect to the Docker daemon") || stderr.contains("error during connect")
}

fn is_missing_container(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("No such object")
}

/// Matches `No such network` and `network <name> not found`
fn is_missing_network(stderr: &str) -> bool {
    stderr.contains("No such network")
        || stderr
            .lines()
            .any(|l| l.contains("network ") && l.trim_end().ends_with("not found"))
}

/// Turn a failed docker invocation into a typed error
fn classify_failure(operation: &'static str, target: &str, stderr: &str) -> RuntimeError {
    if is_daemon_unreachable(stderr) {
        return RuntimeError::BackendUnavailable {
            runtime: "docker".to_string(),
            reason: stderr.to_string(),
        };
    }
    RuntimeError::failed(operation, target, stderr)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectContainer {
    name: String,
    config: InspectConfig,
    #[serde(default)]
    state: InspectState,
    #[serde(default)]
    host_config: InspectHostConfig,
    #[serde(default)]
    network_settings: InspectNetworkSettings,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    image: String,
    #[serde(default)]
    env: Option<Vec<String>>,
    #[serde(default)]
    cmd: Option<Vec<String>>,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    running: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHostConfig {
    #[serde(default)]
    binds: Option<Vec<String>>,
    #[serde(default)]
    restart_policy: Option<InspectRestartPolicy>,
    #[serde(default)]
    port_bindings: Option<BTreeMap<String, Option<Vec<InspectPortBinding>>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectRestartPolicy {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectPortBinding {
    #[serde(default)]
    host_ip: String,
    #[serde(default)]
    host_port: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetworkSettings {
    #[serde(default)]
    networks: Option<BTreeMap<String, InspectEndpoint>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEndpoint {
    #[serde(default)]
    aliases: Option<Vec<String>>,
}

/// Translate `docker inspect` output into nodes
pub fn parse_inspect(json: &str) -> Result<Vec<Node>, RuntimeError> {
    let containers: Vec<InspectContainer> =
        serde_json::from_str(json).map_err(|e| RuntimeError::Parse {
            target: "docker inspect".to_string(),
            reason: e.to_string(),
        })?;
    Ok(containers.into_iter().map(container_to_node).collect())
}

fn container_to_node(container: InspectContainer) -> Node {
    let node_labels = container.config.labels.unwrap_or_default();
    let role = node_labels
        .get(labels::ROLE)
        .or_else(|| node_labels.get(labels::COMPONENT))
        .and_then(|r| r.parse::<Role>().ok())
        .unwrap_or(Role::Worker);

    // First element of the command is the role's default command
    let mut args = container.config.cmd.unwrap_or_default();
    if args.first().map(|c| c.as_str()) == Some(role.default_cmd()) {
        args.remove(0);
    }

    let mut ports = Vec::new();
    for (container_port, bindings) in container.host_config.port_bindings.unwrap_or_default() {
        for binding in bindings.unwrap_or_default() {
            let host_ip = if binding.host_ip.is_empty() {
                crate::ports::WILDCARD_HOST_IP.to_string()
            } else {
                binding.host_ip
            };
            ports.push(format!("{}:{}:{}", host_ip, binding.host_port, container_port));
        }
    }

    let networks = container.network_settings.networks.unwrap_or_default();
    let (network, network_aliases) = networks
        .into_iter()
        .next()
        .map(|(name, endpoint)| (name, endpoint.aliases.unwrap_or_default()))
        .unwrap_or_default();

    Node {
        name: container.name.trim_start_matches('/').to_string(),
        role,
        image: container.config.image,
        args,
        env: container.config.env.unwrap_or_default(),
        labels: node_labels,
        volumes: container.host_config.binds.unwrap_or_default(),
        network,
        network_aliases,
        ports,
        restart: container
            .host_config
            .restart_policy
            .is_some_and(|p| p.name == RESTART_POLICY),
        running: container.state.running,
    }
}

// ============================================================================
// I/O boundary
// ============================================================================

/// Docker backend using the docker CLI
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    binary: String,
}

impl DockerRuntime {
    pub fn new() -> Self {
        Self::with_binary("docker")
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run a docker command; only spawn failures are errors here
    async fn docker(&self, args: &[String]) -> Result<Output, RuntimeError> {
        debug!("Running {} {:?}", self.binary, args);
        Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| RuntimeError::BackendUnavailable {
                runtime: "docker".to_string(),
                reason: format!("failed to run '{}': {}", self.binary, e),
            })
    }

    /// Run a docker command that must succeed, returning stdout
    async fn docker_ok(
        &self,
        args: &[String],
        operation: &'static str,
        target: &str,
    ) -> Result<Vec<u8>, RuntimeError> {
        let output = self.docker(args).await?;
        if output.status.success() {
            return Ok(output.stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify_failure(operation, target, &stderr))
    }

    /// Like `docker_ok`, but maps "no such container" onto `NodeNotFound`
    async fn docker_node(
        &self,
        args: &[String],
        operation: &'static str,
        node: &str,
    ) -> Result<Vec<u8>, RuntimeError> {
        match self.docker_ok(args, operation, node).await {
            Err(RuntimeError::OperationFailed { reason, .. }) if is_missing_container(&reason) => {
                Err(RuntimeError::NodeNotFound(node.to_string()))
            }
            other => other,
        }
    }

    async fn inspect(&self, ids: &[String]) -> Result<Vec<Node>, RuntimeError> {
        let mut args = vec![
            "inspect".to_string(),
            "--type".to_string(),
            "container".to_string(),
        ];
        args.extend(ids.iter().cloned());
        let stdout = self.docker_ok(&args, "inspect", &ids.join(",")).await?;
        parse_inspect(&String::from_utf8_lossy(&stdout))
    }

    async fn find_network(&self, name: &str) -> Result<Option<String>, RuntimeError> {
        let args = vec![
            "network".to_string(),
            "ls".to_string(),
            "--filter".to_string(),
            format!("name=^{}$", name),
            "--format".to_string(),
            "{{.ID}}".to_string(),
        ];
        let stdout = self.docker_ok(&args, "list network", name).await?;
        Ok(String::from_utf8_lossy(&stdout)
            .lines()
            .map(|l| l.trim())
            .find(|l| !l.is_empty())
            .map(|l| l.to_string()))
    }
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

fn combined_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut text = String::from_utf8_lossy(stdout).to_string();
    text.push_str(&String::from_utf8_lossy(stderr));
    text
}

#[async_trait]
impl Runtime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create_node(&self, node: &Node) -> Result<(), RuntimeError> {
        let args = generate_create_args(node)?;
        let output = self.docker(&args).await?;
        if output.status.success() {
            debug!("Created container '{}'", node.name);
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if is_missing_image(&stderr) {
            return Err(RuntimeError::ImageNotFound(node.image.clone()));
        }
        Err(classify_failure("create node", &node.name, &stderr))
    }

    async fn delete_node(&self, node: &Node) -> Result<(), RuntimeError> {
        self.docker_node(&generate_rm_args(&node.name), "delete node", &node.name)
            .await?;
        info!("Deleted node '{}'", node.name);
        Ok(())
    }

    async fn get_nodes_by_label(
        &self,
        labels: &HashMap<String, String>,
    ) -> Result<Vec<Node>, RuntimeError> {
        let stdout = self
            .docker_ok(&generate_list_args(labels), "list nodes", "containers")
            .await?;
        let ids: Vec<String> = String::from_utf8_lossy(&stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.inspect(&ids).await
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>, RuntimeError> {
        match self.inspect(&[name.to_string()]).await {
            Ok(nodes) => Ok(nodes.into_iter().next()),
            Err(RuntimeError::OperationFailed { reason, .. }) if is_missing_container(&reason) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn create_network_if_not_present(
        &self,
        name: &str,
    ) -> Result<(String, bool), RuntimeError> {
        if let Some(id) = self.find_network(name).await? {
            debug!("Network '{}' already exists", name);
            return Ok((id, true));
        }

        let args = vec![
            "network".to_string(),
            "create".to_string(),
            "--label".to_string(),
            format!("{}={}", labels::APP, labels::APP_VALUE),
            name.to_string(),
        ];
        match self.docker_ok(&args, "create network", name).await {
            Ok(stdout) => {
                info!("Created network '{}'", name);
                Ok((String::from_utf8_lossy(&stdout).trim().to_string(), false))
            }
            // Lost a creation race against a concurrent caller
            Err(RuntimeError::OperationFailed { reason, .. }) if reason.contains("already exists") => {
                let id = self
                    .find_network(name)
                    .await?
                    .ok_or_else(|| RuntimeError::NetworkNotFound(name.to_string()))?;
                Ok((id, true))
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_network(&self, id: &str) -> Result<(), RuntimeError> {
        let args = vec!["network".to_string(), "rm".to_string(), id.to_string()];
        match self.docker_ok(&args, "delete network", id).await {
            Err(RuntimeError::OperationFailed { reason, .. }) if is_missing_network(&reason) => {
                Err(RuntimeError::NetworkNotFound(id.to_string()))
            }
            other => other.map(|_| ()),
        }
    }

    async fn start_node(&self, node: &Node) -> Result<(), RuntimeError> {
        let args = vec!["start".to_string(), node.name.clone()];
        self.docker_node(&args, "start node", &node.name).await?;
        Ok(())
    }

    async fn stop_node(&self, node: &Node) -> Result<(), RuntimeError> {
        let args = vec!["stop".to_string(), node.name.clone()];
        self.docker_node(&args, "stop node", &node.name).await?;
        Ok(())
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), RuntimeError> {
        let mut args = vec!["volume".to_string(), "create".to_string()];
        let sorted: BTreeMap<_, _> = labels.iter().collect();
        for (key, value) in sorted {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(name.to_string());
        self.docker_ok(&args, "create volume", name).await?;
        Ok(())
    }

    async fn delete_volume(&self, name: &str) -> Result<(), RuntimeError> {
        let args = vec!["volume".to_string(), "rm".to_string(), name.to_string()];
        self.docker_ok(&args, "delete volume", name).await?;
        Ok(())
    }

    fn runtime_path(&self) -> String {
        std::env::var("DOCKER_HOST")
            .ok()
            .and_then(|host| host.strip_prefix("unix://").map(|p| p.to_string()))
            .unwrap_or_else(|| DEFAULT_SOCKET_PATH.to_string())
    }

    async fn exec_in_node(&self, node: &Node, cmd: &[String]) -> Result<String, RuntimeError> {
        let output = self.docker(&generate_exec_args(&node.name, cmd)).await?;
        let text = combined_output(&output.stdout, &output.stderr);
        if !output.status.success() {
            return Err(classify_failure("exec in node", &node.name, text.trim()));
        }
        Ok(text)
    }

    async fn get_node_logs(&self, node: &Node) -> Result<ByteStream, RuntimeError> {
        let args = vec!["logs".to_string(), node.name.clone()];
        let output = self.docker(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if is_missing_container(&stderr) {
                return Err(RuntimeError::NodeNotFound(node.name.clone()));
            }
            return Err(classify_failure("get logs of", &node.name, &stderr));
        }
        let logs = combined_output(&output.stdout, &output.stderr).into_bytes();
        Ok(Box::pin(Cursor::new(logs)))
    }

    async fn get_kubeconfig(&self, node: &Node) -> Result<ByteStream, RuntimeError> {
        // `docker cp` to stdout streams a tar archive
        let args = vec![
            "cp".to_string(),
            format!("{}:{}", node.name, KUBECONFIG_OUTPUT_PATH),
            "-".to_string(),
        ];
        let archive = self.docker_node(&args, "get kubeconfig from", &node.name).await?;
        Ok(Box::pin(Cursor::new(archive)))
    }

    fn kubeconfig_framing(&self) -> PayloadFraming {
        PayloadFraming::tar()
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        info!("Pulling image '{}'", image);
        let args = vec!["pull".to_string(), image.to_string()];
        self.docker_ok(&args, "pull image", image).await?;
        Ok(())
    }

    async fn save_images(&self, images: &[String], dest: &Path) -> Result<(), RuntimeError> {
        self.docker_ok(
            &generate_save_args(images, dest),
            "save images",
            &images.join(","),
        )
        .await?;
        Ok(())
    }

    async fn copy_to_node(&self, node: &Node, src: &Path, dest: &str) -> Result<(), RuntimeError> {
        if let Some((dir, _)) = dest.rsplit_once('/') {
            if !dir.is_empty() {
                let mkdir = vec!["mkdir".to_string(), "-p".to_string(), dir.to_string()];
                self.exec_in_node(node, &mkdir).await?;
            }
        }
        let args = vec![
            "cp".to_string(),
            src.to_string_lossy().to_string(),
            format!("{}:{}", node.name, dest),
        ];
        self.docker_node(&args, "copy into", &node.name).await?;
        Ok(())
    }
}
