//! In-memory container runtime for integration tests
//!
//! Keeps nodes and networks in a map, records every call in order and lets
//! tests inject failures per node.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use k3d::runtime::{ByteStream, PayloadFraming, Runtime, RuntimeError};
use k3d::types::{node_labels, Node, Role};

/// Output `ctr image import` prints on success
pub const IMPORT_OK_OUTPUT: &str = "unpacking docker.io/library/nginx:latest (sha256:abc)...done";

#[derive(Default)]
struct FakeState {
    nodes: BTreeMap<String, Node>,
    networks: BTreeMap<String, String>,
    local_images: HashSet<String>,
    calls: Vec<String>,
    fail_create: HashSet<String>,
    fail_copy: HashSet<String>,
    fail_pull: bool,
    save_as_directory: bool,
    exec_outputs: HashMap<String, String>,
    kubeconfig: Vec<u8>,
    framing: Option<PayloadFraming>,
    /// Archives seen by `copy_to_node` and whether they existed at that time
    copied: Vec<(String, PathBuf, String, bool)>,
}

pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    /// A runtime with `images` already present locally
    pub fn with_images(images: &[&str]) -> Self {
        let state = FakeState {
            local_images: images.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn record(&self, call: String) {
        self.state().calls.push(call);
    }

    pub fn fail_create(&self, node: &str) {
        self.state().fail_create.insert(node.to_string());
    }

    pub fn fail_copy(&self, node: &str) {
        self.state().fail_copy.insert(node.to_string());
    }

    pub fn fail_pull(&self) {
        self.state().fail_pull = true;
    }

    /// Make `save_images` leave a directory behind, which plain file removal rejects
    pub fn save_as_directory(&self) {
        self.state().save_as_directory = true;
    }

    pub fn set_exec_output(&self, node: &str, output: &str) {
        self.state()
            .exec_outputs
            .insert(node.to_string(), output.to_string());
    }

    pub fn set_kubeconfig(&self, payload: Vec<u8>, framing: PayloadFraming) {
        let mut state = self.state();
        state.kubeconfig = payload;
        state.framing = Some(framing);
    }

    /// Register a running node that was not created through this runtime
    pub fn insert_node(&self, node: Node) {
        self.state().nodes.insert(node.name.clone(), node);
    }

    /// Register a running server for `cluster`
    pub fn insert_server(&self, cluster: &str) -> Node {
        let mut node = Node::new(format!("k3d-{}-server", cluster), Role::Server, "img");
        node.labels = node_labels(cluster, Role::Server);
        node.network = format!("k3d-{}", cluster);
        node.running = true;
        self.insert_node(node.clone());
        node
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn position(&self, call: &str) -> Option<usize> {
        self.state().calls.iter().position(|c| c == call)
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.state().nodes.get(name).cloned()
    }

    pub fn node_names(&self) -> Vec<String> {
        self.state().nodes.keys().cloned().collect()
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.state().networks.contains_key(name)
    }

    pub fn copied(&self) -> Vec<(String, PathBuf, String, bool)> {
        self.state().copied.clone()
    }
}

/// Wrap `body` the way a single-file tar stream would: header then NUL padding
pub fn tar_payload(body: &str) -> Vec<u8> {
    let mut raw = vec![b'h'; 512];
    raw.extend_from_slice(body.as_bytes());
    let padded = raw.len().div_ceil(512) * 512 + 1024;
    raw.resize(padded, 0);
    raw
}

pub fn env_value(node: &Node, key: &str) -> Option<String> {
    node.env.iter().find_map(|e| {
        e.strip_prefix(key)
            .and_then(|v| v.strip_prefix('='))
            .map(|v| v.to_string())
    })
}

#[async_trait]
impl Runtime for FakeRuntime {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn create_node(&self, node: &Node) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(format!("create:{}", node.name));
        if state.fail_create.contains(&node.name) {
            return Err(RuntimeError::failed("create node", &node.name, "injected failure"));
        }
        if !state.local_images.contains(&node.image) {
            return Err(RuntimeError::ImageNotFound(node.image.clone()));
        }
        if state.nodes.contains_key(&node.name) {
            return Err(RuntimeError::failed("create node", &node.name, "name in use"));
        }
        let mut created = node.clone();
        created.running = false;
        state.nodes.insert(node.name.clone(), created);
        Ok(())
    }

    async fn delete_node(&self, node: &Node) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(format!("delete:{}", node.name));
        state
            .nodes
            .remove(&node.name)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NodeNotFound(node.name.clone()))
    }

    async fn get_nodes_by_label(
        &self,
        labels: &HashMap<String, String>,
    ) -> Result<Vec<Node>, RuntimeError> {
        let state = self.state();
        Ok(state
            .nodes
            .values()
            .filter(|n| labels.iter().all(|(k, v)| n.labels.get(k) == Some(v)))
            .cloned()
            .collect())
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>, RuntimeError> {
        Ok(self.node(name))
    }

    async fn create_network_if_not_present(
        &self,
        name: &str,
    ) -> Result<(String, bool), RuntimeError> {
        let mut state = self.state();
        state.calls.push(format!("network:{}", name));
        if let Some(id) = state.networks.get(name) {
            return Ok((id.clone(), true));
        }
        let id = format!("net-{}", name);
        state.networks.insert(name.to_string(), id.clone());
        Ok((id, false))
    }

    async fn delete_network(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(format!("delete-network:{}", id));
        state
            .networks
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NetworkNotFound(id.to_string()))
    }

    async fn start_node(&self, node: &Node) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(format!("start:{}", node.name));
        let existing = state
            .nodes
            .get_mut(&node.name)
            .ok_or_else(|| RuntimeError::NodeNotFound(node.name.clone()))?;
        existing.running = true;
        Ok(())
    }

    async fn stop_node(&self, node: &Node) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(format!("stop:{}", node.name));
        let existing = state
            .nodes
            .get_mut(&node.name)
            .ok_or_else(|| RuntimeError::NodeNotFound(node.name.clone()))?;
        existing.running = false;
        Ok(())
    }

    async fn create_volume(
        &self,
        name: &str,
        _labels: &HashMap<String, String>,
    ) -> Result<(), RuntimeError> {
        self.record(format!("volume:{}", name));
        Ok(())
    }

    async fn delete_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.record(format!("delete-volume:{}", name));
        Ok(())
    }

    fn runtime_path(&self) -> String {
        "/run/fake.sock".to_string()
    }

    async fn exec_in_node(&self, node: &Node, cmd: &[String]) -> Result<String, RuntimeError> {
        let mut state = self.state();
        state.calls.push(format!("exec:{}:{}", node.name, cmd.join(" ")));
        if !state.nodes.contains_key(&node.name) {
            return Err(RuntimeError::NodeNotFound(node.name.clone()));
        }
        Ok(state
            .exec_outputs
            .get(&node.name)
            .cloned()
            .unwrap_or_else(|| IMPORT_OK_OUTPUT.to_string()))
    }

    async fn get_node_logs(&self, _node: &Node) -> Result<ByteStream, RuntimeError> {
        Ok(Box::pin(std::io::Cursor::new(Vec::new())))
    }

    async fn get_kubeconfig(&self, node: &Node) -> Result<ByteStream, RuntimeError> {
        let mut state = self.state();
        state.calls.push(format!("kubeconfig:{}", node.name));
        Ok(Box::pin(std::io::Cursor::new(state.kubeconfig.clone())))
    }

    fn kubeconfig_framing(&self) -> PayloadFraming {
        self.state().framing.unwrap_or_else(PayloadFraming::tar)
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(format!("pull:{}", image));
        if state.fail_pull {
            return Err(RuntimeError::failed("pull image", image, "registry unreachable"));
        }
        state.local_images.insert(image.to_string());
        Ok(())
    }

    async fn save_images(&self, images: &[String], dest: &Path) -> Result<(), RuntimeError> {
        self.record(format!("save:{}", images.join(",")));
        let written = if self.state().save_as_directory {
            std::fs::create_dir_all(dest.join("blobs"))
        } else {
            std::fs::write(dest, b"fake image archive")
        };
        written.map_err(|source| RuntimeError::Io {
            target: dest.display().to_string(),
            source,
        })
    }

    async fn copy_to_node(&self, node: &Node, src: &Path, dest: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(format!("copy:{}", node.name));
        let existed = src.exists();
        state
            .copied
            .push((node.name.clone(), src.to_path_buf(), dest.to_string(), existed));
        if state.fail_copy.contains(&node.name) {
            return Err(RuntimeError::failed("copy into", &node.name, "injected failure"));
        }
        Ok(())
    }
}
