//! Container runtime abstraction
//!
//! Every backend (docker, containerd, k3c) implements [`Runtime`]. The
//! selected backend is passed explicitly into every cluster operation; there
//! is no process-wide default.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::pin::Pin;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::types::Node;

pub mod containerd;
pub mod docker;
pub mod k3c;

pub use containerd::Containerd;
pub use docker::DockerRuntime;
pub use k3c::K3c;

/// Readable payload returned by log and kubeconfig retrieval
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Errors returned by runtime backends
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Runtime '{0}' not supported")]
    Unsupported(String),

    #[error("Runtime '{runtime}' is unavailable: {reason}")]
    BackendUnavailable { runtime: String, reason: String },

    #[error("Image '{0}' not found")]
    ImageNotFound(String),

    #[error("Node '{0}' not found")]
    NodeNotFound(String),

    #[error("Network '{0}' not found")]
    NetworkNotFound(String),

    #[error("Runtime '{runtime}' does not implement '{operation}'")]
    NotImplemented {
        runtime: &'static str,
        operation: &'static str,
    },

    #[error("Invalid node '{node}': {reason}")]
    InvalidNode { node: String, reason: String },

    #[error("Failed to {operation} '{target}': {reason}")]
    OperationFailed {
        operation: &'static str,
        target: String,
        reason: String,
    },

    #[error("Failed to parse runtime output for '{target}': {reason}")]
    Parse { target: String, reason: String },

    #[error("IO error on '{target}': {source}")]
    Io {
        target: String,
        #[source]
        source: std::io::Error,
    },
}

impl RuntimeError {
    pub fn failed(operation: &'static str, target: impl Into<String>, reason: impl fmt::Display) -> Self {
        RuntimeError::OperationFailed {
            operation,
            target: target.into(),
            reason: reason.to_string(),
        }
    }
}

/// How the kubeconfig payload is wrapped when read out of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadFraming {
    /// Leading metadata bytes to drop
    pub header_len: usize,
    /// Trim NUL padding from both ends after dropping the header
    pub trim_nul: bool,
}

impl PayloadFraming {
    /// Raw file contents, no framing
    pub const fn none() -> Self {
        Self {
            header_len: 0,
            trim_nul: false,
        }
    }

    /// A single file inside a tar stream: 512 byte header, NUL padded blocks
    pub const fn tar() -> Self {
        Self {
            header_len: 512,
            trim_nul: true,
        }
    }

    /// Strip the framing, or `None` if the payload is shorter than the header
    pub fn extract<'a>(&self, raw: &'a [u8]) -> Option<&'a [u8]> {
        let body = raw.get(self.header_len..)?;
        if !self.trim_nul {
            return Some(body);
        }
        let start = body.iter().position(|b| *b != 0).unwrap_or(body.len());
        let end = body.iter().rposition(|b| *b != 0).map_or(start, |i| i + 1);
        Some(&body[start..end])
    }
}

/// Capability interface every container backend implements
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Short backend name, used in errors and logs
    fn name(&self) -> &'static str;

    /// Create (but don't start) a node. Fails with `ImageNotFound` if the
    /// image is not present locally; callers decide whether to pull.
    async fn create_node(&self, node: &Node) -> Result<(), RuntimeError>;

    /// Force-remove a node, including anonymous volumes, even if running
    async fn delete_node(&self, node: &Node) -> Result<(), RuntimeError>;

    /// Nodes whose labels are a superset of `labels`; empty is not an error
    async fn get_nodes_by_label(
        &self,
        labels: &HashMap<String, String>,
    ) -> Result<Vec<Node>, RuntimeError>;

    /// Look a node up by name; `Ok(None)` if it doesn't exist
    async fn get_node(&self, name: &str) -> Result<Option<Node>, RuntimeError>;

    /// Returns the network ID and whether it already existed
    async fn create_network_if_not_present(&self, name: &str)
        -> Result<(String, bool), RuntimeError>;

    async fn delete_network(&self, id: &str) -> Result<(), RuntimeError>;

    async fn start_node(&self, node: &Node) -> Result<(), RuntimeError>;

    async fn stop_node(&self, node: &Node) -> Result<(), RuntimeError>;

    async fn create_volume(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), RuntimeError>;

    async fn delete_volume(&self, name: &str) -> Result<(), RuntimeError>;

    /// Path of the backend's control socket, e.g. `/var/run/docker.sock`
    fn runtime_path(&self) -> String;

    /// Run a command inside a node and return its combined output
    async fn exec_in_node(&self, node: &Node, cmd: &[String]) -> Result<String, RuntimeError>;

    async fn get_node_logs(&self, node: &Node) -> Result<ByteStream, RuntimeError>;

    /// Raw kubeconfig payload as stored inside the node, see [`Runtime::kubeconfig_framing`]
    async fn get_kubeconfig(&self, node: &Node) -> Result<ByteStream, RuntimeError>;

    /// Framing of the payload returned by [`Runtime::get_kubeconfig`]
    fn kubeconfig_framing(&self) -> PayloadFraming {
        PayloadFraming::none()
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Save local images into a single tar archive at `dest`
    async fn save_images(&self, images: &[String], dest: &Path) -> Result<(), RuntimeError>;

    /// Copy a local file into a node at `dest`
    async fn copy_to_node(&self, node: &Node, src: &Path, dest: &str) -> Result<(), RuntimeError>;
}

/// Selectable runtime backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    #[default]
    Docker,
    Containerd,
    K3c,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Docker => "docker",
            RuntimeKind::Containerd => "containerd",
            RuntimeKind::K3c => "k3c",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeKind {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "docker" => Ok(RuntimeKind::Docker),
            "containerd" => Ok(RuntimeKind::Containerd),
            "k3c" => Ok(RuntimeKind::K3c),
            other => Err(RuntimeError::Unsupported(other.to_string())),
        }
    }
}

/// Build the backend for a runtime selection
pub fn get_runtime(kind: RuntimeKind, docker_binary: &str) -> Box<dyn Runtime> {
    match kind {
        RuntimeKind::Docker => Box::new(DockerRuntime::with_binary(docker_binary)),
        RuntimeKind::Containerd => Box::new(Containerd),
        RuntimeKind::K3c => Box::new(K3c),
    }
}

/// Declares a backend whose every operation reports `NotImplemented`
macro_rules! unimplemented_runtime {
    ($ty:ident, $name:literal, $path:literal) => {
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $ty;

        impl $ty {
            fn unsupported(operation: &'static str) -> $crate::runtime::RuntimeError {
                $crate::runtime::RuntimeError::NotImplemented {
                    runtime: $name,
                    operation,
                }
            }
        }

        #[async_trait::async_trait]
        impl $crate::runtime::Runtime for $ty {
            fn name(&self) -> &'static str {
                $name
            }

            async fn create_node(
                &self,
                _node: &$crate::types::Node,
            ) -> Result<(), $crate::runtime::RuntimeError> {
                Err(Self::unsupported("create_node"))
            }

            async fn delete_node(
                &self,
                _node: &$crate::types::Node,
            ) -> Result<(), $crate::runtime::RuntimeError> {
                Err(Self::unsupported("delete_node"))
            }

            async fn get_nodes_by_label(
                &self,
                _labels: &std::collections::HashMap<String, String>,
            ) -> Result<Vec<$crate::types::Node>, $crate::runtime::RuntimeError> {
                Err(Self::unsupported("get_nodes_by_label"))
            }

            async fn get_node(
                &self,
                _name: &str,
            ) -> Result<Option<$crate::types::Node>, $crate::runtime::RuntimeError> {
                Err(Self::unsupported("get_node"))
            }

            async fn create_network_if_not_present(
                &self,
                _name: &str,
            ) -> Result<(String, bool), $crate::runtime::RuntimeError> {
                Err(Self::unsupported("create_network_if_not_present"))
            }

            async fn delete_network(&self, _id: &str) -> Result<(), $crate::runtime::RuntimeError> {
                Err(Self::unsupported("delete_network"))
            }

            async fn start_node(
                &self,
                _node: &$crate::types::Node,
            ) -> Result<(), $crate::runtime::RuntimeError> {
                Err(Self::unsupported("start_node"))
            }

            async fn stop_node(
                &self,
                _node: &$crate::types::Node,
            ) -> Result<(), $crate::runtime::RuntimeError> {
                Err(Self::unsupported("stop_node"))
            }

            async fn create_volume(
                &self,
                _name: &str,
                _labels: &std::collections::HashMap<String, String>,
            ) -> Result<(), $crate::runtime::RuntimeError> {
                Err(Self::unsupported("create_volume"))
            }

            async fn delete_volume(&self, _name: &str) -> Result<(), $crate::runtime::RuntimeError> {
                Err(Self::unsupported("delete_volume"))
            }

            fn runtime_path(&self) -> String {
                $path.to_string()
            }

            async fn exec_in_node(
                &self,
                _node: &$crate::types::Node,
                _cmd: &[String],
            ) -> Result<String, $crate::runtime::RuntimeError> {
                Err(Self::unsupported("exec_in_node"))
            }

            async fn get_node_logs(
                &self,
                _node: &$crate::types::Node,
            ) -> Result<$crate::runtime::ByteStream, $crate::runtime::RuntimeError> {
                Err(Self::unsupported("get_node_logs"))
            }

            async fn get_kubeconfig(
                &self,
                _node: &$crate::types::Node,
            ) -> Result<$crate::runtime::ByteStream, $crate::runtime::RuntimeError> {
                Err(Self::unsupported("get_kubeconfig"))
            }

            async fn pull_image(&self, _image: &str) -> Result<(), $crate::runtime::RuntimeError> {
                Err(Self::unsupported("pull_image"))
            }

            async fn save_images(
                &self,
                _images: &[String],
                _dest: &std::path::Path,
            ) -> Result<(), $crate::runtime::RuntimeError> {
                Err(Self::unsupported("save_images"))
            }

            async fn copy_to_node(
                &self,
                _node: &$crate::types::Node,
                _src: &std::path::Path,
                _dest: &str,
            ) -> Result<(), $crate::runtime::RuntimeError> {
                Err(Self::unsupported("copy_to_node"))
            }
        }
    };
}

pub(crate) use unimplemented_runtime;
