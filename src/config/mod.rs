//! Settings file, working directories and kubeconfig location

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::{PayloadFraming, Runtime, RuntimeKind};

/// Environment variable listing kubeconfig files
pub const KUBECONFIG_ENV: &str = "KUBECONFIG";

/// Default settings directory: ~/.config/k3d
pub fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("k3d")
}

/// Default settings file location: ~/.config/k3d/config.yaml
pub fn default_settings_path() -> PathBuf {
    default_config_dir().join("config.yaml")
}

/// Errors that can occur while loading settings or resolving paths
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse settings: {0}")]
    ParseError(String),

    #[error("Multiple kubeconfigs specified via KUBECONFIG ({0}): reduce to one entry, unset KUBECONFIG or choose an output explicitly")]
    MultipleKubeconfigs(String),

    #[error("Could not determine the home directory")]
    NoHomeDir,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Docker backend settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DockerSettings {
    /// Docker CLI binary
    #[serde(default = "default_docker_binary")]
    pub binary: String,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            binary: default_docker_binary(),
        }
    }
}

fn default_docker_binary() -> String {
    "docker".to_string()
}

/// Contents of the settings file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Runtime used when `--runtime` isn't given
    #[serde(default)]
    pub runtime: RuntimeKind,

    #[serde(default)]
    pub docker: DockerSettings,

    /// Parent of the per-cluster working directories
    #[serde(default, rename = "work-dir", skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,

    /// Overrides the backend's kubeconfig header length
    #[serde(default, rename = "kubeconfig-header-len", skip_serializing_if = "Option::is_none")]
    pub kubeconfig_header_len: Option<usize>,
}

impl Settings {
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(default_config_dir)
    }

    /// Private working directory of a cluster
    pub fn cluster_dir(&self, cluster: &str) -> PathBuf {
        self.work_dir().join(cluster)
    }

    /// Kubeconfig framing of `runtime`, with the configured override applied
    pub fn kubeconfig_framing(&self, runtime: &dyn Runtime) -> PayloadFraming {
        let mut framing = runtime.kubeconfig_framing();
        if let Some(len) = self.kubeconfig_header_len {
            framing.header_len = len;
        }
        framing
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Parse settings from YAML; an empty document yields defaults
pub fn parse_settings(content: &str) -> Result<Settings, ConfigError> {
    if content.trim().is_empty() {
        return Ok(Settings::default());
    }
    serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
}

/// Resolve the kubeconfig path from the `KUBECONFIG` value and home directory
pub fn resolve_kubeconfig_path(
    env_value: Option<&str>,
    home: Option<PathBuf>,
) -> Result<PathBuf, ConfigError> {
    if let Some(value) = env_value {
        let paths: Vec<PathBuf> = std::env::split_paths(value)
            .filter(|p| !p.as_os_str().is_empty())
            .collect();
        match paths.len() {
            0 => {}
            1 => return Ok(paths[0].clone()),
            _ => return Err(ConfigError::MultipleKubeconfigs(value.to_string())),
        }
    }
    home.map(|h| h.join(".kube").join("config"))
        .ok_or(ConfigError::NoHomeDir)
}

/// Expand `~` in user supplied paths
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

// ============================================================================
// I/O boundary functions
// ============================================================================

/// Default kubeconfig path honouring `KUBECONFIG`
pub fn default_kubeconfig_path() -> Result<PathBuf, ConfigError> {
    let env_value = std::env::var(KUBECONFIG_ENV).ok();
    resolve_kubeconfig_path(env_value.as_deref(), dirs::home_dir())
}

/// Load settings from a specific path; a missing file yields defaults
pub fn load_settings_from(path: &Path) -> Result<Settings, ConfigError> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let content = std::fs::read_to_string(path)?;
    parse_settings(&content)
}
