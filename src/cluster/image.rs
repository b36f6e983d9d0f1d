//! Concurrent image import into every node of a cluster

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::runtime::{Runtime, RuntimeError};
use crate::types::{Node, DEFAULT_OBJECT_NAME_PREFIX};

use super::get_cluster;

/// Directory inside a node the archive is copied to
pub const IMAGE_DIR_IN_NODE: &str = "/images";

/// `ctr image import` prints this once unpacking finished
pub const IMPORT_DONE_MARKER: &str = "done";

/// Errors that fail the whole import
#[derive(Error, Debug)]
pub enum ImportError {
    #[error("No images given")]
    NoImages,

    #[error("Cluster '{0}' not found")]
    ClusterNotFound(String),

    #[error("Failed to save images into '{path}': {source}")]
    Save {
        path: PathBuf,
        #[source]
        source: RuntimeError,
    },

    #[error("Failed to remove image archive '{path}': {source}")]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Why importing into one node failed
#[derive(Error, Debug)]
pub enum NodeImportError {
    #[error("copying the archive failed: {0}")]
    Copy(#[source] RuntimeError),

    #[error("running the import failed: {0}")]
    Exec(#[source] RuntimeError),

    #[error("import did not report completion, output: {0}")]
    Incomplete(String),
}

#[derive(Debug)]
pub struct NodeImportResult {
    pub node: String,
    pub result: Result<(), NodeImportError>,
}

/// Per-node outcomes in server-then-workers order
#[derive(Debug)]
pub struct ImportReport {
    pub archive: PathBuf,
    pub nodes: Vec<NodeImportResult>,
}

impl ImportReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &str> {
        self.nodes
            .iter()
            .filter(|n| n.result.is_ok())
            .map(|n| n.node.as_str())
    }

    pub fn failed(&self) -> impl Iterator<Item = &NodeImportResult> {
        self.nodes.iter().filter(|n| n.result.is_err())
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed().next().is_none()
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Archive file name, unique per cluster and import time
pub fn archive_name(cluster: &str, at: DateTime<Local>) -> String {
    format!(
        "{}-{}-images-{}.tar",
        DEFAULT_OBJECT_NAME_PREFIX,
        cluster,
        at.format("%Y%m%d%H%M%S%3f")
    )
}

pub fn import_command(archive_in_node: &str) -> Vec<String> {
    ["ctr", "image", "import", archive_in_node]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub fn import_succeeded(output: &str) -> bool {
    output.contains(IMPORT_DONE_MARKER)
}

// ============================================================================
// I/O boundary functions
// ============================================================================

async fn import_into_node(
    runtime: &dyn Runtime,
    node: &Node,
    archive: &Path,
    archive_in_node: &str,
) -> Result<(), NodeImportError> {
    debug!("Copying '{}' into node '{}'", archive.display(), node.name);
    runtime
        .copy_to_node(node, archive, archive_in_node)
        .await
        .map_err(NodeImportError::Copy)?;

    let output = runtime
        .exec_in_node(node, &import_command(archive_in_node))
        .await
        .map_err(NodeImportError::Exec)?;
    if !import_succeeded(&output) {
        return Err(NodeImportError::Incomplete(output));
    }
    Ok(())
}

/// Save `images` into one archive under `cluster_dir` and import it into
/// every node of the cluster concurrently.
///
/// A failing node never cancels the others; its error is logged and kept in
/// the report. The local archive is removed once every node is done.
pub async fn import_images(
    runtime: &dyn Runtime,
    cluster_name: &str,
    images: &[String],
    cluster_dir: &Path,
) -> Result<ImportReport, ImportError> {
    if images.is_empty() {
        return Err(ImportError::NoImages);
    }

    let cluster = get_cluster(runtime, cluster_name)
        .await?
        .ok_or_else(|| ImportError::ClusterNotFound(cluster_name.to_string()))?;

    let image_dir = cluster_dir.join("images");
    tokio::fs::create_dir_all(&image_dir)
        .await
        .map_err(|source| ImportError::Io {
            path: image_dir.clone(),
            source,
        })?;

    let name = archive_name(cluster_name, Local::now());
    let archive = image_dir.join(&name);
    let archive_in_node = format!("{}/{}", IMAGE_DIR_IN_NODE, name);

    info!("Saving images {:?} into '{}'", images, archive.display());
    if let Err(source) = runtime.save_images(images, &archive).await {
        remove_archive(&archive).await.ok();
        return Err(ImportError::Save {
            path: archive,
            source,
        });
    }

    let units = cluster.nodes().map(|node| {
        let archive = archive.as_path();
        let archive_in_node = archive_in_node.as_str();
        async move {
            info!("Importing images into node '{}'", node.name);
            let result = import_into_node(runtime, node, archive, archive_in_node).await;
            if let Err(e) = &result {
                error!("Image import into node '{}' failed: {}", node.name, e);
            }
            NodeImportResult {
                node: node.name.clone(),
                result,
            }
        }
    });
    let nodes = join_all(units).await;

    // Node results survive a failed cleanup
    if let Err(e) = remove_archive(&archive).await {
        warn!("{}", e);
    }

    let report = ImportReport { archive, nodes };
    if report.all_succeeded() {
        info!("Imported images into all nodes of cluster '{}'", cluster_name);
    }
    Ok(report)
}

async fn remove_archive(archive: &Path) -> Result<(), ImportError> {
    match tokio::fs::remove_file(archive).await {
        Ok(()) => {
            debug!("Removed '{}'", archive.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ImportError::Cleanup {
            path: archive.to_path_buf(),
            source,
        }),
    }
}
