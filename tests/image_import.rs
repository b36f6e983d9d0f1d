//! Concurrent image import against the in-memory runtime

mod common;

use common::FakeRuntime;

use k3d::cluster::{
    create_cluster, import_images, ImportError, NodeImportError, WorkerFailurePolicy,
};
use k3d::types::{ClusterSpec, DEFAULT_IMAGE};

async fn running_cluster(workers: usize) -> FakeRuntime {
    let runtime = FakeRuntime::with_images(&[DEFAULT_IMAGE]);
    let spec = ClusterSpec::new("test").with_workers(workers);
    create_cluster(&runtime, &spec, WorkerFailurePolicy::Abort)
        .await
        .unwrap();
    runtime
}

fn images(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_import_isolates_node_without_done_marker() {
    let runtime = running_cluster(2).await;
    runtime.set_exec_output("k3d-test-worker-1", "ctr: failed to unpack");
    let dir = tempfile::tempdir().unwrap();

    let report = import_images(&runtime, "test", &images(&["nginx:latest"]), dir.path())
        .await
        .unwrap();

    let order: Vec<_> = report.nodes.iter().map(|n| n.node.as_str()).collect();
    assert_eq!(
        order,
        vec!["k3d-test-server", "k3d-test-worker-0", "k3d-test-worker-1"]
    );
    let succeeded: Vec<_> = report.succeeded().collect();
    assert_eq!(succeeded, vec!["k3d-test-server", "k3d-test-worker-0"]);
    assert!(matches!(
        report.nodes[2].result,
        Err(NodeImportError::Incomplete(ref out)) if out == "ctr: failed to unpack"
    ));
    assert!(!report.all_succeeded());

    assert!(report.archive.starts_with(dir.path().join("images")));
    assert!(!report.archive.exists());
}

#[tokio::test]
async fn test_import_copies_archive_into_every_node() {
    let runtime = running_cluster(1).await;
    let dir = tempfile::tempdir().unwrap();

    let report = import_images(&runtime, "test", &images(&["nginx:latest", "redis:7"]), dir.path())
        .await
        .unwrap();
    assert!(report.all_succeeded());

    let copied = runtime.copied();
    assert_eq!(copied.len(), 2);
    for (_, src, dest, existed) in &copied {
        assert_eq!(src, &report.archive);
        assert!(*existed, "archive must exist while nodes import it");
        assert!(dest.starts_with("/images/k3d-test-images-"));
        assert!(dest.ends_with(".tar"));
    }
    assert!(runtime
        .calls()
        .contains(&"save:nginx:latest,redis:7".to_string()));

    let exec = format!("exec:k3d-test-server:ctr image import {}", copied[0].2);
    assert!(runtime.position(&exec).is_some());
}

#[tokio::test]
async fn test_copy_failure_is_isolated() {
    let runtime = running_cluster(2).await;
    runtime.fail_copy("k3d-test-worker-0");
    let dir = tempfile::tempdir().unwrap();

    let report = import_images(&runtime, "test", &images(&["nginx:latest"]), dir.path())
        .await
        .unwrap();
    let failed: Vec<_> = report.failed().map(|n| n.node.as_str()).collect();
    assert_eq!(failed, vec!["k3d-test-worker-0"]);
    assert!(matches!(
        report.nodes[1].result,
        Err(NodeImportError::Copy(_))
    ));
    let calls = runtime.calls();
    assert!(!calls.iter().any(|c| c.starts_with("exec:k3d-test-worker-0:")));
    assert!(calls.iter().any(|c| c.starts_with("exec:k3d-test-worker-1:")));
    assert!(!report.archive.exists());
}

#[tokio::test]
async fn test_failed_archive_cleanup_keeps_node_results() {
    let runtime = running_cluster(1).await;
    runtime.save_as_directory();
    runtime.set_exec_output("k3d-test-worker-0", "ctr: failed to unpack");
    let dir = tempfile::tempdir().unwrap();

    let report = import_images(&runtime, "test", &images(&["nginx:latest"]), dir.path())
        .await
        .unwrap();

    assert_eq!(report.nodes.len(), 2);
    let succeeded: Vec<_> = report.succeeded().collect();
    assert_eq!(succeeded, vec!["k3d-test-server"]);
    assert!(report.archive.exists());
}

#[tokio::test]
async fn test_import_unknown_cluster() {
    let runtime = FakeRuntime::with_images(&[]);
    let dir = tempfile::tempdir().unwrap();

    let result = import_images(&runtime, "ghost", &images(&["nginx:latest"]), dir.path()).await;
    assert!(matches!(result, Err(ImportError::ClusterNotFound(ref n)) if n == "ghost"));
    assert!(!runtime.calls().iter().any(|c| c.starts_with("save:")));
}

#[tokio::test]
async fn test_import_requires_images() {
    let runtime = running_cluster(0).await;
    let dir = tempfile::tempdir().unwrap();
    let result = import_images(&runtime, "test", &[], dir.path()).await;
    assert!(matches!(result, Err(ImportError::NoImages)));
}
