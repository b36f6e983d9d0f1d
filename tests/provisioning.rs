//! Cluster provisioning and lifecycle against the in-memory runtime

mod common;

use common::{env_value, FakeRuntime};

use k3d::cluster::{
    create_cluster, delete_cluster, get_cluster, get_clusters, start_cluster, stop_cluster,
    ProvisionError, WorkerFailurePolicy,
};
use k3d::ports::PortSpecError;
use k3d::runtime::RuntimeError;
use k3d::types::{labels, ClusterSpec, DEFAULT_IMAGE};

fn three_node_spec() -> ClusterSpec {
    ClusterSpec::new("test")
        .with_workers(2)
        .with_ports("server", vec!["6443:6443".to_string()])
        .with_ports("worker", vec!["8080:80".to_string()])
        .with_port_auto_offset(100)
}

#[tokio::test]
async fn test_create_cluster_offsets_worker_ports() {
    let runtime = FakeRuntime::with_images(&[DEFAULT_IMAGE]);
    let report = create_cluster(&runtime, &three_node_spec(), WorkerFailurePolicy::Abort)
        .await
        .unwrap();

    assert_eq!(report.server.as_deref(), Some("k3d-test-server"));
    assert_eq!(report.network, "k3d-test");
    assert!(report.workers.iter().all(|w| w.succeeded()));

    let server = runtime.node("k3d-test-server").unwrap();
    assert_eq!(
        server.ports,
        vec!["0.0.0.0:6443:6443/tcp", "0.0.0.0:6443:6443/tcp"]
    );
    assert!(server.running);

    let w0 = runtime.node("k3d-test-worker-0").unwrap();
    let w1 = runtime.node("k3d-test-worker-1").unwrap();
    assert_eq!(w0.ports, vec!["0.0.0.0:8180:80/tcp"]);
    assert_eq!(w1.ports, vec!["0.0.0.0:8181:80/tcp"]);
    assert_eq!(
        env_value(&w1, "K3S_URL").as_deref(),
        Some("https://k3d-test-server:6443")
    );
    assert_eq!(w1.network, "k3d-test");
    assert_eq!(w1.labels.get(labels::K3D_CLUSTER).unwrap(), "test");
}

#[tokio::test]
async fn test_create_cluster_orders_side_effects() {
    let runtime = FakeRuntime::with_images(&[DEFAULT_IMAGE]);
    create_cluster(&runtime, &three_node_spec(), WorkerFailurePolicy::Abort)
        .await
        .unwrap();

    let network = runtime.position("network:k3d-test").unwrap();
    let server_start = runtime.position("start:k3d-test-server").unwrap();
    let w0_create = runtime.position("create:k3d-test-worker-0").unwrap();
    let w1_create = runtime.position("create:k3d-test-worker-1").unwrap();
    assert!(network < runtime.position("create:k3d-test-server").unwrap());
    assert!(server_start < w0_create);
    assert!(w0_create < w1_create);
}

#[tokio::test]
async fn test_missing_image_is_pulled_once() {
    let runtime = FakeRuntime::with_images(&[]);
    let spec = ClusterSpec::new("test").with_workers(1);
    create_cluster(&runtime, &spec, WorkerFailurePolicy::Abort)
        .await
        .unwrap();

    let calls = runtime.calls();
    let pulls = calls.iter().filter(|c| c.starts_with("pull:")).count();
    assert_eq!(pulls, 1);
    let server_creates = calls
        .iter()
        .filter(|c| *c == "create:k3d-test-server")
        .count();
    assert_eq!(server_creates, 2);
    assert!(runtime.node("k3d-test-worker-0").unwrap().running);
}

#[tokio::test]
async fn test_failed_pull_aborts_before_workers() {
    let runtime = FakeRuntime::with_images(&[]);
    runtime.fail_pull();
    let spec = ClusterSpec::new("test").with_workers(2);

    let err = create_cluster(&runtime, &spec, WorkerFailurePolicy::Continue)
        .await
        .unwrap_err();
    match err {
        ProvisionError::NodeCreateFailed { node, .. } => assert_eq!(node, "k3d-test-server"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(runtime.position("create:k3d-test-worker-0").is_none());
}

#[tokio::test]
async fn test_server_failure_creates_no_workers() {
    let runtime = FakeRuntime::with_images(&[DEFAULT_IMAGE]);
    runtime.fail_create("k3d-test-server");

    let result = create_cluster(&runtime, &three_node_spec(), WorkerFailurePolicy::Continue).await;
    assert!(matches!(
        result,
        Err(ProvisionError::NodeCreateFailed { .. })
    ));
    assert!(runtime.node_names().is_empty());
}

#[tokio::test]
async fn test_malformed_port_spec_touches_nothing() {
    let runtime = FakeRuntime::with_images(&[DEFAULT_IMAGE]);
    let spec = ClusterSpec::new("test")
        .with_workers(1)
        .with_ports("worker", vec!["80:eighty".to_string()]);

    let result = create_cluster(&runtime, &spec, WorkerFailurePolicy::Abort).await;
    assert!(matches!(
        result,
        Err(ProvisionError::Ports(PortSpecError::Malformed(s))) if s == "80:eighty"
    ));
    assert!(runtime.calls().is_empty());
}

#[tokio::test]
async fn test_unknown_scope_touches_nothing() {
    let runtime = FakeRuntime::with_images(&[DEFAULT_IMAGE]);
    let spec = ClusterSpec::new("test").with_ports("k3d-other-worker-9", vec!["80".to_string()]);

    let result = create_cluster(&runtime, &spec, WorkerFailurePolicy::Abort).await;
    assert!(matches!(
        result,
        Err(ProvisionError::Ports(PortSpecError::UnknownScope(_)))
    ));
    assert!(runtime.calls().is_empty());
}

#[tokio::test]
async fn test_offset_overflow_touches_nothing() {
    let runtime = FakeRuntime::with_images(&[DEFAULT_IMAGE]);
    let spec = ClusterSpec::new("test")
        .with_workers(2)
        .with_ports("worker", vec!["65500:80".to_string()])
        .with_port_auto_offset(35);

    let result = create_cluster(&runtime, &spec, WorkerFailurePolicy::Abort).await;
    assert!(matches!(
        result,
        Err(ProvisionError::Ports(PortSpecError::OffsetOverflow { .. }))
    ));
    assert!(runtime.calls().is_empty());
}

#[tokio::test]
async fn test_worker_failure_abort() {
    let runtime = FakeRuntime::with_images(&[DEFAULT_IMAGE]);
    runtime.fail_create("k3d-test-worker-1");
    let spec = ClusterSpec::new("test").with_workers(3);

    let err = create_cluster(&runtime, &spec, WorkerFailurePolicy::Abort)
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::NodeCreateFailed { ref node, .. } if node == "k3d-test-worker-1"));
    assert!(runtime.node("k3d-test-server").is_some());
    assert!(runtime.node("k3d-test-worker-0").is_some());
    assert!(runtime.position("create:k3d-test-worker-2").is_none());
}

#[tokio::test]
async fn test_worker_failure_continue() {
    let runtime = FakeRuntime::with_images(&[DEFAULT_IMAGE]);
    runtime.fail_create("k3d-test-worker-1");
    let spec = ClusterSpec::new("test").with_workers(3);

    let report = create_cluster(&runtime, &spec, WorkerFailurePolicy::Continue)
        .await
        .unwrap();
    let failed: Vec<_> = report.failed_workers().map(|w| w.name.as_str()).collect();
    assert_eq!(failed, vec!["k3d-test-worker-1"]);
    assert!(matches!(
        report.workers[1].error,
        Some(RuntimeError::OperationFailed { .. })
    ));
    assert!(runtime.node("k3d-test-worker-2").unwrap().running);
}

#[tokio::test]
async fn test_worker_failure_rollback() {
    let runtime = FakeRuntime::with_images(&[DEFAULT_IMAGE]);
    runtime.fail_create("k3d-test-worker-2");
    let spec = ClusterSpec::new("test").with_workers(3);

    let result = create_cluster(&runtime, &spec, WorkerFailurePolicy::Rollback).await;
    assert!(matches!(result, Err(ProvisionError::NodeCreateFailed { .. })));
    assert_eq!(runtime.node_names(), vec!["k3d-test-server"]);
}

#[tokio::test]
async fn test_agent_only_joins_server_network() {
    let runtime = FakeRuntime::with_images(&[DEFAULT_IMAGE]);
    runtime.insert_server("main");

    let mut spec = ClusterSpec::new("edge").with_workers(1);
    spec.agent_only = true;
    spec.server_url = Some("https://k3d-main-server:6443".to_string());

    let report = create_cluster(&runtime, &spec, WorkerFailurePolicy::Abort)
        .await
        .unwrap();
    assert!(report.server.is_none());
    assert_eq!(report.network, "k3d-main");
    assert!(!runtime.calls().iter().any(|c| c.starts_with("network:")));

    let worker = runtime.node("k3d-edge-worker-0").unwrap();
    assert_eq!(worker.network, "k3d-main");
    assert_eq!(
        env_value(&worker, "K3S_URL").as_deref(),
        Some("https://k3d-main-server:6443")
    );
}

#[tokio::test]
async fn test_agent_only_unknown_server() {
    let runtime = FakeRuntime::with_images(&[DEFAULT_IMAGE]);
    let mut spec = ClusterSpec::new("edge").with_workers(1);
    spec.agent_only = true;
    spec.server_url = Some("k3d-nowhere-server:6443".to_string());

    let result = create_cluster(&runtime, &spec, WorkerFailurePolicy::Abort).await;
    assert!(matches!(result, Err(ProvisionError::ServerNotFound(ref n)) if n == "k3d-nowhere-server"));
}

#[tokio::test]
async fn test_agent_only_requires_server_url() {
    let runtime = FakeRuntime::with_images(&[DEFAULT_IMAGE]);
    let mut spec = ClusterSpec::new("edge").with_workers(1);
    spec.agent_only = true;

    let result = create_cluster(&runtime, &spec, WorkerFailurePolicy::Abort).await;
    assert!(matches!(result, Err(ProvisionError::MissingServerUrl)));
}

#[tokio::test]
async fn test_cluster_lifecycle() {
    let runtime = FakeRuntime::with_images(&[DEFAULT_IMAGE]);
    create_cluster(&runtime, &three_node_spec(), WorkerFailurePolicy::Abort)
        .await
        .unwrap();
    create_cluster(&runtime, &ClusterSpec::new("other"), WorkerFailurePolicy::Abort)
        .await
        .unwrap();

    let names: Vec<_> = get_clusters(&runtime)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(names, vec!["other", "test"]);

    let cluster = get_cluster(&runtime, "test").await.unwrap().unwrap();
    assert_eq!(cluster.node_count(), 3);

    stop_cluster(&runtime, &cluster).await.unwrap();
    assert!(
        runtime.position("stop:k3d-test-worker-1").unwrap()
            < runtime.position("stop:k3d-test-server").unwrap()
    );
    assert!(!runtime.node("k3d-test-server").unwrap().running);

    start_cluster(&runtime, &cluster).await.unwrap();
    assert!(runtime.node("k3d-test-worker-0").unwrap().running);

    delete_cluster(&runtime, &cluster).await.unwrap();
    assert!(get_cluster(&runtime, "test").await.unwrap().is_none());
    assert!(!runtime.has_network("k3d-test"));
    assert!(runtime.has_network("k3d-other"));
}

#[tokio::test]
async fn test_delete_cluster_without_network() {
    let runtime = FakeRuntime::with_images(&[DEFAULT_IMAGE]);
    runtime.insert_server("main");

    let mut spec = ClusterSpec::new("edge").with_workers(1);
    spec.agent_only = true;
    spec.server_url = Some("k3d-main-server:6443".to_string());
    create_cluster(&runtime, &spec, WorkerFailurePolicy::Abort)
        .await
        .unwrap();

    let edge = get_cluster(&runtime, "edge").await.unwrap().unwrap();
    delete_cluster(&runtime, &edge).await.unwrap();
    assert!(runtime.node("k3d-edge-worker-0").is_none());
    assert!(runtime.node("k3d-main-server").is_some());
}
