//! containerd backend
//!
//! Not implemented yet: every operation fails with `RuntimeError::NotImplemented`
//! so destructive calls never report a success that didn't happen.

super::unimplemented_runtime!(Containerd, "containerd", "/run/containerd/containerd.sock");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Runtime, RuntimeError};
    use crate::types::Node;

    #[tokio::test]
    async fn test_operations_not_implemented() {
        let runtime = Containerd;
        let node = Node::named("k3d-test-server");

        let result = runtime.delete_node(&node).await;
        assert!(matches!(
            result,
            Err(RuntimeError::NotImplemented {
                runtime: "containerd",
                operation: "delete_node"
            })
        ));
        assert!(runtime.get_node("k3d-test-server").await.is_err());
        assert_eq!(runtime.runtime_path(), "/run/containerd/containerd.sock");
    }
}
