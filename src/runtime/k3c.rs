//! k3c backend
//!
//! Placeholder until the k3c client grows the operations k3d needs.

super::unimplemented_runtime!(K3c, "k3c", "/run/k3c/k3c.sock");
