//! k3d: run k3s clusters as containers
//!
//! - [`types`] node and cluster model, naming and labels
//! - [`ports`] port spec parsing, scoping and offsets
//! - [`runtime`] container backends behind the [`runtime::Runtime`] trait
//! - [`cluster`] provisioning, lifecycle, image import and kubeconfig handling
//! - [`config`] settings file and well-known paths
//! - [`cli`] command line surface

pub mod cli;
pub mod cluster;
pub mod config;
pub mod ports;
pub mod runtime;
pub mod types;
