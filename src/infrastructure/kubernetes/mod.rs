//! Kubernetes access for job controllers
//!
//! This module covers everything a controller does against a cluster:
//! - Resolving a cluster ID to a client pair
//! - Building Job manifests
//! - Provisioning registry pull secrets
//! - Job lifecycle (delete, create, wait for start and end)
//! - Harvesting outputs and logs from finished pods

pub mod client;
pub mod harvest;
pub mod job_builder;
pub mod lifecycle;
pub mod registry;

pub use client::{ClusterClients, ClusterOps, ClusterResolver, KubeClusterOps, KubeClusterResolver};
