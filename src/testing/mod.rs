//! Test support shipped with the library

pub mod fake_cluster;

pub use fake_cluster::{FakeCluster, PodOutcome};
