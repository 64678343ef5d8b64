#[cfg(feature = "cli")]
pub mod cli;
pub mod cluster;
pub mod configuration;

pub use cluster::{Cluster, DEFAULT_CLUSTER_FILE};
pub use configuration::{Configuration, Prelude, Target, TargetOption};
