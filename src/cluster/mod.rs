//! Cluster-facing types and API client.

pub mod client;
pub mod spec;

pub use client::{ClusterApi, HttpClusterClient};
pub use spec::{InstanceRef, InstanceSpec};
