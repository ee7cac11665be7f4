//! Core data models for the federation control plane.
//!
//! Topology records (clusters, storage and function deployments), logical
//! buckets with their replica edges, and the tracked object cache all map to
//! database tables via `sqlx::FromRow`. The load-balancer types mirror the
//! reverse proxy's JSON configuration tree.

pub mod bucket;
pub mod cluster;
pub mod faas_deployment;
pub mod load_balancer;
pub mod object;
pub mod storage_deployment;
