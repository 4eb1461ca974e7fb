//! Control plane for skarv, an XDP/TC Layer-4 load balancer.
//!
//! The data plane — ingress DNAT and egress SNAT programs plus the maps
//! they consult — lives in `skarv-ebpf`. This crate owns everything around
//! it: configuration, backend health probing and weight redistribution,
//! circuit breaking, conntrack sweeping, the gossip cluster, metrics, and
//! the coordinator that wires the pieces together.

pub mod circuit;
pub mod cluster;
pub mod config;
pub mod conntrack;
pub mod coordinator;
pub mod dns;
pub mod error;
pub mod health;
pub mod telemetry;

pub use config::{load_from_path, Config};
pub use coordinator::{Coordinator, DataPlane};
pub use error::{Error, Result};
