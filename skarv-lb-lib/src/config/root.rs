use serde::Deserialize;

use super::types::{ClusterConfig, ConntrackConfig, ProxyConfig, TelemetryConfig};

/// Main configuration structure.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Proxies to install. At least one is required.
    pub proxies: Vec<ProxyConfig>,
    /// Cluster membership and state sync (optional; standalone otherwise).
    #[serde(default)]
    pub cluster: Option<ClusterConfig>,
    /// Metrics endpoint configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Conntrack sweeping.
    #[serde(default)]
    pub conntrack: ConntrackConfig,
}
