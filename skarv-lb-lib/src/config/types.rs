use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;

/// One listen: an (interface set, port) steered to a weighted target group.
#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Name used in logs, metrics labels and cluster state keys.
    pub name: String,
    /// Interfaces the ingress program watches for this listen.
    pub interfaces: Vec<String>,
    pub port: u16,
    /// 1 to 8 weighted backends.
    pub targets: Vec<TargetConfig>,
    /// Hostname-based routes consulted for TLS traffic on port 443.
    #[serde(default)]
    pub sni_routes: Vec<SniRouteConfig>,
    /// Source-CIDR routes; they take precedence over SNI and listen routing.
    #[serde(default)]
    pub source_routes: Vec<SourceRouteConfig>,
    /// Per-source token bucket applied before routing.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    /// Circuit breaker settings shared by this proxy's targets.
    #[serde(default)]
    pub circuit_breaker: Option<CircuitConfig>,
    /// Enable per-packet stats events for this proxy's routes.
    #[serde(default)]
    pub stats: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TargetConfig {
    /// `ip:port` or `host:port`; hostnames are resolved at registration.
    pub address: String,
    /// Relative weight in 0..=100.
    #[serde(default = "default_weight")]
    pub weight: u8,
    #[serde(default)]
    pub health_check: HealthCheckSpec,
    /// Per-backend token bucket applied after selection.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

fn default_weight() -> u8 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct SniRouteConfig {
    pub hostname: String,
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceRouteConfig {
    /// CIDR, e.g. `10.1.0.0/16`.
    pub cidr: String,
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    None,
    Tcp,
    Http,
    Https,
}

/// How a target is probed.
#[derive(Debug, Deserialize, Clone)]
pub struct HealthCheckSpec {
    #[serde(default = "default_check_kind")]
    pub kind: CheckKind,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Consecutive successes before an unhealthy target turns healthy.
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,
    /// Consecutive failures before a healthy target turns unhealthy.
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    /// Request path for HTTP/HTTPS checks.
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_expected_statuses")]
    pub expected_statuses: Vec<u16>,
    /// Extra trust anchors for HTTPS checks. Without this the trust store is
    /// empty and self-signed backends fail with an SSL error.
    #[serde(default)]
    pub ca_bundle: Option<PathBuf>,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            kind: CheckKind::None,
            interval_ms: default_interval_ms(),
            timeout_ms: default_timeout_ms(),
            healthy_threshold: default_healthy_threshold(),
            unhealthy_threshold: default_unhealthy_threshold(),
            path: default_path(),
            expected_statuses: default_expected_statuses(),
            ca_bundle: None,
        }
    }
}

fn default_check_kind() -> CheckKind {
    CheckKind::None
}
fn default_interval_ms() -> u64 {
    5_000
}
fn default_timeout_ms() -> u64 {
    2_000
}
fn default_healthy_threshold() -> u32 {
    2
}
fn default_unhealthy_threshold() -> u32 {
    3
}
fn default_path() -> String {
    "/".to_string()
}
fn default_expected_statuses() -> Vec<u16> {
    vec![200]
}

/// Token-bucket shape: `rate_per_sec` sustained, `burst` ceiling.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RateLimitConfig {
    pub rate_per_sec: u32,
    pub burst: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CircuitConfig {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_min_requests")]
    pub min_requests: u32,
    /// Error percentage over the window that opens the circuit.
    #[serde(default = "default_error_threshold_pct")]
    pub error_threshold_pct: u32,
    #[serde(default = "default_open_duration_ms")]
    pub open_duration_ms: u64,
    /// Successes required in half-open before closing again.
    #[serde(default = "default_half_open_requests")]
    pub half_open_requests: u32,
    /// How often open circuits are checked for expiry.
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            min_requests: default_min_requests(),
            error_threshold_pct: default_error_threshold_pct(),
            open_duration_ms: default_open_duration_ms(),
            half_open_requests: default_half_open_requests(),
            check_interval_ms: default_check_interval_ms(),
        }
    }
}

fn default_window_ms() -> u64 {
    10_000
}
fn default_min_requests() -> u32 {
    5
}
fn default_error_threshold_pct() -> u32 {
    50
}
fn default_open_duration_ms() -> u64 {
    30_000
}
fn default_half_open_requests() -> u32 {
    3
}
fn default_check_interval_ms() -> u64 {
    1_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClusterConfig {
    /// Defaults to the bind address when absent.
    #[serde(default)]
    pub node_id: Option<String>,
    /// UDP and TCP gossip bind address.
    pub bind: SocketAddr,
    /// Peers contacted on join.
    #[serde(default)]
    pub seeds: Vec<SocketAddr>,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// Suspicion deadline is `suspicion_mult * ping_interval_ms`.
    #[serde(default = "default_suspicion_mult")]
    pub suspicion_mult: u64,
    /// Indirect probes sent when a direct ping times out.
    #[serde(default = "default_indirect_pings")]
    pub indirect_pings: usize,
    #[serde(default = "default_gossip_interval_ms")]
    pub gossip_interval_ms: u64,
    #[serde(default = "default_push_pull_interval_ms")]
    pub push_pull_interval_ms: u64,
    /// Peers each rumor batch is pushed to.
    #[serde(default = "default_fanout")]
    pub fanout: usize,
    /// Payloads above this size use the TCP transport.
    #[serde(default = "default_max_udp_size")]
    pub max_udp_size: usize,
}

fn default_ping_interval_ms() -> u64 {
    1_000
}
fn default_suspicion_mult() -> u64 {
    4
}
fn default_indirect_pings() -> usize {
    3
}
fn default_gossip_interval_ms() -> u64 {
    500
}
fn default_push_pull_interval_ms() -> u64 {
    10_000
}
fn default_fanout() -> usize {
    3
}
fn default_max_udp_size() -> usize {
    1_024
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TelemetryConfig {
    /// Prometheus exposition address, e.g. `0.0.0.0:9090`. Disabled if unset.
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConntrackConfig {
    #[serde(default = "default_idle_timeout_s")]
    pub idle_timeout_s: u32,
    #[serde(default = "default_sweep_interval_s")]
    pub sweep_interval_s: u64,
    /// Keys examined per sweep pass.
    #[serde(default = "default_sweep_batch")]
    pub sweep_batch: usize,
}

impl Default for ConntrackConfig {
    fn default() -> Self {
        Self {
            idle_timeout_s: default_idle_timeout_s(),
            sweep_interval_s: default_sweep_interval_s(),
            sweep_batch: default_sweep_batch(),
        }
    }
}

fn default_idle_timeout_s() -> u32 {
    300
}
fn default_sweep_interval_s() -> u64 {
    10
}
fn default_sweep_batch() -> usize {
    4_096
}
