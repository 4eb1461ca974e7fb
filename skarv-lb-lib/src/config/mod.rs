pub mod loader;
pub mod root;
pub mod types;

pub use loader::load_from_path;
pub use root::Config;
pub use types::{
    CheckKind, CircuitConfig, ClusterConfig, ConntrackConfig, HealthCheckSpec, ProxyConfig,
    RateLimitConfig, SniRouteConfig, SourceRouteConfig, TargetConfig, TelemetryConfig,
};
