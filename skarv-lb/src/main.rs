mod kernel;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

use skarv_lb_lib::config::{
    Config, ConntrackConfig, HealthCheckSpec, ProxyConfig, SourceRouteConfig, TargetConfig,
    TelemetryConfig,
};
use skarv_lb_lib::error::Error;
use skarv_lb_lib::telemetry::init_tracing;

#[derive(Parser, Debug)]
#[command(author, version, about = "skarv: XDP/TC layer-4 load balancer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct PinArg {
    /// bpffs directory holding the pinned maps (shared with `run`).
    #[arg(long, default_value = "/sys/fs/bpf/skarv")]
    pin_path: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load the data plane and run the control plane.
    Run {
        /// Configuration file (TOML or YAML).
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
        /// Interface for a single ad-hoc proxy (alternative to --config).
        #[arg(long)]
        interface: Option<String>,
        /// Listen port for the ad-hoc proxy.
        #[arg(long)]
        port: Option<u16>,
        /// Backend `ip:port` or `ip:port@weight`; repeatable.
        #[arg(long = "target")]
        targets: Vec<String>,
        /// Metrics exposition address.
        #[arg(long)]
        metrics: Option<SocketAddr>,
        /// Pin the maps for the runtime subcommands.
        #[arg(long)]
        pin_path: Option<PathBuf>,
    },
    /// Install a listen on a running data plane.
    AddProxy {
        #[command(flatten)]
        pin: PinArg,
        #[arg(long)]
        interface: String,
        #[arg(long)]
        port: u16,
        #[arg(long = "target", required = true)]
        targets: Vec<String>,
    },
    /// Remove a listen from a running data plane.
    RemoveProxy {
        #[command(flatten)]
        pin: PinArg,
        #[arg(long)]
        interface: String,
        #[arg(long)]
        port: u16,
    },
    /// Add a source-CIDR route.
    AddSourceRoute {
        #[command(flatten)]
        pin: PinArg,
        #[arg(long)]
        cidr: String,
        #[arg(long = "target", required = true)]
        targets: Vec<String>,
    },
    /// Remove a source-CIDR route.
    RemoveSourceRoute {
        #[command(flatten)]
        pin: PinArg,
        #[arg(long)]
        cidr: String,
    },
    /// Add an SNI route.
    AddSniRoute {
        #[command(flatten)]
        pin: PinArg,
        #[arg(long)]
        hostname: String,
        #[arg(long = "target", required = true)]
        targets: Vec<String>,
    },
    /// Remove an SNI route.
    RemoveSniRoute {
        #[command(flatten)]
        pin: PinArg,
        #[arg(long)]
        hostname: String,
    },
    /// Toggle per-packet stats events on every listen route.
    Stats {
        #[command(flatten)]
        pin: PinArg,
        #[arg(value_parser = ["enable", "disable"])]
        mode: String,
    },
    /// List tracked connections.
    Connections {
        #[command(flatten)]
        pin: PinArg,
    },
    /// Set the conntrack idle timeout.
    SetTimeout {
        #[command(flatten)]
        pin: PinArg,
        #[arg(long)]
        seconds: u32,
    },
    /// Print listen routes and connection counts.
    Status {
        #[command(flatten)]
        pin: PinArg,
    },
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    if let Err(err) = runtime.block_on(dispatch(cli.command)) {
        error!(%err, "command failed");
        std::process::exit(1);
    }
}

async fn dispatch(command: Command) -> skarv_lb_lib::Result<()> {
    match command {
        Command::Run { config, interface, port, targets, metrics, pin_path } => {
            let cfg = build_config(config, interface, port, targets, metrics)?;
            run(cfg, pin_path).await
        }
        #[cfg(target_os = "linux")]
        Command::AddProxy { pin, interface, port, targets } => {
            use skarv_ebpf_common::layout::ListenKey;
            use skarv_lb_lib::coordinator::resolve_ifindex;

            let plane = kernel::open_pinned(&pin.pin_path)?;
            let route = route_from_specs(&targets)?;
            let ifindex = resolve_ifindex(&interface)?;
            plane.listen.insert(ListenKey { ifindex, port }, &route)?;
            info!(interface, port, "listen installed");
            Ok(())
        }
        #[cfg(target_os = "linux")]
        Command::RemoveProxy { pin, interface, port } => {
            use skarv_ebpf_common::layout::ListenKey;
            use skarv_lb_lib::coordinator::resolve_ifindex;

            let plane = kernel::open_pinned(&pin.pin_path)?;
            let ifindex = resolve_ifindex(&interface)?;
            plane.listen.remove(ListenKey { ifindex, port })?;
            info!(interface, port, "listen removed");
            Ok(())
        }
        #[cfg(target_os = "linux")]
        Command::AddSourceRoute { pin, cidr, targets } => {
            let plane = kernel::open_pinned(&pin.pin_path)?;
            let net: ipnet_parse::Net = cidr.parse().map_err(|e| {
                Error::Config(format!("bad cidr {cidr}: {e}"))
            })?;
            let route = route_from_specs(&targets)?;
            plane.source_routes.insert(net.network(), net.prefix_len(), &route)?;
            info!(cidr, "source route added");
            Ok(())
        }
        #[cfg(target_os = "linux")]
        Command::RemoveSourceRoute { pin, cidr } => {
            let plane = kernel::open_pinned(&pin.pin_path)?;
            let net: ipnet_parse::Net = cidr.parse().map_err(|e| {
                Error::Config(format!("bad cidr {cidr}: {e}"))
            })?;
            plane.source_routes.remove(net.network(), net.prefix_len())?;
            info!(cidr, "source route removed");
            Ok(())
        }
        #[cfg(target_os = "linux")]
        Command::AddSniRoute { pin, hostname, targets } => {
            let plane = kernel::open_pinned(&pin.pin_path)?;
            let route = route_from_specs(&targets)?;
            plane.sni.insert(&hostname, &route)?;
            info!(hostname, "sni route added");
            Ok(())
        }
        #[cfg(target_os = "linux")]
        Command::RemoveSniRoute { pin, hostname } => {
            let plane = kernel::open_pinned(&pin.pin_path)?;
            plane.sni.remove(&hostname)?;
            info!(hostname, "sni route removed");
            Ok(())
        }
        #[cfg(target_os = "linux")]
        Command::Stats { pin, mode } => {
            let plane = kernel::open_pinned(&pin.pin_path)?;
            let changed = plane.listen.set_stats(mode == "enable")?;
            info!(mode, changed, "stats flag updated");
            Ok(())
        }
        #[cfg(target_os = "linux")]
        Command::Connections { pin } => {
            let plane = kernel::open_pinned(&pin.pin_path)?;
            for (key, value) in plane.conntrack.list() {
                println!(
                    "{}:{} -> {}:{} proto {} (orig {}:{}) fwd {}p/{}B rev {}p/{}B",
                    key.src_ip,
                    key.src_port,
                    key.dst_ip,
                    key.dst_port,
                    key.protocol,
                    value.orig_dst_ip,
                    value.orig_dst_port,
                    value.packets_fwd,
                    value.bytes_fwd,
                    value.packets_rev,
                    value.bytes_rev,
                );
            }
            Ok(())
        }
        #[cfg(target_os = "linux")]
        Command::SetTimeout { pin, seconds } => {
            let plane = kernel::open_pinned(&pin.pin_path)?;
            plane.settings.set_connection_timeout(seconds)?;
            info!(seconds, "conntrack idle timeout updated");
            Ok(())
        }
        #[cfg(target_os = "linux")]
        Command::Status { pin } => {
            let plane = kernel::open_pinned(&pin.pin_path)?;
            println!("idle timeout: {}s", plane.settings.get().conntrack_idle_timeout_s);
            println!("connections: {}", plane.conntrack.list().len());
            for (key, route) in plane.listen.entries() {
                let targets: Vec<String> = route
                    .targets
                    .iter()
                    .map(|t| format!("{}:{} (cum {})", t.ip, t.port, t.cum_weight))
                    .collect();
                println!(
                    "listen ifindex {} port {} flags {:#x}: {}",
                    key.ifindex,
                    key.port,
                    route.flags,
                    targets.join(", ")
                );
            }
            Ok(())
        }
        #[cfg(not(target_os = "linux"))]
        _ => Err(Error::Config("runtime commands require Linux".into())),
    }
}

/// `ip:port` or `ip:port@weight`.
fn parse_target_spec(spec: &str) -> skarv_lb_lib::Result<TargetConfig> {
    let (address, weight) = match spec.rsplit_once('@') {
        Some((address, weight)) => {
            let weight: u8 = weight
                .parse()
                .map_err(|_| Error::Config(format!("bad weight in target {spec}")))?;
            (address.to_string(), weight)
        }
        None => (spec.to_string(), 100),
    };
    Ok(TargetConfig {
        address,
        weight,
        health_check: HealthCheckSpec::default(),
        rate_limit: None,
    })
}

#[cfg(target_os = "linux")]
fn route_from_specs(
    specs: &[String],
) -> skarv_lb_lib::Result<skarv_ebpf_common::layout::RouteValue> {
    use skarv_lb_lib::health::weights::redistribute;

    let mut targets = Vec::new();
    let mut weights = Vec::new();
    for spec in specs {
        let t = parse_target_spec(spec)?;
        let addr: std::net::SocketAddrV4 = t
            .address
            .parse()
            .map_err(|_| Error::Config(format!("target {} must be ipv4:port", t.address)))?;
        targets.push((*addr.ip(), addr.port()));
        weights.push(t.weight);
    }
    let normalized = redistribute(&weights, &vec![true; weights.len()], &vec![None; weights.len()]);
    skarv_ebpf_common::layout::RouteValue::from_weights(&targets, &normalized, 0)
        .map_err(|e| Error::Map(skarv_ebpf::MapError::WouldOverflow(e)))
}

fn build_config(
    config: Option<PathBuf>,
    interface: Option<String>,
    port: Option<u16>,
    targets: Vec<String>,
    metrics: Option<SocketAddr>,
) -> skarv_lb_lib::Result<Config> {
    let mut cfg = match config {
        Some(path) => skarv_lb_lib::load_from_path(path)?,
        None => {
            let (Some(interface), Some(port)) = (interface, port) else {
                return Err(Error::Config(
                    "either --config or --interface/--port/--target are required".into(),
                ));
            };
            if targets.is_empty() {
                return Err(Error::Config("at least one --target is required".into()));
            }
            let targets = targets
                .iter()
                .map(|s| parse_target_spec(s))
                .collect::<skarv_lb_lib::Result<Vec<_>>>()?;
            Config {
                proxies: vec![ProxyConfig {
                    name: format!("{interface}:{port}"),
                    interfaces: vec![interface],
                    port,
                    targets,
                    sni_routes: Vec::new(),
                    source_routes: Vec::new(),
                    rate_limit: None,
                    circuit_breaker: None,
                    stats: false,
                }],
                cluster: None,
                telemetry: TelemetryConfig::default(),
                conntrack: ConntrackConfig::default(),
            }
        }
    };
    if metrics.is_some() {
        cfg.telemetry.metrics_listen = metrics;
    }
    Ok(cfg)
}

#[cfg(target_os = "linux")]
async fn run(cfg: Config, pin_path: Option<PathBuf>) -> skarv_lb_lib::Result<()> {
    let plane = kernel::load(&cfg, pin_path.as_deref())?;
    let coordinator = skarv_lb_lib::Coordinator::new(cfg, plane.plane)?;
    coordinator.start().await?;
    info!("running; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    coordinator.stop().await?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn run(_cfg: Config, _pin_path: Option<PathBuf>) -> skarv_lb_lib::Result<()> {
    Err(Error::Config("the data plane requires Linux".into()))
}

#[cfg(target_os = "linux")]
mod ipnet_parse {
    pub use ipnet::Ipv4Net as Net;
}
