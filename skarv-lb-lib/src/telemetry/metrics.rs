//! Prometheus metric surface and the exposition endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::Result;

#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    pub up: IntGauge,
    pub info: IntGaugeVec,
    pub connections_active: IntGauge,
    /// 1 healthy / 0 unhealthy per (proxy, target).
    pub backend_healthy: IntGaugeVec,
    /// 0 closed / 1 half-open / 2 open.
    pub circuit_state: IntGaugeVec,
    pub circuit_error_rate: GaugeVec,
    pub dns_up: IntGaugeVec,
    pub bytes_total: IntCounterVec,
    pub packets_total: IntCounterVec,
    pub conntrack_removed_total: IntCounterVec,
    pub health_check_duration_seconds: HistogramVec,
    pub cluster_members: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let up = IntGauge::new("skarv_up", "Whether the coordinator is running")
            .map_err(reg_err)?;
        let info = IntGaugeVec::new(
            Opts::new("skarv_info", "Build information"),
            &["version"],
        )
        .map_err(reg_err)?;
        let connections_active = IntGauge::new(
            "skarv_connections_active",
            "Tracked connections after the last sweep",
        )
        .map_err(reg_err)?;
        let backend_healthy = IntGaugeVec::new(
            Opts::new("skarv_backend_healthy", "Backend health (1 healthy, 0 unhealthy)"),
            &["proxy", "target"],
        )
        .map_err(reg_err)?;
        let circuit_state = IntGaugeVec::new(
            Opts::new(
                "skarv_circuit_state",
                "Circuit breaker state (0 closed, 1 half-open, 2 open)",
            ),
            &["target"],
        )
        .map_err(reg_err)?;
        let circuit_error_rate = GaugeVec::new(
            Opts::new("skarv_circuit_error_rate", "Rolling-window error rate percentage"),
            &["target"],
        )
        .map_err(reg_err)?;
        let dns_up = IntGaugeVec::new(
            Opts::new("skarv_dns_up", "Whether the target's hostname resolves"),
            &["target"],
        )
        .map_err(reg_err)?;
        let bytes_total = IntCounterVec::new(
            Opts::new("skarv_bytes_total", "Bytes through tracked flows"),
            &["direction"],
        )
        .map_err(reg_err)?;
        let packets_total = IntCounterVec::new(
            Opts::new("skarv_packets_total", "Packets through tracked flows"),
            &["direction"],
        )
        .map_err(reg_err)?;
        let conntrack_removed_total = IntCounterVec::new(
            Opts::new("skarv_conntrack_removed_total", "Connections removed by the sweeper"),
            &["reason"],
        )
        .map_err(reg_err)?;
        let health_check_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "skarv_health_check_duration_seconds",
                "Health check latency",
            )
            .buckets(vec![0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
            &["proxy", "target"],
        )
        .map_err(reg_err)?;
        let cluster_members = IntGauge::new(
            "skarv_cluster_members",
            "Alive peers in the cluster view",
        )
        .map_err(reg_err)?;

        for metric in [
            Box::new(up.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(info.clone()),
            Box::new(connections_active.clone()),
            Box::new(backend_healthy.clone()),
            Box::new(circuit_state.clone()),
            Box::new(circuit_error_rate.clone()),
            Box::new(dns_up.clone()),
            Box::new(bytes_total.clone()),
            Box::new(packets_total.clone()),
            Box::new(conntrack_removed_total.clone()),
            Box::new(health_check_duration_seconds.clone()),
            Box::new(cluster_members.clone()),
        ] {
            registry.register(metric).map_err(reg_err)?;
        }

        info.with_label_values(&[env!("CARGO_PKG_VERSION")]).set(1);

        Ok(Self {
            registry,
            up,
            info,
            connections_active,
            backend_healthy,
            circuit_state,
            circuit_error_rate,
            dns_up,
            bytes_total,
            packets_total,
            conntrack_removed_total,
            health_check_duration_seconds,
            cluster_members,
        })
    }

    pub fn render(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            warn!(error = %e, "metric encoding failed");
        }
        buf
    }
}

fn reg_err<E: std::fmt::Display>(e: E) -> crate::error::Error {
    crate::error::Error::Config(format!("metrics registration: {e}"))
}

/// Serve `/metrics` until `running` flips false.
pub async fn serve_metrics(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut running: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "metrics endpoint listening");

    while *running.borrow() {
        tokio::select! {
            _ = running.changed() => continue,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "metrics accept error");
                        continue;
                    }
                };
                let metrics = metrics.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let metrics = metrics.clone();
                        async move {
                            let response = if req.uri().path() == "/metrics" {
                                Response::builder()
                                    .status(StatusCode::OK)
                                    .header("Content-Type", "text/plain; version=0.0.4")
                                    .body(Full::new(Bytes::from(metrics.render())))
                            } else {
                                Response::builder()
                                    .status(StatusCode::NOT_FOUND)
                                    .body(Full::new(Bytes::from("Not Found")))
                            };
                            response.map_err(|e| std::io::Error::other(e.to_string()))
                        }
                    });
                    if let Err(e) =
                        http1::Builder::new().serve_connection(TokioIo::new(stream), svc).await
                    {
                        warn!(?peer, error = %e, "metrics connection error");
                    }
                });
            }
        }
    }
    Ok(())
}
