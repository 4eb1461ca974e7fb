//! The coordinator owns every subsystem and the wiring between them:
//! kernel maps and programs, per-proxy health registration, circuit
//! breakers, the conntrack sweeper, the cluster manager and the metrics
//! endpoint. Start builds everything in dependency order; stop reverses it
//! with a bounded grace period.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use skarv_ebpf::{
    BackendRateTable, ConntrackTable, ListenTable, MapKind, MemMap, RateConfigTable, RawMap,
    SettingsTable, SniTable, SourceRouteTable,
};
use skarv_ebpf_common::layout::{
    ConntrackKey, ConntrackValue, ListenKey, RateConfig, RouteValue, CONNTRACK_KEY_LEN,
    CONNTRACK_VALUE_LEN, FLAG_STATS_ENABLED, LISTEN_KEY_LEN, LPM_KEY_LEN, RATE_CONFIG_LEN,
    ROUTE_VALUE_LEN, SETTINGS_VALUE_LEN, SNI_KEY_LEN,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::circuit::{CircuitBreaker, CircuitState};
use crate::cluster::{ClusterManager, StateType, SyncableState};
use crate::config::{CheckKind, Config, ProxyConfig, TargetConfig};
use crate::conntrack::sweep;
use crate::dns::{Resolver, TargetAddr};
use crate::error::{Error, Result};
use crate::health::weights::redistribute;
use crate::health::{spawn_probers, CheckFailure, HealthManager, HealthStatus, ProbeTarget};
use crate::telemetry::{serve_metrics, Metrics};

type SharedMap = Arc<dyn RawMap>;
type ClusterSlot = Arc<Mutex<Option<Arc<ClusterManager>>>>;

/// Typed handles over the maps both kernel programs and the control plane
/// share. Backed by kernel fds in production and by `MemMap`s in tests.
pub struct DataPlane {
    pub listen: ListenTable<SharedMap>,
    pub source_routes: SourceRouteTable<SharedMap>,
    pub sni: SniTable<SharedMap>,
    pub conntrack: ConntrackTable<SharedMap>,
    pub settings: SettingsTable<SharedMap>,
    pub src_rate_config: RateConfigTable<SharedMap>,
    pub backend_rate_config: BackendRateTable<SharedMap>,
}

impl DataPlane {
    /// An in-memory plane with kernel-equivalent map semantics.
    pub fn in_memory() -> Self {
        let map =
            |kind, key, value| -> SharedMap { Arc::new(MemMap::new(kind, key, value, 65_536)) };
        Self {
            listen: ListenTable::new(map(MapKind::Hash, LISTEN_KEY_LEN, ROUTE_VALUE_LEN)),
            source_routes: SourceRouteTable::new(map(
                MapKind::LpmTrie,
                LPM_KEY_LEN,
                ROUTE_VALUE_LEN,
            )),
            sni: SniTable::new(map(MapKind::Hash, SNI_KEY_LEN, ROUTE_VALUE_LEN)),
            conntrack: ConntrackTable::new(map(
                MapKind::LruHash,
                CONNTRACK_KEY_LEN,
                CONNTRACK_VALUE_LEN,
            )),
            settings: SettingsTable::new(map(MapKind::Array, 4, SETTINGS_VALUE_LEN)),
            src_rate_config: RateConfigTable::new(map(MapKind::Array, 4, RATE_CONFIG_LEN)),
            backend_rate_config: BackendRateTable::new(map(MapKind::Hash, 8, RATE_CONFIG_LEN)),
        }
    }
}

struct RegisteredProxy {
    ifindexes: Vec<u32>,
    port: u16,
    targets: Vec<(Ipv4Addr, u16)>,
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Map an interface name to its index. Numeric names are taken literally,
/// which is what tests and explicit configs use.
pub fn resolve_ifindex(name: &str) -> Result<u32> {
    if let Ok(idx) = name.parse::<u32>() {
        return Ok(idx);
    }
    #[cfg(target_os = "linux")]
    {
        skarv_ebpf::sys::ifindex(name)
            .map_err(|source| Error::Attach { interface: name.to_string(), source })
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(Error::Config(format!("cannot resolve interface {name} on this platform")))
    }
}

pub struct Coordinator {
    config: Config,
    plane: Arc<DataPlane>,
    health: Arc<HealthManager>,
    circuit: Arc<CircuitBreaker>,
    metrics: Arc<Metrics>,
    resolver: Arc<Resolver>,
    cluster: ClusterSlot,
    proxies: Mutex<HashMap<String, RegisteredProxy>>,
    running_tx: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(config: Config, plane: DataPlane) -> Result<Self> {
        let plane = Arc::new(plane);
        let metrics = Arc::new(Metrics::new()?);
        let health = Arc::new(HealthManager::new());

        // Circuit transitions feed back into the weight pipeline: an open
        // circuit excludes the target exactly like an unhealthy probe.
        let circuit_health = health.clone();
        let circuit_metrics = metrics.clone();
        let circuit = Arc::new(CircuitBreaker::new(Box::new(move |target_id, state| {
            circuit_metrics.circuit_state.with_label_values(&[target_id]).set(state.as_metric());
            if let Some((proxy, target)) = target_id.split_once('/') {
                circuit_health.set_circuit_open(proxy, target, state == CircuitState::Open);
            }
        })));

        Ok(Self {
            config,
            plane,
            health,
            circuit,
            metrics,
            resolver: Arc::new(Resolver::new()),
            cluster: Arc::new(Mutex::new(None)),
            proxies: Mutex::new(HashMap::new()),
            running_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn health(&self) -> Arc<HealthManager> {
        self.health.clone()
    }

    pub fn circuit(&self) -> Arc<CircuitBreaker> {
        self.circuit.clone()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn plane(&self) -> Arc<DataPlane> {
        self.plane.clone()
    }

    pub fn cluster(&self) -> Option<Arc<ClusterManager>> {
        self.cluster.lock().expect("cluster slot lock").clone()
    }

    pub async fn start(&self) -> Result<()> {
        if self.running_tx.lock().expect("coordinator lock").is_some() {
            return Err(Error::AlreadyRunning);
        }
        let (tx, rx) = watch::channel(true);

        self.plane.settings.set_connection_timeout(self.config.conntrack.idle_timeout_s)?;

        let mut tasks = Vec::new();
        for proxy in self.config.proxies.clone() {
            tasks.extend(self.register_proxy(&proxy, rx.clone()).await?);
        }

        tasks.push(self.spawn_circuit_ticker(rx.clone()));
        tasks.push(self.spawn_sweeper(rx.clone()));

        if let Some(cluster_cfg) = self.config.cluster.clone() {
            let (manager, cluster_tasks) = ClusterManager::start(cluster_cfg, rx.clone()).await?;
            self.wire_cluster(&manager);
            tasks.extend(cluster_tasks);
            *self.cluster.lock().expect("cluster slot lock") = Some(manager);
        }

        if let Some(addr) = self.config.telemetry.metrics_listen {
            let metrics = self.metrics.clone();
            let running = rx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = serve_metrics(addr, metrics, running).await {
                    warn!(error = %e, "metrics endpoint failed");
                }
            }));
        }

        self.metrics.up.set(1);
        *self.running_tx.lock().expect("coordinator lock") = Some(tx);
        *self.tasks.lock().expect("coordinator lock") = tasks;
        info!(proxies = self.config.proxies.len(), "coordinator started");
        Ok(())
    }

    /// Reverse of start: stop the schedules, give in-flight work a bounded
    /// grace period, then drop what is left and clear the kernel rows.
    pub async fn stop(&self) -> Result<()> {
        let tx = self
            .running_tx
            .lock()
            .expect("coordinator lock")
            .take()
            .ok_or(Error::NotRunning)?;
        let _ = tx.send(false);

        let tasks = std::mem::take(&mut *self.tasks.lock().expect("coordinator lock"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        for task in tasks {
            if !task.is_finished() {
                task.abort();
            }
        }

        let registered = std::mem::take(&mut *self.proxies.lock().expect("coordinator lock"));
        for (name, proxy) in registered {
            for ifindex in proxy.ifindexes {
                let _ = self.plane.listen.remove(ListenKey { ifindex, port: proxy.port });
            }
            self.health.unregister_proxy(&name);
            for (ip, port) in proxy.targets {
                self.circuit.unregister(&format!("{name}/{ip}:{port}"));
            }
        }

        *self.cluster.lock().expect("cluster slot lock") = None;
        self.metrics.up.set(0);
        info!("coordinator stopped");
        Ok(())
    }

    async fn resolve_group(&self, targets: &[TargetConfig]) -> Result<Vec<(Ipv4Addr, u16)>> {
        let mut out = Vec::with_capacity(targets.len());
        for target in targets {
            let addr: TargetAddr = target
                .address
                .parse()
                .map_err(|e| Error::Config(format!("target {}: {e}", target.address)))?;
            let resolved = self.resolver.resolve(&addr).await;
            self.metrics
                .dns_up
                .with_label_values(&[&target.address])
                .set(resolved.is_ok() as i64);
            out.push(resolved?);
        }
        Ok(out)
    }

    fn route_for(targets: &[(Ipv4Addr, u16)], weights: &[u8], stats: bool) -> Result<RouteValue> {
        let flags = if stats { FLAG_STATS_ENABLED } else { 0 };
        Ok(RouteValue::from_weights(targets, weights, flags)
            .map_err(skarv_ebpf::MapError::WouldOverflow)?)
    }

    fn normalized(targets: &[TargetConfig]) -> Vec<u8> {
        let configured: Vec<u8> = targets.iter().map(|t| t.weight).collect();
        let all = vec![true; configured.len()];
        let none = vec![None; configured.len()];
        redistribute(&configured, &all, &none)
    }

    async fn register_proxy(
        &self,
        proxy: &ProxyConfig,
        running: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>> {
        let resolved = self.resolve_group(&proxy.targets).await?;
        let normalized = Self::normalized(&proxy.targets);

        let ifindexes: Vec<u32> = proxy
            .interfaces
            .iter()
            .map(|name| resolve_ifindex(name))
            .collect::<Result<_>>()?;

        let route = Self::route_for(&resolved, &normalized, proxy.stats)?;
        for &ifindex in &ifindexes {
            self.plane.listen.insert(ListenKey { ifindex, port: proxy.port }, &route)?;
        }

        for sni in &proxy.sni_routes {
            let group = self.resolve_group(&sni.targets).await?;
            let route =
                Self::route_for(&group, &Self::normalized(&sni.targets), proxy.stats)?;
            self.plane.sni.insert(&sni.hostname, &route)?;
        }

        for source in &proxy.source_routes {
            let net: ipnet::Ipv4Net = source
                .cidr
                .parse()
                .map_err(|e| Error::Config(format!("bad cidr {}: {e}", source.cidr)))?;
            let group = self.resolve_group(&source.targets).await?;
            let route =
                Self::route_for(&group, &Self::normalized(&source.targets), proxy.stats)?;
            self.plane.source_routes.insert(net.network(), net.prefix_len(), &route)?;
        }

        if let Some(limit) = proxy.rate_limit {
            self.plane.src_rate_config.set_source_policy(RateConfig {
                rate_per_sec: limit.rate_per_sec,
                burst: limit.burst,
            })?;
        }
        for (target, &(ip, port)) in proxy.targets.iter().zip(&resolved) {
            if let Some(limit) = target.rate_limit {
                self.plane.backend_rate_config.set_policy(
                    ip,
                    port,
                    RateConfig { rate_per_sec: limit.rate_per_sec, burst: limit.burst },
                )?;
            }
        }

        // Health registration: the callback rewrites this proxy's listen row
        // on every interface whenever the effective weights change.
        let plane = self.plane.clone();
        let callback_ifindexes = ifindexes.clone();
        let callback_targets = resolved.clone();
        let port = proxy.port;
        let stats = proxy.stats;
        let health_targets: Vec<_> = proxy
            .targets
            .iter()
            .zip(&resolved)
            .zip(&normalized)
            .map(|((t, &(ip, tport)), &w)| (format!("{ip}:{tport}"), w, t.health_check.clone()))
            .collect();
        self.health.register_proxy(
            &proxy.name,
            health_targets,
            Box::new(move |name, weights| {
                let route = match Self::route_for(&callback_targets, weights, stats) {
                    Ok(route) => route,
                    Err(e) => {
                        warn!(proxy = name, error = %e, "weight update produced no route");
                        return;
                    }
                };
                for &ifindex in &callback_ifindexes {
                    if let Err(e) = plane.listen.insert(ListenKey { ifindex, port }, &route) {
                        warn!(proxy = name, ifindex, error = %e, "listen row update failed");
                    }
                }
            }),
        );

        for (ip, tport) in &resolved {
            let target_id = format!("{}/{ip}:{tport}", proxy.name);
            self.circuit.register(&target_id, proxy.circuit_breaker.clone().unwrap_or_default());
        }

        let handles = spawn_probers(
            self.probe_targets(proxy, &resolved),
            self.health.clone(),
            Some(self.probe_observer()),
            running,
        );

        self.proxies.lock().expect("coordinator lock").insert(
            proxy.name.clone(),
            RegisteredProxy { ifindexes, port: proxy.port, targets: resolved },
        );
        Ok(handles)
    }

    fn probe_targets(
        &self,
        proxy: &ProxyConfig,
        resolved: &[(Ipv4Addr, u16)],
    ) -> Vec<ProbeTarget> {
        proxy
            .targets
            .iter()
            .zip(resolved)
            .filter(|(t, _)| t.health_check.kind != CheckKind::None)
            .map(|(t, &(ip, tport))| ProbeTarget {
                proxy: proxy.name.clone(),
                target_id: format!("{ip}:{tport}"),
                addr: std::net::SocketAddr::from((ip, tport)),
                spec: t.health_check.clone(),
            })
            .collect()
    }

    /// Observations feed the breaker, metrics, and (on status edges) the
    /// cluster; the health manager itself is updated by the probe loop.
    fn probe_observer(
        &self,
    ) -> Arc<dyn Fn(&ProbeTarget, &std::result::Result<Duration, CheckFailure>) + Send + Sync>
    {
        let circuit = self.circuit.clone();
        let health = self.health.clone();
        let metrics = self.metrics.clone();
        let cluster = self.cluster.clone();
        let last_status: Mutex<HashMap<String, bool>> = Mutex::new(HashMap::new());
        Arc::new(move |target, outcome| {
            let breaker_id = format!("{}/{}", target.proxy, target.target_id);
            match outcome {
                Ok(latency) => {
                    circuit.record_success(&breaker_id, now_ms());
                    metrics
                        .health_check_duration_seconds
                        .with_label_values(&[&target.proxy, &target.target_id])
                        .observe(latency.as_secs_f64());
                }
                Err(_) => circuit.record_failure(&breaker_id, now_ms()),
            }
            if let Some(rate) = circuit.error_rate_pct(&breaker_id) {
                metrics.circuit_error_rate.with_label_values(&[&breaker_id]).set(f64::from(rate));
            }

            let healthy = health
                .snapshot(&target.proxy)
                .iter()
                .find(|t| t.target_id == target.target_id)
                .map(|t| t.status == HealthStatus::Healthy)
                .unwrap_or(false);
            metrics
                .backend_healthy
                .with_label_values(&[&target.proxy, &target.target_id])
                .set(healthy as i64);

            // Gossip status edges, not every probe.
            let changed = {
                let mut last = last_status.lock().expect("status cache lock");
                last.insert(target.target_id.clone(), healthy) != Some(healthy)
            };
            if changed {
                if let Some(cluster) = cluster.lock().expect("cluster slot lock").clone() {
                    cluster.queue_update(
                        StateType::Health,
                        format!("{}/{}", target.proxy, target.target_id),
                        json!({ "healthy": healthy }),
                    );
                }
            }
        })
    }

    fn wire_cluster(&self, manager: &Arc<ClusterManager>) {
        let health = self.health.clone();
        manager.set_on_apply(Box::new(move |state: &SyncableState| match state.state_type {
            StateType::Health => {
                if let Some((proxy, target)) = state.key.split_once('/') {
                    let healthy =
                        state.value.get("healthy").and_then(|v| v.as_bool()).unwrap_or(true);
                    health.apply_remote_status(proxy, target, healthy);
                }
            }
            StateType::CircuitBreaker => {
                if let Some((proxy, target)) = state.key.split_once('/') {
                    let open = state.value.get("state").and_then(|v| v.as_str()) == Some("open");
                    health.set_circuit_open(proxy, target, open);
                }
            }
            StateType::Drain | StateType::Conntrack => {}
        }));

        let plane = self.plane.clone();
        manager.set_on_node_dead(Box::new(move |node, shadows| {
            let mut promoted = 0usize;
            for shadow in shadows {
                match decode_conntrack_state(&shadow.value) {
                    Some((key, mut value)) => {
                        value.last_seen_ns = now_ns();
                        if plane.conntrack.insert(key, &value).is_ok() {
                            promoted += 1;
                        }
                    }
                    None => warn!(node, key = shadow.key, "undecodable shadow entry"),
                }
            }
            info!(node, promoted, "promoted shadow conntrack entries");
        }));
    }

    fn spawn_circuit_ticker(&self, mut running: watch::Receiver<bool>) -> JoinHandle<()> {
        let circuit = self.circuit.clone();
        let interval = self
            .config
            .proxies
            .iter()
            .filter_map(|p| p.circuit_breaker.as_ref().map(|c| c.check_interval_ms))
            .min()
            .unwrap_or(1_000);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval));
            while *running.borrow() {
                tokio::select! {
                    _ = running.changed() => continue,
                    _ = ticker.tick() => circuit.tick(now_ms()),
                }
            }
        })
    }

    fn spawn_sweeper(&self, mut running: watch::Receiver<bool>) -> JoinHandle<()> {
        let plane = self.plane.clone();
        let metrics = self.metrics.clone();
        let cluster = self.cluster.clone();
        let cfg = self.config.conntrack.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(cfg.sweep_interval_s));
            let mut last = (0u64, 0u64, 0u64, 0u64);
            while *running.borrow() {
                tokio::select! {
                    _ = running.changed() => continue,
                    _ = ticker.tick() => {
                        let stats =
                            sweep(&plane.conntrack, &plane.settings, now_ns(), cfg.sweep_batch);
                        metrics.connections_active.set(stats.active as i64);
                        metrics
                            .conntrack_removed_total
                            .with_label_values(&["idle"])
                            .inc_by(stats.removed as u64);
                        // Totals over live flows can shrink as entries
                        // expire; counters publish the positive deltas.
                        let totals =
                            (stats.bytes_fwd, stats.bytes_rev, stats.packets_fwd, stats.packets_rev);
                        metrics
                            .bytes_total
                            .with_label_values(&["fwd"])
                            .inc_by(totals.0.saturating_sub(last.0));
                        metrics
                            .bytes_total
                            .with_label_values(&["rev"])
                            .inc_by(totals.1.saturating_sub(last.1));
                        metrics
                            .packets_total
                            .with_label_values(&["fwd"])
                            .inc_by(totals.2.saturating_sub(last.2));
                        metrics
                            .packets_total
                            .with_label_values(&["rev"])
                            .inc_by(totals.3.saturating_sub(last.3));
                        last = totals;

                        // Replicate live entries to peers as shadow state.
                        if let Some(cluster) = cluster.lock().expect("cluster slot lock").clone() {
                            metrics.cluster_members.set(cluster.membership.alive_count() as i64);
                            for (key, value) in
                                plane.conntrack.list().into_iter().take(cfg.sweep_batch)
                            {
                                cluster.queue_update(
                                    StateType::Conntrack,
                                    format!(
                                        "{}:{}-{}:{}/{}",
                                        key.src_ip,
                                        key.src_port,
                                        key.dst_ip,
                                        key.dst_port,
                                        key.protocol
                                    ),
                                    encode_conntrack_state(&key, &value),
                                );
                            }
                        }
                    }
                }
            }
        })
    }
}

/// JSON encoding of a conntrack row for shadow replication.
pub fn encode_conntrack_state(key: &ConntrackKey, value: &ConntrackValue) -> serde_json::Value {
    json!({
        "src_ip": key.src_ip.to_string(),
        "dst_ip": key.dst_ip.to_string(),
        "src_port": key.src_port,
        "dst_port": key.dst_port,
        "protocol": key.protocol,
        "orig_dst_ip": value.orig_dst_ip.to_string(),
        "orig_dst_port": value.orig_dst_port,
        "nat_dst_ip": value.nat_dst_ip.to_string(),
        "nat_dst_port": value.nat_dst_port,
        "created_ns": value.created_ns,
        "last_seen_ns": value.last_seen_ns,
        "packets_fwd": value.packets_fwd,
        "packets_rev": value.packets_rev,
        "bytes_fwd": value.bytes_fwd,
        "bytes_rev": value.bytes_rev,
    })
}

pub fn decode_conntrack_state(value: &serde_json::Value) -> Option<(ConntrackKey, ConntrackValue)> {
    let ip = |field: &str| -> Option<Ipv4Addr> { value.get(field)?.as_str()?.parse().ok() };
    let num = |field: &str| -> Option<u64> { value.get(field)?.as_u64() };
    let key = ConntrackKey {
        src_ip: ip("src_ip")?,
        dst_ip: ip("dst_ip")?,
        src_port: num("src_port")? as u16,
        dst_port: num("dst_port")? as u16,
        protocol: num("protocol")? as u8,
    };
    let val = ConntrackValue {
        orig_dst_ip: ip("orig_dst_ip")?,
        orig_dst_port: num("orig_dst_port")? as u16,
        nat_dst_ip: ip("nat_dst_ip")?,
        nat_dst_port: num("nat_dst_port")? as u16,
        created_ns: num("created_ns")?,
        last_seen_ns: num("last_seen_ns")?,
        packets_fwd: num("packets_fwd")?,
        packets_rev: num("packets_rev")?,
        bytes_fwd: num("bytes_fwd")?,
        bytes_rev: num("bytes_rev")?,
    };
    Some((key, val))
}
