//! Health subsystem: probes, status transitions, weight redistribution.

pub mod check;
pub mod manager;
pub mod weights;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

pub use check::{run_check, CheckFailure};
pub use manager::{HealthManager, HealthStatus, TargetHealth, WeightsCallback, MAX_RECOVERY_STEP};

use crate::config::{CheckKind, HealthCheckSpec};

/// Everything a probe loop needs to know about one target.
#[derive(Clone)]
pub struct ProbeTarget {
    pub proxy: String,
    pub target_id: String,
    pub addr: SocketAddr,
    pub spec: HealthCheckSpec,
}

/// Observation sink beside the health manager; the coordinator feeds the
/// circuit breaker through this.
pub type ProbeObserver = Arc<dyn Fn(&ProbeTarget, &Result<Duration, CheckFailure>) + Send + Sync>;

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Spawn one recurring probe task per target with a spec other than `none`.
///
/// Start offsets are staggered deterministically across the interval
/// (`index * interval / total`) with ±10% jitter so a fleet of targets does
/// not probe in synchronized waves. Tasks stop when `running` flips false.
pub fn spawn_probers(
    targets: Vec<ProbeTarget>,
    manager: Arc<HealthManager>,
    observer: Option<ProbeObserver>,
    running: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let total = targets.iter().filter(|t| t.spec.kind != CheckKind::None).count().max(1);
    targets
        .into_iter()
        .filter(|t| t.spec.kind != CheckKind::None)
        .enumerate()
        .map(|(index, target)| {
            let manager = manager.clone();
            let observer = observer.clone();
            let mut running = running.clone();
            tokio::spawn(async move {
                let interval = Duration::from_millis(target.spec.interval_ms);
                let base_offset = interval.as_millis() as u64 * index as u64 / total as u64;
                let jitter_span = (interval.as_millis() as u64 / 10).max(1);
                let jitter = rand::rng().random_range(0..=2 * jitter_span);
                let offset =
                    Duration::from_millis((base_offset + jitter).saturating_sub(jitter_span));

                tokio::select! {
                    _ = tokio::time::sleep(offset) => {}
                    _ = running.changed() => {}
                }

                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                while *running.borrow() {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = running.changed() => continue,
                    }
                    let outcome = run_check(target.addr, &target.spec).await;
                    debug!(
                        proxy = target.proxy,
                        target = target.target_id,
                        ok = outcome.is_ok(),
                        "probe finished"
                    );
                    match &outcome {
                        Ok(latency) => manager.record_success(
                            &target.proxy,
                            &target.target_id,
                            now_ms(),
                            latency.as_millis() as u64,
                        ),
                        Err(e) => {
                            manager.record_failure(&target.proxy, &target.target_id, now_ms(), e)
                        }
                    }
                    if let Some(observer) = &observer {
                        observer(&target, &outcome);
                    }
                }
            })
        })
        .collect()
}
