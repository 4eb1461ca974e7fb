//! Per-proxy health state and the transition rules.
//!
//! All mutation flows through one lock per manager, so consecutive
//! success/failure counters never lose updates and observation order per
//! target is the arrival order. The weight-update callback runs while the
//! lock is held; callbacks only encode bytes into kernel maps and must not
//! re-enter the manager.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::config::HealthCheckSpec;
use crate::health::check::CheckFailure;
use crate::health::weights::redistribute;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

/// Recovery ramp length: steps 0..=3 map to 25/50/75/100%.
pub const MAX_RECOVERY_STEP: u8 = 3;

#[derive(Debug, Clone)]
pub struct TargetHealth {
    pub target_id: String,
    pub status: HealthStatus,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_check_ms: u64,
    pub last_latency_ms: Option<u64>,
    pub last_error: Option<String>,
    pub recovery_step: Option<u8>,
    /// Set while the circuit breaker excludes this target.
    pub circuit_open: bool,
    pub spec: HealthCheckSpec,
}

impl TargetHealth {
    fn new(target_id: String, spec: HealthCheckSpec) -> Self {
        Self {
            target_id,
            status: HealthStatus::Unknown,
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_check_ms: 0,
            last_latency_ms: None,
            last_error: None,
            recovery_step: None,
            circuit_open: false,
            spec,
        }
    }

    fn available(&self) -> bool {
        self.status != HealthStatus::Unhealthy && !self.circuit_open
    }
}

/// Invoked under the manager lock whenever a proxy's effective weights
/// change; receives the proxy name and the new vector.
pub type WeightsCallback = Box<dyn Fn(&str, &[u8]) + Send + Sync>;

struct ProxyHealth {
    /// Target order matches the configured route slots.
    targets: Vec<TargetHealth>,
    original_weights: Vec<u8>,
    effective_weights: Vec<u8>,
    callback: WeightsCallback,
}

impl ProxyHealth {
    fn target_mut(&mut self, target_id: &str) -> Option<&mut TargetHealth> {
        self.targets.iter_mut().find(|t| t.target_id == target_id)
    }
}

#[derive(Default)]
pub struct HealthManager {
    proxies: Mutex<HashMap<String, ProxyHealth>>,
}

impl HealthManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a proxy's targets in route-slot order. The callback is
    /// invoked on every effective-weight change.
    pub fn register_proxy(
        &self,
        proxy: &str,
        targets: Vec<(String, u8, HealthCheckSpec)>,
        callback: WeightsCallback,
    ) {
        let original: Vec<u8> = targets.iter().map(|(_, w, _)| *w).collect();
        let health = ProxyHealth {
            targets: targets
                .into_iter()
                .map(|(id, _, spec)| TargetHealth::new(id, spec))
                .collect(),
            effective_weights: original.clone(),
            original_weights: original,
            callback,
        };
        self.proxies.lock().expect("health lock").insert(proxy.to_string(), health);
    }

    pub fn unregister_proxy(&self, proxy: &str) {
        self.proxies.lock().expect("health lock").remove(proxy);
    }

    /// Targets of a proxy, in slot order.
    pub fn snapshot(&self, proxy: &str) -> Vec<TargetHealth> {
        self.proxies
            .lock()
            .expect("health lock")
            .get(proxy)
            .map(|p| p.targets.clone())
            .unwrap_or_default()
    }

    pub fn effective_weights(&self, proxy: &str) -> Vec<u8> {
        self.proxies
            .lock()
            .expect("health lock")
            .get(proxy)
            .map(|p| p.effective_weights.clone())
            .unwrap_or_default()
    }

    /// Record a successful probe.
    pub fn record_success(&self, proxy: &str, target_id: &str, now_ms: u64, latency_ms: u64) {
        let mut proxies = self.proxies.lock().expect("health lock");
        let Some(p) = proxies.get_mut(proxy) else { return };
        let Some(t) = p.target_mut(target_id) else { return };

        t.last_check_ms = now_ms;
        t.last_latency_ms = Some(latency_ms);
        t.last_error = None;
        t.consecutive_failures = 0;
        t.consecutive_successes += 1;

        match t.status {
            HealthStatus::Healthy => {
                // Advance the recovery ramp until it completes.
                if let Some(step) = t.recovery_step {
                    if step < MAX_RECOVERY_STEP {
                        t.recovery_step = Some(step + 1);
                    } else {
                        t.recovery_step = None;
                    }
                }
            }
            HealthStatus::Unknown | HealthStatus::Unhealthy => {
                if t.consecutive_successes >= t.spec.healthy_threshold {
                    info!(proxy, target = target_id, "target became healthy");
                    t.status = HealthStatus::Healthy;
                    t.recovery_step = Some(0);
                }
            }
        }

        Self::publish_if_changed(proxy, p);
    }

    /// Record a failed probe.
    pub fn record_failure(&self, proxy: &str, target_id: &str, now_ms: u64, error: &CheckFailure) {
        let mut proxies = self.proxies.lock().expect("health lock");
        let Some(p) = proxies.get_mut(proxy) else { return };
        let Some(t) = p.target_mut(target_id) else { return };

        t.last_check_ms = now_ms;
        t.last_error = Some(error.to_string());
        t.consecutive_successes = 0;
        t.consecutive_failures += 1;
        t.recovery_step = None;

        if t.status != HealthStatus::Unhealthy && t.consecutive_failures >= t.spec.unhealthy_threshold
        {
            warn!(proxy, target = target_id, %error, "target became unhealthy");
            t.status = HealthStatus::Unhealthy;
        }

        Self::publish_if_changed(proxy, p);
    }

    /// Called by the circuit breaker; an open circuit excludes the target
    /// from the weight distribution exactly like an unhealthy status.
    pub fn set_circuit_open(&self, proxy: &str, target_id: &str, open: bool) {
        let mut proxies = self.proxies.lock().expect("health lock");
        let Some(p) = proxies.get_mut(proxy) else { return };
        let Some(t) = p.target_mut(target_id) else { return };
        if t.circuit_open != open {
            t.circuit_open = open;
            Self::publish_if_changed(proxy, p);
        }
    }

    /// Apply a remote health observation (cluster sync, last-writer-wins
    /// semantics are resolved by the caller). Only the status is adopted;
    /// local counters keep their own history.
    pub fn apply_remote_status(&self, proxy: &str, target_id: &str, healthy: bool) {
        let mut proxies = self.proxies.lock().expect("health lock");
        let Some(p) = proxies.get_mut(proxy) else { return };
        let Some(t) = p.target_mut(target_id) else { return };
        let status = if healthy { HealthStatus::Healthy } else { HealthStatus::Unhealthy };
        if t.status != status {
            debug!(proxy, target = target_id, ?status, "status adopted from cluster");
            t.status = status;
            t.recovery_step = None;
            Self::publish_if_changed(proxy, p);
        }
    }

    fn publish_if_changed(proxy: &str, p: &mut ProxyHealth) {
        let available: Vec<bool> = p.targets.iter().map(|t| t.available()).collect();
        let steps: Vec<Option<u8>> = p.targets.iter().map(|t| t.recovery_step).collect();
        let effective = redistribute(&p.original_weights, &available, &steps);
        if effective != p.effective_weights {
            debug!(proxy, ?effective, "effective weights changed");
            p.effective_weights = effective;
            (p.callback)(proxy, &p.effective_weights);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn spec(healthy: u32, unhealthy: u32) -> HealthCheckSpec {
        HealthCheckSpec {
            kind: crate::config::CheckKind::Tcp,
            healthy_threshold: healthy,
            unhealthy_threshold: unhealthy,
            ..Default::default()
        }
    }

    fn manager_with_two_targets(
        healthy: u32,
        unhealthy: u32,
    ) -> (HealthManager, Arc<Mutex<Vec<Vec<u8>>>>, Arc<AtomicUsize>) {
        let manager = HealthManager::new();
        let published = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let p = published.clone();
        let c = calls.clone();
        manager.register_proxy(
            "web",
            vec![
                ("10.0.0.1:8080".into(), 50, spec(healthy, unhealthy)),
                ("10.0.0.2:8080".into(), 50, spec(healthy, unhealthy)),
            ],
            Box::new(move |_, weights| {
                c.fetch_add(1, Ordering::SeqCst);
                p.lock().unwrap().push(weights.to_vec());
            }),
        );
        (manager, published, calls)
    }

    #[test]
    fn failure_threshold_zeroes_target_and_publishes_once() {
        let (manager, published, calls) = manager_with_two_targets(2, 3);

        for _ in 0..2 {
            manager.record_failure(
                "web",
                "10.0.0.2:8080",
                1,
                &CheckFailure::ConnectionRefused,
            );
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0, "below threshold, nothing published");

        manager.record_failure("web", "10.0.0.2:8080", 1, &CheckFailure::ConnectionRefused);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(published.lock().unwrap().last().unwrap(), &vec![100, 0]);

        // Further failures change nothing and publish nothing.
        manager.record_failure("web", "10.0.0.2:8080", 1, &CheckFailure::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failure_resets_success_streak_and_vice_versa() {
        let (manager, _, _) = manager_with_two_targets(3, 3);
        manager.record_success("web", "10.0.0.1:8080", 1, 5);
        manager.record_success("web", "10.0.0.1:8080", 1, 5);
        manager.record_failure("web", "10.0.0.1:8080", 1, &CheckFailure::Timeout);
        let t = &manager.snapshot("web")[0];
        assert_eq!(t.consecutive_successes, 0);
        assert_eq!(t.consecutive_failures, 1);
        assert_eq!(t.status, HealthStatus::Unknown);
        assert_eq!(t.last_error.as_deref(), Some("timed out"));
    }

    #[test]
    fn gradual_recovery_walks_quarter_steps() {
        let (manager, published, _) = manager_with_two_targets(2, 2);

        // Take target 2 down.
        for _ in 0..2 {
            manager.record_failure("web", "10.0.0.2:8080", 1, &CheckFailure::Timeout);
        }
        assert_eq!(published.lock().unwrap().last().unwrap(), &vec![100, 0]);

        // Two successes reach the healthy threshold: recovery step 0 (25%).
        manager.record_success("web", "10.0.0.2:8080", 2, 5);
        manager.record_success("web", "10.0.0.2:8080", 2, 5);
        assert_eq!(manager.snapshot("web")[1].recovery_step, Some(0));
        assert_eq!(published.lock().unwrap().last().unwrap(), &vec![81, 19]);

        // Each further success advances the ramp: 50%, 75%, 100%.
        manager.record_success("web", "10.0.0.2:8080", 3, 5);
        assert_eq!(published.lock().unwrap().last().unwrap(), &vec![67, 33]);
        manager.record_success("web", "10.0.0.2:8080", 4, 5);
        assert_eq!(published.lock().unwrap().last().unwrap(), &vec![58, 42]);
        manager.record_success("web", "10.0.0.2:8080", 5, 5);
        assert_eq!(published.lock().unwrap().last().unwrap(), &vec![50, 50]);

        // The ramp completes and stays put.
        manager.record_success("web", "10.0.0.2:8080", 6, 5);
        assert_eq!(manager.snapshot("web")[1].recovery_step, None);
        assert_eq!(manager.effective_weights("web"), vec![50, 50]);
    }

    #[test]
    fn all_unhealthy_degrades_to_original_weights() {
        let (manager, _, _) = manager_with_two_targets(2, 1);
        manager.record_failure("web", "10.0.0.1:8080", 1, &CheckFailure::Timeout);
        manager.record_failure("web", "10.0.0.2:8080", 1, &CheckFailure::Timeout);
        assert_eq!(manager.effective_weights("web"), vec![50, 50]);
    }

    #[test]
    fn circuit_open_excludes_target() {
        let (manager, published, _) = manager_with_two_targets(2, 3);
        manager.set_circuit_open("web", "10.0.0.1:8080", true);
        assert_eq!(published.lock().unwrap().last().unwrap(), &vec![0, 100]);
        manager.set_circuit_open("web", "10.0.0.1:8080", false);
        assert_eq!(manager.effective_weights("web"), vec![50, 50]);
    }

    #[test]
    fn remote_status_is_adopted() {
        let (manager, published, _) = manager_with_two_targets(2, 3);
        manager.apply_remote_status("web", "10.0.0.2:8080", false);
        assert_eq!(published.lock().unwrap().last().unwrap(), &vec![100, 0]);
        assert_eq!(manager.snapshot("web")[1].status, HealthStatus::Unhealthy);
    }
}
