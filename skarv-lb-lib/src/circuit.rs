//! Per-target circuit breaker.
//!
//! Observations come from the health pipeline. Each target keeps a rolling
//! error window; crossing the configured error rate with enough samples
//! opens the circuit, a background ticker moves expired open circuits to
//! half-open, and half-open circuits close after enough consecutive
//! successes or re-open on the first failure. State changes are reported to
//! a callback so the owning proxy can recompute weights.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{info, warn};

use crate::config::CircuitConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Metric encoding: 0 = closed, 1 = half-open, 2 = open.
    pub fn as_metric(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

#[derive(Debug, Clone)]
struct TargetCircuit {
    state: CircuitState,
    window_start_ms: u64,
    errors: u32,
    successes: u32,
    last_transition_ms: u64,
    open_until_ms: Option<u64>,
    half_open_successes: u32,
    cfg: CircuitConfig,
}

impl TargetCircuit {
    fn new(cfg: CircuitConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            window_start_ms: 0,
            errors: 0,
            successes: 0,
            last_transition_ms: 0,
            open_until_ms: None,
            half_open_successes: 0,
            cfg,
        }
    }

    fn roll_window(&mut self, now_ms: u64) {
        if now_ms.saturating_sub(self.window_start_ms) > self.cfg.window_ms {
            self.window_start_ms = now_ms;
            self.errors = 0;
            self.successes = 0;
        }
    }

    fn error_rate_pct(&self) -> u32 {
        let total = self.errors + self.successes;
        if total == 0 {
            0
        } else {
            self.errors * 100 / total
        }
    }
}

/// `(target_id, new_state)` transition reported to the callback.
pub type StateCallback = Box<dyn Fn(&str, CircuitState) + Send + Sync>;

pub struct CircuitBreaker {
    targets: Mutex<HashMap<String, TargetCircuit>>,
    callback: StateCallback,
}

impl CircuitBreaker {
    pub fn new(callback: StateCallback) -> Self {
        Self { targets: Mutex::new(HashMap::new()), callback }
    }

    pub fn register(&self, target_id: &str, cfg: CircuitConfig) {
        self.targets
            .lock()
            .expect("circuit lock")
            .insert(target_id.to_string(), TargetCircuit::new(cfg));
    }

    pub fn unregister(&self, target_id: &str) {
        self.targets.lock().expect("circuit lock").remove(target_id);
    }

    pub fn state(&self, target_id: &str) -> Option<CircuitState> {
        self.targets.lock().expect("circuit lock").get(target_id).map(|t| t.state)
    }

    pub fn error_rate_pct(&self, target_id: &str) -> Option<u32> {
        self.targets.lock().expect("circuit lock").get(target_id).map(|t| t.error_rate_pct())
    }

    pub fn record_success(&self, target_id: &str, now_ms: u64) {
        let transition = {
            let mut targets = self.targets.lock().expect("circuit lock");
            let Some(t) = targets.get_mut(target_id) else { return };
            match t.state {
                CircuitState::Closed => {
                    t.roll_window(now_ms);
                    t.successes += 1;
                    None
                }
                CircuitState::Open => None,
                CircuitState::HalfOpen => {
                    t.half_open_successes += 1;
                    if t.half_open_successes >= t.cfg.half_open_requests {
                        info!(target = target_id, "circuit closed after successful half-open trial");
                        t.state = CircuitState::Closed;
                        t.last_transition_ms = now_ms;
                        t.open_until_ms = None;
                        t.window_start_ms = now_ms;
                        t.errors = 0;
                        t.successes = 0;
                        Some(CircuitState::Closed)
                    } else {
                        None
                    }
                }
            }
        };
        if let Some(state) = transition {
            (self.callback)(target_id, state);
        }
    }

    pub fn record_failure(&self, target_id: &str, now_ms: u64) {
        let transition = {
            let mut targets = self.targets.lock().expect("circuit lock");
            let Some(t) = targets.get_mut(target_id) else { return };
            match t.state {
                CircuitState::Closed => {
                    t.roll_window(now_ms);
                    t.errors += 1;
                    let total = t.errors + t.successes;
                    if total >= t.cfg.min_requests
                        && t.error_rate_pct() >= t.cfg.error_threshold_pct
                    {
                        warn!(
                            target = target_id,
                            errors = t.errors,
                            total,
                            "error rate over threshold, circuit opened"
                        );
                        t.state = CircuitState::Open;
                        t.last_transition_ms = now_ms;
                        t.open_until_ms = Some(now_ms + t.cfg.open_duration_ms);
                        Some(CircuitState::Open)
                    } else {
                        None
                    }
                }
                CircuitState::Open => None,
                CircuitState::HalfOpen => {
                    warn!(target = target_id, "half-open trial failed, circuit re-opened");
                    t.state = CircuitState::Open;
                    t.last_transition_ms = now_ms;
                    t.open_until_ms = Some(now_ms + t.cfg.open_duration_ms);
                    t.half_open_successes = 0;
                    Some(CircuitState::Open)
                }
            }
        };
        if let Some(state) = transition {
            (self.callback)(target_id, state);
        }
    }

    /// Move any expired open circuit to half-open. Run from a periodic
    /// ticker at `check_interval_ms`.
    pub fn tick(&self, now_ms: u64) {
        let transitions: Vec<String> = {
            let mut targets = self.targets.lock().expect("circuit lock");
            targets
                .iter_mut()
                .filter_map(|(id, t)| {
                    if t.state == CircuitState::Open
                        && t.open_until_ms.is_some_and(|until| until <= now_ms)
                    {
                        info!(target = id, "open period elapsed, circuit half-open");
                        t.state = CircuitState::HalfOpen;
                        t.half_open_successes = 0;
                        t.last_transition_ms = now_ms;
                        Some(id.clone())
                    } else {
                        None
                    }
                })
                .collect()
        };
        for id in transitions {
            (self.callback)(&id, CircuitState::HalfOpen);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    fn cfg() -> CircuitConfig {
        CircuitConfig {
            window_ms: 10_000,
            min_requests: 5,
            error_threshold_pct: 50,
            open_duration_ms: 30_000,
            half_open_requests: 3,
            check_interval_ms: 1_000,
        }
    }

    fn breaker() -> (Arc<CircuitBreaker>, Arc<StdMutex<Vec<(String, CircuitState)>>>) {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let e = events.clone();
        let cb = Arc::new(CircuitBreaker::new(Box::new(move |id, state| {
            e.lock().unwrap().push((id.to_string(), state));
        })));
        cb.register("t1", cfg());
        (cb, events)
    }

    #[test]
    fn opens_at_error_threshold_with_min_requests() {
        let (cb, events) = breaker();
        // 2 successes + 2 failures: 4 samples, below min_requests.
        cb.record_success("t1", 1_000);
        cb.record_success("t1", 1_001);
        cb.record_failure("t1", 1_002);
        cb.record_failure("t1", 1_003);
        assert_eq!(cb.state("t1"), Some(CircuitState::Closed));

        // Fifth sample brings the rate to 60% over 5 requests.
        cb.record_failure("t1", 1_004);
        assert_eq!(cb.state("t1"), Some(CircuitState::Open));
        assert_eq!(events.lock().unwrap().as_slice(), &[("t1".to_string(), CircuitState::Open)]);
    }

    #[test]
    fn window_expiry_resets_counts() {
        let (cb, _) = breaker();
        cb.record_failure("t1", 1_000);
        cb.record_failure("t1", 1_001);
        cb.record_failure("t1", 1_002);
        cb.record_failure("t1", 1_003);
        // Window rolls over: old errors are forgotten.
        cb.record_failure("t1", 20_000);
        assert_eq!(cb.state("t1"), Some(CircuitState::Closed));
        assert_eq!(cb.error_rate_pct("t1"), Some(100));
    }

    #[test]
    fn open_ignores_observations_until_tick_expires_it() {
        let (cb, events) = breaker();
        for i in 0..5 {
            cb.record_failure("t1", 1_000 + i);
        }
        assert_eq!(cb.state("t1"), Some(CircuitState::Open));

        cb.record_success("t1", 2_000);
        assert_eq!(cb.state("t1"), Some(CircuitState::Open));

        // Not yet expired.
        cb.tick(30_000);
        assert_eq!(cb.state("t1"), Some(CircuitState::Open));

        // open_until = 1004 + 30000; expired at 31_005.
        cb.tick(31_005);
        assert_eq!(cb.state("t1"), Some(CircuitState::HalfOpen));
        assert_eq!(events.lock().unwrap().last().unwrap().1, CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_closes_after_required_successes() {
        let (cb, events) = breaker();
        for i in 0..5 {
            cb.record_failure("t1", 1_000 + i);
        }
        cb.tick(40_000);
        assert_eq!(cb.state("t1"), Some(CircuitState::HalfOpen));

        cb.record_success("t1", 40_001);
        cb.record_success("t1", 40_002);
        assert_eq!(cb.state("t1"), Some(CircuitState::HalfOpen));
        cb.record_success("t1", 40_003);
        assert_eq!(cb.state("t1"), Some(CircuitState::Closed));
        assert_eq!(events.lock().unwrap().last().unwrap().1, CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_and_refreshes_deadline() {
        let (cb, _) = breaker();
        for i in 0..5 {
            cb.record_failure("t1", 1_000 + i);
        }
        cb.tick(40_000);
        cb.record_success("t1", 40_001);
        cb.record_failure("t1", 40_002);
        assert_eq!(cb.state("t1"), Some(CircuitState::Open));

        // The refreshed deadline starts from the failure.
        cb.tick(40_002 + 29_999);
        assert_eq!(cb.state("t1"), Some(CircuitState::Open));
        cb.tick(40_002 + 30_000);
        assert_eq!(cb.state("t1"), Some(CircuitState::HalfOpen));
    }

    #[test]
    fn metric_encoding() {
        assert_eq!(CircuitState::Closed.as_metric(), 0);
        assert_eq!(CircuitState::HalfOpen.as_metric(), 1);
        assert_eq!(CircuitState::Open.as_metric(), 2);
    }
}
