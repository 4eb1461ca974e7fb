//! Synced state and the per-type conflict rules.
//!
//! Each state type resolves conflicts differently:
//!
//! - **Health** is last-writer-wins by Lamport version.
//! - **Circuit breaker** is safety-biased: a remote `open` always displaces a
//!   non-open local view (so one node tripping a backend stops the whole
//!   cluster from hammering it), and the converse holds too — while the
//!   local view is `open`, no remote non-open state is believed, whatever
//!   its version; only a newer `open` may displace an `open`. Between
//!   non-open states, `half_open` displaces `closed` and `closed` needs a
//!   strictly newer version. Re-closing propagates when the owning node
//!   records it locally and gossips the new state.
//! - **Drain**: `draining` beats `active` in both directions — a remote
//!   `active` never overrides a local `draining`; `drained` is
//!   informational and never overrides a local `draining` either.
//! - **Conntrack** entries from peers are not applied to routing at all:
//!   they are held as shadow entries per owner node and only promoted when
//!   that owner is declared dead.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateType {
    Health,
    CircuitBreaker,
    Drain,
    Conntrack,
}

impl StateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateType::Health => "health",
            StateType::CircuitBreaker => "circuit_breaker",
            StateType::Drain => "drain",
            StateType::Conntrack => "conntrack",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncableState {
    pub state_type: StateType,
    pub key: String,
    pub value: serde_json::Value,
    /// Lamport version at the originating node.
    pub version: u64,
    pub source_node: String,
    pub wall_ms: u64,
}

impl SyncableState {
    pub fn digest_key(&self) -> String {
        format!("{}/{}", self.state_type.as_str(), self.key)
    }
}

fn circuit_rank(value: &serde_json::Value) -> u8 {
    match value.get("state").and_then(|s| s.as_str()) {
        Some("open") => 2,
        Some("half_open") => 1,
        _ => 0,
    }
}

fn drain_status(value: &serde_json::Value) -> &str {
    value.get("status").and_then(|s| s.as_str()).unwrap_or("active")
}

/// Whether `remote` should displace `local` under the per-type rules.
pub fn should_apply(local: Option<&SyncableState>, remote: &SyncableState) -> bool {
    let Some(local) = local else { return true };
    match remote.state_type {
        StateType::Health => remote.version > local.version,
        StateType::CircuitBreaker => {
            let (lr, rr) = (circuit_rank(&local.value), circuit_rank(&remote.value));
            if lr == 2 {
                // A local open yields only to a newer open; any non-open
                // remote would re-admit traffic this node cut off.
                return rr == 2 && remote.version > local.version;
            }
            match rr {
                2 => true,
                1 => lr == 0 || remote.version > local.version,
                _ => remote.version > local.version,
            }
        }
        StateType::Drain => {
            let (ls, rs) = (drain_status(&local.value), drain_status(&remote.value));
            match (ls, rs) {
                ("active", "draining") => true,
                ("draining", "active") => false,
                ("draining", "drained") => false,
                _ => remote.version > local.version,
            }
        }
        // Shadow handling happens in the store, not here.
        StateType::Conntrack => true,
    }
}

/// In-memory store of the newest known state per `(type, key)`, plus the
/// conntrack shadow sets per owner.
#[derive(Default)]
pub struct StateStore {
    entries: Mutex<HashMap<String, SyncableState>>,
    shadows: Mutex<HashMap<String, HashMap<String, SyncableState>>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a locally originated state; local writes are authoritative.
    pub fn record_local(&self, state: SyncableState) {
        self.entries.lock().expect("state lock").insert(state.digest_key(), state);
    }

    /// Apply a remote state under the conflict rules. Conntrack states are
    /// diverted into the shadow set of their owner. Returns the state if it
    /// was adopted (so the caller can propagate it to the subsystems).
    pub fn apply_remote(&self, state: SyncableState, local_node: &str) -> Option<SyncableState> {
        if state.source_node == local_node {
            return None;
        }
        if state.state_type == StateType::Conntrack {
            self.shadows
                .lock()
                .expect("state lock")
                .entry(state.source_node.clone())
                .or_default()
                .insert(state.key.clone(), state);
            return None;
        }
        let mut entries = self.entries.lock().expect("state lock");
        let key = state.digest_key();
        if should_apply(entries.get(&key), &state) {
            entries.insert(key, state.clone());
            Some(state)
        } else {
            None
        }
    }

    /// `(state_type/key) -> version` summary of everything held locally.
    pub fn digest(&self) -> HashMap<String, u64> {
        self.entries
            .lock()
            .expect("state lock")
            .iter()
            .map(|(k, v)| (k.clone(), v.version))
            .collect()
    }

    pub fn all(&self) -> Vec<SyncableState> {
        self.entries.lock().expect("state lock").values().cloned().collect()
    }

    /// States newer than the peer's digest (absent entries count as version
    /// zero) — the push half of a push-pull exchange.
    pub fn newer_than(&self, digest: &HashMap<String, u64>) -> Vec<SyncableState> {
        self.entries
            .lock()
            .expect("state lock")
            .values()
            .filter(|s| digest.get(&s.digest_key()).copied().unwrap_or(0) < s.version)
            .cloned()
            .collect()
    }

    /// Number of shadow entries currently held for `owner`.
    pub fn shadow_count(&self, owner: &str) -> usize {
        self.shadows.lock().expect("state lock").get(owner).map_or(0, |m| m.len())
    }

    /// The owner died: hand its shadow entries to the caller for promotion
    /// into the live conntrack table and clear the set.
    pub fn take_shadows(&self, owner: &str) -> Vec<SyncableState> {
        self.shadows
            .lock()
            .expect("state lock")
            .remove(owner)
            .map(|m| m.into_values().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(
        state_type: StateType,
        key: &str,
        value: serde_json::Value,
        version: u64,
        source: &str,
    ) -> SyncableState {
        SyncableState {
            state_type,
            key: key.to_string(),
            value,
            version,
            source_node: source.to_string(),
            wall_ms: 0,
        }
    }

    #[test]
    fn health_is_last_writer_wins_by_version() {
        let local = state(StateType::Health, "web/t1", json!({"healthy": true}), 5, "n1");
        let older = state(StateType::Health, "web/t1", json!({"healthy": false}), 4, "n2");
        let newer = state(StateType::Health, "web/t1", json!({"healthy": false}), 6, "n2");
        assert!(!should_apply(Some(&local), &older));
        assert!(!should_apply(Some(&local), &state(StateType::Health, "web/t1", json!({}), 5, "n2")));
        assert!(should_apply(Some(&local), &newer));
        assert!(should_apply(None, &older));
    }

    #[test]
    fn circuit_open_beats_non_open_regardless_of_version() {
        let closed = state(StateType::CircuitBreaker, "t1", json!({"state": "closed"}), 10, "n1");
        let open_old = state(StateType::CircuitBreaker, "t1", json!({"state": "open"}), 2, "n2");
        assert!(should_apply(Some(&closed), &open_old));

        let half = state(StateType::CircuitBreaker, "t1", json!({"state": "half_open"}), 3, "n2");
        assert!(should_apply(Some(&closed), &half), "half_open beats closed");

        let open_local = state(StateType::CircuitBreaker, "t1", json!({"state": "open"}), 5, "n1");
        assert!(!should_apply(Some(&open_local), &half), "half_open does not displace an open");
        let closed_old = state(StateType::CircuitBreaker, "t1", json!({"state": "closed"}), 4, "n2");
        assert!(!should_apply(Some(&open_local), &closed_old));
        let closed_new = state(StateType::CircuitBreaker, "t1", json!({"state": "closed"}), 9, "n2");
        assert!(
            !should_apply(Some(&open_local), &closed_new),
            "no non-open state displaces an open, whatever its version"
        );
        let half_new =
            state(StateType::CircuitBreaker, "t1", json!({"state": "half_open"}), 9, "n2");
        assert!(!should_apply(Some(&open_local), &half_new));

        // Only a newer open displaces an open.
        let open_new = state(StateType::CircuitBreaker, "t1", json!({"state": "open"}), 9, "n2");
        assert!(should_apply(Some(&open_local), &open_new));
        let open_stale = state(StateType::CircuitBreaker, "t1", json!({"state": "open"}), 5, "n2");
        assert!(!should_apply(Some(&open_local), &open_stale));
    }

    #[test]
    fn drain_rules() {
        let active = state(StateType::Drain, "n9", json!({"status": "active"}), 10, "n1");
        let draining_old = state(StateType::Drain, "n9", json!({"status": "draining"}), 1, "n2");
        assert!(should_apply(Some(&active), &draining_old), "draining beats active");

        let draining = state(StateType::Drain, "n9", json!({"status": "draining"}), 5, "n1");
        let drained = state(StateType::Drain, "n9", json!({"status": "drained"}), 9, "n2");
        assert!(!should_apply(Some(&draining), &drained), "drained never overrides draining");

        let active_new = state(StateType::Drain, "n9", json!({"status": "active"}), 9, "n2");
        assert!(
            !should_apply(Some(&draining), &active_new),
            "draining beats active regardless of version"
        );
    }

    #[test]
    fn conntrack_goes_to_shadows_and_promotes_on_death() {
        let store = StateStore::new();
        let s1 = state(StateType::Conntrack, "flow1", json!({"b": 1}), 1, "peer");
        let s2 = state(StateType::Conntrack, "flow2", json!({"b": 2}), 2, "peer");
        assert!(store.apply_remote(s1.clone(), "local").is_none());
        assert!(store.apply_remote(s2, "local").is_none());
        assert_eq!(store.shadow_count("peer"), 2);
        // Shadows do not appear in the digest or the synced entries.
        assert!(store.digest().is_empty());

        let promoted = store.take_shadows("peer");
        assert_eq!(promoted.len(), 2);
        assert_eq!(store.shadow_count("peer"), 0);
        assert!(store.take_shadows("peer").is_empty());
        // Re-received entries key by flow, not duplicated.
        store.apply_remote(s1.clone(), "local");
        store.apply_remote(s1, "local");
        assert_eq!(store.shadow_count("peer"), 1);
    }

    #[test]
    fn own_states_are_not_reapplied() {
        let store = StateStore::new();
        let s = state(StateType::Health, "web/t1", json!({"healthy": false}), 3, "local");
        assert!(store.apply_remote(s, "local").is_none());
    }

    #[test]
    fn newer_than_respects_digest() {
        let store = StateStore::new();
        store.record_local(state(StateType::Health, "a", json!({}), 3, "n1"));
        store.record_local(state(StateType::Health, "b", json!({}), 7, "n1"));

        let mut digest = HashMap::new();
        digest.insert("health/a".to_string(), 3u64);
        digest.insert("health/b".to_string(), 5u64);
        let newer = store.newer_than(&digest);
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].key, "b");

        // Unknown entries count as version 0.
        let newer = store.newer_than(&HashMap::new());
        assert_eq!(newer.len(), 2);
    }
}
