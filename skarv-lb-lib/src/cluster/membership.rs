//! SWIM-style membership: alive/suspected/dead with incarnation numbers.
//!
//! Suspicion is refutable: a node that learns it is suspected bumps its own
//! incarnation and broadcasts `alive`; peers accept the refutation when the
//! incarnation is at least what they saw suspected. A suspect that is not
//! refuted within the deadline is declared dead.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use rand::prelude::IndexedRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub address: SocketAddr,
    pub incarnation: u64,
    pub join_time_ms: u64,
    pub last_seen_ms: u64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Alive,
    Suspected,
    Dead,
}

#[derive(Debug, Clone)]
pub struct Member {
    pub info: NodeInfo,
    pub status: MemberStatus,
    pub suspected_at_ms: Option<u64>,
}

/// The peer view of one node. The local node is not a member of its own map.
#[derive(Default)]
pub struct Membership {
    peers: Mutex<HashMap<String, Member>>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge knowledge of a peer. A higher incarnation always wins and
    /// clears suspicion; an equal incarnation refreshes liveness only if the
    /// peer is not currently suspected (a suspicion at incarnation `i` needs
    /// `>= i` asserted by the node itself, which bumps to `i + 1`).
    pub fn upsert_alive(&self, info: NodeInfo, now_ms: u64) -> bool {
        let mut peers = self.peers.lock().expect("membership lock");
        match peers.get_mut(&info.node_id) {
            Some(member) => {
                let known = member.info.incarnation;
                let accepted = match member.status {
                    MemberStatus::Alive => info.incarnation >= known,
                    MemberStatus::Suspected | MemberStatus::Dead => info.incarnation >= known,
                };
                if accepted {
                    if member.status != MemberStatus::Alive {
                        info!(node = info.node_id, incarnation = info.incarnation, "peer alive again");
                    }
                    member.info.incarnation = info.incarnation.max(known);
                    member.info.address = info.address;
                    member.info.last_seen_ms = now_ms;
                    member.status = MemberStatus::Alive;
                    member.suspected_at_ms = None;
                }
                accepted
            }
            None => {
                info!(node = info.node_id, address = %info.address, "peer joined");
                peers.insert(
                    info.node_id.clone(),
                    Member {
                        info: NodeInfo { last_seen_ms: now_ms, ..info },
                        status: MemberStatus::Alive,
                        suspected_at_ms: None,
                    },
                );
                true
            }
        }
    }

    /// Record that probes to the node failed (directly and indirectly).
    /// Suspicion at an incarnation lower than the known one is stale noise.
    pub fn suspect(&self, node_id: &str, incarnation: u64, now_ms: u64) -> bool {
        let mut peers = self.peers.lock().expect("membership lock");
        let Some(member) = peers.get_mut(node_id) else { return false };
        if incarnation < member.info.incarnation || member.status != MemberStatus::Alive {
            return false;
        }
        warn!(node = node_id, incarnation, "peer suspected");
        member.status = MemberStatus::Suspected;
        member.suspected_at_ms = Some(now_ms);
        true
    }

    /// Declare suspects dead once their deadline passes. Returns the ids.
    pub fn expire_suspects(&self, now_ms: u64, deadline_ms: u64) -> Vec<String> {
        let mut peers = self.peers.lock().expect("membership lock");
        let mut dead = Vec::new();
        for (id, member) in peers.iter_mut() {
            if member.status == MemberStatus::Suspected
                && member
                    .suspected_at_ms
                    .is_some_and(|at| now_ms.saturating_sub(at) >= deadline_ms)
            {
                warn!(node = id, "suspicion deadline passed, peer dead");
                member.status = MemberStatus::Dead;
                dead.push(id.clone());
            }
        }
        dead
    }

    pub fn remove(&self, node_id: &str) {
        self.peers.lock().expect("membership lock").remove(node_id);
    }

    pub fn touch(&self, node_id: &str, now_ms: u64) {
        if let Some(member) = self.peers.lock().expect("membership lock").get_mut(node_id) {
            member.info.last_seen_ms = now_ms;
        }
    }

    pub fn get(&self, node_id: &str) -> Option<Member> {
        self.peers.lock().expect("membership lock").get(node_id).cloned()
    }

    pub fn members(&self) -> Vec<Member> {
        self.peers.lock().expect("membership lock").values().cloned().collect()
    }

    pub fn alive(&self) -> Vec<NodeInfo> {
        self.peers
            .lock()
            .expect("membership lock")
            .values()
            .filter(|m| m.status == MemberStatus::Alive)
            .map(|m| m.info.clone())
            .collect()
    }

    pub fn alive_count(&self) -> usize {
        self.alive().len()
    }

    /// Up to `k` distinct random alive peers, excluding `exclude`.
    pub fn sample_alive(&self, k: usize, exclude: &[&str]) -> Vec<NodeInfo> {
        let candidates: Vec<NodeInfo> = self
            .alive()
            .into_iter()
            .filter(|n| !exclude.contains(&n.node_id.as_str()))
            .collect();
        let mut rng = rand::rng();
        candidates.choose_multiple(&mut rng, k.min(candidates.len())).cloned().collect()
    }

    pub fn random_alive(&self, exclude: &[&str]) -> Option<NodeInfo> {
        self.sample_alive(1, exclude).into_iter().next()
    }

    /// Peers we never heard from within `stale_ms` despite being alive; used
    /// for debug logging only.
    pub fn stale(&self, now_ms: u64, stale_ms: u64) -> Vec<String> {
        let peers = self.peers.lock().expect("membership lock");
        let stale: Vec<String> = peers
            .values()
            .filter(|m| {
                m.status == MemberStatus::Alive
                    && now_ms.saturating_sub(m.info.last_seen_ms) > stale_ms
            })
            .map(|m| m.info.node_id.clone())
            .collect();
        if !stale.is_empty() {
            debug!(?stale, "peers quiet past staleness window");
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, incarnation: u64) -> NodeInfo {
        NodeInfo {
            node_id: id.to_string(),
            address: "127.0.0.1:7946".parse().unwrap(),
            incarnation,
            join_time_ms: 0,
            last_seen_ms: 0,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn join_suspect_refute_cycle() {
        let m = Membership::new();
        assert!(m.upsert_alive(node("n2", 1), 100));
        assert_eq!(m.alive_count(), 1);

        assert!(m.suspect("n2", 1, 200));
        assert_eq!(m.alive_count(), 0);

        // Refutation with a lower incarnation is rejected...
        assert!(!m.upsert_alive(node("n2", 0), 300));
        assert_eq!(m.get("n2").unwrap().status, MemberStatus::Suspected);

        // ...but an incarnation >= the suspected one re-adds to alive.
        assert!(m.upsert_alive(node("n2", 2), 400));
        assert_eq!(m.get("n2").unwrap().status, MemberStatus::Alive);
        assert_eq!(m.get("n2").unwrap().info.incarnation, 2);
    }

    #[test]
    fn refutation_with_equal_incarnation_is_accepted() {
        let m = Membership::new();
        m.upsert_alive(node("n2", 3), 100);
        m.suspect("n2", 3, 200);
        assert!(m.upsert_alive(node("n2", 3), 300));
        assert_eq!(m.get("n2").unwrap().status, MemberStatus::Alive);
    }

    #[test]
    fn stale_suspicion_is_ignored() {
        let m = Membership::new();
        m.upsert_alive(node("n2", 5), 100);
        assert!(!m.suspect("n2", 4, 200), "suspicion below known incarnation");
        assert_eq!(m.get("n2").unwrap().status, MemberStatus::Alive);
    }

    #[test]
    fn suspects_expire_to_dead_after_deadline() {
        let m = Membership::new();
        m.upsert_alive(node("n2", 1), 0);
        m.suspect("n2", 1, 1_000);
        assert!(m.expire_suspects(2_000, 4_000).is_empty());
        let dead = m.expire_suspects(5_000, 4_000);
        assert_eq!(dead, vec!["n2".to_string()]);
        assert_eq!(m.get("n2").unwrap().status, MemberStatus::Dead);
        // Expiry is idempotent.
        assert!(m.expire_suspects(9_000, 4_000).is_empty());
    }

    #[test]
    fn sampling_excludes_and_bounds() {
        let m = Membership::new();
        for i in 0..5 {
            m.upsert_alive(node(&format!("n{i}"), 1), 0);
        }
        let sample = m.sample_alive(3, &["n0"]);
        assert_eq!(sample.len(), 3);
        assert!(sample.iter().all(|n| n.node_id != "n0"));
        let all = m.sample_alive(10, &[]);
        assert_eq!(all.len(), 5);
    }
}
