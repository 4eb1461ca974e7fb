//! Cluster subsystem: SWIM membership, gossip transport and state sync.
//!
//! Three periodic schedules run while the manager is up:
//! - the SWIM probe cycle (direct ping, indirect ping_req fallback,
//!   suspicion with refutation, death after the suspicion deadline);
//! - rumor mongering: queued local state changes are pushed to `fanout`
//!   random peers every gossip interval;
//! - anti-entropy: a full push-pull digest exchange with one random peer,
//!   which repairs anything rumor mongering dropped.
//!
//! The pending-update queue is bounded; overflow drops the update on the
//! floor and anti-entropy resynchronizes later.

pub mod lamport;
pub mod membership;
pub mod messages;
pub mod state;
pub mod transport;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use lamport::LamportClock;
pub use membership::{Member, MemberStatus, Membership, NodeInfo};
pub use messages::{GossipMessage, MsgType};
pub use state::{should_apply, StateStore, StateType, SyncableState};
pub use transport::{ClusterError, Transport};

use crate::config::ClusterConfig;

/// Invoked for every remote state adopted under the conflict rules.
pub type AppliedCallback = Box<dyn Fn(&SyncableState) + Send + Sync>;
/// Invoked when a peer is declared dead, with its promoted shadow entries.
pub type NodeDeadCallback = Box<dyn Fn(&str, Vec<SyncableState>) + Send + Sync>;

struct PendingPing {
    node_id: String,
    address: SocketAddr,
    incarnation: u64,
    sent_ms: u64,
    went_indirect: bool,
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub struct ClusterManager {
    cfg: ClusterConfig,
    local: Mutex<NodeInfo>,
    pub membership: Membership,
    pub store: StateStore,
    pub clock: LamportClock,
    transport: Transport,
    pending_tx: mpsc::Sender<SyncableState>,
    seq: AtomicU64,
    pending_pings: Mutex<HashMap<u64, PendingPing>>,
    /// `ping_req` relays: our probe seq -> (requester, requester's seq).
    relays: Mutex<HashMap<u64, (SocketAddr, u64)>>,
    on_apply: Mutex<Option<AppliedCallback>>,
    on_node_dead: Mutex<Option<NodeDeadCallback>>,
}

impl ClusterManager {
    /// Bind the transport, contact the seeds, and start the periodic tasks.
    pub async fn start(
        cfg: ClusterConfig,
        running: watch::Receiver<bool>,
    ) -> std::io::Result<(Arc<Self>, Vec<JoinHandle<()>>)> {
        let (transport, mut inbox) =
            Transport::bind(cfg.bind, cfg.max_udp_size, running.clone()).await?;
        let now = now_ms();
        let node_id =
            cfg.node_id.clone().unwrap_or_else(|| transport.local_addr().to_string());
        info!(node_id, address = %transport.local_addr(), "cluster node starting");
        let local = NodeInfo {
            node_id,
            address: transport.local_addr(),
            incarnation: 1,
            join_time_ms: now,
            last_seen_ms: now,
            metadata: HashMap::new(),
        };

        let (pending_tx, mut pending_rx) = mpsc::channel(1_024);
        let manager = Arc::new(Self {
            cfg,
            local: Mutex::new(local),
            membership: Membership::new(),
            store: StateStore::new(),
            clock: LamportClock::new(),
            transport,
            pending_tx,
            seq: AtomicU64::new(0),
            pending_pings: Mutex::new(HashMap::new()),
            relays: Mutex::new(HashMap::new()),
            on_apply: Mutex::new(None),
            on_node_dead: Mutex::new(None),
        });

        for seed in manager.cfg.seeds.clone() {
            let join = manager.message(MsgType::Join);
            if let Err(e) = manager.transport.send(seed, &join).await {
                warn!(%seed, error = %e, "seed join failed");
            }
        }

        let mut handles = Vec::new();

        // Inbox dispatch.
        {
            let manager = manager.clone();
            let mut running = running.clone();
            handles.push(tokio::spawn(async move {
                while *running.borrow() {
                    tokio::select! {
                        _ = running.changed() => continue,
                        received = inbox.recv() => match received {
                            Some((msg, from)) => manager.handle_message(msg, from).await,
                            None => break,
                        },
                    }
                }
            }));
        }

        // SWIM probe cycle.
        {
            let manager = manager.clone();
            let mut running = running.clone();
            let interval = std::time::Duration::from_millis(manager.cfg.ping_interval_ms);
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                while *running.borrow() {
                    tokio::select! {
                        _ = running.changed() => continue,
                        _ = ticker.tick() => manager.swim_tick().await,
                    }
                }
            }));
        }

        // Rumor mongering.
        {
            let manager = manager.clone();
            let mut running = running.clone();
            let interval = std::time::Duration::from_millis(manager.cfg.gossip_interval_ms);
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                while *running.borrow() {
                    tokio::select! {
                        _ = running.changed() => continue,
                        _ = ticker.tick() => {
                            let mut batch = Vec::new();
                            while batch.len() < 64 {
                                match pending_rx.try_recv() {
                                    Ok(state) => batch.push(state),
                                    Err(_) => break,
                                }
                            }
                            if !batch.is_empty() {
                                manager.gossip_states(batch).await;
                            }
                        }
                    }
                }
            }));
        }

        // Anti-entropy.
        {
            let manager = manager.clone();
            let mut running = running.clone();
            let interval = std::time::Duration::from_millis(manager.cfg.push_pull_interval_ms);
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                // The first tick of a tokio interval fires immediately;
                // skip it so push-pull starts one interval in.
                ticker.tick().await;
                while *running.borrow() {
                    tokio::select! {
                        _ = running.changed() => continue,
                        _ = ticker.tick() => manager.push_pull_once().await,
                    }
                }
            }));
        }

        Ok((manager, handles))
    }

    pub fn local_node(&self) -> NodeInfo {
        self.local.lock().expect("cluster lock").clone()
    }

    pub fn set_on_apply(&self, callback: AppliedCallback) {
        *self.on_apply.lock().expect("cluster lock") = Some(callback);
    }

    pub fn set_on_node_dead(&self, callback: NodeDeadCallback) {
        *self.on_node_dead.lock().expect("cluster lock") = Some(callback);
    }

    /// Record a local state change and queue it for rumor mongering. A full
    /// queue drops the update; anti-entropy repairs the gap.
    pub fn queue_update(&self, state_type: StateType, key: String, value: serde_json::Value) {
        let state = SyncableState {
            state_type,
            key,
            value,
            version: self.clock.tick(),
            source_node: self.local_node().node_id,
            wall_ms: now_ms(),
        };
        self.store.record_local(state.clone());
        if self.pending_tx.try_send(state).is_err() {
            debug!("pending update queue full, dropping (anti-entropy will repair)");
        }
    }

    /// Mark the local node as draining/active; gossiped like any state.
    pub fn set_drain(&self, status: &str) {
        let key = self.local_node().node_id;
        self.queue_update(StateType::Drain, key, serde_json::json!({ "status": status }));
    }

    fn message(&self, msg_type: MsgType) -> GossipMessage {
        GossipMessage::new(msg_type, self.local_node())
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn send_to(&self, addr: SocketAddr, msg: &GossipMessage) {
        if let Err(e) = self.transport.send(addr, msg).await {
            warn!(%addr, error = %e, "gossip send failed");
        }
    }

    async fn gossip_states(&self, states: Vec<SyncableState>) {
        let peers = self.membership.sample_alive(self.cfg.fanout, &[]);
        if peers.is_empty() {
            return;
        }
        let mut msg = self.message(MsgType::Push);
        msg.states = states;
        for peer in peers {
            self.send_to(peer.address, &msg).await;
        }
    }

    async fn push_pull_once(&self) {
        let Some(peer) = self.membership.random_alive(&[]) else { return };
        let mut msg = self.message(MsgType::PushPull);
        msg.states = self.store.all();
        msg.digest = self.store.digest();
        debug!(peer = peer.node_id, states = msg.states.len(), "anti-entropy push-pull");
        self.send_to(peer.address, &msg).await;
    }

    async fn swim_tick(&self) {
        let now = now_ms();
        let timeout = self.cfg.ping_interval_ms;

        // Escalate or conclude outstanding probes.
        let mut suspects = Vec::new();
        let mut indirects = Vec::new();
        {
            let mut pending = self.pending_pings.lock().expect("cluster lock");
            pending.retain(|seq, ping| {
                if now.saturating_sub(ping.sent_ms) < timeout {
                    return true;
                }
                if !ping.went_indirect {
                    ping.went_indirect = true;
                    ping.sent_ms = now;
                    indirects.push((
                        *seq,
                        ping.node_id.clone(),
                        ping.address,
                        ping.incarnation,
                    ));
                    true
                } else {
                    suspects.push((ping.node_id.clone(), ping.incarnation));
                    false
                }
            });
        }

        for (seq, node_id, address, _) in indirects {
            let helpers =
                self.membership.sample_alive(self.cfg.indirect_pings, &[node_id.as_str()]);
            debug!(node = node_id, helpers = helpers.len(), "direct ping timed out, going indirect");
            for helper in helpers {
                let mut msg = self.message(MsgType::PingReq);
                msg.target = Some(node_id.clone());
                msg.target_addr = Some(address);
                msg.seq = seq;
                self.send_to(helper.address, &msg).await;
            }
        }

        for (node_id, incarnation) in suspects {
            if self.membership.suspect(&node_id, incarnation, now) {
                let mut msg = self.message(MsgType::Suspect);
                msg.target = Some(node_id.clone());
                msg.incarnation = incarnation;
                for peer in self.membership.sample_alive(self.cfg.fanout, &[node_id.as_str()]) {
                    self.send_to(peer.address, &msg).await;
                }
            }
        }

        // Declare overdue suspects dead and promote their shadow entries.
        let deadline = self.cfg.suspicion_mult * self.cfg.ping_interval_ms;
        for dead in self.membership.expire_suspects(now, deadline) {
            let shadows = self.store.take_shadows(&dead);
            info!(node = dead, shadows = shadows.len(), "peer dead, promoting shadow entries");
            if let Some(callback) = self.on_node_dead.lock().expect("cluster lock").as_ref() {
                callback(&dead, shadows);
            }
        }

        // Probe one random alive peer.
        if let Some(peer) = self.membership.random_alive(&[]) {
            let seq = self.next_seq();
            self.pending_pings.lock().expect("cluster lock").insert(
                seq,
                PendingPing {
                    node_id: peer.node_id.clone(),
                    address: peer.address,
                    incarnation: peer.incarnation,
                    sent_ms: now,
                    went_indirect: false,
                },
            );
            let mut msg = self.message(MsgType::Ping);
            msg.seq = seq;
            self.send_to(peer.address, &msg).await;
        }
    }

    /// Dispatch one received message. Hearing from a node at all counts as
    /// liveness for its asserted incarnation.
    pub async fn handle_message(&self, msg: GossipMessage, from: SocketAddr) {
        let now = now_ms();
        for state in &msg.states {
            self.clock.observe(state.version);
        }
        if msg.sender.node_id != self.local_node().node_id {
            self.membership.upsert_alive(msg.sender.clone(), now);
        }

        match msg.msg_type {
            MsgType::Ping => {
                let mut ack = self.message(MsgType::PingAck);
                ack.seq = msg.seq;
                self.send_to(msg.sender.address, &ack).await;
            }
            MsgType::PingAck => {
                self.pending_pings.lock().expect("cluster lock").remove(&msg.seq);
                self.membership.touch(&msg.sender.node_id, now);
                // Relay the ack to the node that asked us to probe.
                let relay = self.relays.lock().expect("cluster lock").remove(&msg.seq);
                if let Some((requester, their_seq)) = relay {
                    let mut ack = self.message(MsgType::PingAck);
                    ack.seq = their_seq;
                    ack.target = Some(msg.sender.node_id.clone());
                    self.send_to(requester, &ack).await;
                }
            }
            MsgType::PingReq => {
                if let Some(addr) = msg.target_addr {
                    let seq = self.next_seq();
                    self.relays
                        .lock()
                        .expect("cluster lock")
                        .insert(seq, (msg.sender.address, msg.seq));
                    let mut ping = self.message(MsgType::Ping);
                    ping.seq = seq;
                    self.send_to(addr, &ping).await;
                }
            }
            MsgType::Join => {
                // Answer with a full exchange so the joiner converges fast,
                // and let others hear about it.
                let mut reply = self.message(MsgType::PushPull);
                reply.states = self.store.all();
                reply.digest = self.store.digest();
                self.send_to(msg.sender.address, &reply).await;

                let mut alive = self.message(MsgType::Alive);
                alive.target = Some(msg.sender.node_id.clone());
                alive.target_addr = Some(msg.sender.address);
                alive.incarnation = msg.sender.incarnation;
                for peer in self
                    .membership
                    .sample_alive(self.cfg.fanout, &[msg.sender.node_id.as_str()])
                {
                    self.send_to(peer.address, &alive).await;
                }
            }
            MsgType::Leave => {
                info!(node = msg.sender.node_id, "peer left");
                self.membership.remove(&msg.sender.node_id);
            }
            MsgType::Suspect => {
                let subject = msg.target.clone().unwrap_or_default();
                if subject == self.local_node().node_id {
                    // Refute: assert a strictly larger incarnation.
                    let refuted = {
                        let mut local = self.local.lock().expect("cluster lock");
                        local.incarnation = local.incarnation.max(msg.incarnation) + 1;
                        local.clone()
                    };
                    info!(incarnation = refuted.incarnation, "refuting suspicion about self");
                    let mut alive = self.message(MsgType::Alive);
                    alive.target = Some(refuted.node_id.clone());
                    alive.target_addr = Some(refuted.address);
                    alive.incarnation = refuted.incarnation;
                    for peer in self.membership.alive() {
                        self.send_to(peer.address, &alive).await;
                    }
                } else {
                    self.membership.suspect(&subject, msg.incarnation, now);
                }
            }
            MsgType::Alive => {
                let subject = msg.target.clone().unwrap_or(msg.sender.node_id.clone());
                if subject != self.local_node().node_id {
                    let address = msg.target_addr.unwrap_or(msg.sender.address);
                    self.membership.upsert_alive(
                        NodeInfo {
                            node_id: subject,
                            address,
                            incarnation: msg.incarnation.max(1),
                            join_time_ms: now,
                            last_seen_ms: now,
                            metadata: HashMap::new(),
                        },
                        now,
                    );
                }
            }
            MsgType::Push => {
                self.apply_states(msg.states);
            }
            MsgType::PushPull => {
                self.apply_states(msg.states);
                let newer = self.store.newer_than(&msg.digest);
                if !newer.is_empty() {
                    let mut reply = self.message(MsgType::Push);
                    reply.states = newer;
                    self.send_to(msg.sender.address, &reply).await;
                }
            }
            MsgType::Pull => {
                let newer = self.store.newer_than(&msg.digest);
                let mut reply = self.message(MsgType::Push);
                reply.states = newer;
                self.send_to(msg.sender.address, &reply).await;
            }
            MsgType::Ack => {
                self.membership.touch(&msg.sender.node_id, now);
            }
        }
        let _ = from;
    }

    fn apply_states(&self, states: Vec<SyncableState>) {
        let local_id = self.local_node().node_id;
        let callback = self.on_apply.lock().expect("cluster lock");
        for state in states {
            if let Some(adopted) = self.store.apply_remote(state, &local_id) {
                debug!(key = adopted.digest_key(), version = adopted.version, "remote state adopted");
                if let Some(cb) = callback.as_ref() {
                    cb(&adopted);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn test_config(bind: &str, seeds: Vec<SocketAddr>) -> ClusterConfig {
        ClusterConfig {
            node_id: None,
            bind: bind.parse().unwrap(),
            seeds,
            ping_interval_ms: 100,
            suspicion_mult: 3,
            indirect_pings: 2,
            gossip_interval_ms: 50,
            push_pull_interval_ms: 500,
            fanout: 3,
            max_udp_size: 1_024,
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cond()
    }

    #[tokio::test]
    async fn two_nodes_discover_each_other_and_sync_state() {
        let (_run_tx, running) = watch::channel(true);
        let (a, _ha) = ClusterManager::start(test_config("127.0.0.1:0", vec![]), running.clone())
            .await
            .unwrap();
        let seed = a.local_node().address;
        let (b, _hb) =
            ClusterManager::start(test_config("127.0.0.1:0", vec![seed]), running.clone())
                .await
                .unwrap();

        assert!(
            wait_for(|| a.membership.alive_count() == 1 && b.membership.alive_count() == 1,
                Duration::from_secs(3))
            .await,
            "nodes did not discover each other"
        );

        let applied = Arc::new(Mutex::new(Vec::new()));
        let sink = applied.clone();
        b.set_on_apply(Box::new(move |state| {
            sink.lock().unwrap().push(state.clone());
        }));

        a.queue_update(StateType::Health, "web/10.0.0.1:8080".into(), json!({"healthy": false}));

        assert!(
            wait_for(
                || !b.store.newer_than(&HashMap::new()).is_empty(),
                Duration::from_secs(3)
            )
            .await,
            "state did not propagate"
        );
        let received = applied.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].key, "web/10.0.0.1:8080");
        assert_eq!(received[0].state_type, StateType::Health);
    }

    #[tokio::test]
    async fn suspicion_about_self_is_refuted_with_higher_incarnation() {
        let (_run_tx, running) = watch::channel(true);
        let (a, _h) = ClusterManager::start(test_config("127.0.0.1:0", vec![]), running.clone())
            .await
            .unwrap();
        let before = a.local_node().incarnation;

        let mut suspect = GossipMessage::new(
            MsgType::Suspect,
            NodeInfo {
                node_id: "accuser".into(),
                address: "127.0.0.1:1".parse().unwrap(),
                incarnation: 1,
                join_time_ms: 0,
                last_seen_ms: 0,
                metadata: HashMap::new(),
            },
        );
        suspect.target = Some(a.local_node().node_id);
        suspect.incarnation = before;
        a.handle_message(suspect, "127.0.0.1:1".parse().unwrap()).await;

        assert!(a.local_node().incarnation > before);
    }

    #[tokio::test]
    async fn drain_state_is_recorded_and_versioned() {
        let (_run_tx, running) = watch::channel(true);
        let (a, _h) = ClusterManager::start(test_config("127.0.0.1:0", vec![]), running.clone())
            .await
            .unwrap();
        a.set_drain("draining");
        let states = a.store.all();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].state_type, StateType::Drain);
        assert_eq!(states[0].key, a.local_node().node_id);
        assert_eq!(states[0].value["status"], "draining");
        let first_version = states[0].version;

        a.set_drain("drained");
        let states = a.store.all();
        assert_eq!(states[0].value["status"], "drained");
        assert!(states[0].version > first_version);
    }

    #[tokio::test]
    async fn push_pull_reply_carries_only_newer_states() {
        let (_run_tx, running) = watch::channel(true);
        let (a, _h) = ClusterManager::start(test_config("127.0.0.1:0", vec![]), running.clone())
            .await
            .unwrap();
        a.queue_update(StateType::Health, "k1".into(), json!({"healthy": true}));
        a.queue_update(StateType::Health, "k2".into(), json!({"healthy": true}));

        // A digest that already knows k1 at its current version.
        let digest = a.store.digest();
        let mut partial = HashMap::new();
        partial.insert("health/k1".to_string(), digest["health/k1"]);
        let newer = a.store.newer_than(&partial);
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].key, "k2");
    }

    #[tokio::test]
    async fn dead_peer_promotes_shadow_entries() {
        let (_run_tx, running) = watch::channel(true);
        let (a, _h) = ClusterManager::start(test_config("127.0.0.1:0", vec![]), running.clone())
            .await
            .unwrap();

        // Shadow conntrack entries arrive from a peer.
        let peer = NodeInfo {
            node_id: "peer-1".into(),
            address: "127.0.0.1:9".parse().unwrap(),
            incarnation: 1,
            join_time_ms: 0,
            last_seen_ms: 0,
            metadata: HashMap::new(),
        };
        a.membership.upsert_alive(peer.clone(), now_ms());
        let mut push = GossipMessage::new(MsgType::Push, peer);
        push.states.push(SyncableState {
            state_type: StateType::Conntrack,
            key: "flow-1".into(),
            value: json!({"orig_dst": "192.0.2.10:80"}),
            version: 1,
            source_node: "peer-1".into(),
            wall_ms: 0,
        });
        a.handle_message(push, "127.0.0.1:9".parse().unwrap()).await;
        assert_eq!(a.store.shadow_count("peer-1"), 1);

        let promoted = Arc::new(Mutex::new(Vec::new()));
        let sink = promoted.clone();
        a.set_on_node_dead(Box::new(move |node, shadows| {
            sink.lock().unwrap().push((node.to_string(), shadows.len()));
        }));

        // Suspect then let the deadline lapse; the swim tick does the rest.
        a.membership.suspect("peer-1", 1, now_ms().saturating_sub(10_000));
        a.swim_tick().await;

        let events = promoted.lock().unwrap();
        assert_eq!(events.as_slice(), &[("peer-1".to_string(), 1)]);
        assert_eq!(a.store.shadow_count("peer-1"), 0);
    }
}
