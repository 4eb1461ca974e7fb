//! Gossip wire format: self-describing JSON records, one message per UDP
//! datagram or newline-terminated TCP frame.

use std::collections::HashMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use super::membership::NodeInfo;
use super::state::SyncableState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgType {
    Push,
    Pull,
    PushPull,
    Ack,
    Ping,
    PingAck,
    PingReq,
    Join,
    Leave,
    Suspect,
    Alive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipMessage {
    pub msg_type: MsgType,
    pub sender: NodeInfo,
    /// Subject node for ping_req/suspect/alive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Address of the subject, where the receiver needs to reach it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_addr: Option<SocketAddr>,
    /// Incarnation the message asserts about the subject.
    #[serde(default)]
    pub incarnation: u64,
    /// Ping/ack correlation.
    #[serde(default)]
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<SyncableState>,
    /// `(state_type/key) -> version` summary for anti-entropy.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub digest: HashMap<String, u64>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl GossipMessage {
    pub fn new(msg_type: MsgType, sender: NodeInfo) -> Self {
        Self {
            msg_type,
            sender,
            target: None,
            target_addr: None,
            incarnation: 0,
            seq: 0,
            states: Vec::new(),
            digest: HashMap::new(),
            payload: serde_json::Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeInfo {
        NodeInfo {
            node_id: id.to_string(),
            address: "127.0.0.1:7946".parse().unwrap(),
            incarnation: 1,
            join_time_ms: 0,
            last_seen_ms: 0,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn round_trips_through_json() {
        let mut msg = GossipMessage::new(MsgType::PushPull, node("n1"));
        msg.digest.insert("health/web/10.0.0.1:8080".into(), 7);
        let text = serde_json::to_string(&msg).unwrap();
        let back: GossipMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back.msg_type, MsgType::PushPull);
        assert_eq!(back.sender.node_id, "n1");
        assert_eq!(back.digest["health/web/10.0.0.1:8080"], 7);
    }

    #[test]
    fn msg_type_uses_snake_case_tags() {
        let msg = GossipMessage::new(MsgType::PingAck, node("n1"));
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains("\"ping_ack\""), "{text}");
        let msg = GossipMessage::new(MsgType::PushPull, node("n1"));
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains("\"push_pull\""), "{text}");
    }

    #[test]
    fn optional_fields_are_omitted() {
        let msg = GossipMessage::new(MsgType::Ping, node("n1"));
        let text = serde_json::to_string(&msg).unwrap();
        assert!(!text.contains("\"states\""));
        assert!(!text.contains("\"digest\""));
        assert!(!text.contains("\"target\""));
    }
}
