//! Gossip transport: UDP for small messages, newline-framed TCP for
//! anything over the configured threshold (full state exchanges mostly).

use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::messages::GossipMessage;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("send failed: {0}")]
    SendFailed(#[from] std::io::Error),

    #[error("peer timed out")]
    PeerTimeout,
}

/// Receive half: messages from both sockets funneled into one channel.
pub type Inbox = mpsc::Receiver<(GossipMessage, SocketAddr)>;

pub struct Transport {
    udp: Arc<UdpSocket>,
    local: SocketAddr,
    max_udp_size: usize,
}

impl Transport {
    /// Bind UDP and TCP on `addr` and start the receive loops. Loops exit
    /// when `running` flips false.
    pub async fn bind(
        addr: SocketAddr,
        max_udp_size: usize,
        running: watch::Receiver<bool>,
    ) -> std::io::Result<(Self, Inbox)> {
        let udp = Arc::new(UdpSocket::bind(addr).await?);
        let local = udp.local_addr()?;
        let tcp = bind_tcp(local)?;
        let (tx, rx) = mpsc::channel(1_024);

        spawn_udp_loop(udp.clone(), tx.clone(), running.clone());
        spawn_tcp_loop(tcp, tx, running);

        Ok((Self { udp, local, max_udp_size }, rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Serialize and send one message, picking the transport by size.
    pub async fn send(&self, addr: SocketAddr, msg: &GossipMessage) -> Result<(), ClusterError> {
        let mut payload = serde_json::to_vec(msg)?;
        if payload.len() <= self.max_udp_size {
            self.udp.send_to(&payload, addr).await?;
        } else {
            debug!(%addr, size = payload.len(), "payload over UDP cap, using TCP");
            payload.push(b'\n');
            let mut stream = TcpStream::connect(addr).await?;
            stream.write_all(&payload).await?;
            stream.flush().await?;
        }
        Ok(())
    }
}

fn bind_tcp(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    TcpListener::from_std(socket.into())
}

fn spawn_udp_loop(
    udp: Arc<UdpSocket>,
    tx: mpsc::Sender<(GossipMessage, SocketAddr)>,
    mut running: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65_535];
        while *running.borrow() {
            tokio::select! {
                _ = running.changed() => continue,
                recv = udp.recv_from(&mut buf) => match recv {
                    Ok((n, from)) => match serde_json::from_slice::<GossipMessage>(&buf[..n]) {
                        Ok(msg) => {
                            if tx.send((msg, from)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(%from, error = %e, "undecodable gossip datagram"),
                    },
                    Err(e) => {
                        warn!(error = %e, "udp receive error");
                    }
                },
            }
        }
    });
}

fn spawn_tcp_loop(
    tcp: TcpListener,
    tx: mpsc::Sender<(GossipMessage, SocketAddr)>,
    mut running: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        while *running.borrow() {
            tokio::select! {
                _ = running.changed() => continue,
                accepted = tcp.accept() => {
                    let (stream, from) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "tcp accept error");
                            continue;
                        }
                    };
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let mut lines = BufReader::new(stream).lines();
                        while let Ok(Some(line)) = lines.next_line().await {
                            match serde_json::from_str::<GossipMessage>(&line) {
                                Ok(msg) => {
                                    if tx.send((msg, from)).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    warn!(%from, error = %e, "undecodable gossip frame");
                                    break;
                                }
                            }
                        }
                    });
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::membership::NodeInfo;
    use crate::cluster::messages::MsgType;
    use crate::cluster::state::{StateType, SyncableState};

    fn node(id: &str, addr: SocketAddr) -> NodeInfo {
        NodeInfo {
            node_id: id.to_string(),
            address: addr,
            incarnation: 1,
            join_time_ms: 0,
            last_seen_ms: 0,
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn small_message_travels_over_udp() {
        let (_run_tx, run_rx) = watch::channel(true);
        let (a, _inbox_a) =
            Transport::bind("127.0.0.1:0".parse().unwrap(), 1_024, run_rx.clone()).await.unwrap();
        let (b, mut inbox_b) =
            Transport::bind("127.0.0.1:0".parse().unwrap(), 1_024, run_rx).await.unwrap();

        let msg = GossipMessage::new(MsgType::Ping, node("a", a.local_addr()));
        a.send(b.local_addr(), &msg).await.unwrap();

        let (received, _) = inbox_b.recv().await.unwrap();
        assert_eq!(received.msg_type, MsgType::Ping);
        assert_eq!(received.sender.node_id, "a");
    }

    #[tokio::test]
    async fn oversized_message_falls_back_to_tcp() {
        let (_run_tx, run_rx) = watch::channel(true);
        let (a, _inbox_a) =
            Transport::bind("127.0.0.1:0".parse().unwrap(), 256, run_rx.clone()).await.unwrap();
        let (b, mut inbox_b) =
            Transport::bind("127.0.0.1:0".parse().unwrap(), 256, run_rx).await.unwrap();

        let mut msg = GossipMessage::new(MsgType::Push, node("a", a.local_addr()));
        for i in 0..32 {
            msg.states.push(SyncableState {
                state_type: StateType::Health,
                key: format!("web/10.0.0.{i}:8080"),
                value: serde_json::json!({"healthy": true, "filler": "x".repeat(32)}),
                version: i,
                source_node: "a".into(),
                wall_ms: 0,
            });
        }
        assert!(serde_json::to_vec(&msg).unwrap().len() > 256);
        a.send(b.local_addr(), &msg).await.unwrap();

        let (received, _) = inbox_b.recv().await.unwrap();
        assert_eq!(received.msg_type, MsgType::Push);
        assert_eq!(received.states.len(), 32);
    }
}
