mod clock;
mod config;
mod dme;
mod messages;
mod net;

use anyhow::{anyhow, bail, Result};
pub use config::{Config, PeerAddr};
use dme::{DmeCore, RequestOutcome};
pub use messages::{LocalMessage, PeerMessage};
use net::{NetEvent, Peers};
use std::{fmt, net::SocketAddr};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Identifies a node across the peer set. The ordering is lexicographic
/// and serves as the tie-break between requests with equal timestamps.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(String);

impl NodeId {
    /// Node ids travel on the wire as a single field: printable ASCII,
    /// no whitespace, at most 64 bytes.
    pub fn new(s: &str) -> Result<Self> {
        if s.is_empty() || s.len() > 64 {
            bail!("node id must be 1..=64 bytes, got {s:?}");
        }
        if !s.bytes().all(|b| b.is_ascii_graphic()) {
            bail!("node id must be printable ASCII without whitespace, got {s:?}");
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle the application uses to guard its critical section. Cheap to
/// clone; all clones talk to the same node task.
#[derive(Clone)]
pub struct DmeHandle {
    sender: mpsc::Sender<LocalMessage>,
}

impl DmeHandle {
    /// Block until this node may enter the critical section: broadcasts a
    /// REQUEST and waits for a REPLY from every peer.
    pub async fn acquire(&self) -> Result<()> {
        let (granted, wait) = oneshot::channel();
        self.sender
            .send(LocalMessage::Acquire { granted })
            .await
            .map_err(|_| anyhow!("node task is gone"))?;
        wait.await
            .map_err(|_| anyhow!("lock request failed: a peer is unreachable"))?;
        Ok(())
    }

    /// Leave the critical section, answering every deferred request.
    pub async fn release(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.sender
            .send(LocalMessage::Release { done })
            .await
            .map_err(|_| anyhow!("node task is gone"))?;
        wait.await.map_err(|_| anyhow!("node task dropped the release"))?;
        Ok(())
    }
}

/// One chat node's DME engine. A single task owns all protocol state and
/// serializes every decision; network writes happen in the per-peer writer
/// tasks, fed through channels, never inside a decision.
pub struct Node {
    my_id: NodeId,
    core: DmeCore,
    peers: Peers,
    local_inbox: mpsc::Receiver<LocalMessage>,
    pending_acquire: Option<oneshot::Sender<()>>,
    local_addr: SocketAddr,
}

impl Node {
    pub async fn new(config: Config) -> Result<(Self, DmeHandle)> {
        let my_id = config.validate()?;
        let (peers, local_addr) = net::start(&my_id, config.listen_port, &config.peers).await?;
        let core = DmeCore::new(
            my_id.clone(),
            config.peers.iter().map(|p| p.node_id.clone()).collect(),
        );
        let (local_sender, local_inbox) = mpsc::channel(16);
        Ok((
            Self {
                my_id,
                core,
                peers,
                local_inbox,
                pending_acquire: None,
                local_addr,
            },
            DmeHandle { sender: local_sender },
        ))
    }

    /// Where the peer listener actually bound (useful when configured
    /// with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn run(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                Some(local) = self.local_inbox.recv() => self.handle_local(local).await,
                Some(event) = self.peers.inbox.recv() => self.handle_net(event).await,
                else => {
                    info!("[{}] all channels closed, shutting down", self.my_id);
                    break;
                }
            }
        }
        Ok(())
    }

    async fn handle_local(&mut self, msg: LocalMessage) {
        match msg {
            LocalMessage::Acquire { granted } => {
                let key = self.core.begin_request();
                info!(
                    "[{}] requesting critical section, key ({}, {})",
                    self.my_id, key.ts, key.node
                );
                if self.core.replies_complete() {
                    // no peers configured: the section is ours immediately
                    self.core.enter();
                    let _ = granted.send(());
                    return;
                }
                self.pending_acquire = Some(granted);
                let request = PeerMessage::Request {
                    ts: key.ts,
                    from: self.my_id.clone(),
                };
                for (peer, sender) in &self.peers.senders {
                    if sender.send(request.clone()).await.is_err() {
                        warn!("[{}] writer for {} is gone", self.my_id, peer);
                    }
                }
            }
            LocalMessage::Release { done } => {
                let flushed = self.core.release();
                info!(
                    "[{}] released critical section, answering {} deferred request(s)",
                    self.my_id,
                    flushed.len()
                );
                for (peer, ts) in flushed {
                    self.send_to(
                        &peer,
                        PeerMessage::Reply {
                            ts,
                            from: self.my_id.clone(),
                        },
                    )
                    .await;
                }
                let _ = done.send(());
            }
        }
    }

    async fn handle_net(&mut self, event: NetEvent) {
        match event {
            NetEvent::Inbound(PeerMessage::Request { ts, from }) => {
                debug!("[{}] REQUEST from {} (t={})", self.my_id, from, ts);
                match self.core.handle_request(ts, &from) {
                    RequestOutcome::Reply(reply_ts) => {
                        self.send_to(
                            &from,
                            PeerMessage::Reply {
                                ts: reply_ts,
                                from: self.my_id.clone(),
                            },
                        )
                        .await;
                    }
                    RequestOutcome::Deferred => {
                        debug!("[{}] deferring reply to {}", self.my_id, from);
                    }
                    RequestOutcome::Ignored => {}
                }
            }
            NetEvent::Inbound(PeerMessage::Reply { ts, from }) => {
                debug!("[{}] REPLY from {} (t={})", self.my_id, from, ts);
                if self.core.handle_reply(ts, &from) {
                    self.core.enter();
                    info!("[{}] all replies received, entering critical section", self.my_id);
                    match self.pending_acquire.take() {
                        Some(granted) => {
                            let _ = granted.send(());
                        }
                        None => error!("[{}] no waiter for a completed lock request", self.my_id),
                    }
                }
            }
            NetEvent::SendFailed(peer) => {
                error!("[{}] giving up on peer {}", self.my_id, peer);
                // an outstanding request can never gather all its replies
                // now; dropping the waiter's channel surfaces the failure,
                // and the aborted request frees the node to acquire again
                if let Some(waiter) = self.pending_acquire.take() {
                    drop(waiter);
                    for (to, ts) in self.core.abort_request() {
                        self.send_to(
                            &to,
                            PeerMessage::Reply {
                                ts,
                                from: self.my_id.clone(),
                            },
                        )
                        .await;
                    }
                }
            }
        }
    }

    async fn send_to(&self, peer: &NodeId, msg: PeerMessage) {
        match self.peers.senders.get(peer) {
            Some(sender) => {
                if sender.send(msg).await.is_err() {
                    warn!("[{}] writer for {} is gone", self.my_id, peer);
                }
            }
            None => warn!("[{}] no transport for peer {}", self.my_id, peer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn node_config(id: &str, port: u16, peers: &[(&str, u16)]) -> Config {
        Config {
            node_id: id.to_string(),
            listen_port: port,
            server: "127.0.0.1:50000".to_string(),
            peers: peers
                .iter()
                .map(|(peer_id, peer_port)| PeerAddr {
                    node_id: NodeId::new(peer_id).unwrap(),
                    host: "127.0.0.1".to_string(),
                    port: *peer_port,
                })
                .collect(),
        }
    }

    async fn spawn_node(config: Config) -> DmeHandle {
        let (mut node, handle) = Node::new(config).await.unwrap();
        tokio::spawn(async move { node.run().await.unwrap() });
        handle
    }

    #[tokio::test]
    async fn listener_reports_its_bound_port() {
        let (node, _handle) = Node::new(node_config("solo", 0, &[])).await.unwrap();
        assert_ne!(node.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn lone_node_lock_is_trivial() {
        let handle = spawn_node(node_config("solo", 0, &[])).await;
        handle.acquire().await.unwrap();
        handle.release().await.unwrap();
        handle.acquire().await.unwrap();
        handle.release().await.unwrap();
    }

    #[tokio::test]
    async fn two_nodes_exclude_each_other() {
        let port_a = free_port();
        let port_b = free_port();
        let a = spawn_node(node_config("a", port_a, &[("b", port_b)])).await;
        let b = spawn_node(node_config("b", port_b, &[("a", port_a)])).await;

        a.acquire().await.unwrap();

        let (entered_sender, mut entered) = mpsc::channel(1);
        let b_waiter = b.clone();
        tokio::spawn(async move {
            b_waiter.acquire().await.unwrap();
            let _ = entered_sender.send(()).await;
        });

        // b must stay blocked while a holds the section
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(entered.try_recv().is_err(), "b entered while a held the lock");

        a.release().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), entered.recv())
            .await
            .expect("b never entered after a released")
            .unwrap();
        b.release().await.unwrap();
    }
}
