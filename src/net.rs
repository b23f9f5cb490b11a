use crate::config::PeerAddr;
use crate::messages::PeerMessage;
use crate::NodeId;
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use std::{collections::HashMap, net::SocketAddr, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, error, info, warn};

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);
// longest legal line is well under this; anything bigger is garbage
const MAX_LINE_LEN: usize = 256;

pub enum NetEvent {
    Inbound(PeerMessage),
    // the writer task for this peer has given up on delivering to it
    SendFailed(NodeId),
}

pub struct Peers {
    pub inbox: mpsc::Receiver<NetEvent>,
    pub senders: HashMap<NodeId, mpsc::Sender<PeerMessage>>,
}

/// Bind the peer listener and spawn the transport tasks: one acceptor
/// feeding per-connection readers, and one writer per configured peer.
/// Outbound connections are made lazily on first send.
pub async fn start(
    my_id: &NodeId,
    listen_port: u16,
    peer_addrs: &[PeerAddr],
) -> Result<(Peers, SocketAddr)> {
    let listener = TcpListener::bind(("0.0.0.0", listen_port))
        .await
        .with_context(|| format!("binding peer listener on port {listen_port}"))?;
    let local_addr = listener.local_addr()?;
    info!("[{}] listening for peers on {}", my_id, local_addr);

    let (event_sender, inbox) = mpsc::channel::<NetEvent>(256);

    let accept_sender = event_sender.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    debug!("accepted peer connection from {addr}");
                    tokio::spawn(reader_task(stream, addr, accept_sender.clone()));
                }
                Err(e) => error!("accept failed: {e}"),
            }
        }
    });

    let mut senders = HashMap::new();
    for peer in peer_addrs {
        let (outbox_sender, outbox) = mpsc::channel::<PeerMessage>(64);
        tokio::spawn(writer_task(peer.clone(), outbox, event_sender.clone()));
        senders.insert(peer.node_id.clone(), outbox_sender);
    }

    Ok((Peers { inbox, senders }, local_addr))
}

// Reads newline-framed messages off one inbound connection. A malformed
// line or read error closes this connection only; the peer may reconnect.
async fn reader_task(stream: TcpStream, addr: SocketAddr, events: mpsc::Sender<NetEvent>) {
    let mut lines = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("read error from {addr}: {e}");
                return;
            }
        };
        match line.parse::<PeerMessage>() {
            Ok(msg) => {
                if events.send(NetEvent::Inbound(msg)).await.is_err() {
                    return; // node task shut down
                }
            }
            Err(e) => {
                warn!("malformed message from {addr}, closing connection: {e}");
                return;
            }
        }
    }
    debug!("peer connection from {addr} closed");
}

// Owns the outbound connection to one peer, established lazily. A failed
// send gets one reconnect; if the peer stays unreachable the node task is
// told so it can fail any waiter that depends on this peer.
async fn writer_task(
    peer: PeerAddr,
    mut outbox: mpsc::Receiver<PeerMessage>,
    events: mpsc::Sender<NetEvent>,
) {
    let mut conn: Option<Framed<TcpStream, LinesCodec>> = None;
    while let Some(msg) = outbox.recv().await {
        let line = msg.to_string();
        let mut delivered = false;
        for _ in 0..2 {
            if conn.is_none() {
                match connect_with_retry(&peer.addr(), CONNECT_ATTEMPTS, CONNECT_RETRY_DELAY).await
                {
                    Ok(stream) => {
                        let _ = stream.set_nodelay(true);
                        conn = Some(Framed::new(stream, LinesCodec::new()));
                    }
                    Err(e) => {
                        error!("[{}] unreachable at {}: {}", peer.node_id, peer.addr(), e);
                        break;
                    }
                }
            }
            let Some(framed) = conn.as_mut() else { break };
            match framed.send(line.clone()).await {
                Ok(()) => {
                    delivered = true;
                    break;
                }
                Err(e) => {
                    warn!("[{}] send failed, dropping connection: {}", peer.node_id, e);
                    conn = None;
                }
            }
        }
        if delivered {
            debug!("[{}] sent {}", peer.node_id, line);
        } else if events
            .send(NetEvent::SendFailed(peer.node_id.clone()))
            .await
            .is_err()
        {
            return;
        }
    }
}

async fn connect_with_retry(addr: &str, max_attempts: u32, delay: Duration) -> Result<TcpStream> {
    let mut attempts = 0;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                attempts += 1;
                if attempts >= max_attempts {
                    return Err(e.into());
                }
                warn!("connection to {} failed (attempt {}), retrying...", addr, attempts);
                tokio::time::sleep(delay).await;
            }
        }
    }
}
