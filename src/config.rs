use crate::NodeId;
use anyhow::{bail, Context, Result};
use clap::Parser;
use std::collections::HashSet;
use std::str::FromStr;

/// Distributed chat client with Ricart-Agrawala write mutual exclusion
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Config {
    /// This node's unique id (e.g. "joel")
    #[arg(short, long)]
    pub node_id: String,

    /// TCP port for peer REQUEST/REPLY traffic
    #[arg(short, long)]
    pub listen_port: u16,

    /// File server address as host:port
    #[arg(short, long)]
    pub server: String,

    /// A peer as id:host:port; repeat for each peer
    #[arg(short, long = "peer", value_delimiter = ',')]
    pub peers: Vec<PeerAddr>,
}

impl Config {
    /// Membership checks done once at startup; returns this node's id.
    pub fn validate(&self) -> Result<NodeId> {
        let my_id = NodeId::new(&self.node_id)?;
        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.node_id == my_id {
                bail!("peer list contains this node's own id {:?}", self.node_id);
            }
            if !seen.insert(peer.node_id.clone()) {
                bail!("duplicate peer id {}", peer.node_id);
            }
        }
        Ok(my_id)
    }
}

#[derive(Clone, Debug)]
pub struct PeerAddr {
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(':');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(id), Some(host), Some(port), None) => {
                let node_id = NodeId::new(id)?;
                if host.is_empty() {
                    bail!("empty host in peer {s:?}");
                }
                let port = port
                    .parse()
                    .with_context(|| format!("bad port in peer {s:?}"))?;
                Ok(Self {
                    node_id,
                    host: host.to_string(),
                    port,
                })
            }
            _ => bail!("expected id:host:port, got {s:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_peer_triple() {
        let peer: PeerAddr = "jina:10.0.0.7:50001".parse().unwrap();
        assert_eq!(peer.node_id, NodeId::new("jina").unwrap());
        assert_eq!(peer.addr(), "10.0.0.7:50001");
    }

    #[test]
    fn rejects_bad_peer_specs() {
        for spec in ["", "jina", "jina:host", "jina:host:port:extra", "jina::50001", "jina:host:notaport", "jina:host:99999"] {
            assert!(spec.parse::<PeerAddr>().is_err(), "accepted {spec:?}");
        }
    }

    #[test]
    fn parses_a_full_command_line() {
        let config = Config::try_parse_from([
            "dchat",
            "--node-id", "joel",
            "--listen-port", "50001",
            "--server", "127.0.0.1:50000",
            "--peer", "jina:127.0.0.1:50002",
            "--peer", "joan:127.0.0.1:50003",
        ])
        .unwrap();
        assert_eq!(config.peers.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_self_in_peer_list() {
        let config = Config::try_parse_from([
            "dchat",
            "--node-id", "joel",
            "--listen-port", "50001",
            "--server", "127.0.0.1:50000",
            "--peer", "joel:127.0.0.1:50001",
        ])
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_peer_ids() {
        let config = Config::try_parse_from([
            "dchat",
            "--node-id", "joel",
            "--listen-port", "50001",
            "--server", "127.0.0.1:50000",
            "--peer", "jina:127.0.0.1:50002,jina:127.0.0.1:50003",
        ])
        .unwrap();
        assert!(config.validate().is_err());
    }
}
