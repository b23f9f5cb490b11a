use crate::NodeId;
use anyhow::{bail, Context};
use std::fmt;
use std::str::FromStr;
use tokio::sync::oneshot;

/// Requests from the application to the node task.
#[derive(Debug)]
pub enum LocalMessage {
    // wants the critical section; answered once every peer has replied
    Acquire { granted: oneshot::Sender<()> },
    // done with the critical section; answered once deferred replies are queued
    Release { done: oneshot::Sender<()> },
}

/// One line of the peer wire protocol: `REQUEST <ts> <id>` or
/// `REPLY <ts> <id>`, newline-terminated, single-space separated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerMessage {
    Request { ts: u64, from: NodeId },
    Reply { ts: u64, from: NodeId },
}

impl fmt::Display for PeerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerMessage::Request { ts, from } => write!(f, "REQUEST {ts} {from}"),
            PeerMessage::Reply { ts, from } => write!(f, "REPLY {ts} {from}"),
        }
    }
}

impl FromStr for PeerMessage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split(' ');
        let verb = fields.next().unwrap_or("");
        let ts = fields
            .next()
            .with_context(|| format!("missing timestamp in {s:?}"))?;
        let from = fields
            .next()
            .with_context(|| format!("missing node id in {s:?}"))?;
        if fields.next().is_some() {
            bail!("trailing fields in {s:?}");
        }

        if ts.is_empty() || !ts.bytes().all(|b| b.is_ascii_digit()) {
            bail!("timestamp must be a decimal non-negative integer, got {ts:?}");
        }
        let ts: u64 = ts
            .parse()
            .with_context(|| format!("timestamp {ts:?} out of range"))?;
        let from = NodeId::new(from)?;

        match verb {
            "REQUEST" => Ok(PeerMessage::Request { ts, from }),
            "REPLY" => Ok(PeerMessage::Reply { ts, from }),
            other => bail!("unknown verb {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    #[test]
    fn renders_the_exact_wire_format() {
        let request = PeerMessage::Request { ts: 1, from: id("a") };
        assert_eq!(request.to_string(), "REQUEST 1 a");
        let reply = PeerMessage::Reply { ts: 42, from: id("node-7") };
        assert_eq!(reply.to_string(), "REPLY 42 node-7");
    }

    #[test]
    fn parses_both_verbs() {
        assert_eq!(
            "REQUEST 7 joel".parse::<PeerMessage>().unwrap(),
            PeerMessage::Request { ts: 7, from: id("joel") }
        );
        assert_eq!(
            "REPLY 0 jina".parse::<PeerMessage>().unwrap(),
            PeerMessage::Reply { ts: 0, from: id("jina") }
        );
    }

    #[test]
    fn round_trips_losslessly() {
        let original = PeerMessage::Request { ts: u64::MAX, from: id("x_9") };
        let parsed: PeerMessage = original.to_string().parse().unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn rejects_malformed_lines() {
        let bad = [
            "",
            "REQUEST",
            "REQUEST 1",
            "REQUEST 1 a b",
            "REQUEST  1 a",
            "request 1 a",
            "HELLO 1 a",
            "REQUEST x a",
            "REQUEST -1 a",
            "REQUEST +1 a",
            "REQUEST 99999999999999999999999 a",
            "REQUEST 1 a\tb",
        ];
        for line in bad {
            assert!(line.parse::<PeerMessage>().is_err(), "accepted {line:?}");
        }
    }

    #[test]
    fn rejects_oversized_node_ids() {
        let long_id = "x".repeat(65);
        assert!(format!("REQUEST 1 {long_id}").parse::<PeerMessage>().is_err());
        let max_id = "x".repeat(64);
        assert!(format!("REQUEST 1 {max_id}").parse::<PeerMessage>().is_ok());
    }
}
