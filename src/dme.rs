use crate::clock::LamportClock;
use crate::NodeId;
use std::collections::HashSet;
use tracing::warn;

/// Critical-section state of the local node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CsState {
    Released,
    Requested,
    Held,
}

/// Identity of an outstanding request. The derived ordering compares
/// timestamps first and breaks ties on node id; smaller key means higher
/// priority.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct RequestKey {
    pub ts: u64,
    pub node: NodeId,
}

/// What to do with an inbound REQUEST.
#[derive(Debug, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Answer immediately with a REPLY carrying this timestamp.
    Reply(u64),
    /// Hold the reply back until our own release.
    Deferred,
    /// Sender is not in the peer set.
    Ignored,
}

/// Ricart-Agrawala decision core. Owns every per-node protocol variable;
/// the node task is the only thing that touches it, so each decision sees
/// a consistent view of all of them.
pub struct DmeCore {
    node_id: NodeId,
    peers: HashSet<NodeId>,
    clock: LamportClock,
    state: CsState,
    my_request: Option<RequestKey>,
    replies_received: HashSet<NodeId>,
    deferred: HashSet<NodeId>,
}

impl DmeCore {
    pub fn new(node_id: NodeId, peers: HashSet<NodeId>) -> Self {
        Self {
            node_id,
            peers,
            clock: LamportClock::new(),
            state: CsState::Released,
            my_request: None,
            replies_received: HashSet::new(),
            deferred: HashSet::new(),
        }
    }

    /// Start a new request for the critical section. Ticks the clock once;
    /// the returned key's timestamp goes out in the REQUEST to every peer.
    ///
    /// Panics if a request is already outstanding or the section is held:
    /// that is a caller bug, not a recoverable condition.
    pub fn begin_request(&mut self) -> RequestKey {
        assert_eq!(
            self.state,
            CsState::Released,
            "acquire() while already {:?}",
            self.state
        );
        let ts = self.clock.tick();
        let key = RequestKey {
            ts,
            node: self.node_id.clone(),
        };
        self.my_request = Some(key.clone());
        self.replies_received.clear();
        self.state = CsState::Requested;
        key
    }

    /// True once every peer has answered the outstanding request.
    pub fn replies_complete(&self) -> bool {
        self.replies_received.len() == self.peers.len()
    }

    /// Inbound REQUEST. Defer while we hold the section, or while our own
    /// outstanding request has the smaller key; otherwise reply now.
    pub fn handle_request(&mut self, ts: u64, from: &NodeId) -> RequestOutcome {
        self.clock.update(ts);
        if !self.peers.contains(from) {
            warn!("[{}] REQUEST from unknown node {}, ignoring", self.node_id, from);
            return RequestOutcome::Ignored;
        }
        let incoming = RequestKey {
            ts,
            node: from.clone(),
        };
        let ours_wins = match self.state {
            CsState::Held => true,
            CsState::Requested => {
                let mine = self
                    .my_request
                    .as_ref()
                    .expect("requesting without a request key");
                *mine < incoming
            }
            CsState::Released => false,
        };
        if ours_wins {
            self.deferred.insert(from.clone());
            RequestOutcome::Deferred
        } else {
            RequestOutcome::Reply(self.clock.tick())
        }
    }

    /// Inbound REPLY. Returns true once the outstanding request has been
    /// answered by every peer; anomalous replies are logged and dropped.
    pub fn handle_reply(&mut self, ts: u64, from: &NodeId) -> bool {
        self.clock.update(ts);
        if !self.peers.contains(from) {
            warn!("[{}] REPLY from unknown node {}, discarding", self.node_id, from);
            return false;
        }
        if self.state != CsState::Requested {
            warn!(
                "[{}] REPLY from {} while {:?}, discarding",
                self.node_id, from, self.state
            );
            return false;
        }
        if !self.replies_received.insert(from.clone()) {
            warn!("[{}] duplicate REPLY from {}", self.node_id, from);
        }
        self.replies_complete()
    }

    /// Take the critical section once the request is fully answered.
    pub fn enter(&mut self) {
        assert_eq!(
            self.state,
            CsState::Requested,
            "entering the critical section without requesting it"
        );
        assert!(
            self.replies_complete(),
            "entering the critical section before all peers replied"
        );
        self.state = CsState::Held;
    }

    /// Leave the critical section. Returns the deferred peers with one
    /// freshly ticked timestamp per owed REPLY.
    ///
    /// Panics unless the section is held: release without acquire is a
    /// caller bug.
    pub fn release(&mut self) -> Vec<(NodeId, u64)> {
        assert_eq!(
            self.state,
            CsState::Held,
            "release() while {:?}",
            self.state
        );
        self.state = CsState::Released;
        self.my_request = None;
        self.flush_deferred()
    }

    /// Forget the outstanding request after the transport gave up on a
    /// peer. The waiter has already been failed; peers we out-prioritized
    /// are still owed their replies, so they get flushed like a release.
    pub fn abort_request(&mut self) -> Vec<(NodeId, u64)> {
        assert_eq!(
            self.state,
            CsState::Requested,
            "aborting without an outstanding request"
        );
        self.state = CsState::Released;
        self.my_request = None;
        self.replies_received.clear();
        self.flush_deferred()
    }

    fn flush_deferred(&mut self) -> Vec<(NodeId, u64)> {
        let mut flushed: Vec<NodeId> = self.deferred.drain().collect();
        flushed.sort();
        flushed
            .into_iter()
            .map(|peer| {
                let ts = self.clock.tick();
                (peer, ts)
            })
            .collect()
    }
}
