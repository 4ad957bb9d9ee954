use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::orchestrator::jobs::JobId;
use crate::wire::codec::{CodecError, FrameBuffer, WireCodec};

pub type PeerId = u64;

const READ_CHUNK_BYTES: usize = 64 * 1024;
const MAX_READS_PER_POLL: usize = 64;
pub const MAX_OUTBOUND_BACKLOG_BYTES: usize = 32 * 1024 * 1024;

/// Bidirectional byte stream behind a peer. Implementations must be
/// non-blocking: `try_read` reports `WouldBlock` when idle and `Ok(0)` once
/// the remote side has closed.
pub trait PeerChannel: Send {
    fn try_read(&self, buffer: &mut [u8]) -> io::Result<usize>;
    fn try_write(&self, payload: &[u8]) -> io::Result<usize>;
    fn shutdown(&self) -> io::Result<()>;
    fn remote_addr(&self) -> String;
}

#[derive(Debug, PartialEq, Eq)]
pub enum PeerError {
    PeerNotFound { peer_id: PeerId },
    RoleAlreadySet { peer_id: PeerId, role: &'static str },
    HelloRequired { peer_id: PeerId },
    NotAnOperator { peer_id: PeerId },
    ClaimHeldElsewhere { node: String, peer_id: PeerId },
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerNotFound { peer_id } => write!(f, "peer {peer_id} not found"),
            Self::RoleAlreadySet { peer_id, role } => {
                write!(f, "peer {peer_id} already identified as {role}")
            }
            Self::HelloRequired { peer_id } => {
                write!(f, "peer {peer_id} must send HELLO before identifying")
            }
            Self::NotAnOperator { peer_id } => write!(f, "peer {peer_id} is not an operator"),
            Self::ClaimHeldElsewhere { node, peer_id } => {
                write!(f, "node '{node}' is claimed by peer {peer_id}")
            }
        }
    }
}

impl std::error::Error for PeerError {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerRole {
    Anonymous {
        helloed_at: Option<DateTime<Utc>>,
    },
    Node {
        name: String,
        session_id: Uuid,
        registered_at: DateTime<Utc>,
    },
    Operator {
        attached_at: DateTime<Utc>,
        subscribed: bool,
    },
}

impl PeerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anonymous { .. } => "anonymous",
            Self::Node { .. } => "node",
            Self::Operator { .. } => "operator",
        }
    }
}

/// Frames decoded from one read pass. A framing error leaves the stream
/// unusable, so anything after it is discarded.
#[derive(Debug, Default)]
pub struct ReadBatch {
    pub frames: Vec<Vec<u8>>,
    pub framing_error: Option<CodecError>,
}

pub struct Peer {
    id: PeerId,
    channel: Box<dyn PeerChannel>,
    remote_addr: String,
    connected_at: DateTime<Utc>,
    role: PeerRole,
    inbound: FrameBuffer,
    outbound: Vec<u8>,
    pending_calls: HashMap<String, JobId>,
    call_seq: u64,
    failure: Option<String>,
}

impl Peer {
    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn role(&self) -> &PeerRole {
        &self.role
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn node_name(&self) -> Option<&str> {
        match &self.role {
            PeerRole::Node { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.failure.is_none()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Records why the peer must be torn down. Only the first reason sticks.
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        if self.failure.is_none() {
            self.failure = Some(reason.into());
        }
    }

    pub fn next_call_id(&mut self) -> String {
        self.call_seq += 1;
        format!("call-{}", self.call_seq)
    }

    pub fn register_call(&mut self, call_id: String, job_id: JobId) {
        self.pending_calls.insert(call_id, job_id);
    }

    pub fn take_call(&mut self, call_id: &str) -> Option<JobId> {
        self.pending_calls.remove(call_id)
    }

    pub fn pending_call_count(&self) -> usize {
        self.pending_calls.len()
    }

    /// Queues `frame` and pushes as much of the backlog as the socket takes.
    pub fn send_frame(&mut self, frame: &[u8]) {
        if !self.is_usable() {
            return;
        }
        if self.outbound.len() + frame.len() > MAX_OUTBOUND_BACKLOG_BYTES {
            self.mark_failed("outbound backlog limit exceeded");
            return;
        }
        self.outbound.extend_from_slice(frame);
        self.flush();
    }

    pub fn flush(&mut self) {
        while !self.outbound.is_empty() && self.is_usable() {
            match self.channel.try_write(&self.outbound) {
                Ok(0) => self.mark_failed("peer stopped accepting writes"),
                Ok(written) => {
                    self.outbound.drain(..written);
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => self.mark_failed(format!("write failed: {error}")),
            }
        }
    }

    pub fn read_frames(&mut self, codec: &WireCodec) -> ReadBatch {
        let mut batch = ReadBatch::default();
        if !self.is_usable() {
            return batch;
        }

        let mut chunk = vec![0_u8; READ_CHUNK_BYTES];
        for _ in 0..MAX_READS_PER_POLL {
            match self.channel.try_read(&mut chunk) {
                Ok(0) => {
                    self.mark_failed("peer closed connection");
                    break;
                }
                Ok(read) => self.inbound.extend(&chunk[..read]),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    self.mark_failed(format!("read failed: {error}"));
                    break;
                }
            }
        }

        loop {
            match self.inbound.next_frame(codec) {
                Ok(Some(frame)) => batch.frames.push(frame),
                Ok(None) => break,
                Err(error) => {
                    batch.framing_error = Some(error);
                    break;
                }
            }
        }
        batch
    }

    fn close(&self) {
        let _ = self.channel.shutdown();
    }
}

/// Every live connection, keyed by a process-unique peer id, plus the index
/// from claimed node name to the peer holding it.
#[derive(Default)]
pub struct PeerRegistry {
    peers: BTreeMap<PeerId, Peer>,
    claims: HashMap<String, PeerId>,
    last_peer_id: PeerId,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, channel: Box<dyn PeerChannel>, now: DateTime<Utc>) -> PeerId {
        self.last_peer_id += 1;
        let id = self.last_peer_id;
        let remote_addr = channel.remote_addr();
        self.peers.insert(
            id,
            Peer {
                id,
                channel,
                remote_addr,
                connected_at: now,
                role: PeerRole::Anonymous { helloed_at: None },
                inbound: FrameBuffer::new(),
                outbound: Vec::new(),
                pending_calls: HashMap::new(),
                call_seq: 0,
                failure: None,
            },
        );
        id
    }

    pub fn get(&self, peer_id: PeerId) -> Option<&Peer> {
        self.peers.get(&peer_id)
    }

    pub fn get_mut(&mut self, peer_id: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(&peer_id)
    }

    pub fn lookup(&self, node: &str) -> Option<PeerId> {
        self.claims.get(node).copied()
    }

    pub fn mark_helloed(&mut self, peer_id: PeerId, now: DateTime<Utc>) -> Result<(), PeerError> {
        let peer = self.peer_mut(peer_id)?;
        match &mut peer.role {
            PeerRole::Anonymous { helloed_at } if helloed_at.is_none() => {
                *helloed_at = Some(now);
                Ok(())
            }
            role => Err(PeerError::RoleAlreadySet {
                peer_id,
                role: role.as_str(),
            }),
        }
    }

    /// Promotes a helloed anonymous peer to the node role. The previous
    /// holder of `node`, if any, must be removed before the claim is made.
    pub fn claim_node(
        &mut self,
        peer_id: PeerId,
        node: &str,
        now: DateTime<Utc>,
    ) -> Result<Uuid, PeerError> {
        if let Some(holder) = self.claims.get(node).copied() {
            if holder != peer_id {
                return Err(PeerError::ClaimHeldElsewhere {
                    node: node.to_owned(),
                    peer_id: holder,
                });
            }
        }

        let peer = self.peer_mut(peer_id)?;
        ensure_helloed_anonymous(peer)?;
        let session_id = Uuid::new_v4();
        peer.role = PeerRole::Node {
            name: node.to_owned(),
            session_id,
            registered_at: now,
        };
        self.claims.insert(node.to_owned(), peer_id);
        Ok(session_id)
    }

    pub fn attach_operator(&mut self, peer_id: PeerId, now: DateTime<Utc>) -> Result<(), PeerError> {
        let peer = self.peer_mut(peer_id)?;
        ensure_helloed_anonymous(peer)?;
        peer.role = PeerRole::Operator {
            attached_at: now,
            subscribed: false,
        };
        Ok(())
    }

    pub fn set_subscribed(&mut self, peer_id: PeerId, value: bool) -> Result<(), PeerError> {
        let peer = self.peer_mut(peer_id)?;
        match &mut peer.role {
            PeerRole::Operator { subscribed, .. } => {
                *subscribed = value;
                Ok(())
            }
            _ => Err(PeerError::NotAnOperator { peer_id }),
        }
    }

    /// Drops the peer, releases its claim and closes the channel. Removing a
    /// peer that is already gone is a no-op.
    pub fn remove(&mut self, peer_id: PeerId) -> Option<Peer> {
        let peer = self.peers.remove(&peer_id)?;
        if let Some(name) = peer.node_name() {
            if self.claims.get(name) == Some(&peer_id) {
                self.claims.remove(name);
            }
        }
        peer.close();
        Some(peer)
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    pub fn subscribers(&self) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|peer| matches!(peer.role, PeerRole::Operator { subscribed: true, .. }))
            .map(|peer| peer.id)
            .collect()
    }

    pub fn failed(&self) -> Vec<(PeerId, String)> {
        self.peers
            .values()
            .filter_map(|peer| peer.failure().map(|reason| (peer.id, reason.to_owned())))
            .collect()
    }

    /// Anonymous peers that missed the HELLO deadline or, once helloed, the
    /// deadline for identifying as a node or operator.
    pub fn overdue_anonymous(
        &self,
        now: DateTime<Utc>,
        hello_timeout: Duration,
        identify_timeout: Duration,
    ) -> Vec<(PeerId, &'static str)> {
        self.peers
            .values()
            .filter_map(|peer| match peer.role {
                PeerRole::Anonymous { helloed_at: None } => (now - peer.connected_at
                    >= hello_timeout)
                    .then_some((peer.id, "HELLO not received in time")),
                PeerRole::Anonymous {
                    helloed_at: Some(_),
                } => (now - peer.connected_at >= identify_timeout)
                    .then_some((peer.id, "REGISTER or ATTACH not received in time")),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn count_by_role(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::from([("anonymous", 0), ("node", 0), ("operator", 0)]);
        for peer in self.peers.values() {
            *counts.entry(peer.role.as_str()).or_insert(0) += 1;
        }
        counts
    }

    fn peer_mut(&mut self, peer_id: PeerId) -> Result<&mut Peer, PeerError> {
        self.peers
            .get_mut(&peer_id)
            .ok_or(PeerError::PeerNotFound { peer_id })
    }
}

fn ensure_helloed_anonymous(peer: &Peer) -> Result<(), PeerError> {
    match peer.role {
        PeerRole::Anonymous {
            helloed_at: Some(_),
        } => Ok(()),
        PeerRole::Anonymous { helloed_at: None } => {
            Err(PeerError::HelloRequired { peer_id: peer.id })
        }
        ref role => Err(PeerError::RoleAlreadySet {
            peer_id: peer.id,
            role: role.as_str(),
        }),
    }
}
