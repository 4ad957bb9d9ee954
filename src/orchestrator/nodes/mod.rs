use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::peers::PeerId;

pub const MAX_NODE_NAME_LEN: usize = 253;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeStatus {
    Unknown,
    Online,
    Offline,
    Degraded,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Degraded => "degraded",
        }
    }

    /// Online and degraded nodes hold a live peer; the other two never do.
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Online | Self::Degraded)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub status: NodeStatus,
    pub peer: Option<PeerId>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub status_changed_at: DateTime<Utc>,
}

impl Node {
    pub fn to_json(&self) -> Value {
        json!({
            "node": self.name,
            "status": self.status.as_str(),
            "peer_id": self.peer,
            "last_heartbeat_at": self.last_heartbeat_at.map(|at| at.to_rfc3339()),
            "status_changed_at": self.status_changed_at.to_rfc3339(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusChange {
    pub node: String,
    pub from: NodeStatus,
    pub to: NodeStatus,
    pub at: DateTime<Utc>,
}

impl StatusChange {
    pub fn to_json(&self) -> Value {
        json!({
            "node": self.node,
            "from": self.from.as_str(),
            "to": self.to.as_str(),
            "at": self.at.to_rfc3339(),
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum NodeError {
    InvalidName { node: String },
    NotAllowed { node: String },
    NotFound { node: String },
    AlreadyBoundElsewhere { node: String, peer_id: PeerId },
    HeartbeatRejected { node: String, status: NodeStatus },
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidName { node } => write!(
                f,
                "node name '{node}' is invalid; expected 1-{MAX_NODE_NAME_LEN} chars of [A-Za-z0-9._-]"
            ),
            Self::NotAllowed { node } => write!(f, "node '{node}' is not in the allow-list"),
            Self::NotFound { node } => write!(f, "node '{node}' not found"),
            Self::AlreadyBoundElsewhere { node, peer_id } => {
                write!(f, "node '{node}' is already bound to peer {peer_id}")
            }
            Self::HeartbeatRejected { node, status } => write!(
                f,
                "heartbeat for node '{node}' rejected while {}",
                status.as_str()
            ),
        }
    }
}

impl std::error::Error for NodeError {}

/// Authoritative view of every node the controller has heard of.
///
/// Status and the bound peer move together: `bind` is the only way in to a
/// connected state and `unbind` the only way out, so a node reported online
/// or degraded always has exactly one peer behind it.
pub struct NodeRegistry {
    nodes: BTreeMap<String, Node>,
    allowed: Option<BTreeSet<String>>,
}

impl NodeRegistry {
    /// An empty allow-list admits any well-formed name. A non-empty one both
    /// restricts names and pre-populates those nodes as unknown.
    pub fn new(allowed: &[String], now: DateTime<Utc>) -> Self {
        let mut registry = Self {
            nodes: BTreeMap::new(),
            allowed: if allowed.is_empty() {
                None
            } else {
                Some(allowed.iter().cloned().collect())
            },
        };
        for name in allowed {
            registry.nodes.insert(name.clone(), unknown_node(name, now));
        }
        registry
    }

    pub fn validate_name(&self, name: &str) -> Result<(), NodeError> {
        let well_formed = !name.is_empty()
            && name.len() <= MAX_NODE_NAME_LEN
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !well_formed {
            return Err(NodeError::InvalidName {
                node: name.to_owned(),
            });
        }
        if let Some(allowed) = &self.allowed {
            if !allowed.contains(name) {
                return Err(NodeError::NotAllowed {
                    node: name.to_owned(),
                });
            }
        }
        Ok(())
    }

    /// Returns the entry for `name`, creating it as unknown on first reference.
    pub fn ensure(&mut self, name: &str, now: DateTime<Utc>) -> Result<&mut Node, NodeError> {
        self.validate_name(name)?;
        Ok(self
            .nodes
            .entry(name.to_owned())
            .or_insert_with(|| unknown_node(name, now)))
    }

    /// Attaches `peer_id` and moves the node online. Callers replacing an
    /// existing session must unbind the old peer first.
    pub fn bind(
        &mut self,
        name: &str,
        peer_id: PeerId,
        now: DateTime<Utc>,
    ) -> Result<StatusChange, NodeError> {
        let node = self.ensure(name, now)?;
        if let Some(bound) = node.peer {
            if bound != peer_id {
                return Err(NodeError::AlreadyBoundElsewhere {
                    node: name.to_owned(),
                    peer_id: bound,
                });
            }
        }

        node.peer = Some(peer_id);
        node.last_heartbeat_at = Some(now);
        Ok(apply_status(node, NodeStatus::Online, now))
    }

    /// Detaches the peer and marks the node offline. Returns `None` when the
    /// node was not bound, which keeps repeated teardown paths idempotent.
    pub fn unbind(&mut self, name: &str, now: DateTime<Utc>) -> Option<StatusChange> {
        let node = self.nodes.get_mut(name)?;
        node.peer.take()?;
        Some(apply_status(node, NodeStatus::Offline, now))
    }

    pub fn record_heartbeat(
        &mut self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<StatusChange>, NodeError> {
        let node = self.nodes.get_mut(name).ok_or_else(|| NodeError::NotFound {
            node: name.to_owned(),
        })?;
        if !node.status.is_connected() {
            return Err(NodeError::HeartbeatRejected {
                node: name.to_owned(),
                status: node.status,
            });
        }

        node.last_heartbeat_at = Some(now);
        if node.status == NodeStatus::Degraded {
            return Ok(Some(apply_status(node, NodeStatus::Online, now)));
        }
        Ok(None)
    }

    pub fn mark_degraded(&mut self, name: &str, now: DateTime<Utc>) -> Option<StatusChange> {
        let node = self.nodes.get_mut(name)?;
        if node.status != NodeStatus::Online {
            return None;
        }
        Some(apply_status(node, NodeStatus::Degraded, now))
    }

    /// Names never referenced report as unknown.
    pub fn status(&self, name: &str) -> NodeStatus {
        self.nodes
            .get(name)
            .map_or(NodeStatus::Unknown, |node| node.status)
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn bound_peer(&self, name: &str) -> Option<PeerId> {
        self.nodes.get(name).and_then(|node| node.peer)
    }

    pub fn list(&self) -> Vec<&Node> {
        self.nodes.values().collect()
    }

    /// Forgets a node that holds no peer.
    pub fn remove(&mut self, name: &str) -> Result<Node, NodeError> {
        match self.nodes.get(name) {
            None => Err(NodeError::NotFound {
                node: name.to_owned(),
            }),
            Some(node) if node.peer.is_some() => Err(NodeError::AlreadyBoundElsewhere {
                node: name.to_owned(),
                peer_id: node.peer.unwrap_or_default(),
            }),
            Some(_) => self.nodes.remove(name).ok_or_else(|| NodeError::NotFound {
                node: name.to_owned(),
            }),
        }
    }

    pub fn count_by_status(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for status in [
            NodeStatus::Unknown,
            NodeStatus::Online,
            NodeStatus::Offline,
            NodeStatus::Degraded,
        ] {
            counts.insert(status.as_str(), 0);
        }
        for node in self.nodes.values() {
            *counts.entry(node.status.as_str()).or_insert(0) += 1;
        }
        counts
    }
}

fn unknown_node(name: &str, now: DateTime<Utc>) -> Node {
    Node {
        name: name.to_owned(),
        status: NodeStatus::Unknown,
        peer: None,
        last_heartbeat_at: None,
        status_changed_at: now,
    }
}

fn apply_status(node: &mut Node, to: NodeStatus, now: DateTime<Utc>) -> StatusChange {
    let from = node.status;
    node.status = to;
    node.status_changed_at = now;
    StatusChange {
        node: node.name.clone(),
        from,
        to,
        at: now,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{NodeError, NodeRegistry, NodeStatus};

    fn t0() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn bind_moves_unknown_node_online_with_peer() {
        let mut nodes = NodeRegistry::new(&[], t0());
        assert_eq!(nodes.status("n1"), NodeStatus::Unknown);

        let change = nodes.bind("n1", 7, t0()).expect("bind should succeed");
        assert_eq!(change.from, NodeStatus::Unknown);
        assert_eq!(change.to, NodeStatus::Online);
        assert_eq!(nodes.bound_peer("n1"), Some(7));
        assert_eq!(nodes.get("n1").and_then(|n| n.last_heartbeat_at), Some(t0()));
    }

    #[test]
    fn bind_rejects_second_peer_until_unbound() {
        let mut nodes = NodeRegistry::new(&[], t0());
        nodes.bind("n1", 1, t0()).expect("first bind");

        assert_eq!(
            nodes.bind("n1", 2, t0()),
            Err(NodeError::AlreadyBoundElsewhere {
                node: "n1".to_owned(),
                peer_id: 1
            })
        );

        let change = nodes.unbind("n1", t0()).expect("unbind should report a change");
        assert_eq!(change.to, NodeStatus::Offline);
        assert!(nodes.unbind("n1", t0()).is_none());

        let change = nodes.bind("n1", 2, t0()).expect("rebind");
        assert_eq!(change.from, NodeStatus::Offline);
        assert_eq!(nodes.bound_peer("n1"), Some(2));
    }

    #[test]
    fn heartbeat_restores_degraded_and_is_rejected_when_offline() {
        let mut nodes = NodeRegistry::new(&[], t0());
        nodes.bind("n1", 1, t0()).expect("bind");
        assert!(nodes.mark_degraded("n1", t0()).is_some());
        assert!(nodes.mark_degraded("n1", t0()).is_none());

        let later = t0() + Duration::seconds(1);
        let change = nodes
            .record_heartbeat("n1", later)
            .expect("heartbeat accepted")
            .expect("degraded node should recover");
        assert_eq!(change.to, NodeStatus::Online);
        assert_eq!(nodes.record_heartbeat("n1", later), Ok(None));

        nodes.unbind("n1", later);
        assert_eq!(
            nodes.record_heartbeat("n1", later),
            Err(NodeError::HeartbeatRejected {
                node: "n1".to_owned(),
                status: NodeStatus::Offline
            })
        );
        assert!(matches!(
            nodes.record_heartbeat("ghost", later),
            Err(NodeError::NotFound { .. })
        ));
    }

    #[test]
    fn allow_list_restricts_and_prepopulates() {
        let allowed = vec!["web-1".to_owned(), "db-1".to_owned()];
        let mut nodes = NodeRegistry::new(&allowed, t0());

        assert_eq!(nodes.list().len(), 2);
        assert_eq!(nodes.status("db-1"), NodeStatus::Unknown);
        assert_eq!(
            nodes.bind("cache-1", 1, t0()),
            Err(NodeError::NotAllowed {
                node: "cache-1".to_owned()
            })
        );
        assert!(nodes.bind("web-1", 1, t0()).is_ok());
    }

    #[test]
    fn rejects_malformed_names() {
        let mut nodes = NodeRegistry::new(&[], t0());
        for name in ["", "has space", "slash/name"] {
            assert!(matches!(
                nodes.ensure(name, t0()),
                Err(NodeError::InvalidName { .. })
            ));
        }
        assert!(nodes.ensure("node_01.example-a", t0()).is_ok());
    }

    #[test]
    fn remove_refuses_bound_nodes() {
        let mut nodes = NodeRegistry::new(&[], t0());
        nodes.bind("n1", 1, t0()).expect("bind");
        assert!(nodes.remove("n1").is_err());

        nodes.unbind("n1", t0());
        assert_eq!(nodes.remove("n1").map(|n| n.status), Ok(NodeStatus::Offline));
        assert_eq!(nodes.status("n1"), NodeStatus::Unknown);
        assert!(matches!(nodes.remove("n1"), Err(NodeError::NotFound { .. })));
    }

    #[test]
    fn counts_cover_every_status() {
        let mut nodes = NodeRegistry::new(&[], t0());
        nodes.bind("a", 1, t0()).expect("bind a");
        nodes.ensure("b", t0()).expect("ensure b");

        let counts = nodes.count_by_status();
        assert_eq!(counts.get("online"), Some(&1));
        assert_eq!(counts.get("unknown"), Some(&1));
        assert_eq!(counts.get("degraded"), Some(&0));
    }
}
