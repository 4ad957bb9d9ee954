use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::orchestrator::nodes::NodeRegistry;
use crate::peers::PeerId;

pub const MIN_INTERVAL_MS: u64 = 100;
pub const MAX_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_SOFT_MISSED: u32 = 3;
pub const DEFAULT_HARD_MISSED: u32 = 5;

#[derive(Debug, PartialEq, Eq)]
pub enum HeartbeatError {
    InvalidInterval { provided_ms: u64 },
    InvalidThresholds { soft_missed: u32, hard_missed: u32 },
}

impl fmt::Display for HeartbeatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInterval { provided_ms } => write!(
                f,
                "heartbeat interval must be between {MIN_INTERVAL_MS}ms and {MAX_INTERVAL_MS}ms, got {provided_ms}ms"
            ),
            Self::InvalidThresholds {
                soft_missed,
                hard_missed,
            } => write!(
                f,
                "heartbeat thresholds must satisfy 1 <= soft_missed < hard_missed, got soft={soft_missed} hard={hard_missed}"
            ),
        }
    }
}

impl std::error::Error for HeartbeatError {}

/// How much silence a bound node is allowed before it is degraded or dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    interval_ms: u64,
    soft_missed: u32,
    hard_missed: u32,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_INTERVAL_MS,
            soft_missed: DEFAULT_SOFT_MISSED,
            hard_missed: DEFAULT_HARD_MISSED,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Liveness {
    Healthy,
    Degraded,
    Expired,
}

/// Range check shared by the controller policy and the agent's send cadence.
pub fn validate_interval_ms(interval_ms: u64) -> Result<u64, HeartbeatError> {
    if !(MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(&interval_ms) {
        return Err(HeartbeatError::InvalidInterval {
            provided_ms: interval_ms,
        });
    }
    Ok(interval_ms)
}

impl HeartbeatPolicy {
    pub fn new(interval_ms: u64, soft_missed: u32, hard_missed: u32) -> Result<Self, HeartbeatError> {
        let interval_ms = validate_interval_ms(interval_ms)?;
        if soft_missed == 0 || soft_missed >= hard_missed {
            return Err(HeartbeatError::InvalidThresholds {
                soft_missed,
                hard_missed,
            });
        }

        Ok(Self {
            interval_ms,
            soft_missed,
            hard_missed,
        })
    }

    pub fn from_app_config(app_config: &crate::config::AppConfig) -> Result<Self, HeartbeatError> {
        let cfg = &app_config.heartbeat;
        Self::new(cfg.interval_ms, cfg.soft_missed, cfg.hard_missed)
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn soft_timeout_ms(&self) -> u64 {
        self.interval_ms.saturating_mul(u64::from(self.soft_missed))
    }

    pub fn hard_timeout_ms(&self) -> u64 {
        self.interval_ms.saturating_mul(u64::from(self.hard_missed))
    }

    pub fn assess(&self, last_heartbeat_at: DateTime<Utc>, now: DateTime<Utc>) -> Liveness {
        let silent_ms = silence_ms(last_heartbeat_at, now);
        if silent_ms >= self.hard_timeout_ms() {
            Liveness::Expired
        } else if silent_ms >= self.soft_timeout_ms() {
            Liveness::Degraded
        } else {
            Liveness::Healthy
        }
    }

    pub fn metadata_payload(&self) -> Value {
        json!({
            "interval_ms": self.interval_ms,
            "soft_missed": self.soft_missed,
            "hard_missed": self.hard_missed,
            "soft_timeout_ms": self.soft_timeout_ms(),
            "hard_timeout_ms": self.hard_timeout_ms(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LivenessVerdict {
    pub node: String,
    pub peer_id: PeerId,
    pub liveness: Liveness,
    pub silent_ms: u64,
}

/// Evaluates every bound node's heartbeat timer on each engine tick.
///
/// The per-node "timer" is the node's last heartbeat timestamp: binding and
/// every accepted heartbeat restart it, so expiry is a pure function of that
/// timestamp, the policy and the tick's clock.
#[derive(Clone, Copy, Debug)]
pub struct HeartbeatMonitor {
    policy: HeartbeatPolicy,
}

impl HeartbeatMonitor {
    pub fn new(policy: HeartbeatPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> HeartbeatPolicy {
        self.policy
    }

    /// Returns the nodes whose liveness calls for a transition: online nodes
    /// past the soft threshold and any bound node past the hard threshold.
    pub fn sweep(&self, nodes: &NodeRegistry, now: DateTime<Utc>) -> Vec<LivenessVerdict> {
        let mut verdicts = Vec::new();
        for node in nodes.list() {
            let (Some(peer_id), Some(last)) = (node.peer, node.last_heartbeat_at) else {
                continue;
            };

            let liveness = self.policy.assess(last, now);
            let actionable = match liveness {
                Liveness::Expired => true,
                Liveness::Degraded => node.status == crate::orchestrator::nodes::NodeStatus::Online,
                Liveness::Healthy => false,
            };
            if actionable {
                verdicts.push(LivenessVerdict {
                    node: node.name.clone(),
                    peer_id,
                    liveness,
                    silent_ms: silence_ms(last, now),
                });
            }
        }
        verdicts
    }
}

/// Sender side: tells the agent loop when the next heartbeat is due.
#[derive(Debug)]
pub struct HeartbeatTicker {
    interval: Duration,
    next_due: Instant,
}

impl HeartbeatTicker {
    pub fn new(interval_ms: u64, now: Instant) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
            next_due: now,
        }
    }

    pub fn poll(&mut self, now: Instant) -> bool {
        if now < self.next_due {
            return false;
        }
        self.next_due = now + self.interval;
        true
    }
}

fn silence_ms(last: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (now - last).num_milliseconds().max(0) as u64
}
