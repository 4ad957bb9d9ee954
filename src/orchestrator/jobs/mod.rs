use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::orchestrator::dispatch::OperationDescriptor;

pub type JobId = u64;

pub const DEFAULT_RETENTION_MS: u64 = 300_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NodeLost,
    Remote,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NodeLost => "node_lost",
            Self::Remote => "remote",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub code: String,
    pub message: String,
}

impl JobFailure {
    pub fn node_lost(node: &str, reason: &str) -> Self {
        Self {
            kind: FailureKind::NodeLost,
            code: "NODE_LOST".to_owned(),
            message: format!("node '{node}' lost: {reason}"),
        }
    }

    pub fn remote(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Remote,
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub node: String,
    pub operation: OperationDescriptor,
    pub state: JobState,
    pub result: Option<Value>,
    pub error: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub observed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn to_json(&self) -> Value {
        let mut value = json!({
            "jid": self.id,
            "node": self.node,
            "verb": self.operation.verb.as_str(),
            "unit": self.operation.unit,
            "state": self.state.as_str(),
            "created_at": self.created_at.to_rfc3339(),
        });
        if let Some(result) = &self.result {
            value["result"] = result.clone();
        }
        if let Some(error) = &self.error {
            value["error"] = json!({
                "kind": error.kind.as_str(),
                "code": error.code,
                "message": error.message,
            });
        }
        if let Some(resolved_at) = self.resolved_at {
            value["resolved_at"] = Value::String(resolved_at.to_rfc3339());
        }
        value
    }
}

/// Outcome of a resolution attempt. Late or duplicate resolutions are not
/// errors: the first terminal transition wins and later ones are reported
/// back so the caller can log and drop them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    Applied(JobState),
    AlreadyTerminal(JobState),
    Unknown,
}

#[derive(Debug, PartialEq, Eq)]
pub enum JobError {
    NotFound { job_id: JobId },
    AlreadyTerminal { job_id: JobId, state: JobState },
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { job_id } => write!(f, "job {job_id} not found"),
            Self::AlreadyTerminal { job_id, state } => {
                write!(f, "job {job_id} is already {}", state.as_str())
            }
        }
    }
}

impl std::error::Error for JobError {}

/// Owns every job record. Ids are monotonic for the life of the process and
/// never reused, even after retention drops a record.
pub struct JobManager {
    jobs: BTreeMap<JobId, Job>,
    last_id: JobId,
    retention: Duration,
}

impl JobManager {
    pub fn new(retention_ms: u64) -> Self {
        Self {
            jobs: BTreeMap::new(),
            last_id: 0,
            retention: Duration::milliseconds(i64::try_from(retention_ms).unwrap_or(i64::MAX)),
        }
    }

    pub fn create(&mut self, node: &str, operation: OperationDescriptor, now: DateTime<Utc>) -> JobId {
        self.last_id += 1;
        let id = self.last_id;
        self.jobs.insert(
            id,
            Job {
                id,
                node: node.to_owned(),
                operation,
                state: JobState::Pending,
                result: None,
                error: None,
                created_at: now,
                resolved_at: None,
                observed_at: None,
            },
        );
        id
    }

    pub fn resolve_success(&mut self, job_id: JobId, result: Value, now: DateTime<Utc>) -> Resolution {
        self.transition(job_id, now, |job| {
            job.state = JobState::Completed;
            job.result = Some(result);
        })
    }

    pub fn resolve_failure(
        &mut self,
        job_id: JobId,
        failure: JobFailure,
        now: DateTime<Utc>,
    ) -> Resolution {
        self.transition(job_id, now, |job| {
            job.state = JobState::Failed;
            job.error = Some(failure);
        })
    }

    /// Best-effort cancel. The remote operation is not recalled; a late
    /// result for a cancelled job resolves to `AlreadyTerminal`.
    pub fn cancel(&mut self, job_id: JobId, now: DateTime<Utc>) -> Result<(), JobError> {
        match self.transition(job_id, now, |job| job.state = JobState::Cancelled) {
            Resolution::Applied(_) => Ok(()),
            Resolution::AlreadyTerminal(state) => Err(JobError::AlreadyTerminal { job_id, state }),
            Resolution::Unknown => Err(JobError::NotFound { job_id }),
        }
    }

    pub fn get(&self, job_id: JobId) -> Option<&Job> {
        self.jobs.get(&job_id)
    }

    /// Returns a snapshot and, for terminal jobs, stamps the first
    /// observation so retention can start counting.
    pub fn observe(&mut self, job_id: JobId, now: DateTime<Utc>) -> Option<Job> {
        let job = self.jobs.get_mut(&job_id)?;
        if job.state.is_terminal() && job.observed_at.is_none() {
            job.observed_at = Some(now);
        }
        Some(job.clone())
    }

    pub fn list(&self, node: Option<&str>) -> Vec<&Job> {
        self.jobs
            .values()
            .filter(|job| node.map_or(true, |name| job.node == name))
            .collect()
    }

    pub fn pending_for_node(&self, node: &str) -> Vec<JobId> {
        self.jobs
            .values()
            .filter(|job| job.node == node && job.state == JobState::Pending)
            .map(|job| job.id)
            .collect()
    }

    /// Fails every pending job targeting `node` with the given failure and
    /// returns the ids that actually transitioned.
    pub fn fail_pending_for_node(
        &mut self,
        node: &str,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> Vec<JobId> {
        let pending = self.pending_for_node(node);
        pending
            .into_iter()
            .filter(|job_id| {
                matches!(
                    self.resolve_failure(*job_id, failure.clone(), now),
                    Resolution::Applied(_)
                )
            })
            .collect()
    }

    /// Drops terminal jobs that were either observed or resolved longer ago
    /// than the retention window. Pending jobs are never collected.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let retention = self.retention;
        let before = self.jobs.len();
        self.jobs.retain(|_, job| {
            if !job.state.is_terminal() {
                return true;
            }
            let anchor = job.observed_at.or(job.resolved_at).unwrap_or(job.created_at);
            now - anchor < retention
        });
        before - self.jobs.len()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn count_by_state(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for state in [
            JobState::Pending,
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
        ] {
            counts.insert(state.as_str(), 0);
        }
        for job in self.jobs.values() {
            *counts.entry(job.state.as_str()).or_insert(0) += 1;
        }
        counts
    }

    fn transition<F>(&mut self, job_id: JobId, now: DateTime<Utc>, apply: F) -> Resolution
    where
        F: FnOnce(&mut Job),
    {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return Resolution::Unknown;
        };
        if job.state.is_terminal() {
            return Resolution::AlreadyTerminal(job.state);
        }

        apply(job);
        job.resolved_at = Some(now);
        Resolution::Applied(job.state)
    }
}
