pub mod dispatch;
pub mod jobs;
pub mod nodes;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::events::{EventEmitter, JOB_RESOLVED_EVENT, NODE_STATUS_CHANGED_EVENT, PEER_REPLACED_EVENT};
use crate::heartbeat::{HeartbeatError, HeartbeatMonitor, HeartbeatPolicy, Liveness};
use crate::logging::{LogLevel, Logger};
use crate::peers::{PeerChannel, PeerError, PeerId, PeerRegistry};
use crate::wire::codec::WireCodec;
use crate::wire::session::{
    build_job_state_frame, build_node_status_frame, build_protocol_error_frame,
    PROTOCOL_VIOLATION_CODE,
};
use crate::wire::envelope::SIGNAL_REQUEST_ID;

use dispatch::{DispatchError, OperationDescriptor};
use jobs::{Job, JobError, JobFailure, JobId, JobManager, Resolution};
use nodes::{Node, NodeError, NodeRegistry, StatusChange};

const PEERS_CONTEXT: &str = "controller::peers";
const NODES_CONTEXT: &str = "controller::nodes";
const JOBS_CONTEXT: &str = "controller::jobs";
const HEARTBEAT_CONTEXT: &str = "controller::heartbeat";

/// Anonymous peers get this many heartbeat intervals to send HELLO.
pub const HELLO_TIMEOUT_INTERVALS: i32 = 5;
/// ...and this many, counted from connect, to REGISTER or ATTACH.
pub const IDENTIFY_TIMEOUT_INTERVALS: i32 = 10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerSettings {
    pub heartbeat: HeartbeatPolicy,
    pub retention_ms: u64,
    pub allowed_nodes: Vec<String>,
}

impl ControllerSettings {
    pub fn from_app_config(app_config: &AppConfig) -> Result<Self, HeartbeatError> {
        Ok(Self {
            heartbeat: HeartbeatPolicy::from_app_config(app_config)?,
            retention_ms: app_config.jobs.retention_ms,
            allowed_nodes: app_config.nodes.allowed.clone(),
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ControllerError {
    Peer(PeerError),
    Node(NodeError),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Peer(source) => write!(f, "peer error: {source}"),
            Self::Node(source) => write!(f, "node error: {source}"),
        }
    }
}

impl std::error::Error for ControllerError {}

/// Process-wide controller state, driven exclusively by the engine thread.
///
/// Every path that destroys a peer goes through [`Controller::remove_peer`],
/// which unbinds the node and fails its pending jobs in the same call, so no
/// caller can observe an offline node with pending work or a connected node
/// without a peer.
pub struct Controller {
    codec: WireCodec,
    logger: Arc<Logger>,
    emitter: Arc<EventEmitter>,
    peers: PeerRegistry,
    nodes: NodeRegistry,
    jobs: JobManager,
    monitor: HeartbeatMonitor,
    started_at: DateTime<Utc>,
}

impl Controller {
    pub fn new(
        settings: ControllerSettings,
        codec: WireCodec,
        logger: Arc<Logger>,
        emitter: Arc<EventEmitter>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            codec,
            logger,
            emitter,
            peers: PeerRegistry::new(),
            nodes: NodeRegistry::new(&settings.allowed_nodes, now),
            jobs: JobManager::new(settings.retention_ms),
            monitor: HeartbeatMonitor::new(settings.heartbeat),
            started_at: now,
        }
    }

    pub fn codec(&self) -> WireCodec {
        self.codec
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn heartbeat_policy(&self) -> HeartbeatPolicy {
        self.monitor.policy()
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn peers_mut(&mut self) -> &mut PeerRegistry {
        &mut self.peers
    }

    pub fn nodes(&self) -> &NodeRegistry {
        &self.nodes
    }

    pub fn jobs(&self) -> &JobManager {
        &self.jobs
    }

    pub fn accept(&mut self, channel: Box<dyn PeerChannel>, now: DateTime<Utc>) -> PeerId {
        let peer_id = self.peers.accept(channel, now);
        if let Some(peer) = self.peers.get(peer_id) {
            self.logger.log(
                LogLevel::Debug,
                Some(PEERS_CONTEXT),
                "Peer accepted",
                Some(json!({"peer_id": peer_id, "remote_addr": peer.remote_addr()})),
            );
        }
        peer_id
    }

    /// Binds `node` to the identifying peer. A live peer already holding the
    /// name is torn down first; the newest connection always wins.
    pub fn register_node(
        &mut self,
        peer_id: PeerId,
        node: &str,
        now: DateTime<Utc>,
    ) -> Result<Uuid, ControllerError> {
        self.nodes.validate_name(node).map_err(ControllerError::Node)?;
        if self.peers.get(peer_id).is_none() {
            return Err(ControllerError::Peer(PeerError::PeerNotFound { peer_id }));
        }

        let previous = self.nodes.bound_peer(node).or_else(|| self.peers.lookup(node));
        if let Some(previous) = previous.filter(|previous| *previous != peer_id) {
            self.logger.log(
                LogLevel::Info,
                Some(PEERS_CONTEXT),
                "Replacing node session with newer connection",
                Some(json!({"node": node, "previous_peer_id": previous, "peer_id": peer_id})),
            );
            self.emit(
                PEER_REPLACED_EVENT,
                json!({"node": node, "previous_peer_id": previous, "peer_id": peer_id}),
            );
            self.remove_peer(previous, "replaced by a newer connection", now);
        }

        let session_id = self
            .peers
            .claim_node(peer_id, node, now)
            .map_err(ControllerError::Peer)?;
        let change = self
            .nodes
            .bind(node, peer_id, now)
            .map_err(ControllerError::Node)?;
        self.publish_status_change(&change);
        Ok(session_id)
    }

    pub fn attach_operator(&mut self, peer_id: PeerId, now: DateTime<Utc>) -> Result<(), PeerError> {
        self.peers.attach_operator(peer_id, now)?;
        self.logger.log(
            LogLevel::Debug,
            Some(PEERS_CONTEXT),
            "Operator session attached",
            Some(json!({"peer_id": peer_id})),
        );
        Ok(())
    }

    pub fn record_heartbeat(&mut self, peer_id: PeerId, now: DateTime<Utc>) -> Result<(), NodeError> {
        let Some(node) = self
            .peers
            .get(peer_id)
            .and_then(|peer| peer.node_name())
            .map(str::to_owned)
        else {
            return Err(NodeError::NotFound {
                node: format!("<peer {peer_id}>"),
            });
        };

        if let Some(change) = self.nodes.record_heartbeat(&node, now)? {
            self.logger.log(
                LogLevel::Info,
                Some(HEARTBEAT_CONTEXT),
                "Node recovered from degraded state",
                Some(json!({"node": node})),
            );
            self.publish_status_change(&change);
        }
        Ok(())
    }

    pub fn dispatch(
        &mut self,
        node: &str,
        operation: OperationDescriptor,
        now: DateTime<Utc>,
    ) -> Result<JobId, DispatchError> {
        let summary = json!({"node": node, "verb": operation.verb.as_str(), "unit": operation.unit});
        let job_id = dispatch::dispatch(
            &mut self.peers,
            &self.nodes,
            &mut self.jobs,
            &self.codec,
            node,
            operation,
            now,
        )?;

        let mut payload = summary;
        payload["jid"] = json!(job_id);
        self.logger
            .log(LogLevel::Info, Some(JOBS_CONTEXT), "Job dispatched", Some(payload));

        // A write failure on the call frame surfaces here as node loss.
        self.reap_failed_peers(now);
        Ok(job_id)
    }

    /// Feeds a node's reply into the job it belongs to. Replies for calls the
    /// peer no longer tracks, or for jobs already terminal, are dropped.
    pub fn complete_call(
        &mut self,
        peer_id: PeerId,
        call_id: &str,
        outcome: Result<Value, JobFailure>,
        now: DateTime<Utc>,
    ) -> Resolution {
        let Some(job_id) = self
            .peers
            .get_mut(peer_id)
            .and_then(|peer| peer.take_call(call_id))
        else {
            self.logger.log(
                LogLevel::Warn,
                Some(JOBS_CONTEXT),
                "Discarding reply for unknown call",
                Some(json!({"peer_id": peer_id, "call_id": call_id})),
            );
            return Resolution::Unknown;
        };

        let resolution = match outcome {
            Ok(result) => self.jobs.resolve_success(job_id, result, now),
            Err(failure) => self.jobs.resolve_failure(job_id, failure, now),
        };
        match resolution {
            Resolution::Applied(_) => self.publish_job_state(job_id),
            Resolution::AlreadyTerminal(state) => self.logger.log(
                LogLevel::Debug,
                Some(JOBS_CONTEXT),
                "Discarding late reply for terminal job",
                Some(json!({"jid": job_id, "state": state.as_str()})),
            ),
            Resolution::Unknown => self.logger.log(
                LogLevel::Debug,
                Some(JOBS_CONTEXT),
                "Discarding reply for collected job",
                Some(json!({"jid": job_id})),
            ),
        }
        resolution
    }

    pub fn cancel_job(&mut self, job_id: JobId, now: DateTime<Utc>) -> Result<(), JobError> {
        self.jobs.cancel(job_id, now)?;
        self.publish_job_state(job_id);
        Ok(())
    }

    pub fn observe_job(&mut self, job_id: JobId, now: DateTime<Utc>) -> Option<Job> {
        self.jobs.observe(job_id, now)
    }

    /// Single teardown site for a peer. Idempotent: returns `false` when the
    /// peer is already gone.
    pub fn remove_peer(&mut self, peer_id: PeerId, reason: &str, now: DateTime<Utc>) -> bool {
        let Some(peer) = self.peers.remove(peer_id) else {
            return false;
        };

        let mut node_payload = json!({
            "peer_id": peer_id,
            "role": peer.role().as_str(),
            "reason": reason,
        });

        if let Some(node) = peer.node_name() {
            node_payload["node"] = json!(node);
            if self.nodes.bound_peer(node) == Some(peer_id) {
                let change = self.nodes.unbind(node, now);
                let failed = self
                    .jobs
                    .fail_pending_for_node(node, &JobFailure::node_lost(node, reason), now);
                node_payload["failed_jobs"] = json!(failed);

                if let Some(change) = change {
                    self.publish_status_change(&change);
                }
                for job_id in failed {
                    self.publish_job_state(job_id);
                }
            }
        }

        self.logger.log(
            LogLevel::Info,
            Some(PEERS_CONTEXT),
            "Peer removed",
            Some(node_payload),
        );
        true
    }

    /// Sends ERR PROTOCOL_VIOLATION to the peer and tears it down.
    pub fn reject_peer(
        &mut self,
        peer_id: PeerId,
        request_id: Option<&str>,
        message: &str,
        now: DateTime<Utc>,
    ) {
        let request_id = request_id.unwrap_or(SIGNAL_REQUEST_ID);
        self.send_error(peer_id, request_id, PROTOCOL_VIOLATION_CODE, message);
        self.logger.log(
            LogLevel::Warn,
            Some(PEERS_CONTEXT),
            "Protocol violation; closing peer",
            Some(json!({"peer_id": peer_id, "rid": request_id, "message": message})),
        );
        self.remove_peer(peer_id, &format!("protocol violation: {message}"), now);
    }

    /// Tears down the node's peer, if any, then forgets the node entirely.
    pub fn remove_node(&mut self, node: &str, now: DateTime<Utc>) -> Result<Node, NodeError> {
        if let Some(peer_id) = self.nodes.bound_peer(node) {
            self.remove_peer(peer_id, "node removed by administrator", now);
        }
        let removed = self.nodes.remove(node)?;
        self.logger.log(
            LogLevel::Info,
            Some(NODES_CONTEXT),
            "Node removed",
            Some(json!({"node": node})),
        );
        Ok(removed)
    }

    /// Periodic maintenance run by the engine on every tick.
    pub fn sweep(&mut self, now: DateTime<Utc>) {
        for verdict in self.monitor.sweep(&self.nodes, now) {
            match verdict.liveness {
                Liveness::Degraded => {
                    if let Some(change) = self.nodes.mark_degraded(&verdict.node, now) {
                        self.logger.log(
                            LogLevel::Warn,
                            Some(HEARTBEAT_CONTEXT),
                            "Node missed heartbeats; degraded",
                            Some(json!({"node": verdict.node, "silent_ms": verdict.silent_ms})),
                        );
                        self.publish_status_change(&change);
                    }
                }
                Liveness::Expired => {
                    self.logger.log(
                        LogLevel::Warn,
                        Some(HEARTBEAT_CONTEXT),
                        "Node heartbeat expired; dropping peer",
                        Some(json!({"node": verdict.node, "silent_ms": verdict.silent_ms})),
                    );
                    self.remove_peer(
                        verdict.peer_id,
                        &format!("no heartbeat for {}ms", verdict.silent_ms),
                        now,
                    );
                }
                Liveness::Healthy => {}
            }
        }

        let interval = Duration::milliseconds(
            i64::try_from(self.monitor.policy().interval_ms()).unwrap_or(i64::MAX),
        );
        for (peer_id, reason) in self.peers.overdue_anonymous(
            now,
            interval * HELLO_TIMEOUT_INTERVALS,
            interval * IDENTIFY_TIMEOUT_INTERVALS,
        ) {
            self.reject_peer(peer_id, None, reason, now);
        }

        let collected = self.jobs.sweep(now);
        if collected > 0 {
            self.logger.log(
                LogLevel::Debug,
                Some(JOBS_CONTEXT),
                "Collected terminal jobs past retention",
                Some(json!({"collected": collected, "remaining": self.jobs.len()})),
            );
        }

        self.reap_failed_peers(now);
    }

    pub fn flush_peers(&mut self) {
        for peer_id in self.peers.ids() {
            if let Some(peer) = self.peers.get_mut(peer_id) {
                peer.flush();
            }
        }
    }

    pub fn reap_failed_peers(&mut self, now: DateTime<Utc>) {
        for (peer_id, reason) in self.peers.failed() {
            self.remove_peer(peer_id, &reason, now);
        }
    }

    pub fn send_frame(&mut self, peer_id: PeerId, frame: &[u8]) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.send_frame(frame);
        }
    }

    pub fn send_error(&mut self, peer_id: PeerId, request_id: &str, code: &str, message: &str) {
        match build_protocol_error_frame(&self.codec, request_id, code, message) {
            Ok(frame) => self.send_frame(peer_id, &frame),
            Err(error) => self.logger.warn(
                Some(PEERS_CONTEXT),
                &format!("failed to build ERR frame for peer {peer_id}: {error}"),
            ),
        }
    }

    /// Tears down every peer; pending jobs fail as node lost.
    pub fn shutdown(&mut self, now: DateTime<Utc>) {
        for peer_id in self.peers.ids() {
            self.remove_peer(peer_id, "controller shutting down", now);
        }
    }

    fn publish_status_change(&mut self, change: &StatusChange) {
        self.logger.log(
            LogLevel::Info,
            Some(NODES_CONTEXT),
            "Node status changed",
            Some(change.to_json()),
        );
        self.emit(NODE_STATUS_CHANGED_EVENT, change.to_json());
        match build_node_status_frame(&self.codec, change) {
            Ok(frame) => self.broadcast(&frame),
            Err(error) => self.logger.warn(
                Some(NODES_CONTEXT),
                &format!("failed to build NODE_STATUS signal: {error}"),
            ),
        }
    }

    fn publish_job_state(&mut self, job_id: JobId) {
        let Some(job) = self.jobs.get(job_id) else {
            return;
        };
        let payload = job.to_json();
        let frame = build_job_state_frame(&self.codec, job);

        self.logger.log(
            LogLevel::Info,
            Some(JOBS_CONTEXT),
            "Job resolved",
            Some(json!({"jid": job_id, "state": payload["state"], "error": payload.get("error")})),
        );
        self.emit(JOB_RESOLVED_EVENT, payload);
        match frame {
            Ok(frame) => self.broadcast(&frame),
            Err(error) => self.logger.warn(
                Some(JOBS_CONTEXT),
                &format!("failed to build JOB_STATE signal: {error}"),
            ),
        }
    }

    fn broadcast(&mut self, frame: &[u8]) {
        for peer_id in self.peers.subscribers() {
            self.send_frame(peer_id, frame);
        }
    }

    fn emit(&self, event: &str, payload: Value) {
        if let Err(error) = self.emitter.emit(event, Some(payload)) {
            self.logger.warn(Some("controller::events"), &error.to_string());
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    use crate::events::{EventEmitter, JOB_RESOLVED_EVENT, PEER_REPLACED_EVENT};
    use crate::heartbeat::HeartbeatPolicy;
    use crate::logging::tests::memory_logger;
    use crate::logging::LogLevel;
    use crate::peers::tests::{MemoryChannel, RemoteEnd};
    use crate::peers::PeerId;
    use crate::wire::codec::{CodecConfig, WireCodec};
    use crate::wire::session::{JOB_STATE_MESSAGE_TYPE, NODE_STATUS_MESSAGE_TYPE};

    use super::dispatch::{DispatchError, OperationDescriptor, UnitVerb};
    use super::jobs::{FailureKind, JobError, JobFailure, JobState, Resolution};
    use super::nodes::NodeStatus;
    use super::{Controller, ControllerError, ControllerSettings};

    pub(crate) fn t0() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    pub(crate) fn controller_with(allowed: &[&str], emitter: Arc<EventEmitter>) -> Controller {
        let (logger, _sink) = memory_logger(LogLevel::Verbose);
        Controller::new(
            ControllerSettings {
                heartbeat: HeartbeatPolicy::new(1_000, 3, 5).expect("policy"),
                retention_ms: 60_000,
                allowed_nodes: allowed.iter().map(|name| (*name).to_owned()).collect(),
            },
            WireCodec::new(CodecConfig::default()),
            logger,
            emitter,
            t0(),
        )
    }

    fn controller() -> Controller {
        controller_with(&[], Arc::new(EventEmitter::new()))
    }

    pub(crate) fn connect_node(
        controller: &mut Controller,
        node: &str,
        now: chrono::DateTime<Utc>,
    ) -> (PeerId, RemoteEnd) {
        let (channel, remote) = MemoryChannel::pair();
        let peer_id = controller.accept(Box::new(channel), now);
        controller
            .peers_mut()
            .mark_helloed(peer_id, now)
            .expect("hello");
        controller
            .register_node(peer_id, node, now)
            .expect("register should succeed");
        (peer_id, remote)
    }

    fn start(unit: &str) -> OperationDescriptor {
        OperationDescriptor::new(UnitVerb::Start, unit)
    }

    fn call_id_of(remote: &RemoteEnd, codec: &WireCodec) -> String {
        remote
            .take_envelopes(codec)
            .into_iter()
            .next()
            .expect("a call frame should have been sent")
            .request_id
    }

    /// Checks that connected status and a bound live peer always coincide.
    fn assert_binding_invariant(controller: &Controller) {
        for node in controller.nodes().list() {
            let bound = node.peer.is_some();
            assert_eq!(
                bound,
                node.status.is_connected(),
                "node '{}' status {:?} with peer {:?}",
                node.name,
                node.status,
                node.peer
            );
            if let Some(peer_id) = node.peer {
                let peer = controller.peers().get(peer_id).expect("bound peer must be live");
                assert_eq!(peer.node_name(), Some(node.name.as_str()));
                assert_eq!(controller.peers().lookup(&node.name), Some(peer_id));
            }
        }
    }

    #[test]
    fn dispatch_to_unknown_node_creates_no_job() {
        let mut controller = controller();
        let result = controller.dispatch("ghost", start("a.service"), t0());

        assert!(matches!(result, Err(DispatchError::NodeUnavailable { .. })));
        assert!(controller.jobs().get(1).is_none());
        assert!(controller.jobs().is_empty());
    }

    #[test]
    fn reply_completes_job_and_cancel_then_reports_terminal() {
        let mut controller = controller();
        let codec = controller.codec();
        let (peer_id, remote) = connect_node(&mut controller, "n1", t0());

        let job_id = controller
            .dispatch("n1", start("nginx.service"), t0())
            .expect("dispatch should succeed");
        assert_eq!(job_id, 1);
        assert_eq!(controller.jobs().get(1).map(|j| j.state), Some(JobState::Pending));

        let call_id = call_id_of(&remote, &codec);
        assert_eq!(
            controller.complete_call(peer_id, &call_id, Ok(json!({"active": true})), t0()),
            Resolution::Applied(JobState::Completed)
        );
        assert_eq!(
            controller.cancel_job(1, t0()),
            Err(JobError::AlreadyTerminal {
                job_id: 1,
                state: JobState::Completed
            })
        );
        assert_eq!(
            controller.complete_call(peer_id, &call_id, Ok(json!({})), t0()),
            Resolution::Unknown
        );
    }

    #[test]
    fn remote_failure_is_distinct_from_node_loss() {
        let mut controller = controller();
        let codec = controller.codec();
        let (peer_id, remote) = connect_node(&mut controller, "n1", t0());
        let job_id = controller.dispatch("n1", start("bad.service"), t0()).expect("dispatch");
        let call_id = call_id_of(&remote, &codec);

        controller.complete_call(
            peer_id,
            &call_id,
            Err(JobFailure::remote("REMOTE_FAILURE", "unit not found")),
            t0(),
        );

        let job = controller.jobs().get(job_id).expect("job");
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error.as_ref().map(|e| e.kind), Some(FailureKind::Remote));
        assert_eq!(controller.nodes().status("n1"), NodeStatus::Online);
    }

    #[test]
    fn heartbeat_silence_degrades_then_drops_node_and_fails_jobs() {
        let mut controller = controller();
        let (_peer_id, remote) = connect_node(&mut controller, "n1", t0());
        let job_id = controller
            .dispatch("n1", start("nginx.service"), t0() + Duration::seconds(2))
            .expect("dispatch");

        controller.sweep(t0() + Duration::seconds(3));
        assert_eq!(controller.nodes().status("n1"), NodeStatus::Degraded);
        assert_binding_invariant(&controller);

        controller.sweep(t0() + Duration::seconds(5));
        assert_eq!(controller.nodes().status("n1"), NodeStatus::Offline);
        let job = controller.jobs().get(job_id).expect("job");
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error.as_ref().map(|e| e.kind), Some(FailureKind::NodeLost));
        assert!(remote.is_shut_down());
        assert!(controller.peers().is_empty());
        assert_binding_invariant(&controller);

        assert!(matches!(
            controller.dispatch("n1", start("nginx.service"), t0() + Duration::seconds(6)),
            Err(DispatchError::NodeUnavailable { .. })
        ));
    }

    #[test]
    fn heartbeat_restores_degraded_node_and_resets_clock() {
        let mut controller = controller();
        let (peer_id, _remote) = connect_node(&mut controller, "n1", t0());

        controller.sweep(t0() + Duration::seconds(3));
        assert_eq!(controller.nodes().status("n1"), NodeStatus::Degraded);

        controller
            .record_heartbeat(peer_id, t0() + Duration::seconds(4))
            .expect("heartbeat accepted");
        assert_eq!(controller.nodes().status("n1"), NodeStatus::Online);

        controller.sweep(t0() + Duration::seconds(6));
        assert_eq!(controller.nodes().status("n1"), NodeStatus::Online);
        controller.sweep(t0() + Duration::seconds(9));
        assert_eq!(controller.nodes().status("n1"), NodeStatus::Offline);
    }

    #[test]
    fn second_connection_replaces_first_and_fails_its_jobs() {
        let replaced = Arc::new(Mutex::new(Vec::new()));
        let emitter = Arc::new(EventEmitter::new());
        let seen = Arc::clone(&replaced);
        emitter.on(PEER_REPLACED_EVENT, move |event| {
            seen.lock().expect("seen lock").push(event.payload.clone());
            Ok(())
        });
        let mut controller = controller_with(&[], emitter);

        let (first, first_remote) = connect_node(&mut controller, "n1", t0());
        let job_id = controller.dispatch("n1", start("a.service"), t0()).expect("dispatch");
        let (second, _second_remote) = connect_node(&mut controller, "n1", t0());

        assert!(controller.peers().get(first).is_none());
        assert!(first_remote.is_shut_down());
        assert_eq!(controller.nodes().bound_peer("n1"), Some(second));
        assert_eq!(controller.nodes().status("n1"), NodeStatus::Online);
        let job = controller.jobs().get(job_id).expect("job");
        assert_eq!(job.error.as_ref().map(|e| e.kind), Some(FailureKind::NodeLost));
        assert_eq!(replaced.lock().expect("seen lock").len(), 1);
        assert_binding_invariant(&controller);
    }

    #[test]
    fn peer_removal_is_idempotent_and_late_replies_are_dropped() {
        let mut controller = controller();
        let codec = controller.codec();
        let (peer_id, remote) = connect_node(&mut controller, "n1", t0());
        let job_id = controller.dispatch("n1", start("a.service"), t0()).expect("dispatch");
        let call_id = call_id_of(&remote, &codec);

        assert!(controller.remove_peer(peer_id, "peer closed connection", t0()));
        assert!(!controller.remove_peer(peer_id, "peer closed connection", t0()));
        assert_eq!(
            controller.complete_call(peer_id, &call_id, Ok(json!({})), t0()),
            Resolution::Unknown
        );
        assert_eq!(
            controller.jobs().get(job_id).map(|j| j.state),
            Some(JobState::Failed)
        );
        assert_binding_invariant(&controller);
    }

    #[test]
    fn write_failure_during_dispatch_cascades_immediately() {
        let mut controller = controller();
        let (_peer_id, remote) = connect_node(&mut controller, "n1", t0());
        remote.close();

        let job_id = controller.dispatch("n1", start("a.service"), t0()).expect("job was created");

        assert_eq!(controller.nodes().status("n1"), NodeStatus::Offline);
        assert_eq!(
            controller.jobs().get(job_id).and_then(|j| j.error.as_ref().map(|e| e.kind)),
            Some(FailureKind::NodeLost)
        );
        assert_binding_invariant(&controller);
    }

    #[test]
    fn subscribers_receive_status_and_job_signals() {
        let resolved = Arc::new(Mutex::new(0));
        let emitter = Arc::new(EventEmitter::new());
        let counter = Arc::clone(&resolved);
        emitter.on(JOB_RESOLVED_EVENT, move |_event| {
            *counter.lock().expect("counter lock") += 1;
            Ok(())
        });
        let mut controller = controller_with(&[], emitter);
        let codec = controller.codec();

        let (channel, operator) = MemoryChannel::pair();
        let operator_id = controller.accept(Box::new(channel), t0());
        controller.peers_mut().mark_helloed(operator_id, t0()).expect("hello");
        controller.attach_operator(operator_id, t0()).expect("attach");
        controller.peers_mut().set_subscribed(operator_id, true).expect("subscribe");

        let (peer_id, _remote) = connect_node(&mut controller, "n1", t0());
        controller.dispatch("n1", start("a.service"), t0()).expect("dispatch");
        controller.remove_peer(peer_id, "peer closed connection", t0());

        let types: Vec<i64> = operator
            .take_envelopes(&codec)
            .iter()
            .map(|envelope| envelope.message_type)
            .collect();
        assert_eq!(
            types,
            vec![NODE_STATUS_MESSAGE_TYPE, NODE_STATUS_MESSAGE_TYPE, JOB_STATE_MESSAGE_TYPE]
        );
        assert_eq!(*resolved.lock().expect("counter lock"), 1);
    }

    #[test]
    fn anonymous_peers_are_dropped_after_deadlines() {
        let mut controller = controller();
        let (silent_channel, silent) = MemoryChannel::pair();
        let (helloed_channel, _helloed) = MemoryChannel::pair();
        let silent_id = controller.accept(Box::new(silent_channel), t0());
        let helloed_id = controller.accept(Box::new(helloed_channel), t0());
        controller.peers_mut().mark_helloed(helloed_id, t0()).expect("hello");

        controller.sweep(t0() + Duration::seconds(5));
        assert!(controller.peers().get(silent_id).is_none());
        assert!(silent.is_shut_down());
        assert!(controller.peers().get(helloed_id).is_some());

        controller.sweep(t0() + Duration::seconds(10));
        assert!(controller.peers().is_empty());
    }

    #[test]
    fn allow_list_rejects_unlisted_nodes() {
        let mut controller = controller_with(&["web-1"], Arc::new(EventEmitter::new()));
        let (channel, _remote) = MemoryChannel::pair();
        let peer_id = controller.accept(Box::new(channel), t0());
        controller.peers_mut().mark_helloed(peer_id, t0()).expect("hello");

        assert!(matches!(
            controller.register_node(peer_id, "db-1", t0()),
            Err(ControllerError::Node(_))
        ));
        assert_eq!(controller.nodes().status("web-1"), NodeStatus::Unknown);
    }

    #[test]
    fn remove_node_tears_down_peer_and_forgets_node() {
        let mut controller = controller();
        let (_peer_id, remote) = connect_node(&mut controller, "n1", t0());
        let job_id = controller.dispatch("n1", start("a.service"), t0()).expect("dispatch");

        let removed = controller.remove_node("n1", t0()).expect("remove");
        assert_eq!(removed.status, NodeStatus::Offline);
        assert!(remote.is_shut_down());
        assert!(controller.nodes().get("n1").is_none());
        assert_eq!(
            controller.jobs().get(job_id).map(|j| j.state),
            Some(JobState::Failed)
        );
    }

    #[test]
    fn shutdown_fails_all_pending_jobs() {
        let mut controller = controller();
        let (_a, _ra) = connect_node(&mut controller, "n1", t0());
        let (_b, _rb) = connect_node(&mut controller, "n2", t0());
        let first = controller.dispatch("n1", start("a.service"), t0()).expect("dispatch");
        let second = controller.dispatch("n2", start("a.service"), t0()).expect("dispatch");

        controller.shutdown(t0());

        assert!(controller.peers().is_empty());
        for job_id in [first, second] {
            assert_eq!(
                controller.jobs().get(job_id).map(|j| j.state),
                Some(JobState::Failed)
            );
        }
        assert_binding_invariant(&controller);
    }
}
