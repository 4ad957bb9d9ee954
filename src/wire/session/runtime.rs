use chrono::{DateTime, Utc};
use serde_json::json;

use crate::diagnostics::build_status_payload;
use crate::logging::LogLevel;
use crate::orchestrator::dispatch::DispatchError;
use crate::orchestrator::jobs::{JobError, JobFailure, JobState};
use crate::orchestrator::nodes::NodeError;
use crate::orchestrator::{Controller, ControllerError};
use crate::peers::{PeerError, PeerId, PeerRole};
use crate::server::TcpServer;
use crate::wire::envelope::PayloadMap;
use crate::wire::handshake::build_hi_frame;

use super::{
    build_ok_frame, build_pong_frame, evaluate_anonymous_frame, evaluate_node_frame,
    evaluate_operator_frame, json_to_payload, AnonymousAction, NodeAction, OperatorAction,
    SessionError, ALREADY_TERMINAL_CODE, JOB_NOT_FOUND_CODE, NODE_NOT_ALLOWED_CODE,
    NODE_NOT_FOUND_CODE, PROTOCOL_VIOLATION_CODE,
};

const SESSION_CONTEXT: &str = "controller::session";
const MAX_ACCEPTS_PER_TICK: usize = 256;

// Hands every pending inbound connection to the controller as an anonymous peer.
pub fn accept_connections(server: &TcpServer, controller: &mut Controller, now: DateTime<Utc>) {
    for _ in 0..MAX_ACCEPTS_PER_TICK {
        match server.try_accept_persistent() {
            Ok(Some(connection)) => {
                controller.accept(Box::new(connection), now);
            }
            Ok(None) => break,
            Err(error) => {
                controller
                    .logger()
                    .warn(Some("main::server"), &format!("failed to accept connection: {error}"));
                break;
            }
        }
    }
}

// Drains every peer's inbound bytes and applies the decoded frames in arrival
// order, then flushes replies and tears down peers whose transport failed.
pub fn pump_peers(controller: &mut Controller, now: DateTime<Utc>) {
    let codec = controller.codec();
    let mut peer_ids = controller.peers().ids();
    peer_ids.sort_unstable();

    for peer_id in peer_ids {
        let Some(peer) = controller.peers_mut().get_mut(peer_id) else {
            continue;
        };
        let batch = peer.read_frames(&codec);

        for frame in &batch.frames {
            if !process_frame(controller, peer_id, frame, now) {
                break;
            }
        }

        if let Some(error) = batch.framing_error {
            if controller.peers().get(peer_id).is_some() {
                controller.reject_peer(peer_id, None, &format!("invalid frame: {error}"), now);
            }
        }
    }

    controller.flush_peers();
    controller.reap_failed_peers(now);
}

// Routes one frame by the peer's current role. Returns false once the peer is gone.
fn process_frame(controller: &mut Controller, peer_id: PeerId, frame: &[u8], now: DateTime<Utc>) -> bool {
    let Some(role) = controller.peers().get(peer_id).map(|peer| peer.role().clone()) else {
        return false;
    };

    let outcome = match role {
        PeerRole::Anonymous { helloed_at } => {
            let codec = controller.codec();
            evaluate_anonymous_frame(&codec, frame, helloed_at.is_some())
                .map(|action| handle_anonymous_action(controller, peer_id, action, now))
        }
        PeerRole::Node { .. } => {
            let codec = controller.codec();
            evaluate_node_frame(&codec, frame)
                .map(|action| handle_node_action(controller, peer_id, action, now))
        }
        PeerRole::Operator { .. } => {
            let codec = controller.codec();
            evaluate_operator_frame(&codec, frame)
                .map(|action| handle_operator_action(controller, peer_id, action, now))
        }
    };

    if let Err(error) = outcome {
        handle_session_error(controller, peer_id, error, now);
    }
    controller.peers().get(peer_id).is_some()
}

// Rejected requests get an ERR and keep the session; everything else is a
// protocol violation that ends it.
fn handle_session_error(
    controller: &mut Controller,
    peer_id: PeerId,
    error: SessionError,
    now: DateTime<Utc>,
) {
    match error {
        SessionError::RequestRejected {
            request_id,
            code,
            message,
        } => {
            controller.logger().log(
                LogLevel::Debug,
                Some(SESSION_CONTEXT),
                "Request rejected",
                Some(json!({"peer_id": peer_id, "rid": request_id, "code": code, "message": message})),
            );
            controller.send_error(peer_id, &request_id, code, &message);
        }
        SessionError::ProtocolViolation {
            request_id,
            message,
        } => controller.reject_peer(peer_id, request_id.as_deref(), &message, now),
        other => controller.reject_peer(peer_id, None, &other.to_string(), now),
    }
}

fn handle_anonymous_action(
    controller: &mut Controller,
    peer_id: PeerId,
    action: AnonymousAction,
    now: DateTime<Utc>,
) {
    match action {
        AnonymousAction::Hello { request_id } => {
            if let Err(error) = controller.peers_mut().mark_helloed(peer_id, now) {
                controller.reject_peer(peer_id, Some(&request_id), &error.to_string(), now);
                return;
            }
            match build_hi_frame(&controller.codec(), &request_id) {
                Ok(frame) => controller.send_frame(peer_id, &frame),
                Err(error) => controller.logger().warn(
                    Some(SESSION_CONTEXT),
                    &format!("failed to build HI for peer {peer_id}: {error}"),
                ),
            }
        }
        AnonymousAction::Register { request_id, node } => {
            match controller.register_node(peer_id, &node, now) {
                Ok(session_id) => {
                    controller.logger().log(
                        LogLevel::Info,
                        Some(SESSION_CONTEXT),
                        "Node registered",
                        Some(json!({"peer_id": peer_id, "node": node, "session_id": session_id.to_string()})),
                    );
                    let interval_ms = controller.heartbeat_policy().interval_ms();
                    let payload = json_to_payload(&json!({
                        "node": node,
                        "session_id": session_id.to_string(),
                        "heartbeat_interval_ms": interval_ms,
                    }));
                    reply_ok(controller, peer_id, &request_id, payload);
                }
                Err(ControllerError::Node(error @ NodeError::NotAllowed { .. })) => {
                    controller.send_error(peer_id, &request_id, NODE_NOT_ALLOWED_CODE, &error.to_string());
                    controller.remove_peer(peer_id, "node name not allowed", now);
                }
                Err(error) => {
                    controller.reject_peer(peer_id, Some(&request_id), &error.to_string(), now)
                }
            }
        }
        AnonymousAction::Attach { request_id } => match controller.attach_operator(peer_id, now) {
            Ok(()) => reply_ok(controller, peer_id, &request_id, PayloadMap::new()),
            Err(error) => {
                controller.reject_peer(peer_id, Some(&request_id), &error.to_string(), now)
            }
        },
    }
}

fn handle_node_action(
    controller: &mut Controller,
    peer_id: PeerId,
    action: NodeAction,
    now: DateTime<Utc>,
) {
    match action {
        NodeAction::Heartbeat => {
            if let Err(error) = controller.record_heartbeat(peer_id, now) {
                controller.logger().warn(
                    Some(SESSION_CONTEXT),
                    &format!("heartbeat from peer {peer_id} ignored: {error}"),
                );
            }
        }
        NodeAction::CallSucceeded { request_id, result } => {
            controller.complete_call(peer_id, &request_id, Ok(result), now);
        }
        NodeAction::CallFailed {
            request_id,
            code,
            message,
        } => {
            controller.complete_call(
                peer_id,
                &request_id,
                Err(JobFailure::remote(code, message)),
                now,
            );
        }
    }
}

fn handle_operator_action(
    controller: &mut Controller,
    peer_id: PeerId,
    action: OperatorAction,
    now: DateTime<Utc>,
) {
    match action {
        OperatorAction::Ping { request_id } => {
            match build_pong_frame(&controller.codec(), &request_id, &now.to_rfc3339()) {
                Ok(frame) => controller.send_frame(peer_id, &frame),
                Err(error) => controller.logger().warn(
                    Some(SESSION_CONTEXT),
                    &format!("failed to build PONG for peer {peer_id}: {error}"),
                ),
            }
        }
        OperatorAction::ListNodes { request_id } => {
            let nodes: Vec<_> = controller
                .nodes()
                .list()
                .into_iter()
                .map(|node| node.to_json())
                .collect();
            reply_ok(controller, peer_id, &request_id, json_to_payload(&json!({"nodes": nodes})));
        }
        OperatorAction::GetNode { request_id, node } => {
            match controller.nodes().get(&node).map(|record| record.to_json()) {
                Some(record) => reply_ok(controller, peer_id, &request_id, json_to_payload(&record)),
                None => controller.send_error(
                    peer_id,
                    &request_id,
                    NODE_NOT_FOUND_CODE,
                    &format!("node '{node}' is not known"),
                ),
            }
        }
        OperatorAction::Unit {
            request_id,
            node,
            operation,
        } => match controller.dispatch(&node, operation, now) {
            Ok(job_id) => reply_ok(
                controller,
                peer_id,
                &request_id,
                PayloadMap::from([("jid".to_owned(), rmpv::Value::from(job_id))]),
            ),
            Err(error) => {
                let (code, message) = map_dispatch_error(&error);
                controller.send_error(peer_id, &request_id, code, &message);
            }
        },
        OperatorAction::GetJob { request_id, job_id } => {
            match controller.observe_job(job_id, now) {
                Some(job) => reply_ok(controller, peer_id, &request_id, json_to_payload(&job.to_json())),
                None => controller.send_error(
                    peer_id,
                    &request_id,
                    JOB_NOT_FOUND_CODE,
                    &format!("job {job_id} is not known"),
                ),
            }
        }
        OperatorAction::CancelJob { request_id, job_id } => {
            match controller.cancel_job(job_id, now) {
                Ok(()) => reply_ok(
                    controller,
                    peer_id,
                    &request_id,
                    json_to_payload(&json!({"jid": job_id, "state": JobState::Cancelled.as_str()})),
                ),
                Err(error) => {
                    let (code, message) = map_job_error(&error);
                    controller.send_error(peer_id, &request_id, code, &message);
                }
            }
        }
        OperatorAction::ListJobs { request_id, node } => {
            let jobs: Vec<_> = controller
                .jobs()
                .list(node.as_deref())
                .into_iter()
                .map(|job| job.to_json())
                .collect();
            reply_ok(controller, peer_id, &request_id, json_to_payload(&json!({"jobs": jobs})));
        }
        OperatorAction::Subscribe { request_id } => {
            set_subscription(controller, peer_id, &request_id, true, now)
        }
        OperatorAction::Unsubscribe { request_id } => {
            set_subscription(controller, peer_id, &request_id, false, now)
        }
        OperatorAction::Status { request_id } => {
            let payload = build_status_payload(controller, now);
            reply_ok(controller, peer_id, &request_id, payload);
        }
        OperatorAction::RemoveNode { request_id, node } => {
            match controller.remove_node(&node, now) {
                Ok(removed) => {
                    reply_ok(controller, peer_id, &request_id, json_to_payload(&removed.to_json()))
                }
                Err(error) => {
                    let (code, message) = map_node_error(&error);
                    controller.send_error(peer_id, &request_id, code, &message);
                }
            }
        }
    }
}

fn set_subscription(
    controller: &mut Controller,
    peer_id: PeerId,
    request_id: &str,
    subscribed: bool,
    now: DateTime<Utc>,
) {
    match controller.peers_mut().set_subscribed(peer_id, subscribed) {
        Ok(()) => reply_ok(
            controller,
            peer_id,
            request_id,
            PayloadMap::from([("subscribed".to_owned(), rmpv::Value::Boolean(subscribed))]),
        ),
        Err(error @ PeerError::NotAnOperator { .. }) => {
            controller.reject_peer(peer_id, Some(request_id), &error.to_string(), now)
        }
        Err(error) => controller.logger().warn(Some(SESSION_CONTEXT), &error.to_string()),
    }
}

fn reply_ok(controller: &mut Controller, peer_id: PeerId, request_id: &str, payload: PayloadMap) {
    match build_ok_frame(&controller.codec(), request_id, payload) {
        Ok(frame) => controller.send_frame(peer_id, &frame),
        Err(error) => {
            controller.logger().warn(
                Some(SESSION_CONTEXT),
                &format!("failed to encode OK for rid {request_id}: {error}"),
            );
            controller.send_error(
                peer_id,
                request_id,
                PROTOCOL_VIOLATION_CODE,
                "response exceeded envelope limits",
            );
        }
    }
}

fn map_dispatch_error(error: &DispatchError) -> (&'static str, String) {
    (error.wire_code(), error.to_string())
}

fn map_job_error(error: &JobError) -> (&'static str, String) {
    match error {
        JobError::NotFound { .. } => (JOB_NOT_FOUND_CODE, error.to_string()),
        JobError::AlreadyTerminal { .. } => (ALREADY_TERMINAL_CODE, error.to_string()),
    }
}

fn map_node_error(error: &NodeError) -> (&'static str, String) {
    match error {
        NodeError::NotFound { .. } => (NODE_NOT_FOUND_CODE, error.to_string()),
        _ => (super::INVALID_OPERATION_CODE, error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;
    use rmpv::Value;

    use crate::events::EventEmitter;
    use crate::orchestrator::nodes::NodeStatus;
    use crate::orchestrator::tests::{controller_with, t0};
    use crate::orchestrator::Controller;
    use crate::peers::tests::{MemoryChannel, RemoteEnd};
    use crate::peers::PeerId;
    use crate::wire::envelope::{PayloadMap, WireEnvelope, ERR_MESSAGE_TYPE, OK_MESSAGE_TYPE};
    use crate::wire::handshake::{HELLO_MESSAGE_TYPE, HI_MESSAGE_TYPE};
    use crate::wire::session::*;

    use super::pump_peers;

    fn request(message_type: i64, request_id: &str, entries: &[(&str, Value)]) -> WireEnvelope {
        WireEnvelope::new(
            message_type,
            request_id,
            entries
                .iter()
                .map(|(key, value)| ((*key).to_owned(), value.clone()))
                .collect::<PayloadMap>(),
        )
    }

    fn send(controller: &mut Controller, remote: &RemoteEnd, envelope: WireEnvelope) -> Vec<WireEnvelope> {
        let codec = controller.codec();
        remote.push_envelope(&codec, envelope);
        pump_peers(controller, t0());
        remote.take_envelopes(&codec)
    }

    fn connect(controller: &mut Controller) -> (PeerId, RemoteEnd) {
        let (channel, remote) = MemoryChannel::pair();
        let peer_id = controller.accept(Box::new(channel), t0());
        let replies = send(controller, &remote, request(HELLO_MESSAGE_TYPE, "h1", &[]));
        assert_eq!(replies[0].message_type, HI_MESSAGE_TYPE);
        assert_eq!(replies[0].request_id, "h1");
        (peer_id, remote)
    }

    fn register(controller: &mut Controller, node: &str) -> (PeerId, RemoteEnd) {
        let (peer_id, remote) = connect(controller);
        let replies = send(
            controller,
            &remote,
            request(REGISTER_MESSAGE_TYPE, "r1", &[("node", Value::from(node))]),
        );
        assert_eq!(replies[0].message_type, OK_MESSAGE_TYPE, "{replies:?}");
        assert_eq!(replies[0].payload_str("node"), Some(node));
        assert!(replies[0].payload_str("session_id").is_some());
        (peer_id, remote)
    }

    fn attach(controller: &mut Controller) -> RemoteEnd {
        let (_peer_id, remote) = connect(controller);
        let replies = send(controller, &remote, request(ATTACH_MESSAGE_TYPE, "a1", &[]));
        assert_eq!(replies[0].message_type, OK_MESSAGE_TYPE);
        remote
    }

    fn controller() -> Controller {
        controller_with(&[], Arc::new(EventEmitter::new()))
    }

    fn unit_request(node: &str, verb: &str) -> WireEnvelope {
        request(
            UNIT_MESSAGE_TYPE,
            "u1",
            &[
                ("node", Value::from(node)),
                ("verb", Value::from(verb)),
                ("unit", Value::from("nginx.service")),
            ],
        )
    }

    fn error_code(envelope: &WireEnvelope) -> Option<&str> {
        assert_eq!(envelope.message_type, ERR_MESSAGE_TYPE, "{envelope:?}");
        envelope.payload_str("code")
    }

    #[test]
    fn operator_dispatch_round_trips_through_node_reply() {
        let mut controller = controller();
        let codec = controller.codec();
        let (_node_peer, node) = register(&mut controller, "web-1");
        let operator = attach(&mut controller);

        let replies = send(&mut controller, &operator, unit_request("web-1", "start"));
        let jid = replies[0].payload.get("jid").and_then(Value::as_u64).expect("jid");
        assert_eq!(jid, 1);

        let calls = node.take_envelopes(&codec);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].message_type, crate::orchestrator::dispatch::CALL_MESSAGE_TYPE);
        assert_eq!(calls[0].payload_str("verb"), Some("start"));

        send(
            &mut controller,
            &node,
            WireEnvelope::ok(
                calls[0].request_id.clone(),
                Some(PayloadMap::from([("active_state".to_owned(), Value::from("active"))])),
            ),
        );

        let job = send(
            &mut controller,
            &operator,
            request(JOB_MESSAGE_TYPE, "j1", &[("jid", Value::from(jid))]),
        );
        assert_eq!(job[0].payload_str("state"), Some("completed"));

        let cancel = send(
            &mut controller,
            &operator,
            request(CANCEL_MESSAGE_TYPE, "c1", &[("jid", Value::from(jid))]),
        );
        assert_eq!(error_code(&cancel[0]), Some(ALREADY_TERMINAL_CODE));
    }

    #[test]
    fn first_frame_other_than_hello_is_a_violation() {
        let mut controller = controller();
        let (channel, remote) = MemoryChannel::pair();
        controller.accept(Box::new(channel), t0());

        let replies = send(
            &mut controller,
            &remote,
            request(REGISTER_MESSAGE_TYPE, "r1", &[("node", Value::from("n1"))]),
        );

        assert_eq!(error_code(&replies[0]), Some(PROTOCOL_VIOLATION_CODE));
        assert!(remote.is_shut_down());
        assert!(controller.peers().is_empty());
    }

    #[test]
    fn rejected_requests_keep_operator_session() {
        let mut controller = controller();
        let operator = attach(&mut controller);

        let ghost = send(&mut controller, &operator, unit_request("ghost", "start"));
        assert_eq!(error_code(&ghost[0]), Some(NODE_UNAVAILABLE_CODE));

        let bad_verb = send(&mut controller, &operator, unit_request("ghost", "mask"));
        assert_eq!(error_code(&bad_verb[0]), Some(INVALID_OPERATION_CODE));

        let missing = send(
            &mut controller,
            &operator,
            request(JOB_MESSAGE_TYPE, "j1", &[("jid", Value::from(42))]),
        );
        assert_eq!(error_code(&missing[0]), Some(JOB_NOT_FOUND_CODE));

        let pong = send(&mut controller, &operator, request(PING_MESSAGE_TYPE, "p1", &[]));
        assert_eq!(pong[0].message_type, PONG_MESSAGE_TYPE);
        assert!(controller.jobs().is_empty());
        assert!(!operator.is_shut_down());
    }

    #[test]
    fn node_not_on_allow_list_is_refused() {
        let mut controller = controller_with(&["web-1"], Arc::new(EventEmitter::new()));
        let (_peer_id, remote) = connect(&mut controller);

        let replies = send(
            &mut controller,
            &remote,
            request(REGISTER_MESSAGE_TYPE, "r1", &[("node", Value::from("db-1"))]),
        );

        assert_eq!(error_code(&replies[0]), Some(NODE_NOT_ALLOWED_CODE));
        assert!(remote.is_shut_down());
        assert_eq!(controller.nodes().status("web-1"), NodeStatus::Unknown);
    }

    #[test]
    fn node_disconnect_fails_jobs_and_notifies_subscribers() {
        let mut controller = controller();
        let codec = controller.codec();
        let (_node_peer, node) = register(&mut controller, "web-1");
        let operator = attach(&mut controller);
        send(&mut controller, &operator, request(SUBSCRIBE_MESSAGE_TYPE, "s1", &[]));
        let replies = send(&mut controller, &operator, unit_request("web-1", "restart"));
        let jid = replies[0].payload.get("jid").and_then(Value::as_u64).expect("jid");

        node.close();
        pump_peers(&mut controller, t0());

        assert_eq!(controller.nodes().status("web-1"), NodeStatus::Offline);
        let signals = operator.take_envelopes(&codec);
        let kinds: Vec<i64> = signals.iter().map(|s| s.message_type).collect();
        assert_eq!(kinds, vec![NODE_STATUS_MESSAGE_TYPE, JOB_STATE_MESSAGE_TYPE]);
        assert_eq!(signals[1].payload_str("error_kind"), Some("node_lost"));

        let job = send(
            &mut controller,
            &operator,
            request(JOB_MESSAGE_TYPE, "j1", &[("jid", Value::from(jid))]),
        );
        assert_eq!(job[0].payload_str("state"), Some("failed"));
    }

    #[test]
    fn frames_split_and_batched_across_reads_are_reassembled() {
        let mut controller = controller();
        let codec = controller.codec();
        let (channel, remote) = MemoryChannel::pair();
        controller.accept(Box::new(channel), t0());

        let hello = codec
            .encode_frame(&request(HELLO_MESSAGE_TYPE, "h1", &[]).into_raw())
            .expect("hello");
        let attach = codec
            .encode_frame(&request(ATTACH_MESSAGE_TYPE, "a1", &[]).into_raw())
            .expect("attach");
        let mut stream = hello.clone();
        stream.extend_from_slice(&attach);
        let (head, tail) = stream.split_at(hello.len() + 3);

        remote.push_frame(head);
        pump_peers(&mut controller, t0());
        remote.push_frame(tail);
        pump_peers(&mut controller, t0());

        let replies = remote.take_envelopes(&codec);
        let kinds: Vec<i64> = replies.iter().map(|r| r.message_type).collect();
        assert_eq!(kinds, vec![HI_MESSAGE_TYPE, OK_MESSAGE_TYPE]);
    }

    #[test]
    fn oversized_frame_header_tears_down_peer() {
        let mut controller = controller();
        let codec = controller.codec();
        let (channel, remote) = MemoryChannel::pair();
        controller.accept(Box::new(channel), t0());

        remote.push_frame(&[0xFF, 0xFF, 0xFF, 0xFF]);
        pump_peers(&mut controller, t0());

        let replies = remote.take_envelopes(&codec);
        assert_eq!(error_code(&replies[0]), Some(PROTOCOL_VIOLATION_CODE));
        assert!(controller.peers().is_empty());
    }

    #[test]
    fn heartbeat_frames_keep_node_online() {
        let mut controller = controller();
        let codec = controller.codec();
        let (_peer_id, node) = register(&mut controller, "web-1");

        node.push_frame(&build_heartbeat_frame(&codec).expect("heartbeat"));
        pump_peers(&mut controller, t0() + Duration::seconds(4));
        controller.sweep(t0() + Duration::seconds(5));

        assert_eq!(controller.nodes().status("web-1"), NodeStatus::Online);
    }

    #[test]
    fn status_and_node_removal_requests() {
        let mut controller = controller();
        let (_peer_id, node) = register(&mut controller, "web-1");
        let operator = attach(&mut controller);

        let status = send(&mut controller, &operator, request(STATUS_MESSAGE_TYPE, "st", &[]));
        assert_eq!(status[0].message_type, OK_MESSAGE_TYPE);
        assert!(status[0].payload.contains_key("application"));

        let listing = send(&mut controller, &operator, request(LSNODE_MESSAGE_TYPE, "ls", &[]));
        let nodes = listing[0].payload.get("nodes").and_then(Value::as_array).expect("nodes");
        assert_eq!(nodes.len(), 1);

        let removed = send(
            &mut controller,
            &operator,
            request(RMNODE_MESSAGE_TYPE, "rm", &[("node", Value::from("web-1"))]),
        );
        assert_eq!(removed[0].payload_str("status"), Some("offline"));
        assert!(node.is_shut_down());

        let missing = send(
            &mut controller,
            &operator,
            request(NODE_MESSAGE_TYPE, "n1", &[("node", Value::from("web-1"))]),
        );
        assert_eq!(error_code(&missing[0]), Some(NODE_NOT_FOUND_CODE));
    }
}
