pub mod executor;

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::config::AppConfig;
use crate::heartbeat::{validate_interval_ms, HeartbeatError, HeartbeatTicker};
use crate::logging::{LogLevel, Logger};
use crate::peers::{PeerChannel, MAX_OUTBOUND_BACKLOG_BYTES};
use crate::server::{PersistentConnection, ServerError};
use crate::shutdown::ShutdownLatch;
use crate::wire::codec::{CodecError, FrameBuffer, WireCodec};
use crate::wire::envelope::PayloadMap;
use crate::wire::handshake::{build_hello_frame, expect_hi, HandshakeError};
use crate::wire::session::{
    build_heartbeat_frame, build_ok_frame, build_protocol_error_frame, build_register_frame,
    evaluate_controller_frame, json_to_payload, ControllerAction, SessionError,
};

use executor::{CallOutcome, ExecutionWorker, UnitExecutor};

const SESSION_CONTEXT: &str = "agent::session";
const HELLO_REQUEST_ID: &str = "hello-1";
const REGISTER_REQUEST_ID: &str = "register-1";
const READ_CHUNK_BYTES: usize = 64 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HOSTNAME_PATH: &str = "/proc/sys/kernel/hostname";

#[derive(Debug)]
pub enum AgentError {
    MissingNodeName,
    Heartbeat(HeartbeatError),
    Transport(ServerError),
    Io(io::Error),
    Codec(CodecError),
    Handshake(HandshakeError),
    Session(SessionError),
    Rejected { code: String, message: String },
    UnexpectedFrame { message_type: i64 },
    ConnectionClosed,
    OutboundBacklog,
    ExecutorStopped,
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingNodeName => write!(
                f,
                "agent.node_name is empty and the host name could not be determined"
            ),
            Self::Heartbeat(source) => write!(f, "{source}"),
            Self::Transport(source) => write!(f, "{source}"),
            Self::Io(source) => write!(f, "agent io error: {source}"),
            Self::Codec(source) => write!(f, "agent codec error: {source}"),
            Self::Handshake(source) => write!(f, "{source}"),
            Self::Session(source) => write!(f, "{source}"),
            Self::Rejected { code, message } => {
                write!(f, "controller rejected registration ({code}): {message}")
            }
            Self::UnexpectedFrame { message_type } => {
                write!(f, "unexpected message type {message_type} before registration")
            }
            Self::ConnectionClosed => write!(f, "controller closed the connection"),
            Self::OutboundBacklog => write!(f, "outbound backlog limit exceeded"),
            Self::ExecutorStopped => write!(f, "unit executor thread stopped"),
        }
    }
}

impl std::error::Error for AgentError {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentSettings {
    pub controller_host: String,
    pub controller_port: u16,
    pub node_name: String,
    pub heartbeat_interval_ms: u64,
    pub reconnect_interval: Duration,
    pub tick_interval: Duration,
}

impl AgentSettings {
    /// Falls back to the kernel host name when `agent.node_name` is empty.
    /// The local heartbeat interval only applies until the controller
    /// announces its own cadence at registration.
    pub fn from_app_config(app_config: &AppConfig) -> Result<Self, AgentError> {
        let node_name = if app_config.agent.node_name.trim().is_empty() {
            std::fs::read_to_string(HOSTNAME_PATH)
                .map(|name| name.trim().to_owned())
                .unwrap_or_default()
        } else {
            app_config.agent.node_name.trim().to_owned()
        };
        if node_name.is_empty() {
            return Err(AgentError::MissingNodeName);
        }

        Ok(Self {
            controller_host: app_config.agent.controller_host.clone(),
            controller_port: app_config.agent.controller_port,
            node_name,
            heartbeat_interval_ms: validate_interval_ms(app_config.heartbeat.interval_ms)
                .map_err(AgentError::Heartbeat)?,
            reconnect_interval: Duration::from_millis(app_config.agent.reconnect_interval_ms),
            tick_interval: Duration::from_millis(app_config.engine.tick_interval_ms),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    AwaitingHi,
    AwaitingRegistration,
    Registered,
}

/// Node side of one controller connection: HELLO, REGISTER, then heartbeats
/// and CALL execution. Non-blocking; the owner calls [`AgentSession::poll`]
/// once per tick.
pub struct AgentSession {
    codec: WireCodec,
    node: String,
    channel: Box<dyn PeerChannel>,
    inbound: FrameBuffer,
    outbound: Vec<u8>,
    phase: SessionPhase,
    heartbeat_interval_ms: u64,
    ticker: Option<HeartbeatTicker>,
    worker: ExecutionWorker,
    logger: Arc<Logger>,
}

impl AgentSession {
    pub fn start(
        channel: Box<dyn PeerChannel>,
        codec: WireCodec,
        node: &str,
        heartbeat_interval_ms: u64,
        executor: Arc<dyn UnitExecutor>,
        logger: Arc<Logger>,
    ) -> Result<Self, AgentError> {
        let mut session = Self {
            codec,
            node: node.to_owned(),
            channel,
            inbound: FrameBuffer::new(),
            outbound: Vec::new(),
            phase: SessionPhase::AwaitingHi,
            heartbeat_interval_ms,
            ticker: None,
            worker: ExecutionWorker::spawn(executor, Arc::clone(&logger)),
            logger,
        };
        let hello = build_hello_frame(&session.codec, HELLO_REQUEST_ID).map_err(AgentError::Handshake)?;
        session.queue(&hello)?;
        session.flush()?;
        Ok(session)
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn poll(&mut self, now: Instant) -> Result<(), AgentError> {
        for frame in self.read_frames()? {
            self.handle_frame(&frame, now)?;
        }

        if let Some(ticker) = self.ticker.as_mut() {
            if ticker.poll(now) {
                let heartbeat = build_heartbeat_frame(&self.codec).map_err(AgentError::Session)?;
                self.queue(&heartbeat)?;
            }
        }

        for outcome in self.worker.drain() {
            self.queue_call_reply(outcome)?;
        }

        self.flush()
    }

    fn handle_frame(&mut self, frame: &[u8], now: Instant) -> Result<(), AgentError> {
        match self.phase {
            SessionPhase::AwaitingHi => {
                expect_hi(&self.codec, frame).map_err(AgentError::Handshake)?;
                let register = build_register_frame(&self.codec, REGISTER_REQUEST_ID, &self.node)
                    .map_err(AgentError::Session)?;
                self.queue(&register)?;
                self.phase = SessionPhase::AwaitingRegistration;
                Ok(())
            }
            SessionPhase::AwaitingRegistration => {
                match evaluate_controller_frame(&self.codec, frame).map_err(AgentError::Session)? {
                    ControllerAction::Ok {
                        request_id,
                        payload,
                    } if request_id == REGISTER_REQUEST_ID => {
                        self.heartbeat_interval_ms = self.negotiated_interval_ms(&payload);
                        self.phase = SessionPhase::Registered;
                        self.ticker = Some(HeartbeatTicker::new(self.heartbeat_interval_ms, now));
                        self.logger.log(
                            LogLevel::Info,
                            Some(SESSION_CONTEXT),
                            "Registered with controller",
                            Some(json!({
                                "node": self.node,
                                "heartbeat_interval_ms": self.heartbeat_interval_ms,
                            })),
                        );
                        Ok(())
                    }
                    ControllerAction::Err { code, message, .. } => {
                        Err(AgentError::Rejected { code, message })
                    }
                    ControllerAction::Ignored { .. } => Ok(()),
                    ControllerAction::Ok { .. } => Err(AgentError::UnexpectedFrame {
                        message_type: crate::wire::envelope::OK_MESSAGE_TYPE,
                    }),
                    ControllerAction::Call { .. } => Err(AgentError::UnexpectedFrame {
                        message_type: crate::orchestrator::dispatch::CALL_MESSAGE_TYPE,
                    }),
                }
            }
            SessionPhase::Registered => match evaluate_controller_frame(&self.codec, frame) {
                Ok(ControllerAction::Call {
                    request_id,
                    operation,
                }) => {
                    self.logger.log(
                        LogLevel::Debug,
                        Some(SESSION_CONTEXT),
                        "Executing call",
                        Some(json!({
                            "call_id": request_id,
                            "verb": operation.verb.as_str(),
                            "unit": operation.unit,
                        })),
                    );
                    if self.worker.submit(request_id, operation) {
                        Ok(())
                    } else {
                        Err(AgentError::ExecutorStopped)
                    }
                }
                Ok(ControllerAction::Err { code, message, .. }) => {
                    self.logger.warn(
                        Some(SESSION_CONTEXT),
                        &format!("controller reported error {code}: {message}"),
                    );
                    Ok(())
                }
                Ok(ControllerAction::Ok { .. } | ControllerAction::Ignored { .. }) => Ok(()),
                Err(SessionError::RequestRejected {
                    request_id,
                    code,
                    message,
                }) => {
                    let reply = build_protocol_error_frame(&self.codec, &request_id, code, &message)
                        .map_err(AgentError::Session)?;
                    self.queue(&reply)
                }
                Err(error) => Err(AgentError::Session(error)),
            },
        }
    }

    // The controller's cadence wins so its soft/hard thresholds line up with
    // what the agent actually sends. Unusable values keep the local interval.
    fn negotiated_interval_ms(&self, payload: &PayloadMap) -> u64 {
        let Some(requested) = payload.get("heartbeat_interval_ms") else {
            return self.heartbeat_interval_ms;
        };
        let negotiated = requested
            .as_u64()
            .ok_or(HeartbeatError::InvalidInterval { provided_ms: 0 })
            .and_then(validate_interval_ms);
        match negotiated {
            Ok(interval_ms) => interval_ms,
            Err(error) => {
                self.logger.log(
                    LogLevel::Warn,
                    Some(SESSION_CONTEXT),
                    "Ignoring controller heartbeat interval",
                    Some(json!({
                        "error": error.to_string(),
                        "local_interval_ms": self.heartbeat_interval_ms,
                    })),
                );
                self.heartbeat_interval_ms
            }
        }
    }

    fn queue_call_reply(&mut self, outcome: CallOutcome) -> Result<(), AgentError> {
        let frame = match outcome.result {
            Ok(result) => build_ok_frame(&self.codec, &outcome.call_id, json_to_payload(&result)),
            Err(failure) => {
                self.logger.log(
                    LogLevel::Warn,
                    Some(SESSION_CONTEXT),
                    "Call failed",
                    Some(json!({"call_id": outcome.call_id, "code": failure.code, "message": failure.message})),
                );
                build_protocol_error_frame(&self.codec, &outcome.call_id, &failure.code, &failure.message)
            }
        }
        .map_err(AgentError::Session)?;
        self.queue(&frame)
    }

    fn read_frames(&mut self) -> Result<Vec<Vec<u8>>, AgentError> {
        let mut chunk = vec![0_u8; READ_CHUNK_BYTES];
        loop {
            match self.channel.try_read(&mut chunk) {
                Ok(0) => return Err(AgentError::ConnectionClosed),
                Ok(read) => self.inbound.extend(&chunk[..read]),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(AgentError::Io(error)),
            }
        }

        let mut frames = Vec::new();
        while let Some(frame) = self.inbound.next_frame(&self.codec).map_err(AgentError::Codec)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn queue(&mut self, frame: &[u8]) -> Result<(), AgentError> {
        if self.outbound.len() + frame.len() > MAX_OUTBOUND_BACKLOG_BYTES {
            return Err(AgentError::OutboundBacklog);
        }
        self.outbound.extend_from_slice(frame);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), AgentError> {
        while !self.outbound.is_empty() {
            match self.channel.try_write(&self.outbound) {
                Ok(0) => return Err(AgentError::ConnectionClosed),
                Ok(written) => {
                    self.outbound.drain(..written);
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(AgentError::Io(error)),
            }
        }
        Ok(())
    }
}

impl Drop for AgentSession {
    fn drop(&mut self) {
        let _ = self.channel.shutdown();
    }
}

/// Long-running node agent: keeps one registered session to the controller
/// alive, reconnecting after any failure until shutdown is requested.
pub struct Agent {
    settings: AgentSettings,
    codec: WireCodec,
    executor: Arc<dyn UnitExecutor>,
    logger: Arc<Logger>,
}

impl Agent {
    pub fn new(
        settings: AgentSettings,
        codec: WireCodec,
        executor: Arc<dyn UnitExecutor>,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            settings,
            codec,
            executor,
            logger,
        }
    }

    pub fn run(&self, shutdown: &ShutdownLatch) {
        while !shutdown.is_triggered() {
            match self.run_session(shutdown) {
                Ok(()) => break,
                Err(error) => self.logger.log(
                    LogLevel::Warn,
                    Some(SESSION_CONTEXT),
                    "Controller session ended; reconnecting",
                    Some(json!({
                        "error": error.to_string(),
                        "reconnect_in_ms": self.settings.reconnect_interval.as_millis() as u64,
                    })),
                ),
            }
            shutdown.pause(self.settings.reconnect_interval, self.settings.tick_interval);
        }
        self.logger.info(Some(SESSION_CONTEXT), "Agent stopped");
    }

    // Resolves and connects before any frame is exchanged, then polls the
    // session until it fails or shutdown is requested.
    fn run_session(&self, shutdown: &ShutdownLatch) -> Result<(), AgentError> {
        let connection = PersistentConnection::connect(
            &self.settings.controller_host,
            self.settings.controller_port,
            CONNECT_TIMEOUT,
        )
        .map_err(AgentError::Transport)?;
        self.logger.log(
            LogLevel::Info,
            Some(SESSION_CONTEXT),
            "Connected to controller",
            Some(json!({"controller": connection.peer_addr().to_string(), "node": self.settings.node_name})),
        );

        let mut session = AgentSession::start(
            Box::new(connection),
            self.codec,
            &self.settings.node_name,
            self.settings.heartbeat_interval_ms,
            Arc::clone(&self.executor),
            Arc::clone(&self.logger),
        )?;

        loop {
            session.poll(Instant::now())?;
            if !shutdown.pause(self.settings.tick_interval, self.settings.tick_interval) {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use chrono::Utc;
    use rmpv::Value;

    use crate::config::AppConfig;
    use crate::events::EventEmitter;
    use crate::heartbeat::{HeartbeatError, HeartbeatPolicy};
    use crate::logging::tests::memory_logger;
    use crate::logging::LogLevel;
    use crate::orchestrator::dispatch::{build_call_frame, OperationDescriptor, UnitVerb};
    use crate::orchestrator::jobs::JobState;
    use crate::orchestrator::nodes::NodeStatus;
    use crate::orchestrator::{Controller, ControllerSettings};
    use crate::peers::tests::{MemoryChannel, RemoteEnd};
    use crate::server::{ServerConfig, TcpServer};
    use crate::shutdown::ShutdownLatch;
    use crate::wire::codec::{CodecConfig, WireCodec};
    use crate::wire::envelope::{PayloadMap, WireEnvelope, ERR_MESSAGE_TYPE, OK_MESSAGE_TYPE};
    use crate::wire::handshake::{build_hi_frame, HELLO_MESSAGE_TYPE};
    use crate::wire::session::runtime::{accept_connections, pump_peers};
    use crate::wire::session::{
        HEARTBEAT_MESSAGE_TYPE, NODE_NOT_ALLOWED_CODE, REGISTER_MESSAGE_TYPE,
    };

    use super::executor::tests::FakeExecutor;
    use super::{Agent, AgentError, AgentSession, AgentSettings, SessionPhase};

    fn codec() -> WireCodec {
        WireCodec::new(CodecConfig::default())
    }

    fn start_session(node: &str) -> (AgentSession, RemoteEnd, Arc<FakeExecutor>) {
        start_session_with_interval(node, 1_000)
    }

    fn start_session_with_interval(
        node: &str,
        heartbeat_interval_ms: u64,
    ) -> (AgentSession, RemoteEnd, Arc<FakeExecutor>) {
        let (logger, _sink) = memory_logger(LogLevel::Error);
        let (channel, remote) = MemoryChannel::pair();
        let executor = Arc::new(FakeExecutor::default());
        let session = AgentSession::start(
            Box::new(channel),
            codec(),
            node,
            heartbeat_interval_ms,
            executor.clone(),
            logger,
        )
        .expect("session should start");
        (session, remote, executor)
    }

    fn registered_session(node: &str) -> (AgentSession, RemoteEnd, Arc<FakeExecutor>) {
        let (mut session, remote, executor) = start_session(node);
        let codec = codec();
        remote.push_frame(&build_hi_frame(&codec, "hello-1").expect("hi"));
        session.poll(Instant::now()).expect("poll after HI");
        remote.push_envelope(&codec, WireEnvelope::ok("register-1", None));
        session.poll(Instant::now()).expect("poll after OK");
        assert_eq!(session.phase(), SessionPhase::Registered);
        remote.take_envelopes(&codec);
        (session, remote, executor)
    }

    fn poll_until_reply(session: &mut AgentSession, remote: &RemoteEnd) -> Vec<WireEnvelope> {
        for _ in 0..200 {
            session.poll(Instant::now()).expect("poll");
            let envelopes: Vec<WireEnvelope> = remote
                .take_envelopes(&codec())
                .into_iter()
                .filter(|e| e.message_type != HEARTBEAT_MESSAGE_TYPE)
                .collect();
            if !envelopes.is_empty() {
                return envelopes;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("agent produced no reply");
    }

    #[test]
    fn handshake_sends_hello_then_register_then_heartbeat() {
        let (mut session, remote, _executor) = start_session("web-1");
        let codec = codec();

        let hello = remote.take_envelopes(&codec);
        assert_eq!(hello[0].message_type, HELLO_MESSAGE_TYPE);

        remote.push_frame(&build_hi_frame(&codec, "hello-1").expect("hi"));
        session.poll(Instant::now()).expect("poll");
        let register = remote.take_envelopes(&codec);
        assert_eq!(register[0].message_type, REGISTER_MESSAGE_TYPE);
        assert_eq!(register[0].payload_str("node"), Some("web-1"));
        assert_eq!(session.phase(), SessionPhase::AwaitingRegistration);

        remote.push_envelope(&codec, WireEnvelope::ok("register-1", None));
        let now = Instant::now();
        session.poll(now).expect("poll");
        let heartbeat = remote.take_envelopes(&codec);
        assert_eq!(heartbeat[0].message_type, HEARTBEAT_MESSAGE_TYPE);
        assert!(heartbeat[0].is_signal());

        session.poll(now + Duration::from_millis(500)).expect("poll");
        assert!(remote.take_envelopes(&codec).is_empty());
        session.poll(now + Duration::from_millis(1_000)).expect("poll");
        assert_eq!(remote.take_envelopes(&codec).len(), 1);
    }

    fn register_with_payload(session: &mut AgentSession, remote: &RemoteEnd, payload: PayloadMap, now: Instant) {
        let codec = codec();
        remote.push_frame(&build_hi_frame(&codec, "hello-1").expect("hi"));
        session.poll(now).expect("poll after HI");
        remote.take_envelopes(&codec);
        remote.push_envelope(&codec, WireEnvelope::ok("register-1", Some(payload)));
    }

    fn heartbeats_sent(remote: &RemoteEnd) -> usize {
        remote
            .take_envelopes(&codec())
            .iter()
            .filter(|envelope| envelope.message_type == HEARTBEAT_MESSAGE_TYPE)
            .count()
    }

    #[test]
    fn registration_adopts_controller_heartbeat_cadence() {
        let (mut session, remote, _executor) = start_session_with_interval("web-1", 10_000);
        let mut payload = PayloadMap::new();
        payload.insert("node".to_owned(), Value::from("web-1"));
        payload.insert("heartbeat_interval_ms".to_owned(), Value::from(200_u64));
        let now = Instant::now();
        register_with_payload(&mut session, &remote, payload, now);

        let mut sent = 0;
        for step in 0..=5 {
            session.poll(now + Duration::from_millis(step * 200)).expect("poll");
            sent += heartbeats_sent(&remote);
        }
        assert_eq!(session.phase(), SessionPhase::Registered);
        assert_eq!(sent, 6);
    }

    #[test]
    fn unusable_controller_cadence_keeps_local_interval() {
        let (mut session, remote, _executor) = start_session_with_interval("web-1", 1_000);
        let mut payload = PayloadMap::new();
        payload.insert("heartbeat_interval_ms".to_owned(), Value::from(0_u64));
        let now = Instant::now();
        register_with_payload(&mut session, &remote, payload, now);

        session.poll(now).expect("poll");
        assert_eq!(heartbeats_sent(&remote), 1);
        session.poll(now + Duration::from_millis(500)).expect("poll");
        assert_eq!(heartbeats_sent(&remote), 0);
        session.poll(now + Duration::from_millis(1_000)).expect("poll");
        assert_eq!(heartbeats_sent(&remote), 1);
    }

    #[test]
    fn settings_reject_out_of_range_heartbeat_interval() {
        let mut app_config = AppConfig::default();
        app_config.agent.node_name = "web-1".to_owned();
        app_config.heartbeat.interval_ms = 0;

        assert!(matches!(
            AgentSettings::from_app_config(&app_config),
            Err(AgentError::Heartbeat(HeartbeatError::InvalidInterval { provided_ms: 0 }))
        ));
    }

    #[test]
    fn rejected_registration_ends_session() {
        let (mut session, remote, _executor) = start_session("db-1");
        let codec = codec();
        remote.push_frame(&build_hi_frame(&codec, "hello-1").expect("hi"));
        session.poll(Instant::now()).expect("poll");
        remote.push_envelope(
            &codec,
            WireEnvelope::err("register-1", NODE_NOT_ALLOWED_CODE, Some("nope".to_owned()), None),
        );

        assert!(matches!(
            session.poll(Instant::now()),
            Err(AgentError::Rejected { ref code, .. }) if code == NODE_NOT_ALLOWED_CODE
        ));
    }

    #[test]
    fn calls_are_executed_and_answered_with_call_id() {
        let (mut session, remote, executor) = registered_session("web-1");
        let codec = codec();
        let call = build_call_frame(&codec, "call-1", &OperationDescriptor::new(UnitVerb::Restart, "nginx.service"))
            .expect("call");
        remote.push_frame(&call);

        let replies = poll_until_reply(&mut session, &remote);
        assert_eq!(replies[0].message_type, OK_MESSAGE_TYPE);
        assert_eq!(replies[0].request_id, "call-1");
        assert_eq!(replies[0].payload_str("unit"), Some("nginx.service"));
        assert_eq!(
            *executor.executed.lock().expect("executed lock poisoned"),
            vec!["restart nginx.service"]
        );
    }

    #[test]
    fn executor_failures_become_remote_failure_replies() {
        let (mut session, remote, _executor) = registered_session("web-1");
        let codec = codec();
        remote.push_frame(
            &build_call_frame(&codec, "call-9", &OperationDescriptor::new(UnitVerb::Stop, "broken.service"))
                .expect("call"),
        );

        let replies = poll_until_reply(&mut session, &remote);
        assert_eq!(replies[0].message_type, ERR_MESSAGE_TYPE);
        assert_eq!(replies[0].request_id, "call-9");
        assert_eq!(replies[0].payload_str("code"), Some("REMOTE_FAILURE"));
        assert_eq!(
            replies[0].payload_str("message"),
            Some("Unit broken.service not found.")
        );
    }

    #[test]
    fn closed_connection_surfaces_as_error() {
        let (mut session, remote, _executor) = registered_session("web-1");
        remote.close();
        assert!(matches!(
            session.poll(Instant::now()),
            Err(AgentError::ConnectionClosed)
        ));
    }

    #[test]
    fn settings_fall_back_to_configured_values() {
        let mut app_config = AppConfig::default();
        app_config.agent.node_name = " web-1 ".to_owned();
        app_config.agent.controller_port = 4040;

        let settings = AgentSettings::from_app_config(&app_config).expect("settings");
        assert_eq!(settings.node_name, "web-1");
        assert_eq!(settings.controller_port, 4040);
        assert_eq!(settings.reconnect_interval, Duration::from_millis(3_000));
    }

    #[test]
    fn agent_registers_and_serves_calls_over_loopback() {
        let (logger, _sink) = memory_logger(LogLevel::Error);
        let server = TcpServer::bind(&ServerConfig {
            host: "127.0.0.1".to_owned(),
            port: 0,
            tls_enabled: false,
        })
        .expect("server should bind");
        let port = server.local_addr().expect("local addr").port();

        let mut controller = Controller::new(
            ControllerSettings {
                heartbeat: HeartbeatPolicy::new(200, 3, 5).expect("policy"),
                retention_ms: 60_000,
                allowed_nodes: Vec::new(),
            },
            codec(),
            Arc::clone(&logger),
            Arc::new(EventEmitter::new()),
            Utc::now(),
        );

        let shutdown = ShutdownLatch::new();
        let agent = Agent::new(
            AgentSettings {
                controller_host: "127.0.0.1".to_owned(),
                controller_port: port,
                node_name: "web-1".to_owned(),
                heartbeat_interval_ms: 200,
                reconnect_interval: Duration::from_millis(100),
                tick_interval: Duration::from_millis(5),
            },
            codec(),
            Arc::new(FakeExecutor::default()),
            Arc::clone(&logger),
        );
        let agent_shutdown = shutdown.clone();
        let agent_thread = thread::spawn(move || agent.run(&agent_shutdown));

        let engine_tick = |controller: &mut Controller| {
            let now = Utc::now();
            accept_connections(&server, controller, now);
            pump_peers(controller, now);
            controller.sweep(now);
            thread::sleep(Duration::from_millis(5));
        };

        let deadline = Instant::now() + Duration::from_secs(10);
        while controller.nodes().status("web-1") != NodeStatus::Online && Instant::now() < deadline {
            engine_tick(&mut controller);
        }
        assert_eq!(controller.nodes().status("web-1"), NodeStatus::Online);

        let job_id = controller
            .dispatch("web-1", OperationDescriptor::new(UnitVerb::Start, "nginx.service"), Utc::now())
            .expect("dispatch");
        while controller.jobs().get(job_id).map(|job| job.state) == Some(JobState::Pending)
            && Instant::now() < deadline
        {
            engine_tick(&mut controller);
        }
        let job = controller.jobs().get(job_id).expect("job").clone();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(
            job.result.as_ref().and_then(|r| r.get("unit")).and_then(|u| u.as_str()),
            Some("nginx.service")
        );

        shutdown.trigger();
        agent_thread.join().expect("agent thread");
        while controller.nodes().status("web-1") == NodeStatus::Online && Instant::now() < deadline {
            engine_tick(&mut controller);
        }
        assert_eq!(controller.nodes().status("web-1"), NodeStatus::Offline);

        let failed = controller
            .dispatch("web-1", OperationDescriptor::new(UnitVerb::Stop, "nginx.service"), Utc::now());
        assert!(failed.is_err());
    }
}
