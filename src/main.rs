mod agent;
mod config;
mod diagnostics;
mod events;
mod heartbeat;
mod logging;
mod orchestrator;
mod peers;
mod server;
mod shutdown;
mod utils;
mod wire;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use agent::executor::SystemctlExecutor;
use agent::{Agent, AgentSettings};
use config::AppConfig;
use events::{EventEmitter, PEER_REPLACED_EVENT};
use logging::{LogLevel, Logger, LoggerConfig};
use orchestrator::{Controller, ControllerSettings};
use server::TcpServer;
use shutdown::{ShutdownHooks, ShutdownLatch};
use utils::runtime::{ensure_posix_or_exit, RunMode};
use utils::startup_banner::print_startup_banner;
use wire::codec::WireCodec;
use wire::session::runtime::{accept_connections, pump_peers};

fn main() {
    ensure_posix_or_exit();

    let (mode, args) = RunMode::from_args(std::env::args().skip(1));
    print_startup_banner(mode);

    let (app_config, config_path) = load_config_or_exit(args);
    let logger = Arc::new(build_logger_or_exit(&app_config));
    logger.log(
        LogLevel::Info,
        Some("main::config"),
        "Configuration loaded",
        Some(json!({
            "mode": mode.as_str(),
            "source": config_path.map_or_else(|| "defaults".to_owned(), |path| path.display().to_string()),
            "log_level": logger.min_level().as_str(),
        })),
    );

    let wire_codec = WireCodec::from_app_config(&app_config).unwrap_or_else(|error| {
        eprintln!("wire codec configuration error: {error}");
        process::exit(2);
    });

    let shutdown_hooks = ShutdownHooks::install().unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(2);
    });
    logger.info(
        Some("main::shutdown"),
        "Shutdown hooks installed for SIGINT/SIGTERM",
    );

    let shutdown = shutdown_hooks.latch();
    match mode {
        RunMode::Controller => run_controller(&app_config, wire_codec, logger, &shutdown),
        RunMode::Agent => run_agent(&app_config, wire_codec, logger, &shutdown),
    }
}

fn run_controller(
    app_config: &AppConfig,
    wire_codec: WireCodec,
    logger: Arc<Logger>,
    shutdown: &ShutdownLatch,
) {
    let settings = ControllerSettings::from_app_config(app_config).unwrap_or_else(|error| {
        eprintln!("heartbeat configuration error: {error}");
        process::exit(2);
    });
    let server = TcpServer::from_app_config(app_config).unwrap_or_else(|error| {
        eprintln!("server startup error: {error}");
        process::exit(2);
    });
    let bound_addr = server.local_addr().unwrap_or_else(|error| {
        eprintln!("server startup error: failed to read local address: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::server"),
        &format!(
            "{} v{} controller listening",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "bind_address": bound_addr.to_string(),
            "max_envelope_size_bytes": wire_codec.max_envelope_size_bytes(),
            "heartbeat": settings.heartbeat.metadata_payload(),
            "allowed_nodes": settings.allowed_nodes,
            "job_retention_ms": settings.retention_ms,
        })),
    );

    let emitter = Arc::new(EventEmitter::new());
    let replacement_logger = Arc::clone(&logger);
    emitter.on(PEER_REPLACED_EVENT, move |event| {
        replacement_logger.log(
            LogLevel::Debug,
            Some("main::events"),
            "Stale node connection superseded",
            event.payload.clone(),
        );
        Ok(())
    });

    let mut controller = Controller::new(settings, wire_codec, Arc::clone(&logger), emitter, Utc::now());
    let tick = Duration::from_millis(app_config.engine.tick_interval_ms);

    loop {
        let now = Utc::now();
        accept_connections(&server, &mut controller, now);
        pump_peers(&mut controller, now);
        controller.sweep(now);
        if !shutdown.pause(tick, tick) {
            break;
        }
    }

    logger.info(
        Some("main::shutdown"),
        "Shutdown signal received, closing peers",
    );
    controller.shutdown(Utc::now());
    drop(server);
    logger.info(Some("main::shutdown"), "Controller stopped");
}

fn run_agent(
    app_config: &AppConfig,
    wire_codec: WireCodec,
    logger: Arc<Logger>,
    shutdown: &ShutdownLatch,
) {
    let settings = AgentSettings::from_app_config(app_config).unwrap_or_else(|error| {
        eprintln!("agent configuration error: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::agent"),
        "Starting node agent",
        Some(json!({
            "node": settings.node_name,
            "controller": format!("{}:{}", settings.controller_host, settings.controller_port),
            "heartbeat_interval_ms": settings.heartbeat_interval_ms,
            "systemctl_path": app_config.agent.systemctl_path,
        })),
    );

    let agent = Agent::new(
        settings,
        wire_codec,
        Arc::new(SystemctlExecutor::with_program(app_config.agent.systemctl_path.as_str())),
        logger,
    );
    agent.run(shutdown);
}

fn load_config_or_exit(args: Vec<String>) -> (AppConfig, Option<PathBuf>) {
    AppConfig::discover_with_args(args).unwrap_or_else(|error| {
        eprintln!("configuration error: {error}");
        process::exit(2);
    })
}

fn build_logger_or_exit(app_config: &AppConfig) -> Logger {
    let min_level = LogLevel::from_config_value(&app_config.logging.level).unwrap_or_else(|| {
        eprintln!(
            "invalid logging.level '{}'. Allowed values: error, warn, info, debug, verbose",
            app_config.logging.level
        );
        process::exit(2);
    });
    Logger::new(LoggerConfig {
        min_level,
        human_friendly: app_config.logging.human_friendly,
    })
}
