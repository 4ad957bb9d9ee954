use std::fmt;
use std::process::Command;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use serde_json::{json, Map, Value};

use crate::logging::Logger;
use crate::orchestrator::dispatch::{OperationDescriptor, UnitVerb, ALLOWED_FLAGS, PROPERTIES_ARG};
use crate::utils::timing::measure_execution;
use crate::wire::session::REMOTE_FAILURE_CODE;

const EXECUTOR_CONTEXT: &str = "agent::executor";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionFailure {
    pub code: String,
    pub message: String,
}

impl ExecutionFailure {
    pub fn remote(message: impl Into<String>) -> Self {
        Self {
            code: REMOTE_FAILURE_CODE.to_owned(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Performs one unit operation on the local host. Runs on the executor
/// worker thread, so implementations may block.
pub trait UnitExecutor: Send + Sync + 'static {
    fn execute(&self, operation: &OperationDescriptor) -> Result<Value, ExecutionFailure>;
}

/// Drives units through the `systemctl` binary.
#[derive(Clone, Debug)]
pub struct SystemctlExecutor {
    program: String,
}

impl SystemctlExecutor {
    /// `program` is looked up on `PATH` unless it is an absolute path.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Only flags from [`ALLOWED_FLAGS`] are emitted, whatever else `args`
    /// carries.
    pub fn command_args(operation: &OperationDescriptor) -> Vec<String> {
        let mut args = Vec::new();
        match operation.verb {
            UnitVerb::GetProperties => {
                args.push("show".to_owned());
                args.push("--no-pager".to_owned());
                if let Some(Value::Array(names)) = operation.args.get(PROPERTIES_ARG) {
                    let names: Vec<&str> = names.iter().filter_map(Value::as_str).collect();
                    if !names.is_empty() {
                        args.push(format!("--property={}", names.join(",")));
                    }
                }
            }
            verb => {
                args.push(verb.as_str().to_owned());
                for (flag, value) in &operation.args {
                    if ALLOWED_FLAGS.contains(&flag.as_str()) && value.as_bool() == Some(true) {
                        args.push(format!("--{}", flag.replace('_', "-")));
                    }
                }
            }
        }
        args.push(operation.unit.clone());
        args
    }
}

impl UnitExecutor for SystemctlExecutor {
    fn execute(&self, operation: &OperationDescriptor) -> Result<Value, ExecutionFailure> {
        let args = Self::command_args(operation);
        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|error| {
                ExecutionFailure::remote(format!("failed to spawn {}: {error}", self.program))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.trim();
            return Err(ExecutionFailure::remote(if detail.is_empty() {
                format!("{} {} exited with {}", self.program, args.join(" "), output.status)
            } else {
                detail.to_owned()
            }));
        }

        let mut result = json!({
            "unit": operation.unit,
            "verb": operation.verb.as_str(),
        });
        if operation.verb == UnitVerb::GetProperties {
            result["properties"] = Value::Object(parse_properties(&stdout));
        }
        Ok(result)
    }
}

/// Parses `systemctl show` output (`Key=Value` per line).
pub fn parse_properties(output: &str) -> Map<String, Value> {
    output
        .lines()
        .filter_map(|line| line.split_once('='))
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_owned(), Value::String(value.to_owned())))
        .collect()
}

#[derive(Debug)]
pub struct CallOutcome {
    pub call_id: String,
    pub result: Result<Value, ExecutionFailure>,
}

/// Single background thread that runs unit operations in arrival order and
/// hands outcomes back through a channel the session loop polls.
pub struct ExecutionWorker {
    requests: Option<Sender<(String, OperationDescriptor)>>,
    outcomes: Receiver<CallOutcome>,
    handle: Option<JoinHandle<()>>,
}

impl ExecutionWorker {
    pub fn spawn(executor: Arc<dyn UnitExecutor>, logger: Arc<Logger>) -> Self {
        let (request_tx, request_rx) = mpsc::channel::<(String, OperationDescriptor)>();
        let (outcome_tx, outcome_rx) = mpsc::channel();

        let handle = thread::spawn(move || {
            while let Ok((call_id, operation)) = request_rx.recv() {
                let task_name = format!("{} {}", operation.verb.as_str(), operation.unit);
                let (result, elapsed) = measure_execution(
                    &task_name,
                    Some(EXECUTOR_CONTEXT),
                    &logger,
                    || executor.execute(&operation),
                );
                let result = result.map(|mut value| {
                    if let Value::Object(map) = &mut value {
                        map.insert("duration_ms".to_owned(), json!(elapsed.as_millis() as u64));
                    }
                    value
                });
                if outcome_tx.send(CallOutcome { call_id, result }).is_err() {
                    break;
                }
            }
        });

        Self {
            requests: Some(request_tx),
            outcomes: outcome_rx,
            handle: Some(handle),
        }
    }

    /// Returns false if the worker thread is gone.
    pub fn submit(&self, call_id: String, operation: OperationDescriptor) -> bool {
        self.requests
            .as_ref()
            .is_some_and(|requests| requests.send((call_id, operation)).is_ok())
    }

    pub fn drain(&self) -> Vec<CallOutcome> {
        let mut outcomes = Vec::new();
        loop {
            match self.outcomes.try_recv() {
                Ok(outcome) => outcomes.push(outcome),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        outcomes
    }
}

impl Drop for ExecutionWorker {
    fn drop(&mut self) {
        self.requests.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use serde_json::{json, Map, Value};

    use crate::logging::tests::memory_logger;
    use crate::logging::LogLevel;
    use crate::orchestrator::dispatch::{OperationDescriptor, UnitVerb};

    use super::{
        parse_properties, CallOutcome, ExecutionFailure, ExecutionWorker, SystemctlExecutor,
        UnitExecutor,
    };

    /// Succeeds for every unit except `broken.service`, recording what ran.
    #[derive(Default)]
    pub(crate) struct FakeExecutor {
        pub(crate) executed: Mutex<Vec<String>>,
    }

    impl UnitExecutor for FakeExecutor {
        fn execute(&self, operation: &OperationDescriptor) -> Result<Value, ExecutionFailure> {
            self.executed
                .lock()
                .expect("executed lock poisoned")
                .push(format!("{} {}", operation.verb.as_str(), operation.unit));
            if operation.unit == "broken.service" {
                return Err(ExecutionFailure::remote("Unit broken.service not found."));
            }
            Ok(json!({"unit": operation.unit, "verb": operation.verb.as_str()}))
        }
    }

    pub(crate) fn wait_for_outcomes(worker: &ExecutionWorker, count: usize) -> Vec<CallOutcome> {
        let mut outcomes = Vec::new();
        for _ in 0..200 {
            outcomes.extend(worker.drain());
            if outcomes.len() >= count {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        outcomes
    }

    #[test]
    fn builds_systemctl_arguments_per_verb() {
        let start = OperationDescriptor::new(UnitVerb::Start, "nginx.service");
        assert_eq!(SystemctlExecutor::command_args(&start), vec!["start", "nginx.service"]);

        let mut flags = Map::new();
        flags.insert("now".to_owned(), json!(true));
        flags.insert("no_block".to_owned(), json!(true));
        flags.insert("quiet".to_owned(), json!(false));
        let enable = OperationDescriptor::new(UnitVerb::Enable, "nginx.service").with_args(flags);
        assert_eq!(
            SystemctlExecutor::command_args(&enable),
            vec!["enable", "--no-block", "--now", "nginx.service"]
        );

        let mut props = Map::new();
        props.insert("properties".to_owned(), json!(["ActiveState", "SubState"]));
        let show = OperationDescriptor::new(UnitVerb::GetProperties, "sshd.service").with_args(props);
        assert_eq!(
            SystemctlExecutor::command_args(&show),
            vec!["show", "--no-pager", "--property=ActiveState,SubState", "sshd.service"]
        );
    }

    #[test]
    fn unknown_flags_never_become_options() {
        let mut injected = Map::new();
        injected.insert("root=/tmp/evil".to_owned(), json!(true));
        injected.insert("host=attacker.example".to_owned(), json!(true));
        injected.insert("force".to_owned(), json!(true));
        let stop = OperationDescriptor::new(UnitVerb::Stop, "a.service").with_args(injected);

        assert!(stop.validate().is_err());
        assert_eq!(
            SystemctlExecutor::command_args(&stop),
            vec!["stop", "--force", "a.service"]
        );
    }

    #[test]
    fn parses_show_output_into_properties() {
        let parsed = parse_properties("ActiveState=active\nSubState=running\nExecStart={ path=/x ; argv[]=/x }\n\n");
        assert_eq!(parsed.get("ActiveState"), Some(&json!("active")));
        assert_eq!(parsed.get("SubState"), Some(&json!("running")));
        assert_eq!(parsed.get("ExecStart"), Some(&json!("{ path=/x ; argv[]=/x }")));
        assert_eq!(parsed.len(), 3);
    }

    #[test]
    fn missing_binary_is_a_remote_failure() {
        let executor = SystemctlExecutor::with_program("/nonexistent/convoy-systemctl");
        let failure = executor
            .execute(&OperationDescriptor::new(UnitVerb::Stop, "a.service"))
            .expect_err("spawn should fail");
        assert_eq!(failure.code, "REMOTE_FAILURE");
        assert!(failure.message.contains("failed to spawn"));
    }

    #[test]
    fn worker_runs_operations_off_thread_in_order() {
        let (logger, _sink) = memory_logger(LogLevel::Error);
        let executor = Arc::new(FakeExecutor::default());
        let worker = ExecutionWorker::spawn(executor.clone(), logger);

        assert!(worker.submit("call-1".to_owned(), OperationDescriptor::new(UnitVerb::Start, "a.service")));
        assert!(worker.submit("call-2".to_owned(), OperationDescriptor::new(UnitVerb::Stop, "broken.service")));

        let outcomes = wait_for_outcomes(&worker, 2);
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].call_id, "call-1");
        let ok = outcomes[0].result.as_ref().expect("first call succeeds");
        assert!(ok.get("duration_ms").is_some());
        assert_eq!(
            outcomes[1].result.as_ref().expect_err("second call fails").message,
            "Unit broken.service not found."
        );
        assert_eq!(
            *executor.executed.lock().expect("executed lock poisoned"),
            vec!["start a.service", "stop broken.service"]
        );
    }
}
