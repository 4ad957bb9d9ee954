use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use serde_json::Value;

pub const NODE_STATUS_CHANGED_EVENT: &str = "node.status_changed";
pub const JOB_RESOLVED_EVENT: &str = "job.resolved";
pub const PEER_REPLACED_EVENT: &str = "peer.replaced";

pub type ListenerResult = Result<(), String>;

type Listener = Arc<dyn Fn(&Event) -> ListenerResult + Send + Sync>;

#[derive(Clone, Debug)]
pub struct Event {
    pub name: String,
    pub payload: Option<Value>,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

#[derive(Debug)]
pub enum EmitError {
    ListenerFailed {
        event: String,
        listener_index: usize,
        message: String,
    },
    ListenerPanicked {
        event: String,
        listener_index: usize,
    },
}

impl fmt::Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ListenerFailed {
                event,
                listener_index,
                message,
            } => write!(
                f,
                "listener #{listener_index} failed for event '{event}': {message}"
            ),
            Self::ListenerPanicked {
                event,
                listener_index,
            } => write!(f, "listener #{listener_index} panicked for event '{event}'"),
        }
    }
}

impl Error for EmitError {}

/// In-process observer hook for controller state changes.
///
/// Listeners run inline on the engine thread, in registration order, so they
/// observe transitions in exactly the order the controller applied them. A
/// failing or panicking listener stops the remaining listeners for that event
/// and is reported to the emitter's caller; it never unwinds into the engine.
#[derive(Default)]
pub struct EventEmitter {
    listeners: RwLock<HashMap<String, Vec<Listener>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, event_name: impl Into<String>, listener: F)
    where
        F: Fn(&Event) -> ListenerResult + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .expect("listener map lock poisoned")
            .entry(event_name.into())
            .or_default()
            .push(Arc::new(listener));
    }

    pub fn listener_count(&self, event_name: &str) -> usize {
        self.listeners
            .read()
            .expect("listener map lock poisoned")
            .get(event_name)
            .map_or(0, Vec::len)
    }

    pub fn emit(
        &self,
        event_name: impl Into<String>,
        payload: Option<Value>,
    ) -> Result<(), EmitError> {
        let event = Event::new(event_name, payload);
        let handlers = {
            let listeners = self.listeners.read().expect("listener map lock poisoned");
            match listeners.get(&event.name) {
                Some(handlers) => handlers.clone(),
                None => return Ok(()),
            }
        };

        for (idx, handler) in handlers.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(message)) => {
                    return Err(EmitError::ListenerFailed {
                        event: event.name.clone(),
                        listener_index: idx,
                        message,
                    });
                }
                Err(_) => {
                    return Err(EmitError::ListenerPanicked {
                        event: event.name.clone(),
                        listener_index: idx,
                    });
                }
            }
        }

        Ok(())
    }
}
