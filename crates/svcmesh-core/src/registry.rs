//! Per-session registry of outstanding calls.
//!
//! Every call is resolved exactly once: by its Response, by its deadline, or
//! by the session going away. Whichever route removes the entry from the map
//! wins; the others find nothing and do nothing. Completion sinks are always
//! invoked after the registry lock has been released.

use crate::protocol::ResponseBody;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;
use tokio::task::AbortHandle;
use tracing::debug;

/// How a call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Response(ResponseBody),
    TimedOut,
    Disconnected(String),
    /// The response for this call could not be decoded or was too large.
    Malformed(String),
    /// The request was refused locally and never sent.
    Rejected(String),
}

/// Completion callback of one call.
pub type CallSink = Box<dyn FnOnce(CallOutcome) + Send + 'static>;

struct PendingCall {
    method: String,
    deadline: Option<Instant>,
    sink: CallSink,
    timer: Option<AbortHandle>,
}

struct RegistryState {
    next_id: u64,
    pending: HashMap<u64, PendingCall>,
    closed: bool,
}

pub struct CallRegistry {
    state: Mutex<RegistryState>,
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                // 0 is the call id of handshake frames
                next_id: 1,
                pending: HashMap::new(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a call and return its id.
    ///
    /// A closed registry hands the sink back so the caller can resolve it.
    pub fn register(
        &self,
        method: &str,
        deadline: Option<Instant>,
        sink: CallSink,
    ) -> std::result::Result<u64, CallSink> {
        let mut state = self.lock();
        if state.closed {
            return Err(sink);
        }
        let call_id = state.next_id;
        state.next_id += 1;
        state.pending.insert(
            call_id,
            PendingCall {
                method: method.to_string(),
                deadline,
                sink,
                timer: None,
            },
        );
        Ok(call_id)
    }

    /// Attach the deadline timer of a call.
    ///
    /// If the call was resolved in the meantime the timer is aborted and
    /// false returned.
    pub fn set_timer(&self, call_id: u64, timer: AbortHandle) -> bool {
        let mut state = self.lock();
        match state.pending.get_mut(&call_id) {
            Some(call) => {
                call.timer = Some(timer);
                true
            }
            None => {
                drop(state);
                timer.abort();
                false
            }
        }
    }

    /// Resolve a call. Returns false if it was already resolved.
    pub fn resolve(&self, call_id: u64, outcome: CallOutcome) -> bool {
        let call = self.lock().pending.remove(&call_id);
        match call {
            Some(call) => {
                if let Some(timer) = call.timer {
                    timer.abort();
                }
                (call.sink)(outcome);
                true
            }
            None => false,
        }
    }

    /// Resolve a call as timed out from its own timer task.
    pub fn time_out(&self, call_id: u64) -> bool {
        let call = self.lock().pending.remove(&call_id);
        match call {
            Some(call) => {
                debug!(
                    "Call {} ({}) timed out{}",
                    call_id,
                    call.method,
                    call.deadline
                        .map(|d| format!(" {:?} past its deadline", d.elapsed()))
                        .unwrap_or_default()
                );
                (call.sink)(CallOutcome::TimedOut);
                true
            }
            None => false,
        }
    }

    /// Close the registry and resolve everything outstanding as disconnected.
    ///
    /// Returns how many calls were resolved.
    pub fn drain(&self, reason: &str) -> usize {
        let drained: Vec<PendingCall> = {
            let mut state = self.lock();
            state.closed = true;
            state.pending.drain().map(|(_, call)| call).collect()
        };
        let count = drained.len();
        for call in drained {
            if let Some(timer) = call.timer {
                timer.abort();
            }
            (call.sink)(CallOutcome::Disconnected(reason.to_string()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

}

impl Drop for CallRegistry {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if state.pending.is_empty() {
            return;
        }
        debug!(
            "Aborting {} outstanding calls of a dropped session",
            state.pending.len()
        );
        for (_, call) in state.pending.drain() {
            (call.sink)(CallOutcome::Disconnected("aborted".to_string()));
        }
    }
}
