//! Client and server events and the machinery that delivers them.
//!
//! Three pieces cooperate so user callbacks never run under an internal lock
//! and never run after their handle is gone:
//!
//! - [`EventDispatcher`] keeps the registered sinks and invokes a snapshot of
//!   them after its lock is released.
//! - [`SinkGate`] counts callbacks in flight. Closing it refuses new ones and
//!   waits for those running on other threads.
//! - [`EventLatch`] orders a session's `connected`/`disconnected` pair.

use crate::types::EndpointId;
use chrono::{DateTime, Utc};
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};

/// Handle returned when registering a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SinkId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEventKind {
    Connected,
    Disconnected,
    Timeout,
}

impl fmt::Display for ClientEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientEventKind::Connected => write!(f, "connected"),
            ClientEventKind::Disconnected => write!(f, "disconnected"),
            ClientEventKind::Timeout => write!(f, "timeout"),
        }
    }
}

/// Event observed by a [`ServiceClient`](crate::ServiceClient).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEvent {
    pub kind: ClientEventKind,
    pub service_name: String,
    pub endpoint: EndpointId,
    pub time: DateTime<Utc>,
    pub message: String,
}

impl ClientEvent {
    pub fn new(
        kind: ClientEventKind,
        service_name: impl Into<String>,
        endpoint: EndpointId,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            service_name: service_name.into(),
            endpoint,
            time: Utc::now(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEventKind {
    Connected,
    Disconnected,
}

/// Event observed by a [`ServiceServer`](crate::ServiceServer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEvent {
    pub kind: ServerEventKind,
    pub service_name: String,
    /// Remote socket address of the client connection.
    pub peer: String,
    pub time: DateTime<Utc>,
    pub message: String,
}

impl ServerEvent {
    pub fn new(
        kind: ServerEventKind,
        service_name: impl Into<String>,
        peer: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            service_name: service_name.into(),
            peer: peer.into(),
            time: Utc::now(),
            message: message.into(),
        }
    }
}

type Sink<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Id-keyed list of event sinks.
pub struct EventDispatcher<E> {
    next_id: AtomicU64,
    sinks: RwLock<Vec<(SinkId, Sink<E>)>>,
}

impl<E> Default for EventDispatcher<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventDispatcher<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            sinks: RwLock::new(Vec::new()),
        }
    }

    pub fn add<F>(&self, sink: F) -> SinkId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SinkId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sinks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(sink)));
        id
    }

    /// Remove a sink. Returns false if it was not registered.
    pub fn remove(&self, id: SinkId) -> bool {
        let mut sinks = self.sinks.write().unwrap_or_else(|e| e.into_inner());
        let before = sinks.len();
        sinks.retain(|(sink_id, _)| *sink_id != id);
        sinks.len() != before
    }

    pub fn len(&self) -> usize {
        self.sinks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every sink registered at the time of the call.
    pub fn dispatch(&self, event: &E) {
        let snapshot: Vec<Sink<E>> = self
            .sinks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, sink)| sink.clone())
            .collect();
        for sink in snapshot {
            sink(event);
        }
    }
}

static NEXT_GATE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // Gates this thread is currently inside, innermost last.
    static ENTERED_GATES: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

fn entered_on_this_thread(gate_id: u64) -> usize {
    ENTERED_GATES.with(|gates| gates.borrow().iter().filter(|id| **id == gate_id).count())
}

#[derive(Debug, Default)]
struct GateState {
    active: usize,
    closed: bool,
}

/// Counts user callbacks in flight for one handle.
#[derive(Debug)]
pub struct SinkGate {
    id: u64,
    state: Mutex<GateState>,
    idle: Condvar,
}

impl Default for SinkGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SinkGate {
    pub fn new() -> Self {
        Self {
            id: NEXT_GATE_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(GateState::default()),
            idle: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enter the gate. `None` once the gate is closed.
    pub fn enter(&self) -> Option<SinkGuard<'_>> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        state.active += 1;
        drop(state);
        ENTERED_GATES.with(|gates| gates.borrow_mut().push(self.id));
        Some(SinkGuard { gate: self })
    }

    /// Refuse new entries and wait for callbacks running on other threads.
    ///
    /// Callbacks further up the current thread's stack are not waited for,
    /// so a sink may drop the handle that is invoking it.
    pub fn close(&self) {
        let own = entered_on_this_thread(self.id);
        let mut state = self.lock();
        state.closed = true;
        while state.active > own {
            state = self.idle.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn active(&self) -> usize {
        self.lock().active
    }
}

/// Proof of being inside a [`SinkGate`].
pub struct SinkGuard<'a> {
    gate: &'a SinkGate,
}

impl Drop for SinkGuard<'_> {
    fn drop(&mut self) {
        ENTERED_GATES.with(|gates| {
            let mut gates = gates.borrow_mut();
            if let Some(pos) = gates.iter().rposition(|id| *id == self.gate.id) {
                gates.remove(pos);
            }
        });
        let mut state = self.gate.lock();
        state.active -= 1;
        drop(state);
        self.gate.idle.notify_all();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LatchPhase {
    Idle,
    Announcing,
    Announced,
    ClosePending,
    Closed,
}

/// Orders the `connected` / `disconnected` pair of one session.
///
/// `connected` fires at most once and `disconnected` only after it. A close
/// that lands while `connected` is being announced is deferred until the
/// announcement finishes, and reported by [`finish_announce`](Self::finish_announce).
#[derive(Debug)]
pub struct EventLatch {
    phase: Mutex<LatchPhase>,
}

impl Default for EventLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLatch {
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(LatchPhase::Idle),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LatchPhase> {
        self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the right to fire `connected`.
    pub fn begin_announce(&self) -> bool {
        let mut phase = self.lock();
        if *phase == LatchPhase::Idle {
            *phase = LatchPhase::Announcing;
            true
        } else {
            false
        }
    }

    /// End the `connected` announcement. Returns true if a close arrived
    /// meanwhile and `disconnected` must fire now.
    pub fn finish_announce(&self) -> bool {
        let mut phase = self.lock();
        match *phase {
            LatchPhase::Announcing => {
                *phase = LatchPhase::Announced;
                false
            }
            LatchPhase::ClosePending => {
                *phase = LatchPhase::Closed;
                true
            }
            _ => false,
        }
    }

    /// Record the close. Returns true if `disconnected` must fire now.
    pub fn close(&self) -> bool {
        let mut phase = self.lock();
        match *phase {
            LatchPhase::Idle => {
                *phase = LatchPhase::Closed;
                false
            }
            LatchPhase::Announcing => {
                *phase = LatchPhase::ClosePending;
                false
            }
            LatchPhase::Announced => {
                *phase = LatchPhase::Closed;
                true
            }
            LatchPhase::ClosePending | LatchPhase::Closed => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.lock(), LatchPhase::ClosePending | LatchPhase::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_dispatch_reaches_all_sinks() {
        let dispatcher = EventDispatcher::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));
        let t1 = total.clone();
        let t2 = total.clone();
        dispatcher.add(move |v| {
            t1.fetch_add(*v as usize, Ordering::SeqCst);
        });
        let id = dispatcher.add(move |v| {
            t2.fetch_add(*v as usize * 10, Ordering::SeqCst);
        });

        dispatcher.dispatch(&2);
        assert_eq!(total.load(Ordering::SeqCst), 22);

        assert!(dispatcher.remove(id));
        assert!(!dispatcher.remove(id));
        dispatcher.dispatch(&1);
        assert_eq!(total.load(Ordering::SeqCst), 23);
    }

    #[test]
    fn test_sink_may_register_sinks_during_dispatch() {
        let dispatcher = Arc::new(EventDispatcher::<()>::new());
        let inner = dispatcher.clone();
        dispatcher.add(move |_| {
            inner.add(|_| {});
        });
        dispatcher.dispatch(&());
        assert_eq!(dispatcher.len(), 2);
    }

    #[test]
    fn test_gate_refuses_after_close() {
        let gate = SinkGate::new();
        {
            let _guard = gate.enter().unwrap();
            assert_eq!(gate.active(), 1);
        }
        gate.close();
        assert!(gate.is_closed());
        assert!(gate.enter().is_none());
    }

    #[test]
    fn test_gate_close_from_inside_sink_does_not_wait_for_itself() {
        let gate = SinkGate::new();
        let _guard = gate.enter().unwrap();
        gate.close();
        assert!(gate.is_closed());
    }

    #[test]
    fn test_gate_close_waits_for_other_threads() {
        let gate = Arc::new(SinkGate::new());
        let finished = Arc::new(AtomicUsize::new(0));
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();

        let worker_gate = gate.clone();
        let worker_finished = finished.clone();
        let worker = std::thread::spawn(move || {
            let _guard = worker_gate.enter().unwrap();
            entered_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(50));
            worker_finished.store(1, Ordering::SeqCst);
        });

        entered_rx.recv().unwrap();
        gate.close();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        worker.join().unwrap();
    }

    #[test]
    fn test_latch_normal_sequence() {
        let latch = EventLatch::new();
        assert!(latch.begin_announce());
        assert!(!latch.finish_announce());
        assert!(latch.close());
        assert!(!latch.close());
        assert!(!latch.begin_announce());
    }

    #[test]
    fn test_latch_close_before_connect_is_silent() {
        let latch = EventLatch::new();
        assert!(!latch.close());
        assert!(!latch.begin_announce());
        assert!(latch.is_closed());
    }

    #[test]
    fn test_latch_close_during_announce_is_deferred() {
        let latch = EventLatch::new();
        assert!(latch.begin_announce());
        assert!(!latch.close());
        assert!(latch.finish_announce());
        assert!(!latch.close());
    }
}
