//! Shared event loop for clients and servers.
//!
//! An [`EventLoop`] is either an owned multi-thread tokio runtime or a
//! borrowed handle to one the application already runs. Every task the
//! library spawns is wrapped so that code running inside it can tell it is on
//! the event loop; the blocking API uses that to refuse calls that would
//! otherwise wait on the very loop that has to deliver the result.

use crate::{Result, ServiceError};
use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::debug;

thread_local! {
    static ON_EVENT_LOOP: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is polling a task spawned by this library.
pub fn on_event_loop() -> bool {
    ON_EVENT_LOOP.with(|flag| flag.get())
}

/// Refuse a blocking wait from an event loop task.
pub(crate) fn ensure_blocking_allowed() -> Result<()> {
    if on_event_loop() {
        return Err(ServiceError::BlockingOnEventLoop);
    }
    Ok(())
}

struct LoopFlagGuard {
    previous: bool,
}

impl LoopFlagGuard {
    fn enter() -> Self {
        let previous = ON_EVENT_LOOP.with(|flag| flag.replace(true));
        Self { previous }
    }
}

impl Drop for LoopFlagGuard {
    fn drop(&mut self) {
        let previous = self.previous;
        ON_EVENT_LOOP.with(|flag| flag.set(previous));
    }
}

/// Future adapter that marks the polling thread as "on the event loop".
struct OnEventLoop<F> {
    inner: Pin<Box<F>>,
}

impl<F: Future> Future for OnEventLoop<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let _guard = LoopFlagGuard::enter();
        self.get_mut().inner.as_mut().poll(cx)
    }
}

/// Spawn a library task on `handle`.
pub(crate) fn spawn_on<F>(handle: &Handle, future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    handle.spawn(OnEventLoop {
        inner: Box::pin(future),
    })
}

struct OwnedRuntime {
    runtime: Option<Runtime>,
}

impl Drop for OwnedRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            debug!("Shutting down svcmesh event loop");
            // Never blocks, so the last clone may be dropped anywhere,
            // including from inside another runtime.
            runtime.shutdown_background();
        }
    }
}

/// Async runtime shared by the handles created on it.
///
/// Cloning is cheap. An owned runtime is shut down when the last clone is
/// dropped; tasks still running at that point are cancelled and any call
/// they were serving resolves as disconnected.
#[derive(Clone)]
pub struct EventLoop {
    handle: Handle,
    owned: Option<Arc<OwnedRuntime>>,
}

impl EventLoop {
    /// Start a dedicated multi-thread runtime.
    pub fn new(worker_threads: usize) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("svcmesh-worker")
            .enable_all()
            .build()
            .map_err(|e| ServiceError::Io {
                message: format!("Failed to start event loop: {}", e),
                source: Some(e),
            })?;
        let handle = runtime.handle().clone();
        Ok(Self {
            handle,
            owned: Some(Arc::new(OwnedRuntime {
                runtime: Some(runtime),
            })),
        })
    }

    /// Borrow the runtime the caller is currently running on.
    pub fn current() -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| ServiceError::Config {
            message: format!("EventLoop::current called outside a tokio runtime: {}", e),
        })?;
        Ok(Self::from_handle(handle))
    }

    /// Borrow an existing runtime.
    pub fn from_handle(handle: Handle) -> Self {
        Self {
            handle,
            owned: None,
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Whether this loop owns its runtime.
    pub fn is_owned(&self) -> bool {
        self.owned.is_some()
    }

    /// Spawn a task on the loop.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        spawn_on(&self.handle, future)
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("owned", &self.is_owned())
            .finish()
    }
}
