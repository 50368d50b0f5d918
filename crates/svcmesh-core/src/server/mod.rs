//! Service server: listener, sessions and the method dispatch table.
//!
//! # Thread Safety
//!
//! The handle may be used from any thread. Methods can be added or removed
//! while requests are being served; a request sees the table as it was when
//! the request arrived. Handlers run on the blocking pool (sync), on the
//! event loop (async) or wherever the handler completes its [`Responder`].

mod dispatch;
mod listener;

pub use dispatch::{HandlerResult, MethodCall, MethodHandler, MethodReply, Responder};

use crate::config::ServerConfig;
use crate::discovery::Discovery;
use crate::error::HandlerError;
use crate::events::{EventDispatcher, ServerEvent, ServerEventKind, SinkGate, SinkId};
use crate::protocol::{RequestBody, ResponseBody};
use crate::runtime::EventLoop;
use crate::session::{ServerSession, ServerSessionHost, ServerSessionState};
use crate::types::{local_host_name, EndpointId, MethodInfo, ServiceEndpoint};
use crate::Result;
use dispatch::{AsyncHandler, DispatchTable, ResponderHandler, SyncHandler};
use listener::{ConnectionAcceptor, Listener};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

struct ServerInner {
    service_name: String,
    config: ServerConfig,
    handle: Handle,
    table: DispatchTable,
    events: EventDispatcher<ServerEvent>,
    gate: SinkGate,
    sessions: Mutex<HashMap<u64, ServerSession>>,
    next_session_id: AtomicU64,
    closed: AtomicBool,
}

impl ServerInner {
    fn sessions(&self) -> MutexGuard<'_, HashMap<u64, ServerSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fire(&self, kind: ServerEventKind, peer: SocketAddr, message: &str) {
        if let Some(_guard) = self.gate.enter() {
            let event = ServerEvent::new(kind, &self.service_name, peer.to_string(), message);
            self.events.dispatch(&event);
        }
    }
}

/// Session and listener callbacks, holding the server weakly.
struct SessionHost {
    inner: Weak<ServerInner>,
}

#[async_trait::async_trait]
impl ServerSessionHost for SessionHost {
    async fn handle_request(&self, request: RequestBody) -> ResponseBody {
        match self.inner.upgrade() {
            Some(inner) => inner.table.execute(request).await,
            None => ResponseBody::handler_failed("server is shutting down"),
        }
    }

    fn on_connected(&self, peer: SocketAddr, protocol_version: u8) {
        if let Some(inner) = self.inner.upgrade() {
            info!(
                "{}: client {} connected (protocol v{})",
                inner.service_name, peer, protocol_version
            );
            inner.fire(ServerEventKind::Connected, peer, "client connected");
        }
    }

    fn on_disconnected(&self, peer: SocketAddr, reason: &str) {
        if let Some(inner) = self.inner.upgrade() {
            info!("{}: client {} disconnected: {}", inner.service_name, peer, reason);
            inner.fire(ServerEventKind::Disconnected, peer, reason);
        }
    }

    fn on_session_ended(&self, session_id: u64) {
        if let Some(inner) = self.inner.upgrade() {
            // Dropped outside the lock; it may be the last reference.
            let session = inner.sessions().remove(&session_id);
            drop(session);
        }
    }
}

impl ConnectionAcceptor for SessionHost {
    fn accept_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if inner.closed.load(Ordering::Acquire) {
            return;
        }
        let current = inner.sessions().len();
        if current >= inner.config.max_connections {
            warn!(
                "{}: rejecting connection from {}: at max capacity ({})",
                inner.service_name, peer, inner.config.max_connections
            );
            return;
        }
        if inner.config.tcp_nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("[{}] Failed to set TCP_NODELAY: {}", peer, e);
            }
        }

        debug!("{}: connection from {}", inner.service_name, peer);
        let session_id = inner.next_session_id.fetch_add(1, Ordering::Relaxed);
        let host: Arc<dyn ServerSessionHost> = Arc::new(SessionHost {
            inner: self.inner.clone(),
        });
        // Registered under the lock so a session that ends immediately
        // finds itself in the map when it removes itself.
        let mut sessions = inner.sessions();
        let session = ServerSession::start(
            &inner.handle,
            session_id,
            stream,
            peer,
            inner.config.clone(),
            host,
        );
        sessions.insert(session_id, session);
    }
}

/// A named service accepting calls on a TCP port.
///
/// Dropping the server stops the listener, closes every connection (firing
/// `disconnected` events) and waits for event sinks running on other
/// threads. No sink is invoked after the drop returns.
pub struct ServiceServer {
    inner: Arc<ServerInner>,
    listener: Listener,
    endpoint: ServiceEndpoint,
    announced: Mutex<Vec<Arc<dyn Discovery>>>,
    _event_loop: EventLoop,
}

impl ServiceServer {
    /// Bind and start serving `service_name`.
    pub fn create(
        event_loop: &EventLoop,
        service_name: &str,
        config: ServerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let handle = event_loop.handle().clone();
        let inner = Arc::new(ServerInner {
            service_name: service_name.to_string(),
            config: config.clone(),
            handle: handle.clone(),
            table: DispatchTable::new(service_name),
            events: EventDispatcher::new(),
            gate: SinkGate::new(),
            sessions: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });

        let acceptor: Arc<dyn ConnectionAcceptor> = Arc::new(SessionHost {
            inner: Arc::downgrade(&inner),
        });
        let listener = Listener::bind(&handle, &config, acceptor)?;
        let local_addr = listener.local_addr();

        let address = match &config.advertised_address {
            Some(address) => address.clone(),
            None if local_addr.ip().is_unspecified() => local_host_name(),
            None => local_addr.ip().to_string(),
        };
        let endpoint = ServiceEndpoint::new(
            service_name,
            EndpointId::local(),
            address,
            local_addr.port(),
        );
        info!("{}: serving as {}", service_name, endpoint.id);

        Ok(Self {
            inner,
            listener,
            endpoint,
            announced: Mutex::new(Vec::new()),
            _event_loop: event_loop.clone(),
        })
    }

    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    /// What clients need to reach this server.
    pub fn endpoint(&self) -> &ServiceEndpoint {
        &self.endpoint
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn port(&self) -> u16 {
        self.local_addr().port()
    }

    /// Add a synchronous method. It runs on the blocking pool.
    pub fn add_method<F>(&self, name: &str, handler: F)
    where
        F: Fn(MethodCall) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner
            .table
            .insert(name, Arc::new(SyncHandler::new(handler)));
    }

    /// Add an async method. It runs on the event loop.
    pub fn add_async_method<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(MethodCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.inner
            .table
            .insert(name, Arc::new(AsyncHandler::new(handler)));
    }

    /// Add a method that completes through a [`Responder`].
    pub fn add_method_with_responder<F>(&self, name: &str, handler: F)
    where
        F: Fn(MethodCall, Responder) + Send + Sync + 'static,
    {
        self.inner
            .table
            .insert(name, Arc::new(ResponderHandler::new(handler)));
    }

    /// Add a method implemented by a [`MethodHandler`].
    pub fn add_handler(&self, name: &str, handler: Arc<dyn MethodHandler>) {
        self.inner.table.insert(name, handler);
    }

    /// Describe a method's request and response types.
    pub fn add_method_info(&self, info: MethodInfo) {
        self.inner.table.set_info(info);
    }

    /// Remove a method. Later calls to it answer `HandlerMissing`.
    pub fn remove_method(&self, name: &str) -> bool {
        self.inner.table.remove(name)
    }

    pub fn methods(&self) -> Vec<MethodInfo> {
        self.inner.table.methods()
    }

    /// How many times a method's handler has been invoked.
    pub fn method_call_count(&self, name: &str) -> u64 {
        self.inner.table.call_count(name)
    }

    /// Clients currently past the handshake.
    pub fn connection_count(&self) -> usize {
        self.inner
            .sessions()
            .values()
            .filter(|s| s.state() == ServerSessionState::Serving)
            .count()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_count() > 0
    }

    pub fn add_event_sink<F>(&self, sink: F) -> SinkId
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.inner.events.add(sink)
    }

    pub fn remove_event_sink(&self, id: SinkId) -> bool {
        self.inner.events.remove(id)
    }

    /// Announce this server; it is withdrawn again on drop.
    pub fn announce_to(&self, discovery: Arc<dyn Discovery>) {
        discovery.announce(self.endpoint.clone());
        self.announced
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(discovery);
    }
}

impl Drop for ServiceServer {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Release);

        let announced =
            std::mem::take(&mut *self.announced.lock().unwrap_or_else(|e| e.into_inner()));
        for discovery in announced {
            discovery.withdraw(&self.inner.service_name, &self.endpoint.id);
        }

        self.listener.shutdown();

        let sessions: Vec<ServerSession> = self.inner.sessions().drain().map(|(_, s)| s).collect();
        debug!(
            "{}: closing {} sessions",
            self.inner.service_name,
            sessions.len()
        );
        for session in &sessions {
            session.stop();
        }
        drop(sessions);

        self.inner.gate.close();
    }
}

impl std::fmt::Debug for ServiceServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceServer")
            .field("service_name", &self.inner.service_name)
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

/// Shorthand for a failed handler result.
pub fn handler_error(message: impl Into<String>) -> HandlerResult {
    Err(HandlerError::new(message))
}
