//! Client side of one connection: connect, handshake, multiplex calls.
//!
//! The session task resolves and connects, runs the version handshake on the
//! bare stream, then splits it into a reader loop and a writer task. Requests
//! issued before the handshake completes wait in the outbound queue and are
//! written once the writer starts.

use crate::config::ClientConfig;
use crate::protocol::{
    read_frame, read_inbound, write_frame, Frame, HandshakeResponse, Inbound, MessageKind,
    RequestBody, ResponseBody,
};
use crate::registry::{CallOutcome, CallRegistry, CallSink};
use crate::runtime::spawn_on;
use crate::types::ServiceEndpoint;
use crate::{Result, ServiceError};
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Connected,
    Disconnected,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Handshaking => write!(f, "handshaking"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

/// Receives the lifecycle of a client session.
///
/// `on_closed` is called exactly once when the session reaches a terminal
/// state, whether or not `on_connected` was called before.
pub trait SessionObserver: Send + Sync {
    fn on_connected(&self, protocol_version: u8);
    fn on_closed(&self, reason: &str);
}

struct OutboundRequest {
    call_id: u64,
    body: RequestBody,
}

struct SessionCore {
    state: SessionState,
    protocol_version: u8,
    outbound_rx: Option<mpsc::UnboundedReceiver<OutboundRequest>>,
}

struct SessionShared {
    endpoint: ServiceEndpoint,
    config: ClientConfig,
    handle: Handle,
    core: Mutex<SessionCore>,
    registry: CallRegistry,
    outbound_tx: mpsc::UnboundedSender<OutboundRequest>,
    shutdown_tx: watch::Sender<bool>,
    observer: Arc<dyn SessionObserver>,
}

/// Client end of a connection to one endpoint.
///
/// Dropping the session stops it.
pub struct ClientSession {
    shared: Arc<SessionShared>,
}

impl ClientSession {
    /// Create a session and start connecting on the event loop.
    pub fn connect(
        handle: &Handle,
        endpoint: ServiceEndpoint,
        config: ClientConfig,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let shared = Arc::new(SessionShared {
            endpoint,
            config,
            handle: handle.clone(),
            core: Mutex::new(SessionCore {
                state: SessionState::Connecting,
                protocol_version: 0,
                outbound_rx: Some(outbound_rx),
            }),
            registry: CallRegistry::new(),
            outbound_tx,
            shutdown_tx,
            observer,
        });

        let task_shared = shared.clone();
        spawn_on(handle, async move { task_shared.run().await });

        Self { shared }
    }

    pub fn endpoint(&self) -> &ServiceEndpoint {
        &self.shared.endpoint
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Negotiated protocol version, 0 before the handshake completes.
    pub fn protocol_version(&self) -> u8 {
        self.shared.lock().protocol_version
    }

    pub fn pending_calls(&self) -> usize {
        self.shared.registry.len()
    }

    /// Issue a call. `sink` is invoked exactly once with the outcome.
    ///
    /// On a terminal session the sink is invoked right away, on the caller's
    /// thread, with a disconnected outcome. A request that cannot be framed
    /// (method name over 64 KiB, body over `max_payload_size`) is rejected the
    /// same way and the session is unaffected.
    pub fn send_request(
        &self,
        method: &str,
        payload: Bytes,
        call_timeout: Option<Duration>,
        sink: CallSink,
    ) {
        let shared = &self.shared;
        let body = RequestBody::new(method, payload);
        if let Err(e) = body.validate(shared.config.max_payload_size) {
            debug!("[{}] Rejecting call to {}: {}", shared.prefix(), method, e);
            sink(CallOutcome::Rejected(e.to_string()));
            return;
        }
        let deadline = call_timeout.map(|t| Instant::now() + t);
        let call_id = match shared.registry.register(method, deadline, sink) {
            Ok(call_id) => call_id,
            Err(sink) => {
                sink(CallOutcome::Disconnected(format!(
                    "session to {} is closed",
                    shared.endpoint.socket_string()
                )));
                return;
            }
        };

        if let Some(deadline) = deadline {
            let timer_shared = shared.clone();
            let deadline = tokio::time::Instant::from_std(deadline);
            let timer = spawn_on(&shared.handle, async move {
                tokio::time::sleep_until(deadline).await;
                timer_shared.registry.time_out(call_id);
            });
            shared.registry.set_timer(call_id, timer.abort_handle());
        }

        let request = OutboundRequest { call_id, body };
        if shared.outbound_tx.send(request).is_err() {
            shared.registry.resolve(
                call_id,
                CallOutcome::Disconnected("outbound queue closed".to_string()),
            );
        }
    }

    /// Stop the session from the caller's thread.
    ///
    /// Outstanding calls resolve as disconnected and the observer is told,
    /// both before this returns.
    pub fn stop(&self) {
        self.shared.close(SessionState::Disconnected, "session stopped");
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.shared.close(SessionState::Disconnected, "session dropped");
    }
}

impl SessionShared {
    fn lock(&self) -> MutexGuard<'_, SessionCore> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn prefix(&self) -> String {
        self.endpoint.socket_string()
    }

    fn set_state(&self, next: SessionState) -> bool {
        let mut core = self.lock();
        if core.state.is_terminal() {
            return false;
        }
        core.state = next;
        true
    }

    /// Move to a terminal state once; later calls are no-ops.
    ///
    /// A session that never reached `Connected` ends up `Failed` regardless
    /// of `terminal`.
    fn close(&self, terminal: SessionState, reason: &str) {
        {
            let mut core = self.lock();
            if core.state.is_terminal() {
                return;
            }
            core.state = if core.state == SessionState::Connected {
                terminal
            } else {
                SessionState::Failed
            };
            core.outbound_rx = None;
        }
        let _ = self.shutdown_tx.send(true);
        let drained = self.registry.drain(reason);
        debug!(
            "[{}] Session closed ({}), {} outstanding calls resolved",
            self.prefix(),
            reason,
            drained
        );
        self.observer.on_closed(reason);
    }

    fn fail(&self, err: &ServiceError) {
        self.close(SessionState::Disconnected, &err.to_string());
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            return;
        }

        let established = tokio::select! {
            result = self.establish() => result,
            _ = shutdown.changed() => return,
        };
        let (stream, version) = match established {
            Ok(pair) => pair,
            Err(e) => {
                warn!("[{}] Session failed: {}", self.prefix(), e);
                self.fail(&e);
                return;
            }
        };

        let outbound_rx = {
            let mut core = self.lock();
            if core.state.is_terminal() {
                return;
            }
            core.state = SessionState::Connected;
            core.protocol_version = version;
            core.outbound_rx.take()
        };
        let Some(outbound_rx) = outbound_rx else {
            return;
        };
        info!(
            "[{}] Connected to {} (protocol v{})",
            self.prefix(),
            self.endpoint.id,
            version
        );

        let (reader, writer) = stream.into_split();
        let writer_shared = self.clone();
        spawn_on(&self.handle, async move {
            writer_shared
                .write_loop(writer, outbound_rx, version)
                .await
        });

        self.observer.on_connected(version);
        self.read_loop(reader, shutdown).await;
    }

    async fn establish(&self) -> Result<(TcpStream, u8)> {
        let addr = self.resolve().await?;
        let socket = self.endpoint.socket_string();

        let mut stream = timeout(self.config.connect_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| ServiceError::ConnectFailed {
                address: socket.clone(),
                message: format!("timed out after {:?}", self.config.connect_timeout()),
            })?
            .map_err(|e| ServiceError::ConnectFailed {
                address: socket.clone(),
                message: e.to_string(),
            })?;
        if self.config.tcp_nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("[{}] Failed to set TCP_NODELAY: {}", self.prefix(), e);
            }
        }

        if !self.set_state(SessionState::Handshaking) {
            return Err(ServiceError::disconnected("session stopped while connecting"));
        }
        let version = timeout(self.config.connect_timeout(), self.handshake(&mut stream))
            .await
            .map_err(|_| ServiceError::ConnectFailed {
                address: socket,
                message: "handshake timed out".to_string(),
            })??;
        Ok((stream, version))
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        let host = self.endpoint.address.as_str();
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, self.endpoint.port))
            .await
            .map_err(|e| ServiceError::ResolutionFailed {
                address: self.endpoint.socket_string(),
                message: e.to_string(),
            })?
            .collect();
        addrs
            .iter()
            .find(|a| a.ip().is_loopback())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| ServiceError::ResolutionFailed {
                address: self.endpoint.socket_string(),
                message: "no addresses found".to_string(),
            })
    }

    async fn handshake(&self, stream: &mut TcpStream) -> Result<u8> {
        let min = self.config.min_protocol_version;
        let max = self.config.max_protocol_version;
        write_frame(stream, &Frame::handshake_request(min, max)).await?;

        let frame = read_frame(stream, self.config.max_payload_size)
            .await?
            .ok_or_else(|| {
                ServiceError::disconnected("server closed the connection during handshake")
            })?;
        if frame.kind() != MessageKind::HandshakeResponse {
            return Err(ServiceError::malformed(format!(
                "expected HandshakeResponse, got {}",
                frame.kind()
            )));
        }
        let response = HandshakeResponse::decode(&frame.payload)?;
        let version = response.accepted_version;
        if response.is_rejected() || version < min || version > max {
            return Err(ServiceError::ProtocolVersionMismatch {
                local_min: min,
                local_max: max,
                remote: if response.is_rejected() {
                    "rejected the handshake".to_string()
                } else {
                    format!("accepted version {}", version)
                },
            });
        }
        Ok(version)
    }

    async fn read_loop(&self, mut reader: OwnedReadHalf, mut shutdown: watch::Receiver<bool>) {
        loop {
            let inbound = tokio::select! {
                result = read_inbound(&mut reader, self.config.max_payload_size) => result,
                _ = shutdown.changed() => return,
            };
            match inbound {
                Ok(Some(inbound)) => {
                    if let Err(e) = self.handle_inbound(inbound) {
                        warn!("[{}] Protocol error, closing session: {}", self.prefix(), e);
                        self.fail(&e);
                        return;
                    }
                }
                Ok(None) => {
                    debug!("[{}] Server closed the connection", self.prefix());
                    self.close(SessionState::Disconnected, "connection closed by peer");
                    return;
                }
                Err(e) => {
                    debug!("[{}] Read failed: {}", self.prefix(), e);
                    self.fail(&e);
                    return;
                }
            }
        }
    }

    fn handle_inbound(&self, inbound: Inbound) -> Result<()> {
        let frame = match inbound {
            Inbound::Frame(frame) => frame,
            Inbound::Oversized(header) if header.kind == MessageKind::Response => {
                let reason = format!(
                    "response of {} bytes exceeds the limit of {}",
                    header.payload_length, self.config.max_payload_size
                );
                warn!("[{}] Call {}: {}", self.prefix(), header.call_id, reason);
                self.registry.resolve(header.call_id, CallOutcome::Malformed(reason));
                return Ok(());
            }
            Inbound::Oversized(header) => {
                return Err(ServiceError::malformed(format!(
                    "{} frame of {} bytes exceeds the limit of {}",
                    header.kind, header.payload_length, self.config.max_payload_size
                )));
            }
        };
        if frame.kind() != MessageKind::Response {
            return Err(ServiceError::malformed(format!(
                "unexpected {} frame on a connected client session",
                frame.kind()
            )));
        }
        let call_id = frame.call_id();
        let body = match ResponseBody::decode(frame.payload) {
            Ok(body) => body,
            Err(e) => {
                // The call fails as malformed, then the session closes.
                self.registry.resolve(call_id, CallOutcome::Malformed(e.to_string()));
                return Err(e);
            }
        };
        if !self.registry.resolve(call_id, CallOutcome::Response(body)) {
            debug!(
                "[{}] Discarding late response for call {}",
                self.prefix(),
                call_id
            );
        }
        Ok(())
    }

    async fn write_loop(
        self: Arc<Self>,
        mut writer: OwnedWriteHalf,
        mut outbound: mpsc::UnboundedReceiver<OutboundRequest>,
        version: u8,
    ) {
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            return;
        }
        loop {
            let request = tokio::select! {
                request = outbound.recv() => request,
                _ = shutdown.changed() => return,
            };
            let Some(request) = request else {
                return;
            };
            let frame = Frame::request(version, request.call_id, &request.body);
            if let Err(e) = write_frame(&mut writer, &frame).await {
                debug!("[{}] Write failed: {}", self.prefix(), e);
                self.fail(&e);
                return;
            }
        }
    }
}
