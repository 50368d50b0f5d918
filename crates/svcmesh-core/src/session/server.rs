//! Server side of one connection: answer the handshake, serve requests.
//!
//! Every Request is dispatched on its own task so a slow handler does not
//! hold up framing. Responses funnel through a single writer task and carry
//! the call id of the Request they answer.

use crate::config::ServerConfig;
use crate::events::EventLatch;
use crate::protocol::{
    check_outbound_size, negotiate_version, read_frame, read_inbound, write_frame, Frame,
    HandshakeRequest, HandshakeResponse, Inbound, MessageKind, RequestBody, ResponseBody,
};
use crate::runtime::spawn_on;
use crate::{Result, ServiceError};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerSessionState {
    AcceptingHandshake,
    Serving,
    Closed,
}

impl fmt::Display for ServerSessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerSessionState::AcceptingHandshake => write!(f, "accepting-handshake"),
            ServerSessionState::Serving => write!(f, "serving"),
            ServerSessionState::Closed => write!(f, "closed"),
        }
    }
}

/// What a server session needs from the server that accepted it.
#[async_trait::async_trait]
pub trait ServerSessionHost: Send + Sync + 'static {
    /// Run the handler for a request and produce its response.
    async fn handle_request(&self, request: RequestBody) -> ResponseBody;

    /// The handshake succeeded. Called at most once per session.
    fn on_connected(&self, peer: SocketAddr, protocol_version: u8);

    /// The session closed after `on_connected`. Called at most once.
    fn on_disconnected(&self, peer: SocketAddr, reason: &str);

    /// The session reached `Closed`. Always called exactly once.
    fn on_session_ended(&self, session_id: u64);
}

struct SessionCore {
    state: ServerSessionState,
    protocol_version: u8,
}

struct ServerSessionShared {
    id: u64,
    peer: SocketAddr,
    config: ServerConfig,
    handle: Handle,
    core: Mutex<SessionCore>,
    shutdown_tx: watch::Sender<bool>,
    latch: EventLatch,
    host: Arc<dyn ServerSessionHost>,
}

/// Server end of one accepted connection.
pub struct ServerSession {
    shared: Arc<ServerSessionShared>,
}

impl ServerSession {
    pub fn start(
        handle: &Handle,
        session_id: u64,
        stream: TcpStream,
        peer: SocketAddr,
        config: ServerConfig,
        host: Arc<dyn ServerSessionHost>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let shared = Arc::new(ServerSessionShared {
            id: session_id,
            peer,
            config,
            handle: handle.clone(),
            core: Mutex::new(SessionCore {
                state: ServerSessionState::AcceptingHandshake,
                protocol_version: 0,
            }),
            shutdown_tx,
            latch: EventLatch::new(),
            host,
        });

        let task_shared = shared.clone();
        spawn_on(handle, async move { task_shared.run(stream).await });

        Self { shared }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.shared.peer
    }

    pub fn state(&self) -> ServerSessionState {
        self.shared.lock().state
    }

    pub fn protocol_version(&self) -> u8 {
        self.shared.lock().protocol_version
    }

    /// Close the connection from the caller's thread.
    pub fn stop(&self) {
        self.shared.close("server stopped");
    }
}

impl ServerSessionShared {
    fn lock(&self) -> MutexGuard<'_, SessionCore> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.lock().state == ServerSessionState::Closed
    }

    fn close(&self, reason: &str) {
        {
            let mut core = self.lock();
            if core.state == ServerSessionState::Closed {
                return;
            }
            core.state = ServerSessionState::Closed;
        }
        let _ = self.shutdown_tx.send(true);
        debug!("[{}] Session closed: {}", self.peer, reason);
        if self.latch.close() {
            self.host.on_disconnected(self.peer, reason);
        }
        self.host.on_session_ended(self.id);
    }

    async fn run(self: Arc<Self>, mut stream: TcpStream) {
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            return;
        }

        let handshake_timeout = self.config.handshake_timeout();
        let negotiated = tokio::select! {
            result = timeout(handshake_timeout, self.handshake(&mut stream)) => result,
            _ = shutdown.changed() => return,
        };
        let version = match negotiated {
            Ok(Ok(Some(version))) => version,
            Ok(Ok(None)) => {
                self.close("no common protocol version");
                return;
            }
            Err(_) => {
                warn!(
                    "[{}] No handshake within {:?}, closing",
                    self.peer, handshake_timeout
                );
                self.close("handshake timed out");
                return;
            }
            Ok(Err(e)) => {
                warn!("[{}] Handshake failed: {}", self.peer, e);
                self.close(&e.to_string());
                return;
            }
        };

        {
            let mut core = self.lock();
            if core.state == ServerSessionState::Closed {
                return;
            }
            core.state = ServerSessionState::Serving;
            core.protocol_version = version;
        }
        debug!("[{}] Serving (protocol v{})", self.peer, version);

        if self.latch.begin_announce() {
            self.host.on_connected(self.peer, version);
            if self.latch.finish_announce() {
                self.host.on_disconnected(self.peer, "closed while connecting");
            }
        }

        let (reader, writer) = stream.into_split();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let writer_shared = self.clone();
        spawn_on(&self.handle, async move {
            writer_shared.write_loop(writer, response_rx).await
        });

        self.read_loop(reader, response_tx, version, shutdown).await;
    }

    /// Returns the negotiated version, or `None` after rejecting the client.
    async fn handshake(&self, stream: &mut TcpStream) -> Result<Option<u8>> {
        let frame = read_frame(stream, self.config.max_payload_size)
            .await?
            .ok_or_else(|| ServiceError::disconnected("client closed before the handshake"))?;
        if frame.kind() != MessageKind::HandshakeRequest {
            return Err(ServiceError::malformed(format!(
                "expected HandshakeRequest, got {}",
                frame.kind()
            )));
        }
        let request = HandshakeRequest::decode(&frame.payload)?;
        let local_min = self.config.min_protocol_version;
        let local_max = self.config.max_protocol_version;

        match negotiate_version(local_min, local_max, request.min_version, request.max_version) {
            Some(version) => {
                write_frame(stream, &Frame::handshake_response(version, version)).await?;
                Ok(Some(version))
            }
            None => {
                warn!(
                    "[{}] Rejecting client: it speaks [{}, {}], server [{}, {}]",
                    self.peer, request.min_version, request.max_version, local_min, local_max
                );
                let rejected = HandshakeResponse::rejected();
                let frame = Frame::new(
                    local_min,
                    MessageKind::HandshakeResponse,
                    0,
                    rejected.encode(),
                );
                write_frame(stream, &frame).await?;
                Ok(None)
            }
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        response_tx: mpsc::UnboundedSender<Frame>,
        version: u8,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let inbound = tokio::select! {
                result = read_inbound(&mut reader, self.config.max_payload_size) => result,
                _ = shutdown.changed() => return,
            };
            let frame = match inbound {
                Ok(Some(Inbound::Frame(frame))) => frame,
                Ok(Some(Inbound::Oversized(header))) if header.kind == MessageKind::Request => {
                    let reason = format!(
                        "request of {} bytes exceeds the server limit of {}",
                        header.payload_length, self.config.max_payload_size
                    );
                    debug!("[{}] Rejecting call {}: {}", self.peer, header.call_id, reason);
                    let response = ResponseBody::rejected(reason);
                    let _ = response_tx.send(Frame::response(version, header.call_id, &response));
                    continue;
                }
                Ok(Some(Inbound::Oversized(header))) => {
                    let e = ServiceError::malformed(format!(
                        "{} frame of {} bytes exceeds the limit of {}",
                        header.kind, header.payload_length, self.config.max_payload_size
                    ));
                    warn!("[{}] Protocol error, closing session: {}", self.peer, e);
                    self.close(&e.to_string());
                    return;
                }
                Ok(None) => {
                    self.close("connection closed by peer");
                    return;
                }
                Err(e) => {
                    debug!("[{}] Read failed: {}", self.peer, e);
                    self.close(&e.to_string());
                    return;
                }
            };
            if let Err(e) = Self::dispatch(&self, frame, &response_tx, version) {
                warn!("[{}] Protocol error, closing session: {}", self.peer, e);
                self.close(&e.to_string());
                return;
            }
        }
    }

    fn dispatch(
        shared: &Arc<Self>,
        frame: Frame,
        response_tx: &mpsc::UnboundedSender<Frame>,
        version: u8,
    ) -> Result<()> {
        if frame.kind() != MessageKind::Request {
            return Err(ServiceError::malformed(format!(
                "unexpected {} frame on a serving session",
                frame.kind()
            )));
        }
        let call_id = frame.call_id();
        let request = RequestBody::decode(frame.payload)?;

        let task_shared = shared.clone();
        let response_tx = response_tx.clone();
        spawn_on(&shared.handle, async move {
            let shared = task_shared;
            let method = request.method.clone();
            let mut response = shared.host.handle_request(request).await;
            let size = response.encoded_len();
            if check_outbound_size(size, shared.config.max_payload_size).is_err() {
                let reason = format!(
                    "response of {} bytes exceeds the limit of {}",
                    size, shared.config.max_payload_size
                );
                warn!("[{}] Response to {} not sent: {}", shared.peer, method, reason);
                response = ResponseBody::handler_failed(reason);
            }
            if shared.is_closed() {
                debug!(
                    "[{}] Dropping response to call {} ({}): session closed",
                    shared.peer, call_id, method
                );
                return;
            }
            let _ = response_tx.send(Frame::response(version, call_id, &response));
        });
        Ok(())
    }

    async fn write_loop(
        self: Arc<Self>,
        mut writer: OwnedWriteHalf,
        mut responses: mpsc::UnboundedReceiver<Frame>,
    ) {
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            return;
        }
        loop {
            let frame = tokio::select! {
                frame = responses.recv() => frame,
                _ = shutdown.changed() => return,
            };
            let Some(frame) = frame else {
                return;
            };
            if let Err(e) = write_frame(&mut writer, &frame).await {
                debug!("[{}] Write failed: {}", self.peer, e);
                self.close(&e.to_string());
                return;
            }
        }
    }
}
