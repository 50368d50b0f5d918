//! TCP accept loop.
//!
//! Binds synchronously so a server can be created outside the event loop,
//! then accepts on a spawned task until shut down. What happens to an
//! accepted connection is up to the [`ConnectionAcceptor`].

use crate::config::ServerConfig;
use crate::runtime::spawn_on;
use crate::{Result, ServiceError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{error, info};

pub(crate) trait ConnectionAcceptor: Send + Sync + 'static {
    fn accept_connection(&self, stream: TcpStream, peer: SocketAddr);
}

/// Running accept loop. Dropping it stops accepting.
pub(crate) struct Listener {
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl Listener {
    pub(crate) fn bind(
        handle: &Handle,
        config: &ServerConfig,
        acceptor: Arc<dyn ConnectionAcceptor>,
    ) -> Result<Self> {
        let bind_to = format!("{}:{}", config.bind_address, config.port);
        let std_listener =
            std::net::TcpListener::bind(&bind_to).map_err(|e| ServiceError::Io {
                message: format!("Failed to bind {}: {}", bind_to, e),
                source: Some(e),
            })?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;

        let listener = {
            let _guard = handle.enter();
            TcpListener::from_std(std_listener)?
        };
        info!("Service listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task_handle = spawn_on(handle, Self::accept_loop(listener, acceptor, shutdown_rx));

        Ok(Self {
            local_addr,
            shutdown_tx: Some(shutdown_tx),
            task_handle: Some(task_handle),
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }

    async fn accept_loop(
        listener: TcpListener,
        acceptor: Arc<dyn ConnectionAcceptor>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Listener on {:?} shutting down", listener.local_addr().ok());
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => acceptor.accept_connection(stream, peer_addr),
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown();
    }
}
