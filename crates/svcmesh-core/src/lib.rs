//! svcmesh core - brokerless request/response RPC between processes.
//!
//! A [`ServiceServer`] offers named methods on a TCP port. A
//! [`ServiceClient`] learns the endpoints of a service (usually through a
//! [`Discovery`] implementation), keeps one connection per endpoint and fans
//! each call out to all of them, returning one [`ServiceResponse`] per
//! endpoint.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use svcmesh_core::{
//!     ClientConfig, EventLoop, LocalDiscovery, MethodReply, ServerConfig, ServiceClient,
//!     ServiceServer,
//! };
//!
//! fn main() -> svcmesh_core::Result<()> {
//!     let event_loop = EventLoop::new(2)?;
//!     let discovery = Arc::new(LocalDiscovery::new());
//!
//!     let server = ServiceServer::create(&event_loop, "echo", ServerConfig::default())?;
//!     server.add_method("Echo", |call| Ok(MethodReply::new(call.request)));
//!     server.announce_to(discovery.clone());
//!
//!     let client =
//!         ServiceClient::with_discovery(&event_loop, "echo", ClientConfig::default(), discovery)?;
//!     // once connected:
//!     let responses = client.call_blocking("Echo", "hello", Some(Duration::from_secs(1)))?;
//!     println!("{} endpoints answered", responses.len());
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod server;
pub mod session;
pub mod types;

// Re-export commonly used types
pub use client::{ResponseSink, ServiceClient};
pub use config::{ClientConfig, ProtocolConfig, ServerConfig};
pub use discovery::{Discovery, DiscoveryListener, LocalDiscovery, SubscriptionId};
pub use error::{HandlerError, Result, ServiceError};
pub use events::{ClientEvent, ClientEventKind, ServerEvent, ServerEventKind, SinkId};
pub use runtime::EventLoop;
pub use server::{
    handler_error, HandlerResult, MethodCall, MethodHandler, MethodReply, Responder,
    ServiceServer,
};
pub use session::{ServerSessionState, SessionState};
pub use types::{
    CallFailure, CallState, EndpointId, MethodInfo, ServiceEndpoint, ServiceResponse,
};
