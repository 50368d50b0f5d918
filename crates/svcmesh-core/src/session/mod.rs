//! Connection state machines for both ends of a TCP connection.

mod client;
mod server;

pub use client::{ClientSession, SessionObserver, SessionState};
pub use server::{ServerSession, ServerSessionHost, ServerSessionState};
