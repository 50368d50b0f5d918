//! Data model shared by clients, servers and discovery.

use crate::{Result, ServiceError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one reachable remote service instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId {
    pub host_name: String,
    pub process_id: u32,
    pub service_instance_id: String,
}

impl EndpointId {
    pub fn new(
        host_name: impl Into<String>,
        process_id: u32,
        service_instance_id: impl Into<String>,
    ) -> Self {
        Self {
            host_name: host_name.into(),
            process_id,
            service_instance_id: service_instance_id.into(),
        }
    }

    /// Id for a service instance living in this process.
    pub fn local() -> Self {
        Self {
            host_name: local_host_name(),
            process_id: std::process::id(),
            service_instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.host_name, self.process_id, self.service_instance_id
        )
    }
}

/// What discovery reports about an endpoint: who it is and where to connect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub service_name: String,
    pub id: EndpointId,
    pub address: String,
    pub port: u16,
}

impl ServiceEndpoint {
    pub fn new(
        service_name: impl Into<String>,
        id: EndpointId,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            id,
            address: address.into(),
            port,
        }
    }

    /// `address:port` as used for resolution and log prefixes.
    pub fn socket_string(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Informational description of a server method.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MethodInfo {
    pub name: String,
    pub request_type: Option<String>,
    pub response_type: Option<String>,
}

impl MethodInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            request_type: None,
            response_type: None,
        }
    }

    pub fn with_types(
        mut self,
        request_type: impl Into<String>,
        response_type: impl Into<String>,
    ) -> Self {
        self.request_type = Some(request_type.into());
        self.response_type = Some(response_type.into());
        self
    }
}

/// Per-endpoint result state of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    /// The handler ran and produced a response.
    Executed,
    /// The call failed: missing or failing handler, lost connection, protocol error.
    Failed,
    /// The deadline elapsed before a response arrived.
    TimedOut,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallState::Executed => write!(f, "EXECUTED"),
            CallState::Failed => write!(f, "FAILED"),
            CallState::TimedOut => write!(f, "TIMED_OUT"),
        }
    }
}

/// Why a call did not produce a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallFailure {
    /// The endpoint has no handler for the method.
    HandlerMissing,
    /// The handler returned an error or panicked.
    HandlerFailed,
    /// The request was refused before any handler ran, e.g. it was too large.
    Rejected,
    TimedOut,
    /// The session ended before the response arrived.
    Disconnected,
    /// The response could not be decoded or exceeded the size limit.
    Malformed,
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallFailure::HandlerMissing => write!(f, "HANDLER_MISSING"),
            CallFailure::HandlerFailed => write!(f, "HANDLER_FAILED"),
            CallFailure::Rejected => write!(f, "REJECTED"),
            CallFailure::TimedOut => write!(f, "TIMED_OUT"),
            CallFailure::Disconnected => write!(f, "DISCONNECTED"),
            CallFailure::Malformed => write!(f, "MALFORMED"),
        }
    }
}

/// Outcome of one call on one endpoint, as seen by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceResponse {
    pub endpoint: EndpointId,
    pub method: String,
    pub state: CallState,
    /// Set whenever `state` is not `Executed`.
    pub failure: Option<CallFailure>,
    /// Return code set by the handler (0 unless the handler chose otherwise).
    pub ret_state: i32,
    pub error: Option<String>,
    pub response: Bytes,
}

impl ServiceResponse {
    pub fn is_success(&self) -> bool {
        self.state == CallState::Executed
    }

    /// The response payload, or the failure as a [`ServiceError`].
    pub fn into_result(self) -> Result<Bytes> {
        let Some(failure) = self.failure else {
            return Ok(self.response);
        };
        let message = self.error.unwrap_or_default();
        Err(match failure {
            CallFailure::HandlerMissing => ServiceError::HandlerMissing {
                method: self.method,
            },
            CallFailure::HandlerFailed => ServiceError::HandlerFailed {
                method: self.method,
                message,
            },
            CallFailure::Rejected => ServiceError::InvalidRequest { message },
            CallFailure::TimedOut => ServiceError::Timeout {
                method: self.method,
            },
            CallFailure::Disconnected => ServiceError::Disconnected { message },
            CallFailure::Malformed => ServiceError::MalformedMessage { message },
        })
    }
}

/// Host name of this machine, falling back to `localhost`.
pub fn local_host_name() -> String {
    sysinfo::System::host_name()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
