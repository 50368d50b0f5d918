//! One client instance: the binding of a client to a single endpoint.

use super::handle::ClientInner;
use crate::config::ClientConfig;
use crate::events::{ClientEvent, ClientEventKind, EventLatch};
use crate::protocol::ResponseStatus;
use crate::registry::CallOutcome;
use crate::session::{ClientSession, SessionObserver, SessionState};
use crate::types::{CallFailure, CallState, EndpointId, ServiceEndpoint, ServiceResponse};
use bytes::Bytes;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

/// Completion callback of one call on one instance.
pub(crate) type InstanceSink = Box<dyn FnOnce(ServiceResponse) + Send + 'static>;

/// A client's connection to one endpoint.
pub struct ClientInstance {
    endpoint: ServiceEndpoint,
    session: ClientSession,
}

impl ClientInstance {
    pub(crate) fn connect(
        handle: &Handle,
        endpoint: ServiceEndpoint,
        config: ClientConfig,
        client: Weak<ClientInner>,
    ) -> Self {
        let observer = Arc::new(InstanceObserver {
            client,
            endpoint: endpoint.id.clone(),
            latch: EventLatch::new(),
        });
        let session = ClientSession::connect(handle, endpoint.clone(), config, observer);
        Self { endpoint, session }
    }

    pub fn endpoint(&self) -> &ServiceEndpoint {
        &self.endpoint
    }

    pub fn endpoint_id(&self) -> &EndpointId {
        &self.endpoint.id
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Whether the session is gone for good and a re-announcement may
    /// replace this instance.
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub(crate) fn call(
        &self,
        method: &str,
        request: Bytes,
        timeout: Option<Duration>,
        on_response: InstanceSink,
    ) {
        let endpoint = self.endpoint.id.clone();
        let method_name = method.to_string();
        self.session.send_request(
            method,
            request,
            timeout,
            Box::new(move |outcome| on_response(to_response(endpoint, method_name, outcome))),
        );
    }

    /// Stop the session. Outstanding calls resolve as disconnected.
    pub(crate) fn shutdown(&self) {
        self.session.stop();
    }
}

/// Map a call outcome to what the user sees.
fn to_response(endpoint: EndpointId, method: String, outcome: CallOutcome) -> ServiceResponse {
    let failed = |failure: CallFailure, error: String| {
        (CallState::Failed, Some(failure), 0, Some(error), Bytes::new())
    };
    let (state, failure, ret_state, error, response) = match outcome {
        CallOutcome::Response(body) => {
            let (state, failure) = match body.status {
                ResponseStatus::Ok => (CallState::Executed, None),
                ResponseStatus::HandlerMissing => {
                    (CallState::Failed, Some(CallFailure::HandlerMissing))
                }
                ResponseStatus::HandlerFailed => {
                    (CallState::Failed, Some(CallFailure::HandlerFailed))
                }
                ResponseStatus::Rejected => (CallState::Failed, Some(CallFailure::Rejected)),
            };
            (state, failure, body.ret_state, body.error, body.payload)
        }
        CallOutcome::TimedOut => (
            CallState::TimedOut,
            Some(CallFailure::TimedOut),
            0,
            Some("call timed out".to_string()),
            Bytes::new(),
        ),
        CallOutcome::Disconnected(reason) => {
            failed(CallFailure::Disconnected, format!("disconnected: {}", reason))
        }
        CallOutcome::Malformed(reason) => {
            failed(CallFailure::Malformed, format!("malformed response: {}", reason))
        }
        CallOutcome::Rejected(reason) => failed(CallFailure::Rejected, reason),
    };
    ServiceResponse {
        endpoint,
        method,
        state,
        failure,
        ret_state,
        error,
        response,
    }
}

/// Turns session lifecycle into client events.
struct InstanceObserver {
    client: Weak<ClientInner>,
    endpoint: EndpointId,
    latch: EventLatch,
}

impl InstanceObserver {
    fn event(&self, client: &ClientInner, kind: ClientEventKind, message: &str) -> ClientEvent {
        ClientEvent::new(kind, client.service_name(), self.endpoint.clone(), message)
    }
}

impl SessionObserver for InstanceObserver {
    fn on_connected(&self, protocol_version: u8) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        let Some(_guard) = client.gate().enter() else {
            return;
        };
        if !self.latch.begin_announce() {
            return;
        }
        info!(
            "{}: connected to {} (protocol v{})",
            client.service_name(),
            self.endpoint,
            protocol_version
        );
        client.dispatch_event(&self.event(&client, ClientEventKind::Connected, "connected"));
        if self.latch.finish_announce() {
            client.dispatch_event(&self.event(
                &client,
                ClientEventKind::Disconnected,
                "closed while connecting",
            ));
        }
    }

    fn on_closed(&self, reason: &str) {
        if !self.latch.close() {
            return;
        }
        let Some(client) = self.client.upgrade() else {
            return;
        };
        info!(
            "{}: disconnected from {}: {}",
            client.service_name(),
            self.endpoint,
            reason
        );
        let Some(_guard) = client.gate().enter() else {
            return;
        };
        client.dispatch_event(&self.event(&client, ClientEventKind::Disconnected, reason));
    }
}
