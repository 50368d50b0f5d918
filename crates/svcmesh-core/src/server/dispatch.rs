//! Method dispatch table and handler adapters.
//!
//! Handlers come in three shapes, all stored behind [`MethodHandler`]:
//!
//! - synchronous closures, run on the blocking pool;
//! - async closures, run on the event loop;
//! - completion-callback closures, handed a [`Responder`] they may complete
//!   later from any thread.

use crate::error::HandlerError;
use crate::protocol::{RequestBody, ResponseBody};
use crate::runtime::spawn_on;
use crate::types::MethodInfo;
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::task::JoinError;
use tracing::{debug, warn};

/// A request as seen by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodCall {
    pub method: String,
    pub request: Bytes,
}

/// What a handler returns on success.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MethodReply {
    pub ret_state: i32,
    pub response: Bytes,
}

impl MethodReply {
    pub fn new(response: impl Into<Bytes>) -> Self {
        Self {
            ret_state: 0,
            response: response.into(),
        }
    }

    pub fn with_ret_state(mut self, ret_state: i32) -> Self {
        self.ret_state = ret_state;
        self
    }
}

impl From<Bytes> for MethodReply {
    fn from(response: Bytes) -> Self {
        Self::new(response)
    }
}

impl From<Vec<u8>> for MethodReply {
    fn from(response: Vec<u8>) -> Self {
        Self::new(response)
    }
}

impl From<String> for MethodReply {
    fn from(response: String) -> Self {
        Self::new(response)
    }
}

pub type HandlerResult = std::result::Result<MethodReply, HandlerError>;

/// A server method implementation.
#[async_trait::async_trait]
pub trait MethodHandler: Send + Sync + 'static {
    async fn call(&self, call: MethodCall) -> HandlerResult;
}

fn join_failure(err: JoinError) -> HandlerError {
    if err.is_panic() {
        HandlerError::new("handler panicked")
    } else {
        HandlerError::new("handler was cancelled")
    }
}

pub(crate) struct SyncHandler<F> {
    func: Arc<F>,
}

impl<F> SyncHandler<F> {
    pub(crate) fn new(func: F) -> Self {
        Self {
            func: Arc::new(func),
        }
    }
}

#[async_trait::async_trait]
impl<F> MethodHandler for SyncHandler<F>
where
    F: Fn(MethodCall) -> HandlerResult + Send + Sync + 'static,
{
    async fn call(&self, call: MethodCall) -> HandlerResult {
        let func = self.func.clone();
        tokio::task::spawn_blocking(move || func(call))
            .await
            .map_err(join_failure)?
    }
}

pub(crate) struct AsyncHandler<F> {
    func: F,
}

impl<F> AsyncHandler<F> {
    pub(crate) fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait::async_trait]
impl<F, Fut> MethodHandler for AsyncHandler<F>
where
    F: Fn(MethodCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn call(&self, call: MethodCall) -> HandlerResult {
        // Own task, so a panic surfaces as a JoinError.
        let future = (self.func)(call);
        spawn_on(&tokio::runtime::Handle::current(), future)
            .await
            .map_err(join_failure)?
    }
}

/// Completes one call of a completion-callback handler.
///
/// Dropping it without responding fails the call.
pub struct Responder {
    tx: oneshot::Sender<HandlerResult>,
}

impl Responder {
    pub fn respond(self, result: HandlerResult) {
        let _ = self.tx.send(result);
    }
}

pub(crate) struct ResponderHandler<F> {
    func: Arc<F>,
}

impl<F> ResponderHandler<F> {
    pub(crate) fn new(func: F) -> Self {
        Self {
            func: Arc::new(func),
        }
    }
}

#[async_trait::async_trait]
impl<F> MethodHandler for ResponderHandler<F>
where
    F: Fn(MethodCall, Responder) + Send + Sync + 'static,
{
    async fn call(&self, call: MethodCall) -> HandlerResult {
        let (tx, rx) = oneshot::channel();
        let func = self.func.clone();
        let worker = tokio::task::spawn_blocking(move || func(call, Responder { tx }));
        match rx.await {
            Ok(result) => result,
            // A panic drops the responder while unwinding.
            Err(_) => match worker.await {
                Err(e) => Err(join_failure(e)),
                Ok(()) => Err(HandlerError::new("handler dropped its responder")),
            },
        }
    }
}

struct MethodEntry {
    info: MethodInfo,
    handler: Option<Arc<dyn MethodHandler>>,
}

/// Name to handler map of one server.
pub(crate) struct DispatchTable {
    service_name: String,
    methods: RwLock<HashMap<String, MethodEntry>>,
    call_counts: Mutex<HashMap<String, u64>>,
}

impl DispatchTable {
    pub(crate) fn new(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            methods: RwLock::new(HashMap::new()),
            call_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Install a handler, replacing any previous one for the name.
    pub(crate) fn insert(&self, name: &str, handler: Arc<dyn MethodHandler>) {
        let mut methods = self.methods.write().unwrap_or_else(|e| e.into_inner());
        methods
            .entry(name.to_string())
            .and_modify(|entry| entry.handler = Some(handler.clone()))
            .or_insert_with(|| MethodEntry {
                info: MethodInfo::new(name),
                handler: Some(handler),
            });
    }

    pub(crate) fn set_info(&self, info: MethodInfo) {
        let mut methods = self.methods.write().unwrap_or_else(|e| e.into_inner());
        match methods.get_mut(&info.name) {
            Some(entry) => entry.info = info,
            None => {
                methods.insert(
                    info.name.clone(),
                    MethodEntry {
                        info,
                        handler: None,
                    },
                );
            }
        }
    }

    pub(crate) fn remove(&self, name: &str) -> bool {
        self.methods
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some()
    }

    pub(crate) fn methods(&self) -> Vec<MethodInfo> {
        let mut infos: Vec<MethodInfo> = self
            .methods
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub(crate) fn call_count(&self, name: &str) -> u64 {
        self.call_counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    fn handler(&self, name: &str) -> Option<Arc<dyn MethodHandler>> {
        self.methods
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .and_then(|entry| entry.handler.clone())
    }

    /// Run the handler for a request and build its Response body.
    pub(crate) async fn execute(&self, request: RequestBody) -> ResponseBody {
        let Some(handler) = self.handler(&request.method) else {
            debug!(
                "{}: no handler for method {}",
                self.service_name, request.method
            );
            return ResponseBody::handler_missing(&request.method);
        };

        *self
            .call_counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(request.method.clone())
            .or_insert(0) += 1;

        let call = MethodCall {
            method: request.method,
            request: request.payload,
        };
        let method = call.method.clone();
        match handler.call(call).await {
            Ok(reply) => ResponseBody::ok(reply.ret_state, reply.response),
            Err(e) => {
                warn!("{}: method {} failed: {}", self.service_name, method, e);
                ResponseBody::handler_failed(e.message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResponseStatus;

    fn request(method: &str, payload: &'static [u8]) -> RequestBody {
        RequestBody::new(method, Bytes::from_static(payload))
    }

    #[tokio::test]
    async fn test_sync_handler_echoes() {
        let table = DispatchTable::new("test");
        table.insert(
            "Echo",
            Arc::new(SyncHandler::new(|call: MethodCall| {
                Ok(MethodReply::new(call.request).with_ret_state(7))
            })),
        );

        let response = table.execute(request("Echo", b"hello")).await;
        assert_eq!(response.status, ResponseStatus::Ok);
        assert_eq!(response.ret_state, 7);
        assert_eq!(&response.payload[..], b"hello");
        assert_eq!(table.call_count("Echo"), 1);
    }

    #[tokio::test]
    async fn test_missing_method() {
        let table = DispatchTable::new("test");
        let response = table.execute(request("Nope", b"")).await;
        assert_eq!(response.status, ResponseStatus::HandlerMissing);
        assert_eq!(table.call_count("Nope"), 0);
    }

    #[tokio::test]
    async fn test_info_only_entry_is_missing_handler() {
        let table = DispatchTable::new("test");
        table.set_info(MethodInfo::new("Later").with_types("Req", "Resp"));
        assert_eq!(table.methods()[0].request_type.as_deref(), Some("Req"));
        let response = table.execute(request("Later", b"")).await;
        assert_eq!(response.status, ResponseStatus::HandlerMissing);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_panicking_handlers_fail_the_call() {
        let table = DispatchTable::new("test");
        table.insert(
            "Sync",
            Arc::new(SyncHandler::new(|_: MethodCall| -> HandlerResult {
                panic!("sync boom")
            })),
        );
        table.insert(
            "Async",
            Arc::new(AsyncHandler::new(|_: MethodCall| async {
                if true {
                    panic!("async boom");
                }
                Ok(MethodReply::default())
            })),
        );

        table.insert(
            "Responder",
            Arc::new(ResponderHandler::new(|_: MethodCall, _: Responder| {
                panic!("responder boom")
            })),
        );

        for method in ["Sync", "Async", "Responder"] {
            let response = table.execute(request(method, b"")).await;
            assert_eq!(response.status, ResponseStatus::HandlerFailed);
            assert_eq!(response.error.as_deref(), Some("handler panicked"));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_responder_from_another_thread() {
        let table = DispatchTable::new("test");
        table.insert(
            "Later",
            Arc::new(ResponderHandler::new(|call: MethodCall, responder: Responder| {
                std::thread::spawn(move || {
                    std::thread::sleep(std::time::Duration::from_millis(20));
                    responder.respond(Ok(MethodReply::new(call.request)));
                });
            })),
        );
        table.insert(
            "Dropped",
            Arc::new(ResponderHandler::new(|_: MethodCall, _: Responder| {})),
        );

        let response = table.execute(request("Later", b"x")).await;
        assert_eq!(&response.payload[..], b"x");

        let response = table.execute(request("Dropped", b"")).await;
        assert_eq!(response.status, ResponseStatus::HandlerFailed);
        assert_eq!(
            response.error.as_deref(),
            Some("handler dropped its responder")
        );
    }

    #[test]
    fn test_remove_and_list() {
        let table = DispatchTable::new("test");
        table.insert(
            "B",
            Arc::new(SyncHandler::new(|_: MethodCall| Ok(MethodReply::default()))),
        );
        table.insert(
            "A",
            Arc::new(SyncHandler::new(|_: MethodCall| Ok(MethodReply::default()))),
        );
        let names: Vec<String> = table.methods().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["A", "B"]);
        assert!(table.remove("A"));
        assert!(!table.remove("A"));
        assert_eq!(table.methods().len(), 1);
    }
}
