//! The client handle and the shared state behind it.
//!
//! # Thread Safety
//!
//! `ServiceClient` is `Send + Sync` and every method takes `&self`. Response
//! and event sinks run on event loop threads (or inline on the caller's
//! thread when a call fails before it is sent) and never under an internal
//! lock, so a sink may call back into the client with the non-blocking API.
//! The blocking calls refuse to run on an event loop thread. Dropping the
//! client waits for sinks already running elsewhere; none start afterwards.

use super::instance::{ClientInstance, InstanceSink};
use crate::config::ClientConfig;
use crate::discovery::{Discovery, DiscoveryListener, SubscriptionId};
use crate::events::{ClientEvent, ClientEventKind, EventDispatcher, SinkGate, SinkId};
use crate::runtime::{ensure_blocking_allowed, EventLoop};
use crate::types::{CallState, EndpointId, ServiceEndpoint, ServiceResponse};
use crate::{Result, ServiceError};
use bytes::Bytes;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Callback receiving the response of one endpoint.
pub type ResponseSink = Arc<dyn Fn(&ServiceResponse) + Send + Sync>;

/// Where the response of one endpoint goes.
enum Delivery {
    /// Every outcome, timeouts included, for an aggregating call.
    Collect(InstanceSink),
    /// A user sink, gated, skipped for timeouts.
    Sink(ResponseSink),
    Discard,
}

pub(crate) struct ClientInner {
    service_name: String,
    config: ClientConfig,
    handle: Handle,
    host_filter: RwLock<Option<String>>,
    instances: Mutex<BTreeMap<EndpointId, Arc<ClientInstance>>>,
    response_sink: RwLock<Option<ResponseSink>>,
    events: EventDispatcher<ClientEvent>,
    gate: SinkGate,
    call_counts: Mutex<HashMap<String, u64>>,
    closed: AtomicBool,
}

impl ClientInner {
    pub(crate) fn service_name(&self) -> &str {
        &self.service_name
    }

    pub(crate) fn gate(&self) -> &SinkGate {
        &self.gate
    }

    /// Deliver an event to the event sinks. The caller holds the gate.
    pub(crate) fn dispatch_event(&self, event: &ClientEvent) {
        self.events.dispatch(event);
    }

    fn emit(&self, event: &ClientEvent) {
        if let Some(_guard) = self.gate.enter() {
            self.events.dispatch(event);
        }
    }

    fn instances(&self) -> MutexGuard<'_, BTreeMap<EndpointId, Arc<ClientInstance>>> {
        self.instances.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ServiceError::Closed {
                what: format!("client for {}", self.service_name),
            });
        }
        Ok(())
    }

    fn add_endpoint(self: &Arc<Self>, endpoint: ServiceEndpoint) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if endpoint.service_name != self.service_name {
            debug!(
                "{}: ignoring endpoint of service {}",
                self.service_name, endpoint.service_name
            );
            return;
        }

        let replaced = {
            let mut instances = self.instances();
            if let Some(existing) = instances.get(&endpoint.id) {
                if !existing.is_terminal() {
                    return;
                }
                debug!(
                    "{}: reconnecting to {}",
                    self.service_name, endpoint.id
                );
            }
            let instance = Arc::new(ClientInstance::connect(
                &self.handle,
                endpoint.clone(),
                self.config.clone(),
                Arc::downgrade(self),
            ));
            instances.insert(endpoint.id.clone(), instance)
        };
        drop(replaced);
    }

    fn remove_endpoint(&self, id: &EndpointId) -> bool {
        let removed = self.instances().remove(id);
        match removed {
            Some(instance) => {
                info!("{}: endpoint {} removed", self.service_name, id);
                instance.shutdown();
                true
            }
            None => false,
        }
    }

    fn host_filter(&self) -> Option<String> {
        self.host_filter
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .filter(|host| !host.is_empty())
    }

    /// Connected instances a broadcast addresses right now.
    fn addressed_instances(&self) -> Vec<Arc<ClientInstance>> {
        let snapshot: Vec<Arc<ClientInstance>> = self.instances().values().cloned().collect();
        let filter = self.host_filter();
        snapshot
            .into_iter()
            .filter(|instance| instance.is_connected())
            .filter(|instance| match &filter {
                Some(host) => &instance.endpoint_id().host_name == host,
                None => true,
            })
            .collect()
    }

    fn effective_timeout(&self, timeout: Option<Duration>) -> Option<Duration> {
        timeout.or_else(|| self.config.default_call_timeout())
    }

    /// Issue `method` on each instance. Returns how many were addressed.
    fn issue<D>(
        self: &Arc<Self>,
        instances: &[Arc<ClientInstance>],
        method: &str,
        request: Bytes,
        timeout: Option<Duration>,
        mut delivery_for: D,
    ) -> usize
    where
        D: FnMut() -> Delivery,
    {
        let timeout = self.effective_timeout(timeout);
        *self
            .call_counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(method.to_string())
            .or_insert(0) += instances.len() as u64;

        for instance in instances {
            let sink = self.instance_sink(delivery_for());
            instance.call(method, request.clone(), timeout, sink);
        }
        instances.len()
    }

    fn instance_sink(self: &Arc<Self>, delivery: Delivery) -> InstanceSink {
        let client = Arc::downgrade(self);
        Box::new(move |response: ServiceResponse| {
            let client = client.upgrade();
            let timed_out = response.state == CallState::TimedOut;
            if timed_out {
                if let Some(client) = &client {
                    client.emit(&ClientEvent::new(
                        ClientEventKind::Timeout,
                        &client.service_name,
                        response.endpoint.clone(),
                        format!("call to {} timed out", response.method),
                    ));
                }
            }
            match delivery {
                Delivery::Collect(collect) => collect(response),
                Delivery::Sink(sink) => {
                    if timed_out {
                        return;
                    }
                    if let Some(client) = &client {
                        if let Some(_guard) = client.gate.enter() {
                            sink(&response);
                        }
                    }
                }
                Delivery::Discard => {}
            }
        })
    }

    fn instance(&self, id: &EndpointId) -> Result<Arc<ClientInstance>> {
        self.instances()
            .get(id)
            .cloned()
            .ok_or_else(|| ServiceError::UnknownEndpoint(id.to_string()))
    }
}

/// Forwards discovery notifications to a client it does not keep alive.
struct DiscoveryBridge {
    client: Weak<ClientInner>,
}

impl DiscoveryListener for DiscoveryBridge {
    fn on_endpoint_added(&self, _service_name: &str, endpoint: &ServiceEndpoint) {
        if let Some(client) = self.client.upgrade() {
            client.add_endpoint(endpoint.clone());
        }
    }

    fn on_endpoint_removed(&self, _service_name: &str, id: &EndpointId) {
        if let Some(client) = self.client.upgrade() {
            client.remove_endpoint(id);
        }
    }
}

/// Client of a named service, fanning calls out to every known endpoint.
///
/// Calls address the endpoints that are connected (and match the host
/// filter) when the call is issued; each of them produces exactly one
/// [`ServiceResponse`]. Sinks are never invoked with an internal lock held,
/// so they may issue further calls. Blocking calls are refused on event loop
/// threads, sinks included.
///
/// Dropping the client resolves its outstanding calls as disconnected, fires
/// `disconnected` for live connections and then waits for sinks running on
/// other threads. No sink is invoked after the drop returns.
pub struct ServiceClient {
    inner: Arc<ClientInner>,
    subscription: Option<(Arc<dyn Discovery>, SubscriptionId)>,
    _event_loop: EventLoop,
}

impl ServiceClient {
    /// Create a client with no endpoints; feed it with
    /// [`add_endpoint`](Self::add_endpoint).
    pub fn new(event_loop: &EventLoop, service_name: &str, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let inner = Arc::new(ClientInner {
            service_name: service_name.to_string(),
            host_filter: RwLock::new(config.host_filter.clone()),
            config,
            handle: event_loop.handle().clone(),
            instances: Mutex::new(BTreeMap::new()),
            response_sink: RwLock::new(None),
            events: EventDispatcher::new(),
            gate: SinkGate::new(),
            call_counts: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        Ok(Self {
            inner,
            subscription: None,
            _event_loop: event_loop.clone(),
        })
    }

    /// Create a client that learns its endpoints from `discovery`.
    pub fn with_discovery(
        event_loop: &EventLoop,
        service_name: &str,
        config: ClientConfig,
        discovery: Arc<dyn Discovery>,
    ) -> Result<Self> {
        let mut client = Self::new(event_loop, service_name, config)?;
        let bridge = Arc::new(DiscoveryBridge {
            client: Arc::downgrade(&client.inner),
        });
        let id = discovery.subscribe(service_name, bridge);
        client.subscription = Some((discovery, id));
        Ok(client)
    }

    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    /// Start talking to an endpoint. A known endpoint with a live session is
    /// left alone; one whose session has ended is reconnected.
    pub fn add_endpoint(&self, endpoint: ServiceEndpoint) {
        self.inner.add_endpoint(endpoint);
    }

    /// Forget an endpoint. Its outstanding calls resolve as disconnected.
    pub fn remove_endpoint(&self, id: &EndpointId) -> bool {
        self.inner.remove_endpoint(id)
    }

    /// Restrict broadcasts to endpoints on one host. `None` or an empty
    /// name addresses every host.
    pub fn set_host_filter(&self, host: Option<String>) {
        *self
            .inner
            .host_filter
            .write()
            .unwrap_or_else(|e| e.into_inner()) = host;
    }

    pub fn host_filter(&self) -> Option<String> {
        self.inner.host_filter()
    }

    /// Set the sink used by [`call_async`](Self::call_async).
    pub fn add_response_sink<F>(&self, sink: F)
    where
        F: Fn(&ServiceResponse) + Send + Sync + 'static,
    {
        *self
            .inner
            .response_sink
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(sink));
    }

    pub fn remove_response_sink(&self) {
        *self
            .inner
            .response_sink
            .write()
            .unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn add_event_sink<F>(&self, sink: F) -> SinkId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.inner.events.add(sink)
    }

    pub fn remove_event_sink(&self, id: SinkId) -> bool {
        self.inner.events.remove(id)
    }

    /// Call every addressed endpoint and wait for all of them.
    ///
    /// `timeout` of `None` uses the configured default, if any.
    pub async fn call(
        &self,
        method: &str,
        request: impl Into<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<Vec<ServiceResponse>> {
        self.inner.ensure_open()?;
        let instances = self.inner.addressed_instances();
        self.collect_async(&instances, method, request.into(), timeout)
            .await
    }

    /// Blocking form of [`call`](Self::call).
    ///
    /// Fails with [`ServiceError::BlockingOnEventLoop`] on an event loop
    /// thread.
    pub fn call_blocking(
        &self,
        method: &str,
        request: impl Into<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<Vec<ServiceResponse>> {
        ensure_blocking_allowed()?;
        self.inner.ensure_open()?;
        let instances = self.inner.addressed_instances();
        Ok(self.collect_blocking(&instances, method, request.into(), timeout))
    }

    /// Call every addressed endpoint; `sink` receives each response.
    ///
    /// Returns how many endpoints were addressed. Timed-out calls are
    /// reported as a `Timeout` event instead of through `sink`.
    pub fn call_with_callback<F>(
        &self,
        method: &str,
        request: impl Into<Bytes>,
        timeout: Option<Duration>,
        sink: F,
    ) -> Result<usize>
    where
        F: Fn(&ServiceResponse) + Send + Sync + 'static,
    {
        self.inner.ensure_open()?;
        let instances = self.inner.addressed_instances();
        let sink: ResponseSink = Arc::new(sink);
        Ok(self
            .inner
            .issue(&instances, method, request.into(), timeout, || {
                Delivery::Sink(sink.clone())
            }))
    }

    /// Like [`call_with_callback`](Self::call_with_callback), delivering to
    /// the sink set with [`add_response_sink`](Self::add_response_sink).
    pub fn call_async(
        &self,
        method: &str,
        request: impl Into<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<usize> {
        self.inner.ensure_open()?;
        let sink = self
            .inner
            .response_sink
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let instances = self.inner.addressed_instances();
        Ok(self
            .inner
            .issue(&instances, method, request.into(), timeout, || match &sink {
                Some(sink) => Delivery::Sink(sink.clone()),
                None => Delivery::Discard,
            }))
    }

    /// Call a single endpoint, connected or not, ignoring the host filter.
    pub async fn call_endpoint(
        &self,
        id: &EndpointId,
        method: &str,
        request: impl Into<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<ServiceResponse> {
        self.inner.ensure_open()?;
        let instance = self.inner.instance(id)?;
        let mut responses = self
            .collect_async(&[instance], method, request.into(), timeout)
            .await?;
        responses
            .pop()
            .ok_or_else(|| ServiceError::disconnected("call was dropped without an outcome"))
    }

    /// Blocking form of [`call_endpoint`](Self::call_endpoint).
    pub fn call_endpoint_blocking(
        &self,
        id: &EndpointId,
        method: &str,
        request: impl Into<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<ServiceResponse> {
        ensure_blocking_allowed()?;
        self.inner.ensure_open()?;
        let instance = self.inner.instance(id)?;
        self.collect_blocking(&[instance], method, request.into(), timeout)
            .pop()
            .ok_or_else(|| ServiceError::disconnected("call was dropped without an outcome"))
    }

    async fn collect_async(
        &self,
        instances: &[Arc<ClientInstance>],
        method: &str,
        request: Bytes,
        timeout: Option<Duration>,
    ) -> Result<Vec<ServiceResponse>> {
        let mut receivers = Vec::with_capacity(instances.len());
        self.inner
            .issue(instances, method, request, timeout, || {
                let (tx, rx) = oneshot::channel();
                receivers.push(rx);
                Delivery::Collect(Box::new(move |response| {
                    let _ = tx.send(response);
                }))
            });
        Ok(join_all(receivers)
            .await
            .into_iter()
            .filter_map(|outcome| outcome.ok())
            .collect())
    }

    fn collect_blocking(
        &self,
        instances: &[Arc<ClientInstance>],
        method: &str,
        request: Bytes,
        timeout: Option<Duration>,
    ) -> Vec<ServiceResponse> {
        let (tx, rx) = std::sync::mpsc::channel();
        let expected = self.inner.issue(instances, method, request, timeout, || {
            let tx = tx.clone();
            Delivery::Collect(Box::new(move |response| {
                let _ = tx.send(response);
            }))
        });
        drop(tx);

        let mut responses = Vec::with_capacity(expected);
        while responses.len() < expected {
            match rx.recv() {
                Ok(response) => responses.push(response),
                Err(_) => break,
            }
        }
        responses
    }

    /// Every endpoint the client currently has an instance for.
    pub fn endpoints(&self) -> Vec<EndpointId> {
        self.inner.instances().keys().cloned().collect()
    }

    /// Whether at least one endpoint is connected.
    pub fn is_connected(&self) -> bool {
        let snapshot: Vec<Arc<ClientInstance>> =
            self.inner.instances().values().cloned().collect();
        snapshot.iter().any(|instance| instance.is_connected())
    }

    pub fn is_endpoint_connected(&self, id: &EndpointId) -> bool {
        self.inner
            .instance(id)
            .map(|instance| instance.is_connected())
            .unwrap_or(false)
    }

    /// Per-endpoint calls issued for a method.
    pub fn method_call_count(&self, method: &str) -> u64 {
        self.inner
            .call_counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(method)
            .copied()
            .unwrap_or(0)
    }
}

impl Drop for ServiceClient {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Release);
        if let Some((discovery, id)) = self.subscription.take() {
            discovery.unsubscribe(id);
        }

        let instances = std::mem::take(&mut *self.inner.instances());
        debug!(
            "{}: shutting down {} instances",
            self.inner.service_name,
            instances.len()
        );
        for instance in instances.values() {
            instance.shutdown();
        }
        drop(instances);

        self.inner.gate.close();
    }
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient")
            .field("service_name", &self.inner.service_name)
            .field("endpoints", &self.endpoints().len())
            .finish()
    }
}
