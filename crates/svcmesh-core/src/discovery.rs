//! Discovery collaborator interface and an in-process directory.
//!
//! Discovery tells clients which endpoints offer a service. The transport
//! only needs the two notifications of [`DiscoveryListener`]; how endpoints
//! are found is up to the [`Discovery`] implementation.

use crate::types::{EndpointId, ServiceEndpoint};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Receives endpoint changes for one service name.
pub trait DiscoveryListener: Send + Sync {
    fn on_endpoint_added(&self, service_name: &str, endpoint: &ServiceEndpoint);
    fn on_endpoint_removed(&self, service_name: &str, id: &EndpointId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub trait Discovery: Send + Sync {
    /// Subscribe to a service name. Endpoints already known are reported
    /// to the new listener before this returns.
    fn subscribe(&self, service_name: &str, listener: Arc<dyn DiscoveryListener>)
        -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId);

    /// Make an endpoint known. Announcing a known id again re-notifies.
    fn announce(&self, endpoint: ServiceEndpoint);

    fn withdraw(&self, service_name: &str, id: &EndpointId);
}

#[derive(Default)]
struct Directory {
    next_id: u64,
    endpoints: HashMap<String, BTreeMap<EndpointId, ServiceEndpoint>>,
    listeners: HashMap<SubscriptionId, (String, Arc<dyn DiscoveryListener>)>,
}

impl Directory {
    fn listeners_for(&self, service_name: &str) -> Vec<Arc<dyn DiscoveryListener>> {
        self.listeners
            .values()
            .filter(|(name, _)| name == service_name)
            .map(|(_, listener)| listener.clone())
            .collect()
    }
}

/// Discovery within a single process.
///
/// Listeners are notified after the directory lock is released, so they may
/// call back into the directory.
#[derive(Default)]
pub struct LocalDiscovery {
    directory: Mutex<Directory>,
}

impl LocalDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Directory> {
        self.directory.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Endpoints currently announced for a service.
    pub fn endpoints(&self, service_name: &str) -> Vec<ServiceEndpoint> {
        self.lock()
            .endpoints
            .get(service_name)
            .map(|eps| eps.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().listeners.len()
    }
}

impl Discovery for LocalDiscovery {
    fn subscribe(
        &self,
        service_name: &str,
        listener: Arc<dyn DiscoveryListener>,
    ) -> SubscriptionId {
        let (id, known) = {
            let mut directory = self.lock();
            directory.next_id += 1;
            let id = SubscriptionId(directory.next_id);
            directory
                .listeners
                .insert(id, (service_name.to_string(), listener.clone()));
            let known: Vec<ServiceEndpoint> = directory
                .endpoints
                .get(service_name)
                .map(|eps| eps.values().cloned().collect())
                .unwrap_or_default();
            (id, known)
        };
        debug!(
            "Discovery subscription for {} replays {} endpoints",
            service_name,
            known.len()
        );
        for endpoint in &known {
            listener.on_endpoint_added(service_name, endpoint);
        }
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.lock().listeners.remove(&id);
    }

    fn announce(&self, endpoint: ServiceEndpoint) {
        let listeners = {
            let mut directory = self.lock();
            directory
                .endpoints
                .entry(endpoint.service_name.clone())
                .or_default()
                .insert(endpoint.id.clone(), endpoint.clone());
            directory.listeners_for(&endpoint.service_name)
        };
        for listener in listeners {
            listener.on_endpoint_added(&endpoint.service_name, &endpoint);
        }
    }

    fn withdraw(&self, service_name: &str, id: &EndpointId) {
        let listeners = {
            let mut directory = self.lock();
            let removed = directory
                .endpoints
                .get_mut(service_name)
                .and_then(|eps| eps.remove(id))
                .is_some();
            if !removed {
                return;
            }
            directory.listeners_for(service_name)
        };
        for listener in listeners {
            listener.on_endpoint_removed(service_name, id);
        }
    }
}
