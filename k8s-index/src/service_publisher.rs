//! Per-service aggregator owning the `port → PortPublisher` map (spec-level
//! component "Service Publisher"). A single `parking_lot::Mutex` serializes
//! every operation against a service — subscribe/unsubscribe, service and
//! endpoints updates — so a `Service` update and a concurrent `Subscribe`
//! can never observe a torn port map.

use crate::{cluster_index::ClusterIndex, port_publisher::PortPublisher, topic::Subscription};
use ahash::AHashMap as HashMap;
use linkerd_destination_core::{DiscoverError, Port, ServiceId};
use linkerd_destination_k8s_api as k8s;
use parking_lot::Mutex;
use std::sync::Arc;

type PortKey = (Port, Option<String>);

pub struct ServicePublisher {
    service_id: ServiceId,
    cluster_index: Arc<ClusterIndex>,
    ports: Mutex<HashMap<PortKey, Arc<PortPublisher>>>,
    service: Mutex<Option<Arc<k8s::Service>>>,
    endpoints: Mutex<Option<Arc<k8s::Endpoints>>>,
}

impl ServicePublisher {
    pub fn new(service_id: ServiceId, cluster_index: Arc<ClusterIndex>) -> Self {
        Self {
            service_id,
            cluster_index,
            ports: Mutex::new(HashMap::default()),
            service: Mutex::new(None),
            endpoints: Mutex::new(None),
        }
    }

    pub fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    /// Subscribes to `(port, hostname)`, creating the backing
    /// [`PortPublisher`] lazily on first use. Fails synchronously for an
    /// `ExternalName` service — it has no pod backends to resolve.
    pub fn subscribe(
        &self,
        port: Port,
        hostname: Option<String>,
    ) -> Result<Subscription, DiscoverError> {
        if self.is_external_name() {
            return Err(DiscoverError::InvalidService {
                authority: self.service_id.to_string(),
            });
        }
        Ok(self.port_publisher(port, hostname).topic().subscribe())
    }

    /// Returns the `PortPublisher` for `(port, hostname)` without the
    /// `ExternalName` check — used by collaborators (the IP Watcher's
    /// singleton-fallback path) that already know the service is valid.
    pub fn port_publisher(&self, port: Port, hostname: Option<String>) -> Arc<PortPublisher> {
        let mut ports = self.ports.lock();
        ports
            .entry((port, hostname.clone()))
            .or_insert_with(|| {
                let publisher = Arc::new(PortPublisher::new(
                    self.service_id.clone(),
                    port,
                    hostname,
                    self.cluster_index.clone(),
                ));
                if let Some(svc) = self.service.lock().clone() {
                    publisher.update_service(Some(svc));
                }
                if let Some(eps) = self.endpoints.lock().clone() {
                    publisher.update_endpoints(Some(eps));
                }
                publisher
            })
            .clone()
    }

    pub fn update_service(&self, svc: Arc<k8s::Service>) {
        *self.service.lock() = Some(svc.clone());
        for publisher in self.ports.lock().values() {
            publisher.update_service(Some(svc.clone()));
        }
    }

    pub fn delete_service(&self) {
        *self.service.lock() = None;
        for publisher in self.ports.lock().values() {
            publisher.update_service(None);
        }
    }

    pub fn update_endpoints(&self, eps: Arc<k8s::Endpoints>) {
        *self.endpoints.lock() = Some(eps.clone());
        for publisher in self.ports.lock().values() {
            publisher.update_endpoints(Some(eps.clone()));
        }
    }

    pub fn delete_endpoints(&self) {
        *self.endpoints.lock() = None;
        for publisher in self.ports.lock().values() {
            publisher.update_endpoints(None);
        }
    }

    /// Forwarded from the Endpoints Watcher on every pod apply/delete so
    /// publishers with a previously-unresolved backend get a chance to
    /// fill it in.
    pub fn on_pod_index_changed(&self) {
        for publisher in self.ports.lock().values() {
            publisher.on_pod_index_changed();
        }
    }

    pub fn has_endpoints(&self) -> bool {
        self.endpoints.lock().is_some()
    }

    pub fn cluster_ip(&self) -> Option<std::net::IpAddr> {
        self.service
            .lock()
            .as_ref()
            .and_then(|s| s.spec.as_ref())
            .and_then(|s| s.cluster_ip.as_deref())
            .filter(|ip| !ip.is_empty() && *ip != "None")
            .and_then(|ip| ip.parse().ok())
    }

    fn is_external_name(&self) -> bool {
        self.service
            .lock()
            .as_ref()
            .and_then(|s| s.spec.as_ref())
            .and_then(|s| s.type_.as_deref())
            == Some("ExternalName")
    }
}
