//! Top-level façade over the per-service publishers.
//!
//! Holds the `ServiceId → ServicePublisher` map and is the single type
//! `kubert::Runtime` registers against the `Service`, `Endpoints`, and `Pod`
//! watches — one informer callback surface routes each event to the
//! Cluster Index and/or the relevant Service Publisher. `kube-system` is
//! filtered at ingress: nothing in that namespace is ever indexed or
//! published, since nothing meshed ever resolves a backend there.

use crate::{
    cluster_index::ClusterIndex, metrics::SizedIndex, service_publisher::ServicePublisher,
    topic::Subscription,
};
use ahash::AHashMap as HashMap;
use kubert::index::IndexNamespacedResource;
use linkerd_destination_core::{DiscoverError, Port, ServiceId};
use linkerd_destination_k8s_api as k8s;
use parking_lot::RwLock;
use std::sync::Arc;

const KUBE_SYSTEM: &str = "kube-system";

pub struct EndpointsWatcher {
    cluster_index: Arc<ClusterIndex>,
    services: RwLock<HashMap<ServiceId, Arc<ServicePublisher>>>,
}

/// A cheaply cloneable handle onto a single [`EndpointsWatcher`], the form
/// every caller actually holds: `kubert::index::namespaced` needs `&mut`
/// access per dispatched event (mirroring `policy-controller`'s
/// `SharedIndex = Arc<RwLock<Index>>`), while the gRPC and IP-watcher
/// query paths only ever need a read lock around the watcher's own
/// already-synchronized methods.
#[derive(Clone)]
pub struct SharedEndpointsWatcher(Arc<RwLock<EndpointsWatcher>>);

impl SharedEndpointsWatcher {
    pub fn cluster_index(&self) -> Arc<ClusterIndex> {
        self.0.read().cluster_index.clone()
    }

    pub fn subscribe(
        &self,
        service_id: ServiceId,
        port: Port,
        hostname: Option<String>,
    ) -> Result<Subscription, DiscoverError> {
        self.0.read().subscribe(service_id, port, hostname)
    }

    pub fn lookup(&self, service_id: &ServiceId) -> Option<Arc<ServicePublisher>> {
        self.0.read().lookup(service_id)
    }
}

impl<R> IndexNamespacedResource<R> for SharedEndpointsWatcher
where
    EndpointsWatcher: IndexNamespacedResource<R>,
{
    fn apply(&mut self, resource: R) {
        self.0.write().apply(resource);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.0.write().delete(namespace, name);
    }
}

impl<R> SizedIndex<R> for SharedEndpointsWatcher
where
    EndpointsWatcher: SizedIndex<R>,
{
    fn size(&self, namespace: &str) -> usize {
        self.0.read().size(namespace)
    }
}

impl EndpointsWatcher {
    pub fn new(cluster_index: Arc<ClusterIndex>) -> Self {
        Self {
            cluster_index,
            services: RwLock::new(HashMap::default()),
        }
    }

    pub fn shared(cluster_index: Arc<ClusterIndex>) -> SharedEndpointsWatcher {
        SharedEndpointsWatcher(Arc::new(RwLock::new(Self::new(cluster_index))))
    }

    pub fn cluster_index(&self) -> &Arc<ClusterIndex> {
        &self.cluster_index
    }

    /// Subscribes to `(service, port[, hostname])`, creating the Service
    /// Publisher lazily if this is the first subscriber for that service.
    pub fn subscribe(
        &self,
        service_id: ServiceId,
        port: Port,
        hostname: Option<String>,
    ) -> Result<Subscription, DiscoverError> {
        self.service_publisher(service_id).subscribe(port, hostname)
    }

    pub fn lookup(&self, service_id: &ServiceId) -> Option<Arc<ServicePublisher>> {
        self.services.read().get(service_id).cloned()
    }

    fn service_publisher(&self, service_id: ServiceId) -> Arc<ServicePublisher> {
        self.services
            .write()
            .entry(service_id.clone())
            .or_insert_with(|| Arc::new(ServicePublisher::new(service_id, self.cluster_index.clone())))
            .clone()
    }

    fn on_pod_index_changed(&self) {
        for publisher in self.services.read().values() {
            publisher.on_pod_index_changed();
        }
    }
}

impl IndexNamespacedResource<k8s::Service> for EndpointsWatcher {
    fn apply(&mut self, svc: k8s::Service) {
        let Some(ns) = svc.metadata.namespace.clone() else {
            return;
        };
        if ns == KUBE_SYSTEM {
            return;
        }
        let name = svc.metadata.name.clone().unwrap_or_default();
        self.cluster_index.apply_service(svc.clone());
        self.service_publisher(ServiceId::new(ns, name))
            .update_service(Arc::new(svc));
    }

    fn delete(&mut self, namespace: String, name: String) {
        if namespace == KUBE_SYSTEM {
            return;
        }
        self.cluster_index.delete_service(namespace.clone(), name.clone());
        if let Some(publisher) = self.lookup(&ServiceId::new(namespace, name)) {
            publisher.delete_service();
        }
    }
}

impl IndexNamespacedResource<k8s::Endpoints> for EndpointsWatcher {
    fn apply(&mut self, eps: k8s::Endpoints) {
        let Some(ns) = eps.metadata.namespace.clone() else {
            return;
        };
        if ns == KUBE_SYSTEM {
            return;
        }
        let name = eps.metadata.name.clone().unwrap_or_default();
        self.service_publisher(ServiceId::new(ns, name))
            .update_endpoints(Arc::new(eps));
    }

    fn delete(&mut self, namespace: String, name: String) {
        if namespace == KUBE_SYSTEM {
            return;
        }
        if let Some(publisher) = self.lookup(&ServiceId::new(namespace, name)) {
            publisher.delete_endpoints();
        }
    }
}

impl IndexNamespacedResource<k8s::Pod> for EndpointsWatcher {
    fn apply(&mut self, pod: k8s::Pod) {
        if pod.metadata.namespace.as_deref() == Some(KUBE_SYSTEM) {
            return;
        }
        self.cluster_index.apply_pod(pod);
        self.on_pod_index_changed();
    }

    fn delete(&mut self, namespace: String, name: String) {
        if namespace == KUBE_SYSTEM {
            return;
        }
        self.cluster_index.delete_pod(namespace, name);
        self.on_pod_index_changed();
    }
}

impl SizedIndex<k8s::Service> for EndpointsWatcher {
    fn size(&self, namespace: &str) -> usize {
        self.cluster_index.service_count(namespace)
    }
}

impl SizedIndex<k8s::Pod> for EndpointsWatcher {
    fn size(&self, namespace: &str) -> usize {
        self.cluster_index.pod_count(namespace)
    }
}

impl SizedIndex<k8s::Endpoints> for EndpointsWatcher {
    fn size(&self, namespace: &str) -> usize {
        self.services
            .read()
            .values()
            .filter(|p| p.service_id().namespace == namespace && p.has_endpoints())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkerd_destination_k8s_api::ObjectMeta;

    fn service(ns: &str, name: &str) -> k8s::Service {
        k8s::Service {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: None,
            status: None,
        }
    }

    #[test]
    fn kube_system_services_are_never_indexed() {
        let mut watcher = EndpointsWatcher::new(ClusterIndex::shared());
        IndexNamespacedResource::apply(&mut watcher, service("kube-system", "kube-dns"));
        assert!(watcher
            .lookup(&ServiceId::new("kube-system", "kube-dns"))
            .is_none());
    }

    #[test]
    fn applying_a_service_creates_its_publisher() {
        let mut watcher = EndpointsWatcher::new(ClusterIndex::shared());
        IndexNamespacedResource::apply(&mut watcher, service("ns", "name1"));
        assert!(watcher.lookup(&ServiceId::new("ns", "name1")).is_some());
    }

    #[test]
    fn deleting_unknown_service_does_not_panic() {
        let mut watcher = EndpointsWatcher::new(ClusterIndex::shared());
        IndexNamespacedResource::delete(&mut watcher, "ns".into(), "ghost".into());
    }
}
