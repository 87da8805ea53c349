//! Resolves a bare `ip:port` the same way the Endpoints Watcher resolves a
//! `(service, port)` pair, for callers that only have an address and not a
//! service name (the gRPC `Get` path when the proxy already holds a
//! resolved cluster IP or pod IP from its own routing layer).
//!
//! Four cases, tried in order:
//! 1. `ip` is a service's `clusterIP` — delegate to the Endpoints Watcher;
//!    this is the only branch with a live, evolving backend set, so it is
//!    the only one that returns a real [`Subscription`].
//! 2. `ip:port` matches an indexed `hostIP:hostPort` — a fixed singleton
//!    naming that pod.
//! 3. `ip` matches an indexed pod IP directly — a fixed singleton naming
//!    that pod, with the caller's requested port substituted for whatever
//!    port the pod's own spec declares (the caller dialed a specific port
//!    on the pod's IP; the Cluster Index only proves pod identity, not
//!    which of the pod's ports was meant).
//! 4. Nothing indexed recognizes `ip` — an opaque pass-through singleton,
//!    unresolved but not an error: plenty of meshed traffic targets IPs
//!    the cluster was never going to index (off-cluster endpoints, for
//!    instance).

use crate::{
    adapter::diff_and_emit, cluster_index::ClusterIndex,
    endpoints_watcher::{EndpointsWatcher, SharedEndpointsWatcher}, owner,
    topic::{Subscription, TopicState},
};
use linkerd_destination_core::{Address, AddressSet, DiscoverError, Listener, Port, ServiceId};
use linkerd_destination_k8s_api as k8s;
use std::{net::IpAddr, sync::Arc};
use tracing::instrument;

/// The result of [`IpWatcher::subscribe`]. Only the `clusterIP` case has a
/// backend set that can change after the fact; the other three resolve to
/// a single fixed [`AddressSet`] for the lifetime of the subscription.
pub enum IpResolution {
    Service(Subscription),
    Static(AddressSet),
}

pub struct IpWatcher {
    cluster_index: Arc<ClusterIndex>,
    endpoints_watcher: SharedEndpointsWatcher,
}

impl IpWatcher {
    pub fn new(cluster_index: Arc<ClusterIndex>, endpoints_watcher: SharedEndpointsWatcher) -> Self {
        Self {
            cluster_index,
            endpoints_watcher,
        }
    }

    pub fn shared(cluster_index: Arc<ClusterIndex>, endpoints_watcher: SharedEndpointsWatcher) -> Arc<Self> {
        Arc::new(Self::new(cluster_index, endpoints_watcher))
    }

    pub fn subscribe(&self, ip: IpAddr, port: Port) -> Result<IpResolution, DiscoverError> {
        if let Some(service_id) = self.cluster_index.get_service_by_cluster_ip(ip)? {
            let sub = self.endpoints_watcher.subscribe(service_id, port, None)?;
            return Ok(IpResolution::Service(sub));
        }

        if let Some(pod) = self.cluster_index.get_pod_by_host_port(ip, port)? {
            return Ok(IpResolution::Static(singleton_for_pod(&pod, &ip.to_string(), port)));
        }

        if let Some(pod) = self.cluster_index.get_pod_by_pod_ip(ip)? {
            return Ok(IpResolution::Static(singleton_for_pod(&pod, &ip.to_string(), port)));
        }

        Ok(IpResolution::Static(AddressSet::singleton(Address::unresolved(
            ip.to_string(),
            port,
        ))))
    }

    /// The push-style counterpart to [`IpWatcher::subscribe`]: drives
    /// `listener` for as long as the returned task runs, resolving `ip`
    /// exactly as `subscribe` does but additionally handling §4.4's
    /// service-identity-reassignment case — a `clusterIP` that used to
    /// resolve to one service later resolving to a different one (or to
    /// none at all).
    ///
    /// On every `ClusterIndex` cluster-IP-identity change (a cheap,
    /// cluster-wide signal; see
    /// [`ClusterIndex::watch_cluster_ip_changes`]) the current resolution
    /// is torn down — `listener.no_endpoints(true)` is sent first to
    /// clear the listener's prior view, exactly as §4.4 prescribes — and
    /// `ip` is re-resolved from scratch. Whether a publication racing
    /// with this teardown can be observed in between is the Open
    /// Question §9 leaves unresolved; this implementation does not pin
    /// it down either.
    #[instrument(skip(self, listener), fields(%ip, %port))]
    pub fn subscribe_listener(
        self: &Arc<Self>,
        ip: IpAddr,
        port: Port,
        mut listener: Box<dyn Listener>,
    ) -> tokio::task::JoinHandle<()> {
        let watcher = self.clone();
        tokio::spawn(async move {
            let mut generation = watcher.cluster_index.watch_cluster_ip_changes();

            loop {
                let resolution = match watcher.subscribe(ip, port) {
                    Ok(r) => r,
                    Err(_) => {
                        listener.no_endpoints(false).await;
                        return;
                    }
                };

                match resolution {
                    IpResolution::Static(set) => {
                        listener.add(set).await;
                        if generation.changed().await.is_err() {
                            return;
                        }
                        listener.no_endpoints(true).await;
                    }
                    IpResolution::Service(mut sub) => {
                        let mut prev: Option<Arc<AddressSet>> = None;
                        loop {
                            match sub.state() {
                                TopicState::Snapshot(snapshot) => {
                                    diff_and_emit(&mut *listener, prev.as_deref(), &snapshot.set)
                                        .await;
                                    prev = Some(snapshot.set);
                                }
                                TopicState::NoEndpoints { service_exists } => {
                                    prev = None;
                                    listener.no_endpoints(service_exists).await;
                                }
                                TopicState::Unknown => {}
                            }

                            tokio::select! {
                                changed = sub.changed() => {
                                    if !changed {
                                        return;
                                    }
                                }
                                result = generation.changed() => {
                                    if result.is_err() {
                                        return;
                                    }
                                    break;
                                }
                            }
                        }
                        listener.no_endpoints(true).await;
                    }
                }
            }
        })
    }

    /// The `clusterIP` a given address currently resolves to, if any —
    /// used by callers that need identity rather than a live subscription.
    pub fn get_svc_id(&self, ip: IpAddr) -> Result<Option<ServiceId>, DiscoverError> {
        self.cluster_index.get_service_by_cluster_ip(ip)
    }

    /// The pod a given `ip:port` names, trying `hostIP:hostPort` before a
    /// direct pod-IP match.
    pub fn get_pod(&self, ip: IpAddr, port: Port) -> Result<Option<Arc<k8s::Pod>>, DiscoverError> {
        if let Some(pod) = self.cluster_index.get_pod_by_host_port(ip, port)? {
            return Ok(Some(pod));
        }
        self.cluster_index.get_pod_by_pod_ip(ip)
    }
}

fn singleton_for_pod(pod: &k8s::Pod, ip: &str, port: Port) -> AddressSet {
    use kube::ResourceExt;

    let (owner_kind, owner_name) = owner::get_owner_kind_and_name(pod, false);
    let pod_id = linkerd_destination_core::PodId::new(
        pod.namespace().unwrap_or_default(),
        pod.name_any(),
    );
    let addr = Address {
        ip: ip.to_string(),
        port,
        pod: Some(pod_id),
        owner_kind,
        owner_name,
    };
    AddressSet::singleton(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkerd_destination_k8s_api::{ObjectMeta, PodSpec, PodStatus};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        added: Vec<AddressSet>,
        removed: Vec<AddressSet>,
        no_endpoints: Vec<bool>,
    }

    struct RecordingListener(Arc<Mutex<Recording>>);

    #[async_trait::async_trait]
    impl Listener for RecordingListener {
        async fn add(&mut self, addrs: AddressSet) {
            self.0.lock().unwrap().added.push(addrs);
        }
        async fn remove(&mut self, addrs: AddressSet) {
            self.0.lock().unwrap().removed.push(addrs);
        }
        async fn no_endpoints(&mut self, service_exists: bool) {
            self.0.lock().unwrap().no_endpoints.push(service_exists);
        }
    }

    fn pod(ns: &str, name: &str, ip: &str) -> k8s::Pod {
        k8s::Pod {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec::default()),
            status: Some(PodStatus {
                pod_ip: Some(ip.to_string()),
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn unindexed_ip_resolves_to_opaque_singleton() {
        let cluster_index = ClusterIndex::shared();
        let endpoints_watcher = EndpointsWatcher::shared(cluster_index.clone());
        let watcher = IpWatcher::new(cluster_index, endpoints_watcher);

        let resolution = watcher
            .subscribe("203.0.113.9".parse().unwrap(), 443)
            .expect("resolves");
        match resolution {
            IpResolution::Static(set) => {
                assert_eq!(set.len(), 1);
                let (id, addr) = set.addresses().next().unwrap();
                assert!(id.is_empty());
                assert_eq!(addr.ip, "203.0.113.9");
            }
            IpResolution::Service(_) => panic!("expected a static resolution"),
        }
    }

    #[test]
    fn pod_ip_resolves_to_named_singleton_with_requested_port() {
        let cluster_index = ClusterIndex::shared();
        cluster_index.apply_pod(pod("ns", "p1", "10.1.2.3"));
        let endpoints_watcher = EndpointsWatcher::shared(cluster_index.clone());
        let watcher = IpWatcher::new(cluster_index, endpoints_watcher);

        let resolution = watcher
            .subscribe("10.1.2.3".parse().unwrap(), 9090)
            .expect("resolves");
        match resolution {
            IpResolution::Static(set) => {
                let (_, addr) = set.addresses().next().unwrap();
                assert_eq!(addr.port, 9090);
                assert_eq!(addr.owner_name, "p1");
            }
            IpResolution::Service(_) => panic!("expected a static resolution"),
        }
    }

    #[test]
    fn cluster_ip_delegates_to_endpoints_watcher() {
        use linkerd_destination_k8s_api::ServiceSpec;

        let cluster_index = ClusterIndex::shared();
        let endpoints_watcher = EndpointsWatcher::shared(cluster_index.clone());
        let watcher = IpWatcher::new(cluster_index.clone(), endpoints_watcher);
        cluster_index.apply_service(k8s::Service {
            metadata: ObjectMeta {
                namespace: Some("ns".to_string()),
                name: Some("name1".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("192.168.210.92".to_string()),
                ..Default::default()
            }),
            status: None,
        });
        let resolution = watcher
            .subscribe("192.168.210.92".parse().unwrap(), 80)
            .expect("resolves");
        assert!(matches!(resolution, IpResolution::Service(_)));
    }

    #[tokio::test]
    async fn tombstoned_service_delete_clears_then_resolves_singleton() {
        use linkerd_destination_k8s_api::ServiceSpec;

        let cluster_index = ClusterIndex::shared();
        let endpoints_watcher = EndpointsWatcher::shared(cluster_index.clone());
        let watcher = IpWatcher::shared(cluster_index.clone(), endpoints_watcher);

        let ip: IpAddr = "192.168.210.92".parse().unwrap();
        cluster_index.apply_service(k8s::Service {
            metadata: ObjectMeta {
                namespace: Some("ns".to_string()),
                name: Some("name1".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some(ip.to_string()),
                ..Default::default()
            }),
            status: None,
        });

        let recording = Arc::new(Mutex::new(Recording::default()));
        let listener = Box::new(RecordingListener(recording.clone()));
        let task = watcher.subscribe_listener(ip, 80, listener);

        // Nothing has been published on the service's own topic yet
        // (only the Cluster Index, not the Service Publisher, has been
        // told about the service directly in this test) — the listener
        // observes nothing until the identity change below.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(recording.lock().unwrap().no_endpoints.is_empty());

        // A tombstoned delete: the service is gone from the index, only
        // the key survives. `ClusterIndex::delete_service` already
        // handles the "last-known object" reconstruction (see
        // `cluster_index.rs`); from this caller's perspective it is
        // indistinguishable from a plain delete.
        cluster_index.delete_service("ns".to_string(), "name1".to_string());

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        task.abort();

        let recorded = recording.lock().unwrap();
        assert_eq!(recorded.no_endpoints, vec![true]);
        assert_eq!(recorded.added.len(), 1);
        let (id, addr) = recorded.added[0].addresses().next().unwrap();
        assert!(id.is_empty());
        assert_eq!(addr.ip, ip.to_string());
    }
}
