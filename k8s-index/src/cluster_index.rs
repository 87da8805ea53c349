//! Inverted indices over cluster objects.
//!
//! Maintains `svcByClusterIP`, `podByPodIP`, and `podByHostIP:hostPort`,
//! rebuilt incrementally from `kubert::index::IndexNamespacedResource`
//! callbacks the same way `k8s/index/src/node.rs` builds its
//! node-name→kubelet-IP index: a canonical by-name store per resource
//! kind, plus secondary maps keyed by the thing callers actually look up.
//!
//! `kubert`'s `delete(namespace, name)` callback carries only a key, never
//! the deleted object — this module's Rust take on the classic
//! client-go "tombstone" shape (see `DESIGN.md` for the full reasoning).
//! The by-name store here is exactly the "last-known object" a tombstone
//! would wrap: delete looks the key up there to learn which derived
//! entries to remove, and a miss — the key was never indexed, or was
//! already removed — is logged and ignored rather than treated as an
//! error.

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use linkerd_destination_core::{DiscoverError, PodId, Port, ServiceId};
use linkerd_destination_k8s_api as k8s;
use parking_lot::RwLock;
use std::{
    net::IpAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::watch;
use tracing::{instrument, warn};

#[derive(Debug)]
pub struct ClusterIndex {
    state: RwLock<State>,
    /// Bumped on every `clusterIP` add/remove/reassignment. The IP
    /// Watcher watches this to notice when an IP it has already resolved
    /// and subscribed against now names a different (or no) service —
    /// §4.4's service-identity-reassignment case. A single cluster-wide
    /// counter rather than a per-IP one: reassignment is rare enough that
    /// a handful of spurious wakeups for unrelated IPs costs nothing, and
    /// it avoids a watch channel per indexed IP.
    cluster_ip_generation: AtomicU64,
    cluster_ip_changed: watch::Sender<u64>,
}

impl Default for ClusterIndex {
    fn default() -> Self {
        let (cluster_ip_changed, _rx) = watch::channel(0);
        Self {
            state: RwLock::new(State::default()),
            cluster_ip_generation: AtomicU64::new(0),
            cluster_ip_changed,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    services_by_name: HashMap<ServiceId, ServiceEntry>,
    pods_by_name: HashMap<PodId, PodEntry>,

    svc_by_cluster_ip: HashMap<IpAddr, HashSet<ServiceId>>,
    pod_by_pod_ip: HashMap<IpAddr, HashSet<PodId>>,
    pod_by_host_port: HashMap<(IpAddr, Port), HashSet<PodId>>,
}

#[derive(Debug, Clone)]
struct ServiceEntry {
    cluster_ip: Option<IpAddr>,
}

#[derive(Debug, Clone)]
struct PodEntry {
    pod: Arc<k8s::Pod>,
    pod_ip: Option<IpAddr>,
    host_ports: Vec<(IpAddr, Port)>,
}

/// Shared, cloneable handle over a `ClusterIndex`.
pub type SharedClusterIndex = Arc<ClusterIndex>;

impl ClusterIndex {
    pub fn shared() -> SharedClusterIndex {
        Arc::new(Self::default())
    }

    /// Looks up the service, if any, whose `clusterIP` equals `ip`.
    /// `Err(Conflict)` when more than one service indexes the same IP — a
    /// pathological misconfiguration callers treat as "unresolved"
    /// unresolved rather than propagated as an error.
    #[instrument(skip(self))]
    pub fn get_service_by_cluster_ip(&self, ip: IpAddr) -> Result<Option<ServiceId>, DiscoverError> {
        resolve_unique(&self.state.read().svc_by_cluster_ip, &ip, "clusterIP")
    }

    /// Looks up the pod, if any, that declares `hostIP:hostPort`.
    #[instrument(skip(self))]
    pub fn get_pod_by_host_port(
        &self,
        ip: IpAddr,
        port: Port,
    ) -> Result<Option<Arc<k8s::Pod>>, DiscoverError> {
        let state = self.state.read();
        let id = resolve_unique(&state.pod_by_host_port, &(ip, port), "hostIP:hostPort")?;
        Ok(id.and_then(|id| state.pods_by_name.get(&id).map(|e| e.pod.clone())))
    }

    /// Looks up the (non-host-network) pod, if any, whose `podIP` equals
    /// `ip`.
    #[instrument(skip(self))]
    pub fn get_pod_by_pod_ip(&self, ip: IpAddr) -> Result<Option<Arc<k8s::Pod>>, DiscoverError> {
        let state = self.state.read();
        let id = resolve_unique(&state.pod_by_pod_ip, &ip, "podIP")?;
        Ok(id.and_then(|id| state.pods_by_name.get(&id).map(|e| e.pod.clone())))
    }

    /// Direct lookup by identity — used by the Port Publisher to resolve
    /// an endpoint's `targetRef` once the index has settled, independent
    /// of the IP-keyed secondary indices above.
    pub fn get_pod(&self, id: &PodId) -> Option<Arc<k8s::Pod>> {
        self.state.read().pods_by_name.get(id).map(|e| e.pod.clone())
    }

    /// Drops pods whose phase is `Succeeded`/`Failed` or whose deletion
    /// timestamp is set — they are indexed (so a late-arriving delete can
    /// still clean them up) but must not receive traffic.
    pub fn filter_receiving_traffic(pods: Vec<Arc<k8s::Pod>>) -> Vec<Arc<k8s::Pod>> {
        pods.into_iter().filter(|pod| is_receiving_traffic(pod)).collect()
    }

    pub(crate) fn service_count(&self, namespace: &str) -> usize {
        self.state
            .read()
            .services_by_name
            .keys()
            .filter(|id| id.namespace == namespace)
            .count()
    }

    pub(crate) fn pod_count(&self, namespace: &str) -> usize {
        self.state
            .read()
            .pods_by_name
            .keys()
            .filter(|id| id.namespace == namespace)
            .count()
    }
}

fn is_receiving_traffic(pod: &k8s::Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    !matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

fn resolve_unique<K, V>(
    index: &HashMap<K, HashSet<V>>,
    key: &K,
    kind: &'static str,
) -> Result<Option<V>, DiscoverError>
where
    K: std::hash::Hash + Eq + std::fmt::Debug,
    V: Clone + std::fmt::Debug,
{
    match index.get(key) {
        None => Ok(None),
        Some(set) if set.len() == 1 => Ok(set.iter().next().cloned()),
        Some(set) => {
            warn!(?key, ?set, kind, "conflicting index entries");
            Err(DiscoverError::Conflict {
                kind,
                key: format!("{key:?}"),
            })
        }
    }
}

impl ClusterIndex {
    /// Inherent, shared-reference form of [`kubert::index::IndexNamespacedResource::apply`]
    /// for services. The trait requires `&mut self`, which an `Arc<ClusterIndex>` shared
    /// between the informer's index slot and the Endpoints Watcher cannot offer — the
    /// Endpoints Watcher calls this directly instead, since its informer callbacks route
    /// the same Service/Pod events to both collaborators.
    #[instrument(skip_all, fields(name = svc.metadata.name.as_deref().unwrap_or("")))]
    pub fn apply_service(&self, svc: k8s::Service) {
        let ns = match svc.metadata.namespace.clone() {
            Some(ns) => ns,
            None => return,
        };
        let name = svc.metadata.name.clone().unwrap_or_default();
        let id = ServiceId::new(ns, name);

        let cluster_ip = svc
            .spec
            .as_ref()
            .and_then(|s| s.cluster_ip.as_deref())
            .filter(|ip| !ip.is_empty() && *ip != "None")
            .and_then(|ip| ip.parse::<IpAddr>().ok());

        let mut state = self.state.write();
        let mut reassigned = false;
        if let Some(prior) = state.services_by_name.get(&id).cloned() {
            if prior.cluster_ip != cluster_ip {
                unindex_cluster_ip(&mut state, &id, prior.cluster_ip);
                reassigned = true;
            }
        }
        if let Some(ip) = cluster_ip {
            state.svc_by_cluster_ip.entry(ip).or_default().insert(id.clone());
        }
        state.services_by_name.insert(id, ServiceEntry { cluster_ip });
        drop(state);
        if reassigned {
            self.bump_cluster_ip_generation();
        }
    }

    #[instrument(skip(self))]
    pub fn delete_service(&self, namespace: String, name: String) {
        let id = ServiceId::new(namespace, name);
        let mut state = self.state.write();
        match state.services_by_name.remove(&id) {
            Some(entry) => {
                unindex_cluster_ip(&mut state, &id, entry.cluster_ip);
                drop(state);
                self.bump_cluster_ip_generation();
            }
            None => warn!(%id, "deleting unknown service, ignoring"),
        }
    }

    /// A `watch` receiver that fires whenever a `clusterIP` is assigned
    /// to, reassigned away from, or removed from some service. The IP
    /// Watcher polls this to drive §4.4's subscriber-migration path; it
    /// is cluster-wide rather than per-IP; see the field doc on
    /// [`ClusterIndex::cluster_ip_generation`].
    pub fn watch_cluster_ip_changes(&self) -> watch::Receiver<u64> {
        self.cluster_ip_changed.subscribe()
    }

    fn bump_cluster_ip_generation(&self) {
        let next = self.cluster_ip_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.cluster_ip_changed.send(next);
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Service> for ClusterIndex {
    fn apply(&mut self, svc: k8s::Service) {
        self.apply_service(svc)
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_service(namespace, name)
    }
}

fn unindex_cluster_ip(state: &mut State, id: &ServiceId, ip: Option<IpAddr>) {
    if let Some(ip) = ip {
        if let Some(set) = state.svc_by_cluster_ip.get_mut(&ip) {
            set.remove(id);
            if set.is_empty() {
                state.svc_by_cluster_ip.remove(&ip);
            }
        }
    }
}

impl ClusterIndex {
    #[instrument(skip_all, fields(name = pod.metadata.name.as_deref().unwrap_or("")))]
    pub fn apply_pod(&self, pod: k8s::Pod) {
        let ns = match pod.metadata.namespace.clone() {
            Some(ns) => ns,
            None => return,
        };
        let name = pod.metadata.name.clone().unwrap_or_default();
        let id = PodId::new(ns, name);

        let host_network = pod
            .spec
            .as_ref()
            .and_then(|s| s.host_network)
            .unwrap_or(false);
        let pod_ip = if host_network {
            None
        } else {
            pod.status
                .as_ref()
                .and_then(|s| s.pod_ip.as_deref())
                .and_then(|ip| ip.parse::<IpAddr>().ok())
        };
        let host_ports = collect_host_ports(&pod);

        let mut state = self.state.write();
        if let Some(prior) = state.pods_by_name.get(&id).cloned() {
            unindex_pod(&mut state, &id, &prior);
        }
        if let Some(ip) = pod_ip {
            state.pod_by_pod_ip.entry(ip).or_default().insert(id.clone());
        }
        for key in &host_ports {
            state.pod_by_host_port.entry(*key).or_default().insert(id.clone());
        }
        state.pods_by_name.insert(
            id,
            PodEntry {
                pod: Arc::new(pod),
                pod_ip,
                host_ports,
            },
        );
    }

    #[instrument(skip(self))]
    pub fn delete_pod(&self, namespace: String, name: String) {
        let id = PodId::new(namespace, name);
        let mut state = self.state.write();
        match state.pods_by_name.remove(&id) {
            Some(entry) => unindex_pod(&mut state, &id, &entry),
            None => warn!(%id, "deleting unknown pod, ignoring"),
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Pod> for ClusterIndex {
    fn apply(&mut self, pod: k8s::Pod) {
        self.apply_pod(pod)
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_pod(namespace, name)
    }
}

fn unindex_pod(state: &mut State, id: &PodId, entry: &PodEntry) {
    if let Some(ip) = entry.pod_ip {
        if let Some(set) = state.pod_by_pod_ip.get_mut(&ip) {
            set.remove(id);
            if set.is_empty() {
                state.pod_by_pod_ip.remove(&ip);
            }
        }
    }
    for key in &entry.host_ports {
        if let Some(set) = state.pod_by_host_port.get_mut(key) {
            set.remove(id);
            if set.is_empty() {
                state.pod_by_host_port.remove(key);
            }
        }
    }
}

/// Collects `hostIP:hostPort` keys from every container port declaration
/// that sets a `hostPort`, across both `containers` and `initContainers`
/// (sidecars included).
fn collect_host_ports(pod: &k8s::Pod) -> Vec<(IpAddr, Port)> {
    let Some(spec) = pod.spec.as_ref() else {
        return Vec::new();
    };
    spec.containers
        .iter()
        .chain(spec.init_containers.iter().flatten())
        .filter_map(|c| c.ports.as_ref())
        .flatten()
        .filter_map(|p| {
            let host_port = p.host_port?;
            let host_ip = p.host_ip.as_deref().filter(|ip| !ip.is_empty())?;
            let ip: IpAddr = host_ip.parse().ok()?;
            Some((ip, host_port as Port))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubert::index::IndexNamespacedResource;
    use linkerd_destination_k8s_api::{ObjectMeta, PodSpec, PodStatus, ServiceSpec};

    fn pod(ns: &str, name: &str, ip: &str, host_network: bool) -> k8s::Pod {
        k8s::Pod {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                host_network: Some(host_network),
                ..Default::default()
            }),
            status: Some(PodStatus {
                pod_ip: Some(ip.to_string()),
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
        }
    }

    fn service(ns: &str, name: &str, cluster_ip: Option<&str>) -> k8s::Service {
        k8s::Service {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: cluster_ip.map(String::from),
                ..Default::default()
            }),
            status: None,
        }
    }

    #[test]
    fn resolves_service_by_cluster_ip() {
        let mut idx = ClusterIndex::default();
        IndexNamespacedResource::apply(&mut idx, service("ns", "name1", Some("192.168.210.92")));
        let found = idx
            .get_service_by_cluster_ip("192.168.210.92".parse().unwrap())
            .unwrap();
        assert_eq!(found, Some(ServiceId::new("ns", "name1")));
    }

    #[test]
    fn detects_cluster_ip_conflict() {
        let mut idx = ClusterIndex::default();
        IndexNamespacedResource::apply(&mut idx, service("ns", "a", Some("192.168.210.92")));
        IndexNamespacedResource::apply(&mut idx, service("ns", "b", Some("192.168.210.92")));
        let err = idx
            .get_service_by_cluster_ip("192.168.210.92".parse().unwrap())
            .unwrap_err();
        assert!(matches!(err, DiscoverError::Conflict { kind: "clusterIP", .. }));
    }

    #[test]
    fn delete_unindexes_cluster_ip() {
        let mut idx = ClusterIndex::default();
        IndexNamespacedResource::apply(&mut idx, service("ns", "name1", Some("192.168.210.92")));
        IndexNamespacedResource::delete(&mut idx, "ns".into(), "name1".into());
        assert_eq!(
            idx.get_service_by_cluster_ip("192.168.210.92".parse().unwrap())
                .unwrap(),
            None
        );
    }

    #[test]
    fn delete_of_unknown_service_is_ignored_not_panicking() {
        let mut idx = ClusterIndex::default();
        IndexNamespacedResource::delete(&mut idx, "ns".into(), "ghost".into());
    }

    #[test]
    fn host_network_pod_excluded_from_pod_ip_index() {
        let mut idx = ClusterIndex::default();
        IndexNamespacedResource::apply(&mut idx, pod("ns", "p", "172.17.0.12", true));
        assert_eq!(idx.get_pod_by_pod_ip("172.17.0.12".parse().unwrap()).unwrap(), None);
    }

    #[test]
    fn non_host_network_pod_indexed_by_pod_ip() {
        let mut idx = ClusterIndex::default();
        IndexNamespacedResource::apply(&mut idx, pod("ns", "p", "172.17.0.12", false));
        let found = idx.get_pod_by_pod_ip("172.17.0.12".parse().unwrap()).unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn filters_succeeded_and_failed_pods() {
        let mut running = pod("ns", "running", "10.0.0.1", false);
        let mut succeeded = pod("ns", "done", "10.0.0.2", false);
        succeeded.status.as_mut().unwrap().phase = Some("Succeeded".to_string());
        running.status.as_mut().unwrap().phase = Some("Running".to_string());

        let kept = ClusterIndex::filter_receiving_traffic(vec![
            Arc::new(running.clone()),
            Arc::new(succeeded),
        ]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].metadata.name.as_deref(), Some("running"));
    }
}
