//! One publisher per `(ServiceID, port[, hostname])`.
//!
//! Translates `Service`/`Endpoints` state into `AddressSet` snapshots on
//! its owned [`EndpointTopic`]. Follows the same shape as
//! `outbound/index.rs::ServiceRoutes` elsewhere in this workspace: state the publisher
//! needs between updates sits behind one `parking_lot::Mutex`, and every
//! external event — a service update, an endpoints update, or a pod
//! event that might resolve a previously-unindexed backend — re-enters
//! through the same `recompute` path rather than patching the derived
//! set incrementally: always recomputing from current indexed state
//! under the publisher's lock is the only way to avoid missing a race
//! between the endpoints watcher and the pod watcher.

use crate::{cluster_index::ClusterIndex, owner, topic::EndpointTopic};
use linkerd_destination_core::{Address, AddressSet, PodId, Port, ServiceId};
use linkerd_destination_k8s_api as k8s;
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
};
use tracing::instrument;

pub struct PortPublisher {
    service_id: ServiceId,
    port: Port,
    hostname: Option<String>,
    cluster_index: Arc<ClusterIndex>,
    topic: EndpointTopic,
    state: Mutex<State>,
    /// Set whenever the last computed set dropped at least one endpoint
    /// because its backing pod wasn't indexed yet — lets a pod-watch
    /// event decide cheaply whether this publisher is worth recomputing
    /// (the pod/endpoints-watcher race described above) without rebuilding every
    /// live publisher on every pod event.
    has_unresolved: AtomicBool,
}

#[derive(Default)]
struct State {
    service: Option<Arc<k8s::Service>>,
    endpoints: Option<Arc<k8s::Endpoints>>,
}

impl PortPublisher {
    pub fn new(
        service_id: ServiceId,
        port: Port,
        hostname: Option<String>,
        cluster_index: Arc<ClusterIndex>,
    ) -> Self {
        Self {
            service_id,
            port,
            hostname,
            cluster_index,
            topic: EndpointTopic::new(),
            state: Mutex::new(State::default()),
            has_unresolved: AtomicBool::new(false),
        }
    }

    pub fn topic(&self) -> &EndpointTopic {
        &self.topic
    }

    pub fn update_service(&self, svc: Option<Arc<k8s::Service>>) {
        self.state.lock().service = svc;
        self.recompute();
    }

    pub fn update_endpoints(&self, eps: Option<Arc<k8s::Endpoints>>) {
        self.state.lock().endpoints = eps;
        self.recompute();
    }

    /// Called after any pod apply/delete; cheap no-op unless the last
    /// computed set actually had a gap a newly-indexed pod might fill.
    pub fn on_pod_index_changed(&self) {
        if self.has_unresolved.load(Ordering::Relaxed) {
            self.recompute();
        }
    }

    #[instrument(skip(self), fields(service = %self.service_id, port = self.port))]
    fn recompute(&self) {
        let state = self.state.lock();
        match (&state.service, &state.endpoints) {
            // Neither known: either genuinely unprimed (no publish,
            // topic stays `unknown`) or both just got torn down, which
            // is itself the real "no-endpoints(false)" transition.
            (None, None) => self.topic.publish_no_endpoints(false),

            // Endpoints arrived before the service did. We favor
            // buffering this until the service Add arrives rather than
            // publishing a transient `no-endpoints(false)` — leave the
            // topic exactly as it was.
            (None, Some(_)) => {}

            (Some(_), None) => self.topic.publish_no_endpoints(true),

            (Some(svc), Some(eps)) => {
                let (set, unresolved) = self.resolve(svc, eps);
                self.has_unresolved.store(unresolved, Ordering::Relaxed);
                self.topic.publish_snapshot(set);
            }
        }
    }

    /// Builds the `AddressSet` for the current `(service, endpoints)`
    /// pair. Returns whether any endpoint was dropped for lack of an
    /// indexed backing pod, so the caller can decide whether future pod
    /// events are worth recomputing for.
    fn resolve(&self, svc: &k8s::Service, eps: &k8s::Endpoints) -> (AddressSet, bool) {
        use kube::ResourceExt;

        let port_name = svc
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_ref())
            .and_then(|ports| ports.iter().find(|p| p.port as u32 == self.port as u32))
            .and_then(|p| p.name.clone());

        let mut entries: Vec<(PodId, Address)> = Vec::new();
        let mut unresolved = false;

        for subset in eps.subsets.iter().flatten() {
            let resolved_port = match resolve_subset_port(subset, port_name.as_deref()) {
                Some(port) => port,
                None => continue,
            };

            for addr in subset.addresses.iter().flatten() {
                if let Some(wanted) = self.hostname.as_deref() {
                    if addr.hostname.as_deref() != Some(wanted) {
                        continue;
                    }
                }

                let pod_ref = addr
                    .target_ref
                    .as_ref()
                    .filter(|r| r.kind.as_deref() == Some("Pod"))
                    .and_then(|r| Some((r.namespace.clone()?, r.name.clone()?)));

                let (key, resolved) = match pod_ref {
                    None => (
                        PodId::new(String::new(), addr.ip.clone()),
                        None,
                    ),
                    Some((ns, name)) => {
                        let pod_id = PodId::new(ns, name);
                        match self.cluster_index.get_pod(&pod_id) {
                            Some(pod) => (pod_id.clone(), Some((pod_id, pod))),
                            None => {
                                // Endpoint references a pod the Cluster
                                // Index hasn't (yet, or ever) observed —
                                // dropped rather than delivered with
                                // empty owner metadata, matching the
                                // "missing pods" scenario.
                                unresolved = true;
                                continue;
                            }
                        }
                    }
                };

                let (pod, owner_kind, owner_name) = match resolved {
                    Some((pod_id, pod)) => {
                        let (kind, name) = owner::get_owner_kind_and_name(&pod, false);
                        (Some(pod_id), kind, name)
                    }
                    None => (None, String::new(), String::new()),
                };

                entries.push((
                    key,
                    Address {
                        ip: addr.ip.clone(),
                        port: resolved_port,
                        pod,
                        owner_kind,
                        owner_name,
                    },
                ));
            }
        }

        let labels: BTreeMap<String, String> = svc.labels().clone().into_iter().collect();
        let (addresses, _) = entries
            .into_iter()
            .collect::<AddressSet>()
            .into_parts();
        (AddressSet::new(addresses, labels), unresolved)
    }
}

/// Resolves the numeric port this subset contributes for the requested
/// service port:
/// - a named `targetPort` is matched against the subset's `ports` by
///   name (the Endpoints controller always stamps the service port's own
///   name onto the matching `EndpointPort`);
/// - an unnamed service port falls back to the subset's single port
///   entry;
/// - failing both, the subset contributes nothing.
fn resolve_subset_port(subset: &k8s::EndpointSubset, port_name: Option<&str>) -> Option<Port> {
    let ports = subset.ports.as_ref()?;
    match port_name {
        Some(name) => ports
            .iter()
            .find(|p| p.name.as_deref() == Some(name))
            .map(|p| p.port as Port),
        None => ports.first().map(|p| p.port as Port),
    }
}
