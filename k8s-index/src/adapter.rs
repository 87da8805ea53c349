//! Adapts a pull-on-notify [`Subscription`] into the push-style
//! [`Listener`] capability set (§9's "declarative vs imperative
//! delivery").
//!
//! Grounded in the historical Rust consumer of exactly this protocol: the
//! proxy-side destination client's `Resolution::poll`, which diffed
//! consecutive `Update`s into `Insert`/`Remove` deltas for its load
//! balancer. Here the direction is reversed — we are the publisher, not
//! the consumer — but the diff is the same idea: track the last
//! delivered `AddressSet`, and turn every new snapshot into the minimal
//! `add`/`remove` pair that reconciles a listener's view with it.
//!
//! This is intentionally the *only* place that bridges the two styles:
//! everything else in this crate (and the core types) stays on the topic
//! form, exactly as §9 recommends for new code.

use linkerd_destination_core::{Address, AddressSet, Listener, PodId};
use std::{collections::BTreeMap, sync::Arc};

use crate::topic::{Subscription, TopicState};

/// Drives `listener` from `sub` until the subscription's topic is
/// dropped (which never happens while the listener is attached) or the
/// calling task is cancelled. Performs the initial replay required by
/// invariant 6 (§3) before waiting for further changes.
pub async fn relay_topic_to_listener(mut sub: Subscription, mut listener: Box<dyn Listener>) {
    let mut prev: Option<Arc<AddressSet>> = None;

    loop {
        match sub.state() {
            TopicState::Snapshot(snapshot) => {
                diff_and_emit(&mut *listener, prev.as_deref(), &snapshot.set).await;
                prev = Some(snapshot.set);
            }
            TopicState::NoEndpoints { service_exists } => {
                prev = None;
                listener.no_endpoints(service_exists).await;
            }
            TopicState::Unknown => {}
        }

        if !sub.changed().await {
            return;
        }
    }
}

/// Emits `remove` for addresses present in `prev` but absent (or changed)
/// in `next`, then `add` for addresses present in `next` but absent (or
/// changed) from `prev`. A no-op diff (identical sets, e.g. a
/// version-only republish) emits nothing.
///
/// `pub(crate)` rather than private: [`crate::ip_watcher`]'s
/// service-identity-migration path reuses this directly, racing its own
/// loop against [`crate::ClusterIndex::watch_cluster_ip_changes`] instead
/// of running the plain topic-until-dropped loop above.
pub(crate) async fn diff_and_emit(listener: &mut dyn Listener, prev: Option<&AddressSet>, next: &AddressSet) {
    let empty;
    let prev = match prev {
        Some(p) => p,
        None => {
            empty = AddressSet::default();
            &empty
        }
    };

    let removed: BTreeMap<&PodId, &Address> = prev
        .addresses()
        .filter(|(id, addr)| next.addresses().find(|(i, _)| i == id).map(|(_, a)| a) != Some(addr))
        .collect();
    let added: BTreeMap<&PodId, &Address> = next
        .addresses()
        .filter(|(id, addr)| prev.addresses().find(|(i, _)| i == id).map(|(_, a)| a) != Some(addr))
        .collect();

    if !removed.is_empty() {
        let set: AddressSet = removed
            .into_iter()
            .map(|(id, addr)| (id.clone(), addr.clone()))
            .collect();
        listener.remove(set).await;
    }
    if !added.is_empty() {
        let set: AddressSet = added
            .into_iter()
            .map(|(id, addr)| (id.clone(), addr.clone()))
            .collect();
        listener.add(set).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::EndpointTopic;
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

    fn set(entries: &[(&str, &str, &str, linkerd_destination_core::Port)]) -> AddressSet {
        entries
            .iter()
            .map(|(ns, name, ip, port)| {
                (
                    PodId::new(*ns, *name),
                    Address {
                        ip: ip.to_string(),
                        port: *port,
                        pod: Some(PodId::new(*ns, *name)),
                        owner_kind: String::new(),
                        owner_name: String::new(),
                    },
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn replays_initial_snapshot_then_stops_when_topic_idle() {
        let topic = EndpointTopic::new();
        topic.publish_snapshot(set(&[("ns", "a", "10.0.0.1", 80)]));

        let recording = Arc::new(Mutex::new(Recording::default()));
        let sub = topic.subscribe();
        let listener = Box::new(RecordingListener(recording.clone()));

        let relay = tokio::spawn(relay_topic_to_listener(sub, listener));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        relay.abort();

        let recorded = recording.lock().unwrap();
        assert_eq!(recorded.added.len(), 1);
        assert_eq!(recorded.added[0].len(), 1);
        assert!(recorded.removed.is_empty());
    }

    #[tokio::test]
    async fn diffs_successive_snapshots_into_add_and_remove() {
        let topic = EndpointTopic::new();
        let recording = Arc::new(Mutex::new(Recording::default()));
        let sub = topic.subscribe();
        let listener = Box::new(RecordingListener(recording.clone()));
        let relay = tokio::spawn(relay_topic_to_listener(sub, listener));

        topic.publish_snapshot(set(&[("ns", "a", "10.0.0.1", 80)]));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        topic.publish_snapshot(set(&[("ns", "b", "10.0.0.2", 80)]));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        relay.abort();

        let recorded = recording.lock().unwrap();
        assert_eq!(recorded.added.len(), 2);
        assert_eq!(recorded.removed.len(), 1);
        assert_eq!(recorded.removed[0].len(), 1);
    }

    #[tokio::test]
    async fn no_endpoints_clears_prior_and_notifies_listener() {
        let topic = EndpointTopic::new();
        let recording = Arc::new(Mutex::new(Recording::default()));
        let sub = topic.subscribe();
        let listener = Box::new(RecordingListener(recording.clone()));
        let relay = tokio::spawn(relay_topic_to_listener(sub, listener));

        topic.publish_snapshot(set(&[("ns", "a", "10.0.0.1", 80)]));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        topic.publish_no_endpoints(true);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        relay.abort();

        let recorded = recording.lock().unwrap();
        assert_eq!(recorded.no_endpoints, vec![true]);
    }
}
