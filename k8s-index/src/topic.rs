//! The per-`(service, port)` broadcast surface.
//!
//! Follows the same `watch`-based publish shape used elsewhere in this
//! workspace (`k8s/index/src/lookup.rs::Rx`, `outbound/index.rs::ServiceRoutes`):
//! the topic stores its current state behind a lock, and uses a
//! `tokio::sync::watch<()>` purely as a wake signal — subscribers read the
//! actual state via [`EndpointTopic::latest`], never from the channel
//! itself. A `watch` receiver that misses several sends between polls
//! only ever observes "changed since I last looked", which is exactly the
//! coalescing property this surface is built to provide: an arbitrarily fast publisher
//! produces at most one pending wake-up per subscriber, and the channel is
//! never closed by the topic (a subscriber simply stops polling when its
//! scope ends).

use linkerd_destination_core::{AddressSet, AddressSnapshot};
use parking_lot::RwLock;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::watch;

/// The topic's current logical state. Exactly one of these holds at any
/// moment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TopicState {
    Unknown,
    Snapshot(AddressSnapshot),
    NoEndpoints { service_exists: bool },
}

impl Default for TopicState {
    fn default() -> Self {
        TopicState::Unknown
    }
}

#[derive(Debug)]
struct Inner {
    state: RwLock<TopicState>,
    notify: watch::Sender<()>,
    next_version: AtomicU64,
}

/// A broadcast surface for one `(ServiceId, Port[, hostname])`. Owned by
/// exactly one [`crate::port_publisher::PortPublisher`].
#[derive(Clone, Debug)]
pub struct EndpointTopic(Arc<Inner>);

/// A handle obtained from [`EndpointTopic::subscribe`]. Dropping it is the
/// cancellation: removal from the topic's implicit
/// subscriber set is then automatic and idempotent, handled by
/// `tokio::sync::watch`'s receiver bookkeeping rather than anything this
/// crate tracks itself.
pub struct Subscription {
    topic: EndpointTopic,
    notify_rx: watch::Receiver<()>,
}

impl Default for EndpointTopic {
    fn default() -> Self {
        let (notify, _rx) = watch::channel(());
        Self(Arc::new(Inner {
            state: RwLock::new(TopicState::Unknown),
            notify,
            next_version: AtomicU64::new(0),
        }))
    }
}

impl EndpointTopic {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber. The returned [`Subscription`] should be
    /// polled for `latest()` immediately — that read is the "initial
    /// replay" a subscriber needs, performed synchronously rather
    /// than via a racy post-registration wake.
    pub fn subscribe(&self) -> Subscription {
        let notify_rx = self.0.notify.subscribe();
        Subscription {
            topic: self.clone(),
            notify_rx,
        }
    }

    /// Returns the most recent snapshot, or `(None, false)` while in the
    /// *no-endpoints* or *unknown* state.
    pub fn latest(&self) -> (Option<AddressSnapshot>, bool) {
        match &*self.0.state.read() {
            TopicState::Snapshot(snap) => (Some(snap.clone()), true),
            TopicState::NoEndpoints { .. } | TopicState::Unknown => (None, false),
        }
    }

    pub fn state(&self) -> TopicState {
        self.0.state.read().clone()
    }

    /// Publishes a new `AddressSet`, advancing the topic to *snapshot*
    /// state with a strictly greater version than any prior publication
    /// Republishing an unchanged set is permitted and
    /// still advances the version — callers must treat equal sets at
    /// different versions as no-ops.
    pub fn publish_snapshot(&self, set: AddressSet) -> AddressSnapshot {
        let version = self.0.next_version.fetch_add(1, Ordering::SeqCst);
        let snapshot = AddressSnapshot::new(version, set);
        *self.0.state.write() = TopicState::Snapshot(snapshot.clone());
        // A publish never blocks: `send` is a non-blocking store plus a
        // best-effort wake of any receivers; it fails only when no
        // receiver exists, which is not an error for the publisher.
        let _ = self.0.notify.send(());
        snapshot
    }

    /// Publishes a *no-endpoints* transition, clearing any prior snapshot.
    pub fn publish_no_endpoints(&self, service_exists: bool) {
        *self.0.state.write() = TopicState::NoEndpoints { service_exists };
        let _ = self.0.notify.send(());
    }
}

impl Subscription {
    /// Returns the most recent snapshot at the call moment.
    pub fn latest(&self) -> (Option<AddressSnapshot>, bool) {
        self.topic.latest()
    }

    pub fn state(&self) -> TopicState {
        self.topic.state()
    }

    /// Waits until the topic has published since this was last observed.
    /// Returns `false` if the topic has been dropped (the owning Port
    /// Publisher is gone); that never happens while subscribers are
    /// attached.
    pub async fn changed(&mut self) -> bool {
        self.notify_rx.changed().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkerd_destination_core::{Address, PodId};

    fn addr_set(ip: &str, port: linkerd_destination_core::Port) -> AddressSet {
        AddressSet::singleton(Address::unresolved(ip, port))
    }

    #[test]
    fn unknown_until_first_publish() {
        let topic = EndpointTopic::new();
        let (snap, has) = topic.latest();
        assert!(snap.is_none());
        assert!(!has);
        assert_eq!(topic.state(), TopicState::Unknown);
    }

    #[test]
    fn version_strictly_increases_across_publications() {
        let topic = EndpointTopic::new();
        let s1 = topic.publish_snapshot(addr_set("10.0.0.1", 80));
        let s2 = topic.publish_snapshot(addr_set("10.0.0.2", 80));
        assert!(s1.version < s2.version);
    }

    #[test]
    fn republishing_identical_set_still_advances_version() {
        let topic = EndpointTopic::new();
        let s1 = topic.publish_snapshot(addr_set("10.0.0.1", 80));
        let s2 = topic.publish_snapshot(addr_set("10.0.0.1", 80));
        assert_eq!(s1.set, s2.set);
        assert!(s1.version < s2.version);
    }

    #[test]
    fn no_endpoints_clears_snapshot() {
        let topic = EndpointTopic::new();
        topic.publish_snapshot(addr_set("10.0.0.1", 80));
        topic.publish_no_endpoints(true);
        let (snap, has) = topic.latest();
        assert!(snap.is_none());
        assert!(!has);
        assert_eq!(
            topic.state(),
            TopicState::NoEndpoints {
                service_exists: true
            }
        );
    }

    #[tokio::test]
    async fn subscriber_observes_monotone_versions() {
        let topic = EndpointTopic::new();
        topic.publish_snapshot(addr_set("10.0.0.1", 80));
        let mut sub = topic.subscribe();
        let (initial, _) = sub.latest();
        let initial_version = initial.unwrap().version;

        topic.publish_snapshot(addr_set("10.0.0.2", 80));
        assert!(sub.changed().await);
        let (next, _) = sub.latest();
        assert!(next.unwrap().version > initial_version);
    }

    #[tokio::test]
    async fn coalesces_rapid_publications_into_one_wakeup() {
        let topic = EndpointTopic::new();
        let mut sub = topic.subscribe();
        let _ = sub.latest();

        for i in 0..50u32 {
            topic.publish_snapshot(addr_set("10.0.0.1", i));
        }

        assert!(sub.changed().await);
        let (snap, _) = sub.latest();
        assert_eq!(snap.unwrap().version, 49);

        // No further publications happened, so a subsequent `changed()`
        // must not resolve immediately.
        assert!(tokio::time::timeout(std::time::Duration::from_millis(20), sub.changed())
            .await
            .is_err());
    }

    #[test]
    fn pod_id_reserved_key_used_for_singletons() {
        let set = addr_set("10.0.0.1", 80);
        let (id, _) = set.addresses().next().unwrap();
        assert_eq!(id, &PodId::default());
    }
}
