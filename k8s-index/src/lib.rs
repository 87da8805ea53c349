//! The endpoint watcher substrate: cluster-state indices and the
//! publisher hierarchy that turns them into live, per-subscriber address
//! snapshots.
//!
//! Layered the same way `policy-controller/k8s/index` is laid out — one
//! module per collaborating component, composed by the top-level
//! façades (`EndpointsWatcher`, `IpWatcher`) that `runtime` binds to
//! `kubert`'s informers.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod adapter;
mod cluster_index;
mod endpoints_watcher;
mod ip_watcher;
pub mod metrics;
mod owner;
mod port_publisher;
mod service_publisher;
mod topic;

pub use self::{
    adapter::relay_topic_to_listener,
    cluster_index::{ClusterIndex, SharedClusterIndex},
    endpoints_watcher::{EndpointsWatcher, SharedEndpointsWatcher},
    ip_watcher::{IpResolution, IpWatcher},
    owner::get_owner_kind_and_name,
    port_publisher::PortPublisher,
    service_publisher::ServicePublisher,
    topic::{EndpointTopic, Subscription, TopicState},
};
