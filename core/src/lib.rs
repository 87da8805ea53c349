//! Wire- and Kubernetes-independent types shared by the endpoint watcher
//! substrate and its collaborators.
//!
//! This crate has no dependency on `kube`/`k8s-openapi` or `tonic`: it
//! models identifiers, address sets, snapshots, the push-listener
//! interface, and the error taxonomy that the rest of the workspace builds
//! on, the same separation `policy-controller/core` draws between itself
//! and `policy-controller/k8s/index`.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod address;
mod authority;
mod error;
mod ids;
mod listener;

pub use self::{
    address::{Address, AddressSet},
    authority::parse_authority,
    error::DiscoverError,
    ids::{PodId, Port, ProfileId, ServiceId},
    listener::Listener,
};

use std::sync::Arc;

/// An immutable, version-stamped [`AddressSet`] published atomically to
/// subscribers.
///
/// `version` is monotone non-decreasing for a given topic and strictly
/// increases on every distinct publication. The
/// `AddressSet` payload is wrapped in an `Arc` so that publishing never
/// requires copying it again for each subscriber: once constructed it is
/// never mutated, so sharing it without further locking is sound.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressSnapshot {
    pub version: u64,
    pub set: Arc<AddressSet>,
}

impl AddressSnapshot {
    pub fn new(version: u64, set: AddressSet) -> Self {
        Self {
            version,
            set: Arc::new(set),
        }
    }
}
