use std::fmt;

/// A `(namespace, name)` pair identifying a `Service`.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServiceId {
    pub namespace: String,
    pub name: String,
}

/// A `(namespace, name)` pair identifying a `Pod`.
///
/// `PodId::default()` (empty namespace and name) is the reserved key used
/// by [`crate::AddressSet`] for a synthesized singleton address that has
/// no backing pod (an unresolved IP, or an `ExternalName` fallback).
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct PodId {
    pub namespace: String,
    pub name: String,
}

/// Mirrors [`ServiceId`] for service-profile lookups. The service-profile
/// watcher itself is an external collaborator; this alias only lets the
/// core speak about profile identity when resolving an authority.
pub type ProfileId = ServiceId;

/// A Kubernetes container/service port number.
pub type Port = u32;

impl ServiceId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl PodId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.namespace.is_empty() && self.name.is_empty()
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.namespace)
    }
}

impl fmt::Display for PodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.namespace)
    }
}
