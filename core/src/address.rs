use crate::{ids::Port, PodId};
use ahash::AHashMap as HashMap;
use std::collections::BTreeMap;

/// A single backend: a pod IP and port, plus the owning workload's
/// identity and labels when known.
///
/// `pod` is `None` for synthesized single-address sets: an unresolved IP
/// passed through opaquely, or an endpoint whose `targetRef` points at a
/// pod that the Cluster Index has not (yet, or ever) observed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Address {
    pub ip: String,
    pub port: Port,
    pub pod: Option<PodId>,
    pub owner_kind: String,
    pub owner_name: String,
}

impl Address {
    /// Builds a synthesized, ownerless address — used for opaque
    /// pass-through IPs and for endpoint references to pods the index
    /// hasn't indexed.
    pub fn unresolved(ip: impl Into<String>, port: Port) -> Self {
        Self {
            ip: ip.into(),
            port,
            pod: None,
            owner_kind: String::new(),
            owner_name: String::new(),
        }
    }
}

/// A resolved set of backend addresses for one `(service, port[, hostname])`
/// subscription, plus the labels of the resource the set was resolved
/// from (the service, for most cases).
///
/// Keyed by `PodId` so that repeated updates naturally dedupe and diff;
/// the reserved empty `PodId` is used for the single-address case (see
/// [`PodId::is_empty`]).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddressSet {
    addresses: HashMap<PodId, Address>,
    labels: BTreeMap<String, String>,
}

impl AddressSet {
    pub fn new(addresses: HashMap<PodId, Address>, labels: BTreeMap<String, String>) -> Self {
        Self { addresses, labels }
    }

    /// A set containing exactly one synthesized address — the shape
    /// produced for opaque IP pass-through and unresolvable targets.
    pub fn singleton(addr: Address) -> Self {
        let mut addresses = HashMap::default();
        addresses.insert(PodId::default(), addr);
        Self {
            addresses,
            labels: BTreeMap::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn addresses(&self) -> impl Iterator<Item = (&PodId, &Address)> {
        self.addresses.iter()
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn into_parts(self) -> (HashMap<PodId, Address>, BTreeMap<String, String>) {
        (self.addresses, self.labels)
    }
}

impl FromIterator<(PodId, Address)> for AddressSet {
    fn from_iter<I: IntoIterator<Item = (PodId, Address)>>(iter: I) -> Self {
        Self {
            addresses: iter.into_iter().collect(),
            labels: BTreeMap::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singleton_uses_reserved_empty_pod_id() {
        let set = AddressSet::singleton(Address::unresolved("192.168.210.92", 5959));
        assert_eq!(set.len(), 1);
        let (id, addr) = set.addresses().next().unwrap();
        assert!(id.is_empty());
        assert_eq!(addr.ip, "192.168.210.92");
        assert_eq!(addr.port, 5959);
        assert!(addr.pod.is_none());
    }

    #[test]
    fn equal_sets_are_equal_regardless_of_construction_order() {
        let a: AddressSet = vec![
            (
                PodId::new("ns", "a"),
                Address::unresolved("10.0.0.1", 80),
            ),
            (
                PodId::new("ns", "b"),
                Address::unresolved("10.0.0.2", 80),
            ),
        ]
        .into_iter()
        .collect();
        let b: AddressSet = vec![
            (
                PodId::new("ns", "b"),
                Address::unresolved("10.0.0.2", 80),
            ),
            (
                PodId::new("ns", "a"),
                Address::unresolved("10.0.0.1", 80),
            ),
        ]
        .into_iter()
        .collect();
        assert_eq!(a, b);
    }
}
