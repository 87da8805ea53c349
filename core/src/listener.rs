use crate::AddressSet;

/// The push-style delivery interface for an address-level subscription.
///
/// This is the declarative alternative to a pull-on-notify topic: a topic
/// subscription can always be adapted into calls against a `Listener` by
/// diffing consecutive snapshots, so implementers need only write one
/// adapter rather than duplicate delivery logic per transport. The gRPC
/// surface is the primary consumer, translating these calls directly into
/// `destination.Update` messages.
#[async_trait::async_trait]
pub trait Listener: Send {
    /// Addresses newly present in the resolved set.
    async fn add(&mut self, addrs: AddressSet);

    /// Addresses no longer present in the resolved set.
    async fn remove(&mut self, addrs: AddressSet);

    /// The resolved set has no backing endpoints. `service_exists`
    /// distinguishes "the service exists but has no ready endpoints" from
    /// "neither the service nor an endpoints object was ever observed".
    async fn no_endpoints(&mut self, service_exists: bool);
}
