/// Error categories surfaced to callers of the endpoint watcher substrate.
///
/// `Subscribe` fails synchronously on `InvalidService`; `Conflict` is
/// returned by Cluster Index lookups and is handled by callers as
/// "unresolved" rather than propagated to subscribers.
/// `TransportFailure` has no normative wire format at this layer — it
/// exists so collaborators (the gRPC surface) can wrap their own
/// transport errors in the same taxonomy.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum DiscoverError {
    #[error("invalid service authority: {authority}")]
    InvalidService { authority: String },

    #[error("conflicting {kind} entries for key {key}")]
    Conflict { kind: &'static str, key: String },

    #[error("transport failure: {message}")]
    TransportFailure { message: String },
}
