//! Resolves a pod's highest-level controller.
//!
//! There is no ready-made helper for this in the workspace — every other
//! owner-reference touch point in the pack only *writes* one (see
//! `policy-controller/runtime/src/lease.rs`, which builds an owner
//! reference via `controller_owner_ref` to tie a `Lease` to its
//! `Deployment`). Reading one back is the mirror operation:
//! `kube::ResourceExt::owner_references()` gives the raw list, and we pick
//! the entry with `controller == Some(true)`, the same selector
//! `controller_owner_ref` sets when writing.

use linkerd_destination_k8s_api::{Pod, ResourceExt};

/// Resolves `(ownerKind, ownerName)` for `pod`.
///
/// A bare pod with no controller owner reports itself: `("Pod", name)`.
/// A pod controlled by a `ReplicaSet` is, unless `skip_indirect` is set,
/// reported as owned by the Deployment that templated the ReplicaSet —
/// recovered by stripping the ReplicaSet's generated `-<hash>` suffix,
/// the same heuristic `kubectl` and most mesh control planes use since
/// the ReplicaSet itself carries no back-reference to its Deployment.
pub fn get_owner_kind_and_name(pod: &Pod, skip_indirect: bool) -> (String, String) {
    let controller = pod
        .owner_references()
        .iter()
        .find(|owner| owner.controller == Some(true));

    let Some(owner) = controller else {
        return ("Pod".to_string(), pod.name_any());
    };

    if !skip_indirect && owner.kind == "ReplicaSet" {
        if let Some(deployment) = strip_replicaset_hash_suffix(&owner.name) {
            return ("Deployment".to_string(), deployment);
        }
    }

    (owner.kind.clone(), owner.name.clone())
}

/// A ReplicaSet generated for a Deployment is always named
/// `<deployment>-<hash>`, where `<hash>` is a single alphanumeric label
/// with no further `-` in it. Anything else (a hand-created ReplicaSet,
/// or one whose name doesn't fit the pattern) has no recoverable
/// Deployment name.
fn strip_replicaset_hash_suffix(name: &str) -> Option<String> {
    let (prefix, hash) = name.rsplit_once('-')?;
    if prefix.is_empty() || hash.is_empty() || !hash.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(prefix.to_string())
}
