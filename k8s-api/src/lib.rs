//! Re-exports the Kubernetes object kinds and client plumbing the
//! endpoint watcher substrate needs, the same way
//! `policy-controller/k8s/api` centralizes its `k8s-openapi`/`kube`
//! surface so the rest of the workspace depends on one crate instead of
//! pinning versions in several places.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use k8s_openapi::{
    api::core::v1::{
        Container, ContainerPort, EndpointAddress, EndpointPort, EndpointSubset, Endpoints,
        ObjectReference, Pod, PodSpec, PodStatus, Service, ServicePort, ServiceSpec, ServiceStatus,
    },
    apimachinery::pkg::{apis::meta::v1::OwnerReference, util::intstr::IntOrString},
    NamespaceResourceScope,
};
pub use kube::{
    api::{Api, ListParams, ObjectMeta, Resource, ResourceExt},
    runtime::watcher,
    Client, Error,
};
