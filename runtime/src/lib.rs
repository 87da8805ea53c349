//! Wires the endpoint watcher substrate to `kubert`'s informer runtime and
//! the gRPC server, the same shape `policy-controller/runtime` wires its
//! inbound/outbound indices: a `clap`-derived `Args`, a `kubert::Runtime`
//! built from its `client`/`server`/`admin` sub-args, one `watch_all`
//! informer per resource kind spawned against a shared, metrics-wrapped
//! index, and the gRPC server spawned last so it only starts serving once
//! the watches are running.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use linkerd_destination_core as core;
pub use linkerd_destination_grpc as grpc;
pub use linkerd_destination_k8s_api as k8s;
pub use linkerd_destination_k8s_index as index;

mod args;

pub use self::args::Args;
