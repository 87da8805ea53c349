//! The external gRPC surface over the endpoint watcher substrate.
//!
//! Carried as an ambient "how subscribers actually attach" collaborator
//! the same way `policy-controller/grpc` sits alongside
//! `policy-controller/k8s/index` even though only the index is specified
//! in depth — grounded on `policy-controller/grpc/src/outbound.rs`'s
//! shape: a thin `tonic` service wrapping an index/watcher handle, a
//! `drain::Watch` for graceful shutdown, and a response stream. The
//! producer side here is a [`Listener`] trait object rather than a
//! single async block, so the stream is built from an `mpsc` channel
//! plus `ReceiverStream` instead of `async_stream::try_stream!`.
//!
//! Implements the `destination.Destination` service's `Get` RPC —
//! `linkerd2_proxy_api::destination`'s historical proxy-facing address
//! resolution surface — directly on top of [`IpWatcher`]/
//! [`EndpointsWatcher`] via the push-[`Listener`] adapter those crates
//! expose. `GetProfile` is stubbed `Unimplemented`: the service-profile
//! watcher that would back it is an explicit external collaborator
//! (spec.md §1), out of scope here.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod translate;

use futures::Stream;
use linkerd_destination_core::{parse_authority, AddressSet, Listener};
use linkerd_destination_k8s_index::{relay_topic_to_listener, IpWatcher, SharedEndpointsWatcher};
use linkerd2_proxy_api::destination::{
    destination_server::{Destination, DestinationServer},
    update::Update,
    DestinationProfile, GetDestination,
};
use std::{net::IpAddr, pin::Pin, sync::Arc};
use tokio::sync::mpsc;
use tonic::{Request, Response, Status};
use tracing::{info, instrument};

/// The default weight assigned to every discovered address: the proxy's
/// load balancer treats all backends as equally preferred, so the
/// gRPC-level weight this service reports is always the protocol's
/// "no opinion" value.
const DEFAULT_WEIGHT: u32 = 10_000;

/// The `Destination` RPC handler. Named distinctly from the
/// `tonic`-generated `destination_server::DestinationServer<T>` wrapper
/// it is served through, the same way `OutboundPolicyServer` avoids
/// colliding with `OutboundPoliciesServer` in the teacher's
/// `grpc/src/outbound.rs`.
#[derive(Clone)]
pub struct Server {
    ip_watcher: Arc<IpWatcher>,
    endpoints_watcher: SharedEndpointsWatcher,
    drain: drain::Watch,
}

impl Server {
    pub fn new(
        ip_watcher: Arc<IpWatcher>,
        endpoints_watcher: SharedEndpointsWatcher,
        drain: drain::Watch,
    ) -> Self {
        Self {
            ip_watcher,
            endpoints_watcher,
            drain,
        }
    }

    pub fn svc(self) -> DestinationServer<Self> {
        DestinationServer::new(self)
    }
}

type ResponseStream =
    Pin<Box<dyn Stream<Item = Result<linkerd2_proxy_api::destination::Update, Status>> + Send>>;
type ProfileStream =
    Pin<Box<dyn Stream<Item = Result<DestinationProfile, Status>> + Send>>;

#[async_trait::async_trait]
impl Destination for Server {
    type GetStream = ResponseStream;
    type GetProfileStream = ProfileStream;

    #[instrument(skip(self), fields(path = %req.get_ref().path))]
    async fn get(
        &self,
        req: Request<GetDestination>,
    ) -> Result<Response<Self::GetStream>, Status> {
        let path = req.into_inner().path;
        info!("resolving destination");

        let (tx, rx) = mpsc::channel::<Result<linkerd2_proxy_api::destination::Update, Status>>(16);
        let listener = Box::new(ChannelListener(tx));

        if let Some((host, port)) = path.rsplit_once(':') {
            if let Ok(ip) = host.parse::<IpAddr>() {
                let port = port
                    .parse()
                    .map_err(|_| Status::invalid_argument("invalid port"))?;
                let mut handle = self.ip_watcher.subscribe_listener(ip, port, listener);
                let drain = self.drain.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = &mut handle => {}
                        signal = drain.signaled() => {
                            handle.abort();
                            drop(signal);
                        }
                    }
                });
                return Ok(Response::new(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx))));
            }
        }

        let (service_id, port, hostname) = parse_authority(&path)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        let sub = self
            .endpoints_watcher
            .subscribe(service_id, port, hostname)
            .map_err(to_status)?;

        let drain = self.drain.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = relay_topic_to_listener(sub, listener) => {}
                handle = drain.signaled() => drop(handle),
            }
        });

        Ok(Response::new(Box::pin(
            tokio_stream::wrappers::ReceiverStream::new(rx),
        )))
    }

    async fn get_profile(
        &self,
        _req: Request<GetDestination>,
    ) -> Result<Response<Self::GetProfileStream>, Status> {
        Err(Status::unimplemented(
            "service-profile resolution is not part of the endpoint watcher substrate",
        ))
    }
}

/// Adapts the push-[`Listener`] capability set onto a `destination.Update`
/// stream: each `add`/`remove`/`no_endpoints` call becomes exactly one
/// message sent down `tx`. A full channel (a very slow proxy client) is
/// treated the same way a dropped topic-subscriber slot would be — the
/// update is lost, not retried, matching §4.7's "publications are never
/// retried" policy at this boundary too.
struct ChannelListener(mpsc::Sender<Result<linkerd2_proxy_api::destination::Update, Status>>);

#[async_trait::async_trait]
impl Listener for ChannelListener {
    async fn add(&mut self, addrs: AddressSet) {
        let msg = translate::to_update(Update::Add(translate::to_weighted_addr_set(
            &addrs,
            DEFAULT_WEIGHT,
        )));
        let _ = self.0.try_send(Ok(msg));
    }

    async fn remove(&mut self, addrs: AddressSet) {
        let msg = translate::to_update(Update::Remove(translate::to_addr_set(&addrs)));
        let _ = self.0.try_send(Ok(msg));
    }

    async fn no_endpoints(&mut self, service_exists: bool) {
        let msg = translate::to_update(Update::NoEndpoints(
            linkerd2_proxy_api::destination::NoEndpoints {
                exists: service_exists,
            },
        ));
        let _ = self.0.try_send(Ok(msg));
    }
}

fn to_status(err: linkerd_destination_core::DiscoverError) -> Status {
    use linkerd_destination_core::DiscoverError::*;
    match err {
        InvalidService { authority } => {
            Status::invalid_argument(format!("invalid service: {authority}"))
        }
        Conflict { kind, key } => Status::unavailable(format!("conflicting {kind} for {key}")),
        TransportFailure { message } => Status::unavailable(message),
    }
}
