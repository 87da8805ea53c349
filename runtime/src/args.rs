use crate::{grpc, index, k8s};
use anyhow::{bail, Result};
use clap::Parser;
use futures::prelude::*;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, sync::Arc};
use tracing::{info, info_span, instrument, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "destination", about = "An endpoint discovery controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "linkerd=info,warn",
        env = "LINKERD_DESTINATION_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Address the `destination.Destination` gRPC service binds to.
    #[clap(long, default_value = "0.0.0.0:8086")]
    grpc_addr: SocketAddr,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            grpc_addr,
        } = self;

        let cluster_index = index::ClusterIndex::shared();
        let endpoints_watcher = index::EndpointsWatcher::shared(cluster_index.clone());
        let ip_watcher = index::IpWatcher::shared(cluster_index.clone(), endpoints_watcher.clone());

        let mut prom = <Registry>::default();
        let index_metrics = index::metrics::IndexMetrics::register(
            endpoints_watcher.clone(),
            prom.sub_registry_with_prefix("index"),
        )
        .shared();

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let services = runtime.watch_all::<k8s::Service>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index_metrics.clone(), services)
                .instrument(info_span!("services")),
        );

        let endpoints = runtime.watch_all::<k8s::Endpoints>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index_metrics.clone(), endpoints)
                .instrument(info_span!("endpoints")),
        );

        let pods = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index_metrics, pods).instrument(info_span!("pods")),
        );

        tokio::spawn(
            serve_grpc(grpc_addr, ip_watcher, endpoints_watcher, runtime.shutdown_handle())
                .instrument(info_span!("grpc")),
        );

        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

#[instrument(skip_all, fields(port = %addr.port()))]
async fn serve_grpc(
    addr: SocketAddr,
    ip_watcher: Arc<index::IpWatcher>,
    endpoints_watcher: index::SharedEndpointsWatcher,
    drain: drain::Watch,
) -> Result<()> {
    let svc = grpc::Server::new(ip_watcher, endpoints_watcher, drain.clone()).svc();

    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = tonic::transport::Server::builder()
            .add_service(svc)
            .serve_with_shutdown(addr, close_rx.map(|_| {}));
    }

    info!(%addr, "destination gRPC server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?
        }
    }
    Ok(())
}
