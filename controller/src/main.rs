#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod admin;

use anyhow::{bail, Result};
use clap::Parser;
use maesh_controller_core::{ConfigurationProvider, TrafficType};
use maesh_controller_k8s_api::{self as k8s, access::TrafficTarget, ListParams};
use maesh_controller_k8s_index::{
    ConfigMapStore, Controller, DeployLog, Ignored, Index, ShadowServiceManager, TcpPortTable,
};
use maesh_controller_providers::{KubernetesProvider, SmiProvider};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, info_span, Instrument};

const DEPLOY_LOG_CAPACITY: usize = 1000;

#[derive(Debug, Parser)]
#[clap(name = "maesh-controller", about = "A service mesh control plane")]
struct Args {
    #[clap(
        long,
        default_value = "maesh_controller=info,warn",
        env = "MAESH_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The namespace the data-plane instances run in.
    #[clap(long, default_value = "maesh")]
    mesh_namespace: String,

    /// Traffic type for services without a traffic-type annotation.
    #[clap(long, default_value = "http")]
    default_mode: TrafficType,

    /// Enables the policy-aware configuration provider.
    #[clap(long)]
    smi: bool,

    /// Additional namespaces the mesh ignores entirely.
    #[clap(long)]
    ignore_namespaces: Vec<String>,

    /// Address of the read-only mesh API.
    #[clap(long, default_value = "0.0.0.0:9000")]
    api_addr: SocketAddr,

    /// Name of the ConfigMap holding the durable TCP port table.
    #[clap(long, default_value = "tcp-state-table")]
    tcp_state_table: String,

    #[clap(long, default_value = "10000")]
    min_tcp_port: i32,

    #[clap(long, default_value = "10100")]
    max_tcp_port: i32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        log_level,
        log_format,
        client,
        admin,
        mesh_namespace,
        default_mode,
        smi,
        ignore_namespaces,
        api_addr,
        tcp_state_table,
        min_tcp_port,
        max_tcp_port,
    } = Args::parse();

    let mut runtime = kubert::Runtime::builder()
        .with_log(log_level, log_format)
        .with_admin(admin)
        .with_client(client)
        .build()
        .await?;

    let client = runtime.client();

    // Rehydrate the durable TCP port table before anything can allocate from
    // it. A failure here aborts startup.
    let store = ConfigMapStore::new(
        k8s::Api::namespaced(client.clone(), &mesh_namespace),
        tcp_state_table,
    );
    let table = Arc::new(TcpPortTable::load(Box::new(store), min_tcp_port, max_tcp_port).await?);

    let ignored = Ignored::new(&mesh_namespace, ignore_namespaces);
    let shadow = ShadowServiceManager::new(
        client,
        mesh_namespace.clone(),
        default_mode,
        table.clone(),
    );

    // Eagerly create shadow services so every user service is addressable
    // before the first watch event arrives.
    info!("Creating initial shadow services");
    if let Err(error) = shadow.sync(&ignored).await {
        tracing::error!(%error, "Could not create initial shadow services");
    }

    // Build the index, which processes events from all watches, maintains the
    // cache the providers read, and feeds the reconciler.
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let index = Index::shared(ignored, mesh_namespace, events_tx);

    let services = runtime.watch_all::<k8s::Service>(ListParams::default());
    tokio::spawn(
        kubert::index::namespaced(index.clone(), services).instrument(info_span!("services")),
    );

    let endpoints = runtime.watch_all::<k8s::Endpoints>(ListParams::default());
    tokio::spawn(
        kubert::index::namespaced(index.clone(), endpoints).instrument(info_span!("endpoints")),
    );

    let pods = runtime.watch_all::<k8s::Pod>(ListParams::default());
    tokio::spawn(kubert::index::namespaced(index.clone(), pods).instrument(info_span!("pods")));

    if smi {
        let targets = runtime.watch_all::<TrafficTarget>(ListParams::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), targets)
                .instrument(info_span!("traffictargets")),
        );
    }

    let provider: Box<dyn ConfigurationProvider + Send + Sync> = if smi {
        Box::new(SmiProvider::new(index.clone(), default_mode, table.clone()))
    } else {
        Box::new(KubernetesProvider::new(index.clone(), default_mode, table))
    };

    let deploy_log = Arc::new(DeployLog::new(DEPLOY_LOG_CAPACITY));
    let last_config = Arc::new(RwLock::new(None));
    let (ready_tx, ready_rx) = watch::channel(false);

    let controller = Controller::new(
        index,
        provider,
        shadow,
        events_rx,
        deploy_log.clone(),
        last_config.clone(),
        ready_tx,
    );
    tokio::spawn(
        controller
            .run(runtime.shutdown_handle())
            .instrument(info_span!("controller")),
    );

    tokio::spawn(admin::serve(api_addr, ready_rx, last_config, deploy_log));

    // Block the main thread on the shutdown signal. Once it fires, wait for
    // the background tasks to complete before exiting.
    if runtime.run().await.is_err() {
        bail!("Aborted");
    }

    Ok(())
}
