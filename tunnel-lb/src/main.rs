// Tunnel Load Balancer Controller Daemon

use anyhow::{Context, Result};
use clap::Parser;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::Api;
use kube::Client;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tunnel_lb::{
    api_client::{ProvisioningApi, ProvisioningClient},
    config::load_config,
    health,
    k8s_client::{self, ClusterClient, KubeClusterClient},
    reconciler::{Reconcile, Reconciler},
    resource::ResourceKind,
    tunnel::WgQuick,
    tunnel_manager::TunnelManager,
    types::Config,
    watcher::ResourceWatcher,
};

#[derive(Parser)]
#[command(name = "tunnel-lb")]
#[command(about = "Tunnel-backed load balancer controller", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "TUNNEL_LB_CONFIG")]
    config: Option<PathBuf>,
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as kube::Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

fn wg_quick(config: &Config) -> WgQuick {
    match &config.tunnel.config_dir {
        Some(dir) => WgQuick::new(config.tunnel.wg_quick.clone(), dir.clone()),
        None => WgQuick::new(config.tunnel.wg_quick.clone(), std::env::temp_dir()),
    }
}

/// Wait for the watchers, optionally bringing the local tunnels down
///
/// Tunnels are left running unless `teardown` is set, so a restarted
/// controller finds them up and adopts them on the next reconcile.
async fn graceful_shutdown(manager: &TunnelManager, tasks: Vec<JoinHandle<()>>, teardown: bool) {
    log::info!("Shutting down gracefully...");

    for task in tasks {
        if let Err(e) = task.await {
            log::error!("Task failed during shutdown: {}", e);
        }
    }

    let remaining = manager.list().await.len();
    if teardown {
        if remaining > 0 {
            log::info!("Bringing down {} local tunnel(s)...", remaining);
        }
        manager.shutdown().await;
    } else if remaining > 0 {
        log::info!("Leaving {} local tunnel(s) running", remaining);
    }

    log::info!("Shutdown complete");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(Some(path.as_path()))
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => load_config(None).context("Failed to load config")?,
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.general.log_level),
    )
    .init();

    log::info!("Starting tunnel-lb controller");
    log::info!("Provisioning server: {}", config.server.url);
    match &config.controller.namespace {
        Some(ns) => log::info!("Watching namespace {}", ns),
        None => log::info!("Watching all namespaces"),
    }

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let api: Arc<dyn ProvisioningApi> = Arc::new(
        ProvisioningClient::new(
            &config.server.url,
            &config.server.api_key,
            Duration::from_secs(config.server.request_timeout),
        )
        .context("Failed to create provisioning client")?,
    );
    let manager = Arc::new(TunnelManager::new(wg_quick(&config)));
    let cluster: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(client.clone()));
    let reconciler = Reconciler::new(api.clone(), manager.clone(), cluster.clone());
    let persisted = reconciler.persisted_ids();
    let reconciler: Arc<dyn Reconcile> = Arc::new(reconciler);

    let cancel = CancellationToken::new();
    let namespace = config.controller.namespace.as_deref();
    let mut tasks = Vec::new();

    if config.controller.watch_ingresses {
        let watcher = Arc::new(ResourceWatcher::new(
            ResourceKind::Ingress,
            cluster.clone(),
            reconciler.clone(),
            persisted.clone(),
            config.controller.workers,
        ));
        let feed = k8s_client::feed(scoped_api::<Ingress>(&client, namespace));
        tasks.push(tokio::spawn(watcher.run(feed, cancel.clone())));
    }

    if config.controller.watch_services {
        let watcher = Arc::new(ResourceWatcher::new(
            ResourceKind::Service,
            cluster.clone(),
            reconciler.clone(),
            persisted.clone(),
            config.controller.workers,
        ));
        let feed = k8s_client::feed(scoped_api::<Service>(&client, namespace));
        tasks.push(tokio::spawn(watcher.run(feed, cancel.clone())));
    }

    if config.controller.health_interval > 0 {
        tasks.push(tokio::spawn(health::run_probe_loop(
            api.clone(),
            manager.clone(),
            Duration::from_secs(config.controller.health_interval),
            cancel.clone(),
        )));
    }

    log::info!("Controller started successfully");

    // Set up signal handlers for graceful shutdown
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to set up SIGTERM handler")?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("Failed to set up SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => log::info!("Received SIGTERM"),
        _ = sigint.recv() => log::info!("Received SIGINT"),
    }

    cancel.cancel();
    graceful_shutdown(&manager, tasks, config.tunnel.teardown_on_exit).await;
    Ok(())
}
