//! flotillad – the federation control-plane daemon.
//!
//! Wires a host-cluster client, the cluster registry, and the type-config
//! controller together, then runs until interrupted.

#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use flotilla_core::ControllerConfig;
use flotilla_hub::ClusterRegistry;
use flotilla_typeconfig::start_type_config_controller;

#[derive(Parser, Debug)]
#[command(name = "flotillad", version, about = "Federates resources across member clusters")]
struct Cli {
    /// Namespace holding the control-plane resources.
    #[arg(long = "namespace")]
    namespace: Option<String>,

    /// Restrict federated resources to one namespace (namespaced control plane).
    #[arg(long = "target-namespace")]
    target_namespace: Option<String>,
}

fn init_tracing() {
    let env = std::env::var("FLOTILLA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("FLOTILLA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(err) => warn!(error = %err, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid FLOTILLA_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let mut config = ControllerConfig::from_env();
    if let Some(ns) = cli.namespace {
        config.fed_namespace = ns;
    }
    if let Some(ns) = cli.target_namespace {
        config.target_namespace = Some(ns);
    }
    info!(
        namespace = %config.fed_namespace,
        target_namespace = ?config.target_namespace,
        "starting flotillad"
    );

    let host = kube::Client::try_default().await?;
    let (stop_tx, stop_rx) = watch::channel(());

    let registry = ClusterRegistry::start(host.clone(), &config, stop_rx.clone());
    let controller = tokio::spawn(start_type_config_controller(
        config,
        host,
        Arc::clone(&registry),
        stop_rx,
    ));

    tokio::signal::ctrl_c().await?;
    info!("interrupt received; shutting down");
    drop(stop_tx);
    match controller.await {
        Ok(result) => result?,
        Err(err) => warn!(error = %err, "type-config controller task failed"),
    }
    Ok(())
}
