//! # configmapsecret-controller
//!
//! Controller entrypoint: parses flags, bootstraps logging and metrics,
//! serves health and metrics endpoints, optionally waits for the leader
//! lease, and runs the ConfigMapSecret controller until shutdown.

use anyhow::{Context as _, Result};
use clap::Parser;
use configmapsecret_controller::controller::refmap::RefIndex;
use configmapsecret_controller::controller::{dispatch, reconciler};
use configmapsecret_controller::crd::ConfigMapSecret;
use configmapsecret_controller::elect::LeaseLock;
use configmapsecret_controller::observability::metrics;
use configmapsecret_controller::server::{self, ServerState};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{Api, Client};
use kube_runtime::{watcher, Controller};
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const SERVICE_ACCOUNT_NAMESPACE_PATH: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";
const LEADER_ELECTION_LEASE: &str = "configmapsecret-controller-leader";
const LEASE_DURATION: Duration = Duration::from_secs(15);

/// Renders ConfigMapSecrets into Secrets.
#[derive(Parser)]
#[command(name = "configmapsecret-controller")]
struct Args {
    /// The address to which the health endpoint binds.
    #[arg(long, default_value = ":9090")]
    health_addr: String,

    /// The address to which the metric endpoint binds.
    #[arg(long, default_value = ":9091")]
    metrics_addr: String,

    /// Enable the controller to manage all namespaces, instead of only its
    /// own namespace.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    all_namespaces: bool,

    /// Enable leader election, which will ensure there is only one active
    /// controller.
    #[arg(long, default_value_t = false)]
    enable_leader_election: bool,

    /// Namespace of the leader election object. Defaults to `kube-system`
    /// when all-namespaces is enabled and to the controller's own namespace
    /// when all-namespaces is disabled.
    #[arg(long, default_value = "")]
    leader_election_namespace: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
    info!("Starting configmapsecret-controller");

    metrics::register_metrics().context("Unable to register metrics")?;

    let state = Arc::new(ServerState::default());
    let health_state = state.clone();
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = server::start_health_server(&health_addr, health_state).await {
            error!(error = %e, "Health server failed");
        }
    });
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = server::start_metrics_server(&metrics_addr).await {
            error!(error = %e, "Metrics server failed");
        }
    });

    let client = Client::try_default()
        .await
        .context("Unable to load kubeconfig")?;

    let namespace = if args.all_namespaces {
        None
    } else {
        Some(current_namespace().context("Unable to detect namespace")?)
    };

    if args.enable_leader_election {
        let election_namespace = if !args.leader_election_namespace.is_empty() {
            args.leader_election_namespace.clone()
        } else {
            namespace.clone().unwrap_or_else(|| "kube-system".to_string())
        };
        let identity = std::env::var("POD_NAME")
            .unwrap_or_else(|_| format!("configmapsecret-controller-{}", std::process::id()));
        let lock = Arc::new(LeaseLock::new(
            client.clone(),
            &election_namespace,
            LEADER_ELECTION_LEASE,
            &identity,
            LEASE_DURATION,
        ));
        info!(namespace = %election_namespace, "Waiting for leader lease");
        lock.acquire().await?;
        tokio::spawn(async move {
            if let Err(e) = lock.hold().await {
                error!(error = %e, "Leader lease lost, shutting down");
                std::process::exit(1);
            }
        });
    }

    let (cms_api, secrets_api, config_maps_api): (
        Api<ConfigMapSecret>,
        Api<Secret>,
        Api<ConfigMap>,
    ) = match &namespace {
        Some(ns) => (
            Api::namespaced(client.clone(), ns),
            Api::namespaced(client.clone(), ns),
            Api::namespaced(client.clone(), ns),
        ),
        None => (
            Api::all(client.clone()),
            Api::all(client.clone()),
            Api::all(client.clone()),
        ),
    };

    let index = Arc::new(RwLock::new(RefIndex::default()));
    tokio::spawn(dispatch::track_owned_secrets(
        secrets_api.clone(),
        index.clone(),
    ));
    tokio::spawn(dispatch::track_sources(cms_api.clone(), index.clone()));

    let ctx = Arc::new(reconciler::Context::new(client, index.clone()));
    state.is_ready.store(true, Ordering::Relaxed);

    Controller::new(cms_api, watcher::Config::default())
        .watches(
            secrets_api,
            watcher::Config::default(),
            dispatch::secret_mapper(index.clone()),
        )
        .watches(
            config_maps_api,
            watcher::Config::default(),
            dispatch::config_map_mapper(index),
        )
        .shutdown_on_signal()
        .run(reconciler::reconcile, reconciler::error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!(configmapsecret = %obj, "Reconciled"),
                Err(err) => warn!(error = %err, "Reconcile error"),
            }
        })
        .await;

    info!("Controller stopped");
    Ok(())
}

fn current_namespace() -> Result<String> {
    let buf = std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE_PATH)?;
    Ok(buf.trim().to_string())
}
