//! # Initialization
//!
//! Process setup: rustls provider, tracing, metrics, the probe server and the
//! Kubernetes client the reconcilers share.

use crate::config::{load_config, ServerConfig};
use crate::controller::{Context as ReconcileContext, KubeStore, ResourceStore};
use crate::observability;
use crate::osb::{HttpOsbClientFactory, OsbClientFactory};
use crate::server::{start_server, ServerState};
use anyhow::{anyhow, Context, Result};
use kube::Client;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Everything the watch loop needs to start the controllers
pub struct InitializationResult {
    pub client: Client,
    pub context: Arc<ReconcileContext>,
    pub server_state: Arc<ServerState>,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("context", &self.context)
            .field("server_state", &self.server_state)
            .finish_non_exhaustive()
    }
}

pub async fn initialize() -> Result<InitializationResult> {
    // Required by rustls 0.23 before any TLS client is built
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|existing| anyhow!("a rustls crypto provider was already installed: {existing:?}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "service_catalog_controller=info".into()),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting service catalog controller"
    );

    let (controller_config, server_config) = load_config();
    info!(?controller_config, ?server_config, "configuration loaded");

    observability::metrics::register_metrics().context("failed to register metrics")?;

    let server_state = Arc::new(ServerState::default());
    let server_handle = {
        let state = Arc::clone(&server_state);
        let port = server_config.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = start_server(port, state).await {
                error!("HTTP server error: {e}");
            }
        })
    };
    wait_for_server_ready(&server_config, &server_state, &server_handle).await?;

    let client = Client::try_default()
        .await
        .context("failed to build Kubernetes client")?;

    let store: Arc<dyn ResourceStore> = Arc::new(KubeStore::new(client.clone()));
    let osb_factory: Arc<dyn OsbClientFactory> =
        Arc::new(HttpOsbClientFactory::new(&controller_config));
    let context = Arc::new(ReconcileContext::new(store, osb_factory, controller_config));

    info!("controller initialized, starting watch loops");
    Ok(InitializationResult {
        client,
        context,
        server_state,
    })
}

/// Poll until the server has bound its listener, failing if the task died
/// or the startup timeout passed
async fn wait_for_server_ready(
    config: &ServerConfig,
    server_state: &ServerState,
    server_handle: &tokio::task::JoinHandle<()>,
) -> Result<()> {
    let startup_timeout = Duration::from_secs(config.startup_timeout_secs);
    let poll_interval = Duration::from_millis(config.poll_interval_ms);
    let start = Instant::now();

    loop {
        if server_handle.is_finished() {
            return Err(anyhow!("HTTP server failed to start"));
        }
        if server_state.is_listening.load(Ordering::Relaxed) {
            info!("HTTP server is accepting connections");
            return Ok(());
        }
        if start.elapsed() > startup_timeout {
            return Err(anyhow!(
                "HTTP server failed to become ready within {} seconds",
                startup_timeout.as_secs()
            ));
        }
        tokio::time::sleep(poll_interval).await;
    }
}
