//! Swap Relayer - burn-to-mint token swaps through an m-of-n multisig
//!
//! Registers burns observed on the source chain, collects co-signer
//! signatures, broadcasts the multisig mint once quorum is reached and
//! confirms it against the destination chain.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod coordination;
mod error;
mod metrics;
mod state;
mod swap;

use chain::CliChainClient;
use config::{LoggingConfig, Settings};
use coordination::{CoordinationEngine, LocalSigner, SwapCoordinator};
use metrics::MetricsServer;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first so logging can honour it
    let settings = Settings::load()?;

    init_logging(&settings.logging);

    info!("Starting Swap Relayer v{}", env!("CARGO_PKG_VERSION"));
    info!(
        instance_id = %settings.relayer.instance_id,
        "Configured for a {}-of-n multisig at {}",
        settings.relayer.threshold,
        settings.chain_client.multisig_address
    );

    // Initialize swap state store
    let store = state::connect(&settings.database).await?;
    info!("Swap state store ready");

    // Initialize metrics server
    let metrics_server = if settings.metrics.enabled {
        Some(MetricsServer::new(settings.metrics.port))
    } else {
        None
    };

    let chain = Arc::new(CliChainClient::new(settings.chain_client.clone())?);

    let coordinator = Arc::new(SwapCoordinator::new(
        store.clone(),
        chain,
        &settings.relayer,
    ));

    let signer = LocalSigner::from_config(&settings.signer, &settings.chain_client.from_account);
    if let Some(signer) = &signer {
        info!("Co-signing enabled as {}", signer.user);
    }

    let coordination_engine = Arc::new(CoordinationEngine::new(
        coordinator.clone(),
        settings.relayer.clone(),
        signer,
    ));
    info!("Coordination engine initialized");

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = api::AppState {
            coordinator: coordinator.clone(),
            threshold: settings.relayer.threshold,
        };
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = metrics_server.map(|server| {
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    // Start coordination engine
    let coordination_handle = tokio::spawn({
        let engine = coordination_engine.clone();
        async move {
            if let Err(e) = engine.run().await {
                error!("Coordination engine error: {}", e);
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let store = store.clone();
        let interval = settings.relayer.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                match store.health_check().await {
                    Ok(()) => metrics::record_health_check(),
                    Err(e) => {
                        warn!("Store health check failed: {}", e);
                        metrics::record_health_check_failure();
                    }
                }
            }
        }
    });

    info!("Swap Relayer is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Let an in-flight pass finish before tearing down
    coordination_engine.stop().await;
    if tokio::time::timeout(settings.relayer.tool_timeout(), coordination_handle)
        .await
        .is_err()
    {
        warn!("Coordination engine did not stop in time");
    }

    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Swap Relayer stopped");
    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,swap_relayer=debug,sqlx=warn,hyper=warn"));

    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
