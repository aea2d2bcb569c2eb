use adtoken::oauth::run_state_purge;
use adtoken::{load_config, AdTokenConfig, TokenService};
use anyhow::{Context, Result};
use refresh_daemon::api::{create_router, ApiState};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const STATE_PURGE_INTERVAL_SECS: u64 = 60;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "refresh_daemon=info,adtoken=info".into()),
        )
        .init();

    info!("Refresh daemon starting...");

    let config_path =
        std::env::var("ADTOKEN_CONFIG").unwrap_or_else(|_| "adtoken.toml".to_string());
    let mut config = if Path::new(&config_path).exists() {
        load_config(&config_path)?
    } else {
        info!(path = %config_path, "No config file, using defaults");
        AdTokenConfig::default()
    };
    config.apply_env();

    let api_port = config.api.port;
    let refresh_enabled = config.refresh.enabled;

    info!(
        config = %config_path,
        store = %config.storage.path.display(),
        api_version = %config.issuer.api_version,
        api_port = api_port,
        refresh_enabled = refresh_enabled,
        "Configuration loaded"
    );

    let service = Arc::new(
        TokenService::from_config(config).context("Failed to initialize token service")?,
    );

    let scheduler_handle = if refresh_enabled {
        Some(service.scheduler().start())
    } else {
        info!("Background refresh disabled");
        None
    };

    tokio::spawn(run_state_purge(
        service.reauthorizer().states().clone(),
        STATE_PURGE_INTERVAL_SECS,
    ));

    // Start HTTP API server
    let router = create_router(ApiState {
        service: Arc::clone(&service),
    });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", api_port))
        .await
        .context("Failed to bind admin API port")?;
    info!(port = api_port, "Admin API listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "Admin API server error");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    server_handle.abort();
    service.scheduler().stop();
    if let Some(handle) = scheduler_handle {
        let _ = handle.await;
    }
    info!("Refresh daemon stopped");

    Ok(())
}
