use anyhow::{Context, Result};
use authstore::cleanup::AuthRequestJanitor;
use authstore::config::{load_config, secret_from_env, AuthStoreConfig, SECRET_ENV};
use authstore::vault::{AuthStore, MasterKey};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "authstore=info".into()),
        )
        .init();

    info!("Auth store starting...");

    let mut config = match std::env::var("AUTHSTORE_CONFIG") {
        Ok(path) => load_config(&path)?,
        Err(_) => AuthStoreConfig::default(),
    };
    config.apply_env();

    let key = {
        let secret = secret_from_env()?;
        MasterKey::derive(&secret)
            .with_context(|| format!("Failed to derive key from {}", SECRET_ENV))?
    };

    info!(
        path = %config.storage.path,
        lock_timeout_ms = config.storage.lock_timeout_ms,
        cleanup_enabled = config.cleanup.enabled,
        "Configuration loaded"
    );

    let store = AuthStore::open(&config.storage, &key).context("Failed to initialize auth store")?;
    info!("Auth store initialized");

    let shutdown = CancellationToken::new();
    let janitor = if config.cleanup.enabled {
        let janitor = AuthRequestJanitor::new(store.clone(), &config.cleanup);
        Some(tokio::spawn(janitor.run(shutdown.clone())))
    } else {
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    shutdown.cancel();
    if let Some(handle) = janitor {
        let _ = handle.await;
    }

    info!("Auth store stopped");
    Ok(())
}
