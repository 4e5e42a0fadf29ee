//! Background purge of abandoned authorization requests.
//!
//! A login that never reaches its callback leaves its auth request behind.
//! The janitor deletes requests older than the configured TTL on a fixed
//! interval. It is owned by the binary, not by the store.

use crate::config::CleanupConfig;
use crate::error::StoreError;
use crate::vault::{AuthStore, CallContext};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Periodic auth-request purger.
pub struct AuthRequestJanitor {
    store: AuthStore,
    ttl: Duration,
    interval: Duration,
}

impl AuthRequestJanitor {
    pub fn new(store: AuthStore, config: &CleanupConfig) -> Self {
        Self {
            store,
            ttl: config.auth_request_ttl(),
            interval: config.interval(),
        }
    }

    /// Run the sweep loop until the cancellation token is triggered.
    ///
    /// ```rust,ignore
    /// tokio::spawn(janitor.run(shutdown.clone()));
    /// ```
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            ttl_secs = self.ttl.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Auth request janitor starting"
        );

        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled() => {
                    info!("Auth request janitor shutting down");
                    return;
                }
            }

            let ctx = CallContext::with_cancel(shutdown.child_token());
            match self.sweep(&ctx).await {
                Ok(0) => debug!("Auth request sweep complete, nothing expired"),
                Ok(removed) => info!(removed, "Purged expired auth requests"),
                Err(StoreError::Cancelled) => {}
                Err(e) => warn!(error = %e, "Auth request sweep failed"),
            }
        }
    }

    /// One sweep: delete every auth request older than the TTL.
    pub async fn sweep(&self, ctx: &CallContext) -> Result<usize, StoreError> {
        self.store.purge_auth_requests(ctx, self.ttl).await
    }
}
