//! Measurement retention.

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::SqliteStore;

/// Delete measurements older than `retention` once per `interval` until cancelled.
///
/// The first prune runs immediately.
pub async fn run_retention(
    store: SqliteStore,
    retention: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    let Ok(retention) = chrono::Duration::from_std(retention) else {
        tracing::warn!(?retention, "Retention window out of range, pruning disabled");
        return;
    };
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let cutoff = Utc::now() - retention;
        match store.prune_measurements(cutoff).await {
            Ok(removed) => tracing::info!(removed, %cutoff, "Pruned old measurements"),
            Err(e) => tracing::warn!(error = %e, "Measurement pruning failed"),
        }
    }
}
