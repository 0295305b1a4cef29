//! Credential Change Watcher
//!
//! Polls the credentials table and emits a [`CredentialChange`] for every
//! row that appeared, flipped its `active` flag, or disappeared since the
//! previous poll. The first poll only records a baseline; credentials that
//! exist at startup are picked up by the supervisor's initial activation.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::SqliteStore;
use crate::application::ports::StoreError;
use crate::domain::credential::{ChangeAction, CredentialChange, CredentialId};

/// Table poller producing credential change events.
#[derive(Debug)]
pub struct CredentialWatcher {
    store: SqliteStore,
    interval: Duration,
    snapshot: Option<HashMap<CredentialId, bool>>,
}

impl CredentialWatcher {
    /// Create a watcher polling every `interval`.
    #[must_use]
    pub const fn new(store: SqliteStore, interval: Duration) -> Self {
        Self {
            store,
            interval,
            snapshot: None,
        }
    }

    /// Record the current table contents as the baseline.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be read.
    pub async fn prime(&mut self) -> Result<(), StoreError> {
        self.snapshot = Some(self.read_table().await?);
        Ok(())
    }

    /// Diff the table against the previous poll.
    ///
    /// Returns no changes on the first call.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be read; the baseline is kept.
    pub async fn poll(&mut self) -> Result<Vec<CredentialChange>, StoreError> {
        let current = self.read_table().await?;
        let Some(previous) = self.snapshot.replace(current.clone()) else {
            return Ok(Vec::new());
        };
        Ok(diff(&previous, &current))
    }

    async fn read_table(&self) -> Result<HashMap<CredentialId, bool>, StoreError> {
        Ok(self
            .store
            .list_credentials()
            .await?
            .into_iter()
            .map(|c| (c.id(), c.is_active()))
            .collect())
    }

    /// Poll until `cancel` fires or the receiver goes away.
    pub async fn run(mut self, tx: mpsc::Sender<CredentialChange>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let changes = match self.poll().await {
                Ok(changes) => changes,
                Err(e) => {
                    tracing::warn!(error = %e, "Credential poll failed");
                    continue;
                }
            };

            for change in changes {
                tracing::debug!(
                    credential_id = %change.credential_id,
                    action = ?change.action,
                    active = change.active,
                    "Credential changed"
                );
                if tx.send(change).await.is_err() {
                    tracing::debug!("Change receiver closed, stopping watcher");
                    return;
                }
            }
        }

        tracing::debug!("Credential watcher stopped");
    }
}

fn diff(
    previous: &HashMap<CredentialId, bool>,
    current: &HashMap<CredentialId, bool>,
) -> Vec<CredentialChange> {
    let mut changes: Vec<_> = current
        .iter()
        .filter_map(|(&id, &active)| match previous.get(&id) {
            None => Some(CredentialChange::new(ChangeAction::Insert, id, active)),
            Some(&was) if was != active => {
                Some(CredentialChange::new(ChangeAction::Update, id, active))
            }
            Some(_) => None,
        })
        .chain(
            previous
                .keys()
                .filter(|id| !current.contains_key(id))
                .map(|&id| CredentialChange::new(ChangeAction::Delete, id, false)),
        )
        .collect();
    changes.sort_by_key(|c| c.credential_id);
    changes
}
