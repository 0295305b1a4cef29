//! SQLite Store
//!
//! One connection behind a mutex, driven from `spawn_blocking` so callers on
//! the async runtime never block on disk I/O.
//!
//! # Schema
//!
//! - `credentials`: provider tokens with an `active` flag; tokens are unique
//! - `live_measurements`: one row per (home, sample time), the full record
//!   kept as JSON next to the headline columns

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use crate::application::ports::{CredentialStore, MeasurementSink, StoreError};
use crate::domain::credential::{Credential, CredentialId};
use crate::domain::telemetry::{DeviceId, TelemetryRecord};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS credentials (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    token       TEXT    NOT NULL UNIQUE,
    active      INTEGER NOT NULL DEFAULT 1,
    created_at  TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS live_measurements (
    home_id                  TEXT    NOT NULL,
    timestamp_ms             INTEGER NOT NULL,
    power                    REAL    NOT NULL,
    power_production         REAL    NOT NULL,
    accumulated_consumption  REAL    NOT NULL,
    accumulated_production   REAL    NOT NULL,
    payload                  TEXT    NOT NULL,
    PRIMARY KEY (home_id, timestamp_ms)
);
";

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database {
            message: err.to_string(),
        }
    }
}

/// SQLite-backed credential and measurement store.
///
/// Cloning is cheap; clones share the connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Worker {
            message: e.to_string(),
        })?
    }

    // =========================================================================
    // Credentials
    // =========================================================================

    /// Insert a token, or re-activate it if it already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the database rejects the write.
    pub async fn insert_credential(
        &self,
        token: impl Into<String>,
    ) -> Result<Credential, StoreError> {
        let token = token.into();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO credentials (token, active, created_at) VALUES (?1, 1, ?2)
                 ON CONFLICT(token) DO UPDATE SET active = 1",
                params![token, Utc::now()],
            )?;
            let id: i64 = conn.query_row(
                "SELECT id FROM credentials WHERE token = ?1",
                params![token],
                |row| row.get(0),
            )?;
            Ok(Credential::new(CredentialId::new(id), token, true))
        })
        .await
    }

    /// Flip the `active` flag. Returns `false` if the credential does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database rejects the write.
    pub async fn set_active(&self, id: CredentialId, active: bool) -> Result<bool, StoreError> {
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE credentials SET active = ?1 WHERE id = ?2",
                params![active, id.get()],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Remove a credential. Returns `false` if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database rejects the write.
    pub async fn delete_credential(&self, id: CredentialId) -> Result<bool, StoreError> {
        self.call(move |conn| {
            let changed = conn.execute("DELETE FROM credentials WHERE id = ?1", params![id.get()])?;
            Ok(changed > 0)
        })
        .await
    }

    /// Every credential, active or not, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_credentials(&self) -> Result<Vec<Credential>, StoreError> {
        self.call(|conn| {
            query_credentials(conn, "SELECT id, token, active FROM credentials ORDER BY id")
        })
        .await
    }

    // =========================================================================
    // Measurements
    // =========================================================================

    /// Most recent records for a device, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a stored payload is unreadable.
    pub async fn latest_measurements(
        &self,
        device: &DeviceId,
        limit: usize,
    ) -> Result<Vec<TelemetryRecord>, StoreError> {
        let device = device.as_str().to_owned();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT payload FROM live_measurements
                 WHERE home_id = ?1 ORDER BY timestamp_ms DESC LIMIT ?2",
            )?;
            let payloads = stmt
                .query_map(params![device, limit], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;

            payloads
                .iter()
                .map(|payload| {
                    serde_json::from_str(payload).map_err(|e| StoreError::Corrupt {
                        field: "payload",
                        message: e.to_string(),
                    })
                })
                .collect()
        })
        .await
    }

    /// Delete records sampled before `cutoff`. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database rejects the delete.
    pub async fn prune_measurements(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        self.call(move |conn| {
            let removed = conn.execute(
                "DELETE FROM live_measurements WHERE timestamp_ms < ?1",
                params![cutoff.timestamp_millis()],
            )?;
            Ok(removed)
        })
        .await
    }
}

fn query_credentials(conn: &Connection, sql: &str) -> Result<Vec<Credential>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(Credential::new(
                CredentialId::new(row.get(0)?),
                row.get::<_, String>(1)?,
                row.get(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[async_trait]
impl CredentialStore for SqliteStore {
    async fn list_active_credentials(&self) -> Result<Vec<Credential>, StoreError> {
        self.call(|conn| {
            query_credentials(
                conn,
                "SELECT id, token, active FROM credentials WHERE active = 1 ORDER BY id",
            )
        })
        .await
    }

    async fn get_credential(&self, id: CredentialId) -> Result<Option<Credential>, StoreError> {
        self.call(move |conn| {
            let credential = conn
                .query_row(
                    "SELECT id, token, active FROM credentials WHERE id = ?1",
                    params![id.get()],
                    |row| {
                        Ok(Credential::new(
                            CredentialId::new(row.get(0)?),
                            row.get::<_, String>(1)?,
                            row.get(2)?,
                        ))
                    },
                )
                .optional()?;
            Ok(credential)
        })
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.call(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl MeasurementSink for SqliteStore {
    async fn store(&self, device: &DeviceId, record: &TelemetryRecord) -> Result<(), StoreError> {
        let payload = serde_json::to_string(record).map_err(|e| StoreError::Corrupt {
            field: "payload",
            message: e.to_string(),
        })?;
        let device = device.as_str().to_owned();
        let record = record.clone();

        self.call(move |conn| {
            conn.execute(
                "INSERT INTO live_measurements (
                    home_id, timestamp_ms, power, power_production,
                    accumulated_consumption, accumulated_production, payload
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(home_id, timestamp_ms) DO UPDATE SET
                    power = excluded.power,
                    power_production = excluded.power_production,
                    accumulated_consumption = excluded.accumulated_consumption,
                    accumulated_production = excluded.accumulated_production,
                    payload = excluded.payload",
                params![
                    device,
                    record.timestamp.timestamp_millis(),
                    record.power,
                    record.power_production,
                    record.accumulated_consumption,
                    record.accumulated_production,
                    payload,
                ],
            )?;
            Ok(())
        })
        .await
    }
}
