//! Persistence Adapters
//!
//! SQLite-backed storage for credentials and live measurements:
//!
//! - `sqlite`: [`SqliteStore`], implementing the credential and measurement ports
//! - `watcher`: [`CredentialWatcher`], turning table changes into change events
//! - `retention`: periodic pruning of old measurements

mod retention;
mod sqlite;
mod watcher;

pub use retention::run_retention;
pub use sqlite::SqliteStore;
pub use watcher::CredentialWatcher;
