//! Credential Types
//!
//! A credential is a provider API token plus a numeric identity and an
//! `active` flag. The streaming core never mutates credentials; it only
//! observes changes to `active` through [`CredentialChange`] notifications.
//!
//! # Change Notifications
//!
//! Notifications use the wire shape emitted by the credential store:
//!
//! ```json
//! {"action": "UPDATE", "token_id": 7, "active": false}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// Identity
// =============================================================================

/// Numeric identity of a stored credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialId(i64);

impl CredentialId {
    /// Wrap a raw store id.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Raw store id.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Credential
// =============================================================================

/// Provider API token with its store identity.
///
/// `Debug` redacts the token so a credential can be logged safely.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    id: CredentialId,
    token: String,
    active: bool,
}

impl Credential {
    /// Create a credential.
    #[must_use]
    pub fn new(id: CredentialId, token: impl Into<String>, active: bool) -> Self {
        Self {
            id,
            token: token.into(),
            active,
        }
    }

    /// Store identity.
    #[must_use]
    pub const fn id(&self) -> CredentialId {
        self.id
    }

    /// Raw bearer token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Whether the credential should currently be streaming.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("token", &"[REDACTED]")
            .field("active", &self.active)
            .finish()
    }
}

// =============================================================================
// Change Notifications
// =============================================================================

/// Kind of change applied to a credential record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeAction {
    /// A credential was created.
    Insert,
    /// A credential was modified.
    Update,
    /// A credential was removed.
    Delete,
}

/// What the supervisor should do in response to a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesiredState {
    /// Start streaming for the credential (idempotent).
    Activate,
    /// Stop streaming for the credential (idempotent).
    Deactivate,
}

/// A single credential change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialChange {
    /// What happened to the record.
    pub action: ChangeAction,
    /// Which credential changed.
    #[serde(rename = "token_id", alias = "credential_id")]
    pub credential_id: CredentialId,
    /// The record's `active` flag after the change.
    pub active: bool,
}

impl CredentialChange {
    /// Create a change notification.
    #[must_use]
    pub const fn new(action: ChangeAction, credential_id: CredentialId, active: bool) -> Self {
        Self {
            action,
            credential_id,
            active,
        }
    }

    /// Map the change to the supervisor action it requires.
    ///
    /// Deletions always deactivate, regardless of the reported flag.
    #[must_use]
    pub const fn desired_state(&self) -> DesiredState {
        match self.action {
            ChangeAction::Delete => DesiredState::Deactivate,
            ChangeAction::Insert | ChangeAction::Update if self.active => DesiredState::Activate,
            ChangeAction::Insert | ChangeAction::Update => DesiredState::Deactivate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_token() {
        let credential = Credential::new(CredentialId::new(3), "super-secret-token", true);
        let debug = format!("{credential:?}");
        assert!(!debug.contains("super-secret-token"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn change_parses_store_notification() {
        let change: CredentialChange =
            serde_json::from_str(r#"{"action":"UPDATE","token_id":7,"active":false}"#).unwrap();

        assert_eq!(change.action, ChangeAction::Update);
        assert_eq!(change.credential_id, CredentialId::new(7));
        assert!(!change.active);
    }

    #[test]
    fn change_accepts_credential_id_alias() {
        let change: CredentialChange =
            serde_json::from_str(r#"{"action":"INSERT","credential_id":1,"active":true}"#).unwrap();
        assert_eq!(change.credential_id.get(), 1);
    }

    #[test]
    fn desired_state_follows_active_flag() {
        let id = CredentialId::new(1);
        assert_eq!(
            CredentialChange::new(ChangeAction::Insert, id, true).desired_state(),
            DesiredState::Activate
        );
        assert_eq!(
            CredentialChange::new(ChangeAction::Update, id, false).desired_state(),
            DesiredState::Deactivate
        );
        assert_eq!(
            CredentialChange::new(ChangeAction::Delete, id, true).desired_state(),
            DesiredState::Deactivate
        );
    }
}
