//! Identity provider contract.
//!
//! The identity system is an external collaborator. It owns a stable id
//! and can sign and verify bytes. The current identity is published on a
//! `watch` channel so components can tell "not ready yet" apart from
//! "ready" without polling.

use std::future::Future;

use tokio::sync::watch;

/// Errors that can occur in the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    /// No identity has been established yet.
    #[error("identity not initialized")]
    NotInitialized,

    /// The user dismissed the signing prompt.
    #[error("signing cancelled")]
    Cancelled,

    /// Signing failed for another reason.
    #[error("signing failed: {0}")]
    SigningFailed(String),
}

/// The local identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    /// Stable id. Used as the owner prefix of database names, so it never
    /// contains `_`.
    pub id: String,
    /// Human-readable name recorded as `createdBy` on new tasks.
    pub display_name: String,
}

impl Identity {
    /// Creates an identity whose display name is its id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }
}

/// Receiver side of the identity readiness signal.
pub type IdentityWatch = watch::Receiver<Option<Identity>>;

/// Signs and verifies on behalf of the current identity.
pub trait IdentityProvider: Send + Sync {
    /// The current identity, if one is established.
    fn current_identity(&self) -> Option<Identity>;

    /// Signs `data` with the current identity's key.
    fn sign(&self, data: &[u8]) -> impl Future<Output = Result<Vec<u8>, IdentityError>> + Send;

    /// Verifies `signature` over `data` against the current identity.
    fn verify(
        &self,
        signature: &[u8],
        data: &[u8],
    ) -> impl Future<Output = Result<bool, IdentityError>> + Send;
}

/// Returns `true` if `id` can be used as a database-name owner prefix.
#[must_use]
pub fn is_valid_identity_id(id: &str) -> bool {
    !id.is_empty()
        && !id.contains(tasklane_proto::registry::DB_NAME_SEPARATOR)
        && !id.contains('/')
        && !id.chars().any(char::is_whitespace)
}
