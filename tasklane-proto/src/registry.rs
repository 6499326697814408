//! Registry records: the per-identity directory of lists.
//!
//! Each identity owns one registry log. Entries are keyed by the list's
//! display name and point at the list's database by name and, once known,
//! by content-derived address.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Display name of the root list every registry contains.
pub const ROOT_LIST_NAME: &str = "projects";

/// Separator between the owner identity and the rest of a database name.
pub const DB_NAME_SEPARATOR: char = '_';

/// Encryption settings of a list database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionConfig {
    /// Whether entries are encrypted at rest.
    pub enabled: bool,
    /// Cipher name understood by the log store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

impl EncryptionConfig {
    /// Plaintext storage.
    #[must_use]
    pub const fn plaintext() -> Self {
        Self {
            enabled: false,
            method: None,
        }
    }

    /// Encrypted storage using `method`.
    #[must_use]
    pub fn encrypted(method: impl Into<String>) -> Self {
        Self {
            enabled: true,
            method: Some(method.into()),
        }
    }
}

impl std::fmt::Display for EncryptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.enabled, &self.method) {
            (false, _) => write!(f, "plaintext"),
            (true, Some(method)) => write!(f, "encrypted ({method})"),
            (true, None) => write!(f, "encrypted"),
        }
    }
}

/// One registry entry, stored under the list's display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    /// Database name, `<owner identity>_<display name>[_<suffix>]`.
    pub db_name: String,
    /// Content-derived database address, once discovered.
    #[serde(default)]
    pub address: Option<String>,
    /// Display name of the parent list. `None` for the root.
    #[serde(default)]
    pub parent: Option<String>,
    /// Whether the database is encrypted.
    #[serde(default)]
    pub encryption_enabled: bool,
    /// Cipher name, when encrypted.
    #[serde(default)]
    pub encryption_method: Option<String>,
    /// When the entry was first registered.
    pub created_at: DateTime<Utc>,
}

impl RegistryEntry {
    /// Encryption settings recorded for the database.
    #[must_use]
    pub fn encryption(&self) -> EncryptionConfig {
        EncryptionConfig {
            enabled: self.encryption_enabled,
            method: self.encryption_method.clone(),
        }
    }

    /// Overwrites the recorded encryption settings.
    pub fn set_encryption(&mut self, encryption: &EncryptionConfig) {
        self.encryption_enabled = encryption.enabled;
        self.encryption_method.clone_from(&encryption.method);
    }
}

/// Structured owner locator for a list.
///
/// Built once where a database name enters the system and carried from
/// then on. Identity ids must not contain [`DB_NAME_SEPARATOR`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListAddress {
    /// Identity that owns the list database.
    pub identity_id: String,
    /// Display name of the list.
    pub display_name: String,
}

impl ListAddress {
    /// Creates a list address.
    #[must_use]
    pub fn new(identity_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            identity_id: identity_id.into(),
            display_name: display_name.into(),
        }
    }

    /// Builds the address of a registry entry stored under `display_name`.
    ///
    /// The owner is the identity prefix of the entry's database name.
    /// Returns `None` if the database name carries no prefix.
    #[must_use]
    pub fn from_entry(display_name: &str, entry: &RegistryEntry) -> Option<Self> {
        let (identity_id, rest) = entry.db_name.split_once(DB_NAME_SEPARATOR)?;
        if identity_id.is_empty() || rest.is_empty() {
            return None;
        }
        Some(Self::new(identity_id, display_name))
    }

    /// Deterministic database name: `<identity>_<display name>`.
    #[must_use]
    pub fn db_name(&self) -> String {
        format!("{}{DB_NAME_SEPARATOR}{}", self.identity_id, self.display_name)
    }

    /// Database name with an extra suffix, used for migration targets.
    #[must_use]
    pub fn suffixed_db_name(&self, suffix: &str) -> String {
        format!("{}{DB_NAME_SEPARATOR}{suffix}", self.db_name())
    }

    /// Returns `true` if `identity_id` owns the list.
    #[must_use]
    pub fn is_owned_by(&self, identity_id: &str) -> bool {
        self.identity_id == identity_id
    }
}

impl std::fmt::Display for ListAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.identity_id, self.display_name)
    }
}

/// Name of the registry database owned by `identity_id`.
#[must_use]
pub fn registry_db_name(identity_id: &str) -> String {
    format!("{identity_id}{DB_NAME_SEPARATOR}registry")
}
