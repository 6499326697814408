//! Moves a list to a new database with a different encryption setting.
//!
//! The source database is only ever read. Entries are copied into a fresh
//! destination, then the registry entry is repointed at it. Until the
//! repoint succeeds, every reader keeps using the source. A failure
//! after the destination was created leaves it orphaned and unreferenced,
//! with the source still authoritative.

use chrono::Utc;
use thiserror::Error;

use tasklane_proto::registry::EncryptionConfig;

use crate::registry::{RegistryError, RegistrySession};
use crate::store::{
    AccessController, DbAddress, LogProvider, LogStore, OpenRequest, StoreError,
};
use crate::tasks::random_suffix;

/// Errors that stop a migration.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The identity has not been established yet.
    #[error("identity not ready")]
    IdentityNotReady,
    /// No list is registered under the name.
    #[error("list not found: {0}")]
    ListNotFound(String),
    /// Only the owner may migrate a list.
    #[error("{identity} does not own {list}")]
    NotOwner {
        /// Requesting identity.
        identity: String,
        /// List display name.
        list: String,
    },
    /// Source and target configurations are the same.
    #[error("list already uses {0}")]
    SameConfiguration(EncryptionConfig),
    /// The registry records a different source configuration.
    #[error("list is stored as {actual}, not {expected}")]
    SourceMismatch {
        /// Configuration the caller expected.
        expected: EncryptionConfig,
        /// Configuration the registry records.
        actual: EncryptionConfig,
    },
    /// Reading the source failed. Nothing was written.
    #[error("failed to read source: {0}")]
    ReadSource(#[source] StoreError),
    /// Creating the destination failed. Nothing was written.
    #[error("failed to create destination: {0}")]
    CreateDestination(#[source] StoreError),
    /// Repointing the registry failed. The destination is orphaned.
    #[error("failed to repoint registry entry: {0}")]
    Repoint(#[source] RegistryError),
    /// Another registry failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Outcome of a completed migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// Display name of the list.
    pub display_name: String,
    /// Database the list was read from.
    pub source_db_name: String,
    /// Database the list now lives in.
    pub db_name: String,
    /// Address of the new database.
    pub address: DbAddress,
    /// New configuration.
    pub encryption: EncryptionConfig,
    /// Entries copied.
    pub copied: usize,
    /// Keys that failed to copy.
    pub failed_keys: Vec<String>,
}

impl MigrationReport {
    /// Returns `true` if some entries did not make it across.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.failed_keys.is_empty()
    }

    /// Entries in the source snapshot.
    #[must_use]
    pub fn total(&self) -> usize {
        self.copied + self.failed_keys.len()
    }
}

/// Name tag for a configuration, used in destination names.
#[must_use]
pub const fn encryption_tag(encryption: &EncryptionConfig) -> &'static str {
    if encryption.enabled { "enc" } else { "plain" }
}

/// Migrates the list registered as `display_name` from `from` to `to`.
///
/// # Errors
///
/// Returns a [`MigrationError`] describing the step that failed. Errors
/// before the repoint leave the registry and the source untouched.
pub async fn migrate<P: LogProvider>(
    session: &RegistrySession<P>,
    display_name: &str,
    from: &EncryptionConfig,
    to: &EncryptionConfig,
) -> Result<MigrationReport, MigrationError> {
    let identity = session
        .identity()
        .ok_or(MigrationError::IdentityNotReady)?
        .id;
    if from == to {
        return Err(MigrationError::SameConfiguration(to.clone()));
    }

    session.refresh().await.map_err(|e| match e {
        RegistryError::IdentityNotReady => MigrationError::IdentityNotReady,
        other => MigrationError::Registry(other),
    })?;
    let record = session
        .find(display_name)
        .ok_or_else(|| MigrationError::ListNotFound(display_name.to_string()))?;
    let owner = record
        .owner
        .clone()
        .filter(|o| o.is_owned_by(&identity))
        .ok_or_else(|| MigrationError::NotOwner {
            identity: identity.clone(),
            list: display_name.to_string(),
        })?;
    let recorded = record.entry.encryption();
    if recorded.enabled != from.enabled {
        return Err(MigrationError::SourceMismatch {
            expected: from.clone(),
            actual: recorded,
        });
    }

    // 1. Snapshot the source.
    let source_request = match &record.entry.address {
        Some(address) => OpenRequest::by_address(DbAddress::new(address.clone()), &identity),
        None => OpenRequest::by_name(record.entry.db_name.clone(), &identity),
    }
    .encryption(from.clone());
    let source = session
        .provider()
        .open(source_request)
        .await
        .map_err(MigrationError::ReadSource)?;
    let snapshot = source.list_all().await.map_err(MigrationError::ReadSource)?;

    // 2. Release the source; it is never written.
    if let Err(e) = source.close().await {
        tracing::debug!(error = %e, "closing migration source failed");
    }

    // 3-4. Fresh destination.
    let db_name = owner.suffixed_db_name(&format!(
        "{}-{}-{}",
        encryption_tag(to),
        Utc::now().timestamp_millis(),
        random_suffix()
    ));
    let destination = session
        .provider()
        .open(
            OpenRequest::by_name(db_name.clone(), &identity)
                .create()
                .encryption(to.clone())
                .access(AccessController::task_list(&identity)),
        )
        .await
        .map_err(MigrationError::CreateDestination)?;
    let address = destination.address().clone();

    // 5. Copy.
    let mut copied = 0;
    let mut failed_keys = Vec::new();
    for entry in snapshot {
        match destination.put(&entry.key, entry.value).await {
            Ok(()) => copied += 1,
            Err(e) => {
                tracing::warn!(list = %display_name, key = %entry.key, error = %e, "failed to copy entry");
                failed_keys.push(entry.key);
            }
        }
    }

    // 6. Repoint.
    let repointed = session
        .update_entry(display_name, |entry| {
            entry.db_name.clone_from(&db_name);
            entry.address = Some(address.as_str().to_string());
            entry.set_encryption(to);
        })
        .await;

    // 7. Release the destination.
    if let Err(e) = destination.close().await {
        tracing::debug!(error = %e, "closing migration destination failed");
    }

    if let Err(e) = repointed {
        tracing::error!(list = %display_name, orphan = %db_name, error = %e, "registry repoint failed, destination left orphaned");
        return Err(MigrationError::Repoint(e));
    }

    let report = MigrationReport {
        display_name: display_name.to_string(),
        source_db_name: record.entry.db_name,
        db_name,
        address,
        encryption: to.clone(),
        copied,
        failed_keys,
    };
    if report.is_partial() {
        tracing::warn!(
            list = %display_name,
            copied = report.copied,
            failed = report.failed_keys.len(),
            "migration finished with missing entries"
        );
    } else {
        tracing::info!(list = %display_name, db = %report.db_name, copied = report.copied, "migration finished");
    }
    Ok(report)
}
