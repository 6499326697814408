//! Integration tests for moving a list between encryption configurations.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, watch};

use tasklane::confirm::{ConfirmError, ConfirmationGate, IdentityConfirmer};
use tasklane::identity::Identity;
use tasklane::migrate::{MigrationError, migrate};
use tasklane::registry::{RegistryError, RegistrySession, RegistrySettings};
use tasklane::store::memory::{MemoryLog, MemoryProvider};
use tasklane::store::{
    DbAddress, LogProvider, LogStore, OpenRequest, StoreChange, StoreError,
};
use tasklane::tasks::{NewTask, TaskService, reduce};
use tasklane_proto::entry::LogEntry;
use tasklane_proto::registry::{EncryptionConfig, ROOT_LIST_NAME};

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

struct AlwaysConfirm;

impl IdentityConfirmer for AlwaysConfirm {
    async fn confirm(&self, _identity_id: &str) -> Result<(), ConfirmError> {
        Ok(())
    }
}

/// Wraps a [`MemoryProvider`], failing chosen writes.
#[derive(Clone)]
struct FlakyProvider {
    inner: MemoryProvider,
    /// Key whose copy into a migration destination fails.
    poisoned_key: Option<String>,
    /// Makes every registry write fail while set.
    registry_down: Arc<AtomicBool>,
}

impl FlakyProvider {
    fn new(inner: MemoryProvider) -> Self {
        Self {
            inner,
            poisoned_key: None,
            registry_down: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl LogProvider for FlakyProvider {
    type Store = FlakyLog;

    async fn open(&self, request: OpenRequest) -> Result<FlakyLog, StoreError> {
        let inner = self.inner.open(request).await?;
        Ok(FlakyLog {
            inner,
            poisoned_key: self.poisoned_key.clone(),
            registry_down: Arc::clone(&self.registry_down),
        })
    }
}

struct FlakyLog {
    inner: MemoryLog,
    poisoned_key: Option<String>,
    registry_down: Arc<AtomicBool>,
}

impl LogStore for FlakyLog {
    fn db_name(&self) -> &str {
        self.inner.db_name()
    }

    fn address(&self) -> &DbAddress {
        self.inner.address()
    }

    fn encryption(&self) -> &EncryptionConfig {
        self.inner.encryption()
    }

    async fn put(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
        if self.db_name().ends_with("_registry") && self.registry_down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("registry replica offline".to_string()));
        }
        if self.db_name().contains("_enc-") && self.poisoned_key.as_deref() == Some(key) {
            return Err(StoreError::WriteFailed(format!("{key} rejected by replica")));
        }
        self.inner.put(key, value).await
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }

    async fn list_all(&self) -> Result<Vec<LogEntry>, StoreError> {
        self.inner.list_all().await
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.inner.subscribe()
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.inner.close().await
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn session<P: LogProvider>(provider: P, identity: &str) -> RegistrySession<P> {
    let (_tx, rx) = watch::channel(Some(Identity::new(identity)));
    RegistrySession::new(Arc::new(provider), rx, RegistrySettings::default())
}

fn encrypted() -> EncryptionConfig {
    EncryptionConfig::encrypted("stub-xor")
}

/// Creates "groceries" with two tasks, one of them delegated to bob and
/// completed by him.
async fn seeded_groceries(provider: &MemoryProvider, registry: &RegistrySession<MemoryProvider>) {
    let list = registry.resolve("groceries", Some(ROOT_LIST_NAME)).await.unwrap();
    let gate = Arc::new(ConfirmationGate::new(AlwaysConfirm, Duration::from_secs(1)));
    let alice = TaskService::new(Arc::clone(&list.store), Identity::new("alice"), Arc::clone(&gate));
    let milk = alice.add_task(NewTask::text("Buy milk")).await.unwrap();
    alice.add_task(NewTask::text("Buy bread")).await.unwrap();
    alice
        .grant_delegation(&milk.key, "bob", None)
        .await
        .unwrap();

    let bob_log = provider
        .open(OpenRequest::by_address(list.address().clone(), "bob"))
        .await
        .unwrap();
    let bob = TaskService::new(Arc::new(bob_log), Identity::new("bob"), gate);
    bob.refresh().await.unwrap();
    bob.toggle_task(&milk.key).await.unwrap();
}

// ===========================================================================
// Successful migrations
// ===========================================================================

#[tokio::test]
async fn plaintext_to_encrypted_preserves_every_entry() {
    let provider = MemoryProvider::new();
    let registry = session(provider.clone(), "alice");
    seeded_groceries(&provider, &registry).await;

    let source = registry.resolve("groceries", None).await.unwrap();
    let before = source.store.list_all().await.unwrap();
    assert_eq!(before.len(), 3);
    let stored_before = provider.raw_entries(source.address()).unwrap();

    let report = migrate(&registry, "groceries", &EncryptionConfig::plaintext(), &encrypted())
        .await
        .unwrap();
    assert_eq!(report.copied, 3);
    assert!(!report.is_partial());
    assert!(report.db_name.starts_with("alice_groceries_enc-"));
    assert_eq!(report.encryption, encrypted());

    // The registry now points at the new database.
    let record = registry.find("groceries").unwrap();
    assert_eq!(record.entry.db_name, report.db_name);
    assert_eq!(record.entry.encryption(), encrypted());
    assert_eq!(record.entry.parent.as_deref(), Some(ROOT_LIST_NAME));

    // Same reduced view on both sides.
    let reopened = registry.resolve("groceries", None).await.unwrap();
    assert_eq!(reopened.address(), &report.address);
    let after = reopened.store.list_all().await.unwrap();
    let now = Utc::now();
    assert_eq!(reduce(&before, now), reduce(&after, now));
    assert!(reduce(&after, now).iter().any(|t| t.text == "Buy milk" && t.completed));

    // Stored bytes are ciphertext.
    let raw = provider.raw_entries(&report.address).unwrap();
    assert_eq!(raw.len(), 3);
    assert!(
        raw.iter()
            .all(|(_, bytes)| !String::from_utf8_lossy(bytes).contains("Buy"))
    );

    // The source was only read, down to its stored bytes.
    assert_eq!(provider.raw_entries(source.address()).unwrap(), stored_before);
    assert_eq!(source.store.list_all().await.unwrap(), before);
}

#[tokio::test]
async fn encrypted_database_refuses_plaintext_open() {
    let provider = MemoryProvider::new();
    let registry = session(provider.clone(), "alice");
    seeded_groceries(&provider, &registry).await;
    let report = migrate(&registry, "groceries", &EncryptionConfig::plaintext(), &encrypted())
        .await
        .unwrap();

    let err = provider
        .open(OpenRequest::by_address(report.address.clone(), "alice"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, StoreError::EncryptionMismatch { .. }));
}

#[tokio::test]
async fn migrating_back_creates_a_fresh_plaintext_database() {
    let provider = MemoryProvider::new();
    let registry = session(provider.clone(), "alice");
    seeded_groceries(&provider, &registry).await;

    let there = migrate(&registry, "groceries", &EncryptionConfig::plaintext(), &encrypted())
        .await
        .unwrap();
    let back = migrate(&registry, "groceries", &encrypted(), &EncryptionConfig::plaintext())
        .await
        .unwrap();
    assert_eq!(back.source_db_name, there.db_name);
    assert!(back.db_name.starts_with("alice_groceries_plain-"));
    assert_ne!(back.address, there.address);
    assert_eq!(back.copied, 3);
    assert!(!registry.find("groceries").unwrap().entry.encryption_enabled);
}

// ===========================================================================
// Rejections
// ===========================================================================

#[tokio::test]
async fn only_the_owner_may_migrate() {
    let provider = MemoryProvider::new();
    let alice = session(provider.clone(), "alice");
    seeded_groceries(&provider, &alice).await;
    let address = alice.find("groceries").unwrap().entry.address;

    let bob = session(provider.clone(), "bob");
    bob.add_to_registry(
        "groceries",
        "alice_groceries",
        address.as_deref(),
        Some(ROOT_LIST_NAME),
        &EncryptionConfig::plaintext(),
    )
    .await
    .unwrap();
    let before = provider.database_names();

    assert!(matches!(
        migrate(&bob, "groceries", &EncryptionConfig::plaintext(), &encrypted()).await,
        Err(MigrationError::NotOwner { .. })
    ));
    assert_eq!(provider.database_names(), before);
}

#[tokio::test]
async fn wrong_source_configuration_is_rejected() {
    let provider = MemoryProvider::new();
    let registry = session(provider.clone(), "alice");
    seeded_groceries(&provider, &registry).await;
    assert!(matches!(
        migrate(&registry, "groceries", &encrypted(), &EncryptionConfig::plaintext()).await,
        Err(MigrationError::SourceMismatch { .. })
    ));
    assert!(!registry.find("groceries").unwrap().entry.encryption_enabled);
}

#[tokio::test]
async fn identity_that_cannot_own_lists_is_refused() {
    let provider = MemoryProvider::new();
    let registry = session(provider.clone(), "alice_w");

    assert!(matches!(
        registry.resolve("groceries", Some(ROOT_LIST_NAME)).await,
        Err(RegistryError::InvalidIdentity(id)) if id == "alice_w"
    ));
    assert!(matches!(
        migrate(&registry, "groceries", &EncryptionConfig::plaintext(), &encrypted()).await,
        Err(MigrationError::Registry(RegistryError::InvalidIdentity(_)))
    ));
    assert!(provider.database_names().is_empty());
}

#[tokio::test]
async fn unsupported_method_creates_nothing() {
    let provider = MemoryProvider::new();
    let registry = session(provider.clone(), "alice");
    seeded_groceries(&provider, &registry).await;
    let before = provider.database_names();

    let err = migrate(
        &registry,
        "groceries",
        &EncryptionConfig::plaintext(),
        &EncryptionConfig::encrypted("aes-gcm"),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, MigrationError::CreateDestination(StoreError::Unavailable(_))));
    assert_eq!(provider.database_names(), before);
    assert_eq!(registry.find("groceries").unwrap().entry.db_name, "alice_groceries");
}

// ===========================================================================
// Failures
// ===========================================================================

#[tokio::test]
async fn failed_copies_are_reported() {
    let memory = MemoryProvider::new();
    let mut flaky = FlakyProvider::new(memory.clone());
    flaky.poisoned_key = Some("task_1714564800000_poison00".to_string());
    let registry = session(flaky, "alice");

    let list = registry.resolve("groceries", Some(ROOT_LIST_NAME)).await.unwrap();
    for (key, text) in [
        ("task_1714564800000_poison00", "Buy milk"),
        ("task_1714564900000_fine0000", "Buy bread"),
    ] {
        list.store
            .put(
                key,
                serde_json::json!({"text": text, "createdAt": "2024-05-01T12:00:00Z", "createdByIdentity": "alice"}),
            )
            .await
            .unwrap();
    }

    let report = migrate(&registry, "groceries", &EncryptionConfig::plaintext(), &encrypted())
        .await
        .unwrap();
    assert!(report.is_partial());
    assert_eq!(report.copied, 1);
    assert_eq!(report.total(), 2);
    assert_eq!(report.failed_keys, vec!["task_1714564800000_poison00".to_string()]);
    assert_eq!(registry.find("groceries").unwrap().entry.db_name, report.db_name);
}

#[tokio::test]
async fn failed_repoint_leaves_source_authoritative() {
    let memory = MemoryProvider::new();
    let flaky = FlakyProvider::new(memory.clone());
    let registry_down = Arc::clone(&flaky.registry_down);
    let registry = session(flaky, "alice");

    let list = registry.resolve("groceries", Some(ROOT_LIST_NAME)).await.unwrap();
    list.store
        .put(
            "task_1714564800000_abcd1234",
            serde_json::json!({"text": "Buy milk", "createdAt": "2024-05-01T12:00:00Z", "createdByIdentity": "alice"}),
        )
        .await
        .unwrap();

    registry_down.store(true, Ordering::SeqCst);
    let err = migrate(&registry, "groceries", &EncryptionConfig::plaintext(), &encrypted())
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Repoint(_)));
    registry_down.store(false, Ordering::SeqCst);

    // The registry still names the source, and the source is intact.
    let record = registry.find("groceries").unwrap();
    assert_eq!(record.entry.db_name, "alice_groceries");
    assert!(!record.entry.encryption_enabled);
    let again = registry.resolve("groceries", None).await.unwrap();
    assert_eq!(again.address(), list.address());
    assert_eq!(again.store.list_all().await.unwrap().len(), 1);

    // The destination exists but nothing refers to it.
    assert!(
        memory
            .database_names()
            .iter()
            .any(|n| n.starts_with("alice_groceries_enc-"))
    );
}
