//! Integration tests for navigating lists through a `Workspace`.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use tasklane::confirm::{ConfirmError, ConfirmationGate, IdentityConfirmer};
use tasklane::identity::Identity;
use tasklane::registry::hierarchy::format_path;
use tasklane::registry::{RegistryError, RegistrySession, RegistrySettings};
use tasklane::store::LogStore;
use tasklane::store::memory::MemoryProvider;
use tasklane::tasks::NewTask;
use tasklane::workspace::{Workspace, WorkspaceError};
use tasklane_proto::registry::{EncryptionConfig, ROOT_LIST_NAME};

struct AlwaysConfirm;

impl IdentityConfirmer for AlwaysConfirm {
    async fn confirm(&self, _identity_id: &str) -> Result<(), ConfirmError> {
        Ok(())
    }
}

fn workspace(provider: &MemoryProvider, identity: &str) -> Workspace<MemoryProvider, AlwaysConfirm> {
    let (_tx, rx) = watch::channel(Some(Identity::new(identity)));
    let registry = Arc::new(RegistrySession::new(
        Arc::new(provider.clone()),
        rx,
        RegistrySettings::default(),
    ));
    let gate = Arc::new(ConfirmationGate::new(AlwaysConfirm, Duration::from_secs(1)));
    Workspace::new(registry, gate)
}

fn crumb(ws: &Workspace<MemoryProvider, AlwaysConfirm>) -> String {
    format_path(&ws.breadcrumb())
}

// ===========================================================================
// Navigation
// ===========================================================================

#[tokio::test]
async fn create_descend_and_climb() {
    let provider = MemoryProvider::new();
    let mut ws = workspace(&provider, "alice");

    ws.switch_list(ROOT_LIST_NAME).await.unwrap();
    assert_eq!(crumb(&ws), "projects");

    ws.create_sub_list("home").await.unwrap();
    ws.create_sub_list("groceries").await.unwrap();
    assert_eq!(crumb(&ws), "projects > home > groceries");
    assert_eq!(ws.current().unwrap().parent.as_deref(), Some("home"));

    let up = ws.navigate_up().await.unwrap();
    assert_eq!(up.name, "home");
    assert_eq!(crumb(&ws), "projects > home");

    ws.navigate_up().await.unwrap();
    assert_eq!(crumb(&ws), "projects");
    assert!(matches!(
        ws.navigate_up().await,
        Err(WorkspaceError::AtRoot(_))
    ));
}

#[tokio::test]
async fn switching_by_name_finds_nested_lists() {
    let provider = MemoryProvider::new();
    let mut ws = workspace(&provider, "alice");
    ws.switch_list(ROOT_LIST_NAME).await.unwrap();
    ws.create_sub_list("home").await.unwrap();
    ws.create_sub_list("groceries").await.unwrap();
    ws.switch_list(ROOT_LIST_NAME).await.unwrap();

    let open = ws.switch_list("groceries").await.unwrap();
    assert_eq!(open.parent.as_deref(), Some("home"));
    assert_eq!(crumb(&ws), "projects > home > groceries");
}

#[tokio::test]
async fn sub_list_names_are_unique_across_the_tree() {
    let provider = MemoryProvider::new();
    let mut ws = workspace(&provider, "alice");
    ws.switch_list(ROOT_LIST_NAME).await.unwrap();
    ws.create_sub_list("home").await.unwrap();
    ws.create_sub_list("errands").await.unwrap();
    ws.switch_list(ROOT_LIST_NAME).await.unwrap();
    ws.create_sub_list("work").await.unwrap();

    let err = ws.create_sub_list("errands").await.err().unwrap();
    assert!(matches!(
        err,
        WorkspaceError::Registry(RegistryError::DuplicateName { ref parent, .. }) if parent == "home"
    ));
    assert_eq!(ws.current().unwrap().name, "work");
}

#[tokio::test]
async fn tasks_live_with_their_list() {
    let provider = MemoryProvider::new();
    let mut ws = workspace(&provider, "alice");
    ws.switch_list("groceries").await.unwrap();
    ws.tasks()
        .unwrap()
        .add_task(NewTask::text("Buy milk"))
        .await
        .unwrap();

    ws.switch_list("chores").await.unwrap();
    assert!(ws.tasks().unwrap().tasks().is_empty());

    ws.switch_list("groceries").await.unwrap();
    let tasks = ws.tasks().unwrap().tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].text, "Buy milk");
}

// ===========================================================================
// Migration through the workspace
// ===========================================================================

#[tokio::test]
async fn migrate_reopens_the_list_on_its_new_database() {
    let provider = MemoryProvider::new();
    let mut ws = workspace(&provider, "alice");
    ws.switch_list("groceries").await.unwrap();
    let old_service = Arc::clone(ws.tasks().unwrap());
    old_service.add_task(NewTask::text("Buy milk")).await.unwrap();
    let old_address = old_service.store().address().clone();

    let report = ws
        .migrate_encryption(&EncryptionConfig::encrypted("stub-xor"))
        .await
        .unwrap();
    assert_eq!(report.copied, 1);

    let service = ws.tasks().unwrap();
    assert_eq!(service.store().address(), &report.address);
    assert_ne!(service.store().address(), &old_address);
    assert!(service.store().encryption().enabled);
    assert_eq!(service.tasks()[0].text, "Buy milk");

    // Writes land in the new database.
    service.add_task(NewTask::text("Buy bread")).await.unwrap();
    assert_eq!(provider.raw_entries(&report.address).unwrap().len(), 2);
    assert_eq!(provider.raw_entries(&old_address).unwrap().len(), 1);
}

#[tokio::test]
async fn migrating_to_the_current_configuration_is_rejected() {
    let provider = MemoryProvider::new();
    let mut ws = workspace(&provider, "alice");
    ws.switch_list("groceries").await.unwrap();
    assert!(matches!(
        ws.migrate_encryption(&EncryptionConfig::plaintext()).await,
        Err(WorkspaceError::Migration(_))
    ));
    assert!(!ws.tasks().unwrap().store().encryption().enabled);
}

// ===========================================================================
// Live updates and shutdown
// ===========================================================================

#[tokio::test]
async fn open_list_follows_writes_from_other_handles() {
    let provider = MemoryProvider::new();
    let mut ws = workspace(&provider, "alice");
    ws.switch_list("groceries").await.unwrap();
    let mut rx = ws.tasks().unwrap().subscribe();

    // A second session of the same identity writes to the list.
    let mut other = workspace(&provider, "alice");
    other.switch_list("groceries").await.unwrap();
    other
        .tasks()
        .unwrap()
        .add_task(NewTask::text("Buy milk"))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|tasks| tasks.len() == 1))
        .await
        .expect("open list did not refresh")
        .unwrap();
}

#[tokio::test]
async fn close_releases_everything() {
    let provider = MemoryProvider::new();
    let mut ws = workspace(&provider, "alice");
    ws.switch_list("groceries").await.unwrap();
    let service = Arc::clone(ws.tasks().unwrap());

    ws.close().await.unwrap();
    assert!(ws.current().is_none());
    assert!(ws.registry().cached_listing().is_empty());
    assert!(service.refresh().await.is_err());
}
