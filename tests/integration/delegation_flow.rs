//! Integration tests for delegated task writes.
//!
//! Two identities share one list database: the owner writes canonical
//! records, the delegate appends actions. Both run their own
//! `TaskService` over their own handle, with a shared stepping clock so
//! timestamps are deterministic.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use tasklane::confirm::{ConfirmError, ConfirmationGate, ConfirmationState, IdentityConfirmer};
use tasklane::identity::Identity;
use tasklane::store::memory::{MemoryLog, MemoryProvider};
use tasklane::store::{AccessController, LogProvider, LogStore, OpenRequest, StoreError};
use tasklane::tasks::manager::Clock;
use tasklane::tasks::{
    ErrorKind, NewTask, TaskError, TaskService, TaskUpdate, WriteAccess, WriteOutcome,
    reduce_detailed, write_access,
};
use tasklane_proto::action::{ACTION_KEY_PREFIX, ActionKey};

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

/// Clock that only moves when told to.
#[derive(Clone)]
struct Ticker(Arc<AtomicI64>);

impl Ticker {
    fn new() -> Self {
        Self(Arc::new(AtomicI64::new(1_714_564_800_000)))
    }

    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.0.load(Ordering::SeqCst)).unwrap()
    }

    fn advance_secs(&self, secs: i64) {
        self.0.fetch_add(secs * 1000, Ordering::SeqCst);
    }

    fn clock(&self) -> Clock {
        let ticker = self.clone();
        Arc::new(move || ticker.now())
    }
}

/// Confirms every gesture and counts them.
#[derive(Clone, Default)]
struct CountingConfirmer(Arc<AtomicUsize>);

impl IdentityConfirmer for CountingConfirmer {
    async fn confirm(&self, _identity_id: &str) -> Result<(), ConfirmError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Refuses every gesture.
struct RefusingConfirmer;

impl IdentityConfirmer for RefusingConfirmer {
    async fn confirm(&self, _identity_id: &str) -> Result<(), ConfirmError> {
        Err(ConfirmError::Cancelled)
    }
}

/// Lets the owner revoke the grant while the delegate's gesture is open.
struct RevokedMidGesture {
    owner: Arc<TaskService<MemoryLog, CountingConfirmer>>,
    task_key: String,
}

impl IdentityConfirmer for RevokedMidGesture {
    async fn confirm(&self, _identity_id: &str) -> Result<(), ConfirmError> {
        self.owner
            .revoke_delegation(&self.task_key)
            .await
            .map_err(|e| ConfirmError::Rejected(e.to_string()))?;
        Ok(())
    }
}

/// Confirms, but only after the shared clock moved past `lapse_secs`.
struct SlowConfirmer {
    ticker: Ticker,
    lapse_secs: i64,
}

impl IdentityConfirmer for SlowConfirmer {
    async fn confirm(&self, _identity_id: &str) -> Result<(), ConfirmError> {
        self.ticker.advance_secs(self.lapse_secs);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn owner_log(provider: &MemoryProvider) -> MemoryLog {
    provider
        .open(
            OpenRequest::by_name("alice_groceries", "alice")
                .create()
                .access(AccessController::task_list("alice")),
        )
        .await
        .unwrap()
}

async fn shared_log(provider: &MemoryProvider, identity: &str) -> MemoryLog {
    let address = provider.address_of("alice_groceries").unwrap();
    provider
        .open(OpenRequest::by_address(address, identity))
        .await
        .unwrap()
}

fn service<C: IdentityConfirmer>(
    log: MemoryLog,
    identity: &str,
    confirmer: C,
    ticker: &Ticker,
) -> TaskService<MemoryLog, C> {
    let gate = Arc::new(ConfirmationGate::new(confirmer, Duration::from_secs(5)));
    TaskService::new(Arc::new(log), Identity::new(identity), gate).with_clock(ticker.clock())
}

struct Fixture {
    provider: MemoryProvider,
    ticker: Ticker,
    alice: TaskService<MemoryLog, CountingConfirmer>,
    bob: TaskService<MemoryLog, CountingConfirmer>,
    bob_gestures: CountingConfirmer,
    task_key: String,
}

/// Alice creates "Buy milk" and delegates it to bob for an hour.
async fn delegated_fixture() -> Fixture {
    let provider = MemoryProvider::new();
    let ticker = Ticker::new();
    let alice = service(
        owner_log(&provider).await,
        "alice",
        CountingConfirmer::default(),
        &ticker,
    );
    let task = alice.add_task(NewTask::text("Buy milk")).await.unwrap();
    ticker.advance_secs(1);
    alice
        .grant_delegation(
            &task.key,
            "bob",
            Some(ticker.now() + chrono::Duration::hours(1)),
        )
        .await
        .unwrap();
    ticker.advance_secs(1);

    let bob_gestures = CountingConfirmer::default();
    let bob = service(
        shared_log(&provider, "bob").await,
        "bob",
        bob_gestures.clone(),
        &ticker,
    );
    bob.refresh().await.unwrap();
    Fixture {
        provider,
        ticker,
        alice,
        bob,
        bob_gestures,
        task_key: task.key,
    }
}

// ===========================================================================
// Delegate writes
// ===========================================================================

#[tokio::test]
async fn delegate_toggle_appends_action_and_owner_sees_it() {
    let f = delegated_fixture().await;

    let outcome = f.bob.toggle_task(&f.task_key).await.unwrap();
    let WriteOutcome::Appended { key } = outcome else {
        panic!("delegate writes must append");
    };
    assert!(key.starts_with(ACTION_KEY_PREFIX));
    let parsed = ActionKey::parse(&key).unwrap();
    assert_eq!(parsed.task_key, f.task_key);
    assert_eq!(parsed.delegate_id, "bob");
    assert_eq!(f.bob_gestures.0.load(Ordering::SeqCst), 1);

    // The canonical record is untouched.
    let canonical = f.alice.store().get(&f.task_key).await.unwrap().unwrap();
    assert_eq!(canonical["completed"], serde_json::json!(false));

    // Both views fold the action in.
    assert!(f.bob.tasks()[0].completed);
    let alice_view = f.alice.refresh().await.unwrap();
    assert!(alice_view[0].completed);
}

#[tokio::test]
async fn delegate_may_patch_text_and_description_only() {
    let f = delegated_fixture().await;

    f.bob
        .update_task(
            &f.task_key,
            TaskUpdate {
                text: Some("Buy oat milk".to_string()),
                description: Some("the barista kind".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let view = f.alice.refresh().await.unwrap();
    assert_eq!(view[0].text, "Buy oat milk");
    assert_eq!(view[0].description, "the barista kind");

    let err = f
        .bob
        .update_task(
            &f.task_key,
            TaskUpdate {
                priority: Some(Some("high".to_string())),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::FieldNotDelegable("priority")));
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn delegate_cannot_delete_or_regrant() {
    let f = delegated_fixture().await;

    let err = f.bob.delete_task(&f.task_key).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);

    let err = f
        .bob
        .grant_delegation(&f.task_key, "carol", None)
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::NotAuthorized { .. }));

    let err = f.bob.revoke_delegation(&f.task_key).await.unwrap_err();
    assert!(matches!(err, TaskError::NotAuthorized { .. }));
}

#[tokio::test]
async fn delegate_cannot_overwrite_canonical_record_directly() {
    let f = delegated_fixture().await;
    let forged = serde_json::json!({
        "text": "Forged",
        "createdAt": "2024-05-01T12:00:00Z",
        "createdByIdentity": "bob",
    });
    let err = f.bob.store().put(&f.task_key, forged).await.unwrap_err();
    assert!(matches!(err, StoreError::AccessDenied { .. }));

    let view = f.alice.refresh().await.unwrap();
    assert_eq!(view[0].text, "Buy milk");
}

#[tokio::test]
async fn stranger_is_denied() {
    let f = delegated_fixture().await;
    let carol = service(
        shared_log(&f.provider, "carol").await,
        "carol",
        CountingConfirmer::default(),
        &f.ticker,
    );
    carol.refresh().await.unwrap();
    let err = carol.toggle_task(&f.task_key).await.unwrap_err();
    assert!(matches!(err, TaskError::NotAuthorized { ref identity, .. } if identity == "carol"));
    assert_eq!(
        write_access(&carol.tasks()[0], "carol", f.ticker.now()),
        WriteAccess::Denied
    );
}

// ===========================================================================
// Confirmation gesture
// ===========================================================================

#[tokio::test]
async fn refused_gesture_writes_nothing() {
    let f = delegated_fixture().await;
    let bob = service(
        shared_log(&f.provider, "bob").await,
        "bob",
        RefusingConfirmer,
        &f.ticker,
    );
    let before = f.alice.store().list_all().await.unwrap().len();

    let err = bob.toggle_task(&f.task_key).await.unwrap_err();
    assert!(matches!(
        err,
        TaskError::Confirmation(ConfirmError::Cancelled)
    ));
    assert_eq!(err.kind(), ErrorKind::Authentication);
    assert_eq!(f.alice.store().list_all().await.unwrap().len(), before);
}

#[tokio::test]
async fn grant_lapsing_during_gesture_is_denied() {
    let f = delegated_fixture().await;
    let slow = SlowConfirmer {
        ticker: f.ticker.clone(),
        lapse_secs: 2 * 60 * 60,
    };
    let gate = Arc::new(ConfirmationGate::new(slow, Duration::from_secs(5)));
    let bob = TaskService::new(
        Arc::new(shared_log(&f.provider, "bob").await),
        Identity::new("bob"),
        Arc::clone(&gate),
    )
    .with_clock(f.ticker.clock());

    let err = bob.toggle_task(&f.task_key).await.unwrap_err();
    assert!(matches!(err, TaskError::NotAuthorized { .. }));
    // The gesture itself succeeded.
    assert_eq!(gate.state(), ConfirmationState::Success);

    let entries = f.alice.store().list_all().await.unwrap();
    assert!(entries.iter().all(|e| !e.key.starts_with(ACTION_KEY_PREFIX)));
}

#[tokio::test]
async fn revocation_during_gesture_is_denied() {
    let f = delegated_fixture().await;
    let owner = Arc::new(f.alice);
    let gate = Arc::new(ConfirmationGate::new(
        RevokedMidGesture {
            owner: Arc::clone(&owner),
            task_key: f.task_key.clone(),
        },
        Duration::from_secs(5),
    ));
    let bob = TaskService::new(
        Arc::new(shared_log(&f.provider, "bob").await),
        Identity::new("bob"),
        gate,
    )
    .with_clock(f.ticker.clock());

    let err = bob.toggle_task(&f.task_key).await.unwrap_err();
    assert!(matches!(err, TaskError::NotAuthorized { .. }));
    let entries = owner.store().list_all().await.unwrap();
    assert!(entries.iter().all(|e| !e.key.starts_with(ACTION_KEY_PREFIX)));
}

// ===========================================================================
// Expiry and revocation
// ===========================================================================

#[tokio::test]
async fn expired_grant_stops_new_writes_and_hides_late_actions() {
    let f = delegated_fixture().await;
    f.bob.toggle_task(&f.task_key).await.unwrap();

    f.ticker.advance_secs(2 * 60 * 60);
    let err = f.bob.toggle_task(&f.task_key).await.unwrap_err();
    assert!(matches!(err, TaskError::NotAuthorized { .. }));

    // Actions are judged at read time: once the grant expired, its
    // actions no longer apply.
    let reduction = reduce_detailed(&f.alice.store().list_all().await.unwrap(), f.ticker.now());
    assert!(!reduction.tasks[0].completed);
    assert_eq!(reduction.discarded.len(), 1);
}

#[tokio::test]
async fn revocation_folds_applied_changes_then_blocks_delegate() {
    let f = delegated_fixture().await;
    f.bob.toggle_task(&f.task_key).await.unwrap();
    f.ticker.advance_secs(1);

    // The owner writes from the reduced view, so bob's change survives.
    let revoked = f.alice.revoke_delegation(&f.task_key).await.unwrap();
    assert!(revoked.completed);
    assert!(revoked.delegation.as_ref().unwrap().revoked_at.is_some());
    f.ticker.advance_secs(1);

    let err = f.bob.toggle_task(&f.task_key).await.unwrap_err();
    assert!(matches!(err, TaskError::NotAuthorized { .. }));
    let view = f.alice.refresh().await.unwrap();
    assert!(view[0].completed);
}

#[tokio::test]
async fn owner_write_supersedes_earlier_actions() {
    let f = delegated_fixture().await;
    f.bob
        .update_task(
            &f.task_key,
            TaskUpdate {
                text: Some("Buy oat milk".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    f.ticker.advance_secs(1);

    // Owner edits the description; the delegate's text is folded in and
    // the action itself is no longer needed.
    f.alice
        .update_task(
            &f.task_key,
            TaskUpdate {
                description: Some("two litres".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let canonical = f.alice.store().get(&f.task_key).await.unwrap().unwrap();
    assert_eq!(canonical["text"], serde_json::json!("Buy oat milk"));

    let reduction = reduce_detailed(&f.alice.store().list_all().await.unwrap(), f.ticker.now());
    assert_eq!(reduction.tasks[0].text, "Buy oat milk");
    assert_eq!(reduction.tasks[0].description, "two litres");
    assert_eq!(reduction.applied, 0);
}

#[tokio::test]
async fn delegate_with_lagging_clock_is_not_dropped() {
    let f = delegated_fixture().await;
    // The owner writes at t; the delegate's clock reads one second earlier.
    f.alice
        .update_task(
            &f.task_key,
            TaskUpdate {
                description: Some("two litres".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let lagging = Ticker(Arc::new(AtomicI64::new(
        f.ticker.now().timestamp_millis() - 1000,
    )));
    let bob = service(
        shared_log(&f.provider, "bob").await,
        "bob",
        CountingConfirmer::default(),
        &lagging,
    );
    bob.toggle_task(&f.task_key).await.unwrap();

    let view = f.alice.refresh().await.unwrap();
    assert!(view[0].completed);
    assert_eq!(view[0].description, "two litres");
    assert_eq!(view[0].updated_by.as_deref(), Some("bob"));
}

#[tokio::test]
async fn owner_can_undo_a_folded_delegate_change() {
    let f = delegated_fixture().await;
    let WriteOutcome::Appended { key } = f.bob.toggle_task(&f.task_key).await.unwrap() else {
        panic!("delegate writes are appended");
    };
    f.ticker.advance_secs(1);

    let WriteOutcome::Canonical(reopened) = f.alice.toggle_task(&f.task_key).await.unwrap() else {
        panic!("owner writes are canonical");
    };
    assert!(!reopened.completed);
    assert!(reopened.folded_actions.contains(&key));

    let canonical = f.alice.store().get(&f.task_key).await.unwrap().unwrap();
    assert_eq!(canonical["foldedActions"], serde_json::json!([key]));
    let view = f.bob.refresh().await.unwrap();
    assert!(!view[0].completed);
}

// ===========================================================================
// Background refresh
// ===========================================================================

#[tokio::test]
async fn owner_view_follows_delegate_writes() {
    let f = delegated_fixture().await;
    let alice = Arc::new(f.alice);
    let mut rx = alice.subscribe();
    let handle = alice.spawn_refresh_task();

    f.bob.toggle_task(&f.task_key).await.unwrap();
    tokio::time::timeout(
        Duration::from_secs(1),
        rx.wait_for(|tasks| tasks.first().is_some_and(|t| t.completed)),
    )
    .await
    .expect("refresh did not publish in time")
    .unwrap();
    handle.abort();
}
