//! Task service: validated writes on top of one list's log store.
//!
//! `TaskService` is the application-layer interface for a single opened
//! list. Owners write canonical records; delegates append delegation
//! actions after passing the confirmation gate. After every write the
//! service re-reduces the log and publishes the result on a `watch`
//! channel.
//!
//! Owner writes always start from the reduced view, so delegate changes
//! already applied are folded into the new canonical record, and the keys
//! of the actions behind them are recorded in `foldedActions`.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};

use tasklane_proto::action::DelegatedChange;
use tasklane_proto::task::{MAX_TASK_TEXT_LENGTH, Task, TaskPatch, task_key};

use super::delegation::{self, WriteAccess, is_active, write_access};
use super::reduce::reduce;
use super::{TaskError, random_suffix, validate_text};
use crate::confirm::{ConfirmationGate, IdentityConfirmer};
use crate::identity::Identity;
use crate::store::LogStore;

/// Source of the current instant.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Fields of a new task. Only `text` is required.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewTask {
    /// Task text.
    pub text: String,
    /// Description.
    pub description: String,
    /// Priority label.
    pub priority: Option<String>,
    /// Assignee display name.
    pub assignee: Option<String>,
    /// Estimated effort in hours.
    pub estimated_time: Option<f64>,
    /// Estimated cost.
    pub estimated_costs: Option<f64>,
}

impl NewTask {
    /// A task with just `text`.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

/// A partial update. `None` leaves a field untouched; for optional fields
/// `Some(None)` clears the value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    /// New text.
    pub text: Option<String>,
    /// New description.
    pub description: Option<String>,
    /// New priority.
    pub priority: Option<Option<String>>,
    /// New assignee.
    pub assignee: Option<Option<String>>,
    /// New effort estimate.
    pub estimated_time: Option<Option<f64>>,
    /// New cost estimate.
    pub estimated_costs: Option<Option<f64>>,
}

impl TaskUpdate {
    /// Returns `true` if the update changes nothing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.text.is_none()
            && self.description.is_none()
            && self.priority.is_none()
            && self.assignee.is_none()
            && self.estimated_time.is_none()
            && self.estimated_costs.is_none()
    }

    /// Converts to the delegate-writable subset.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::FieldNotDelegable`] naming the first field a
    /// delegate may not change.
    pub fn into_patch(self) -> Result<TaskPatch, TaskError> {
        if self.priority.is_some() {
            return Err(TaskError::FieldNotDelegable("priority"));
        }
        if self.assignee.is_some() {
            return Err(TaskError::FieldNotDelegable("assignee"));
        }
        if self.estimated_time.is_some() {
            return Err(TaskError::FieldNotDelegable("estimatedTime"));
        }
        if self.estimated_costs.is_some() {
            return Err(TaskError::FieldNotDelegable("estimatedCosts"));
        }
        Ok(TaskPatch {
            text: self.text,
            description: self.description,
        })
    }

    fn apply_to(self, task: &mut Task) {
        if let Some(text) = self.text {
            task.text = text;
        }
        if let Some(description) = self.description {
            task.description = description;
        }
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        if let Some(assignee) = self.assignee {
            task.assignee = assignee;
        }
        if let Some(estimated_time) = self.estimated_time {
            task.estimated_time = estimated_time;
        }
        if let Some(estimated_costs) = self.estimated_costs {
            task.estimated_costs = estimated_costs;
        }
    }
}

/// What a successful write produced.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The owner rewrote the canonical record.
    Canonical(Task),
    /// A delegate appended an action under `key`.
    Appended {
        /// Log key of the appended action.
        key: String,
    },
}

/// Mutation surface for one task list.
pub struct TaskService<S, C> {
    store: Arc<S>,
    actor: Identity,
    gate: Arc<ConfirmationGate<C>>,
    max_text_len: usize,
    clock: Clock,
    snapshot: watch::Sender<Vec<Task>>,
}

impl<S: LogStore, C: IdentityConfirmer> TaskService<S, C> {
    /// Creates a service writing to `store` as `actor`.
    #[must_use]
    pub fn new(store: Arc<S>, actor: Identity, gate: Arc<ConfirmationGate<C>>) -> Self {
        Self {
            store,
            actor,
            gate,
            max_text_len: MAX_TASK_TEXT_LENGTH,
            clock: Arc::new(Utc::now),
            snapshot: watch::Sender::new(Vec::new()),
        }
    }

    /// Sets the maximum text length.
    #[must_use]
    pub fn with_max_text_len(mut self, max: usize) -> Self {
        self.max_text_len = max;
        self
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// The underlying store.
    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The identity writing through this service.
    #[must_use]
    pub const fn actor(&self) -> &Identity {
        &self.actor
    }

    /// Last published task list.
    #[must_use]
    pub fn tasks(&self) -> Vec<Task> {
        self.snapshot.borrow().clone()
    }

    /// Subscribes to published task lists.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Vec<Task>> {
        self.snapshot.subscribe()
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Re-reads the log, reduces it, and publishes the result.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Store`] if the log cannot be read. The last
    /// published list is kept.
    pub async fn refresh(&self) -> Result<Vec<Task>, TaskError> {
        let entries = match self.store.list_all().await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(db = %self.store.db_name(), error = %e, "refresh failed, keeping last snapshot");
                return Err(e.into());
            }
        };
        let tasks = reduce(&entries, self.now());
        self.snapshot.send_replace(tasks.clone());
        Ok(tasks)
    }

    async fn refresh_after_write(&self) {
        if let Err(e) = self.refresh().await {
            tracing::debug!(error = %e, "post-write refresh failed");
        }
    }

    async fn current(&self, key: &str) -> Result<Task, TaskError> {
        self.refresh()
            .await?
            .into_iter()
            .find(|t| t.key == key)
            .ok_or_else(|| TaskError::TaskNotFound(key.to_string()))
    }

    fn deny(&self, task: &Task, attempted: &str) -> TaskError {
        tracing::warn!(
            target: "tasklane::security",
            identity = %self.actor.id,
            task_key = %task.key,
            attempted,
            "write rejected"
        );
        TaskError::NotAuthorized {
            identity: self.actor.id.clone(),
            task_key: task.key.clone(),
        }
    }

    async fn put_canonical(&self, mut task: Task, now: DateTime<Utc>) -> Result<Task, TaskError> {
        task.updated_at = Some(now);
        task.updated_by = Some(self.actor.id.clone());
        let value = serde_json::to_value(&task)?;
        self.store.put(&task.key, value).await?;
        self.refresh_after_write().await;
        Ok(task)
    }

    async fn append_action(
        &self,
        task: &Task,
        change: DelegatedChange,
    ) -> Result<WriteOutcome, TaskError> {
        self.gate.confirm(&self.actor.id).await?;
        // The gesture can take a while; the grant may have lapsed or been
        // revoked meanwhile.
        let task = self.current(&task.key).await?;
        let now = self.now();
        if !is_active(&task, &self.actor.id, now) {
            return Err(self.deny(&task, "append after delegation lapsed"));
        }
        let (key, action) =
            delegation::build_action(&task, &self.actor.id, change, now, &random_suffix());
        let key = key.to_string();
        let value = serde_json::to_value(action.to_record())?;
        self.store.put(&key, value).await?;
        tracing::info!(task_key = %task.key, action_key = %key, "appended delegation action");
        self.refresh_after_write().await;
        Ok(WriteOutcome::Appended { key })
    }

    /// Creates a task owned by the actor.
    ///
    /// # Errors
    ///
    /// Returns a validation error for bad text or [`TaskError::Store`] if
    /// the write fails.
    pub async fn add_task(&self, new: NewTask) -> Result<Task, TaskError> {
        validate_text(&new.text, self.max_text_len)?;
        let now = self.now();
        let task = Task {
            key: task_key(now, &random_suffix()),
            text: new.text,
            description: new.description,
            completed: false,
            priority: new.priority,
            assignee: new.assignee,
            created_by: self.actor.display_name.clone(),
            created_by_identity: Some(self.actor.id.clone()),
            estimated_time: new.estimated_time,
            estimated_costs: new.estimated_costs,
            delegation: None,
            created_at: now,
            updated_at: None,
            updated_by: None,
            folded_actions: BTreeSet::new(),
        };
        let value = serde_json::to_value(&task)?;
        self.store.put(&task.key, value).await?;
        tracing::info!(task_key = %task.key, "created task");
        self.refresh_after_write().await;
        Ok(task)
    }

    /// Flips the completion flag.
    ///
    /// Owners rewrite the canonical record; active delegates append a
    /// `set-completed` action after confirming.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::NotAuthorized`] if the actor has no write
    /// access, [`TaskError::Confirmation`] if the gesture fails, or
    /// [`TaskError::Store`] if the write fails.
    pub async fn toggle_task(&self, key: &str) -> Result<WriteOutcome, TaskError> {
        let task = self.current(key).await?;
        let now = self.now();
        match write_access(&task, &self.actor.id, now) {
            WriteAccess::Owner => {
                let mut next = task;
                next.completed = !next.completed;
                Ok(WriteOutcome::Canonical(self.put_canonical(next, now).await?))
            }
            WriteAccess::Delegate => {
                let flag = !task.completed;
                self.append_action(&task, DelegatedChange::SetCompleted(flag))
                    .await
            }
            WriteAccess::Denied => Err(self.deny(&task, "toggle")),
        }
    }

    /// Applies a partial update.
    ///
    /// Delegates may only change `text` and `description`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty update, bad text, or a
    /// non-delegable field; otherwise as [`toggle_task`](Self::toggle_task).
    pub async fn update_task(
        &self,
        key: &str,
        update: TaskUpdate,
    ) -> Result<WriteOutcome, TaskError> {
        if update.is_empty() {
            return Err(TaskError::NothingToUpdate);
        }
        if let Some(text) = &update.text {
            validate_text(text, self.max_text_len)?;
        }
        let task = self.current(key).await?;
        let now = self.now();
        match write_access(&task, &self.actor.id, now) {
            WriteAccess::Owner => {
                let mut next = task;
                update.apply_to(&mut next);
                Ok(WriteOutcome::Canonical(self.put_canonical(next, now).await?))
            }
            WriteAccess::Delegate => {
                let patch = update.into_patch()?;
                if patch.is_empty() {
                    return Err(TaskError::NothingToUpdate);
                }
                self.append_action(&task, DelegatedChange::PatchFields(patch))
                    .await
            }
            WriteAccess::Denied => Err(self.deny(&task, "update")),
        }
    }

    /// Deletes a task. Owner only.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::NotAuthorized`] for non-owners or
    /// [`TaskError::Store`] if the delete fails.
    pub async fn delete_task(&self, key: &str) -> Result<(), TaskError> {
        let task = self.current(key).await?;
        if !task.is_owned_by(&self.actor.id) {
            return Err(self.deny(&task, "delete"));
        }
        self.store.delete(key).await?;
        tracing::info!(task_key = %key, "deleted task");
        self.refresh_after_write().await;
        Ok(())
    }

    /// Grants `delegate_id` limited write rights until `expires_at`.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::NotAuthorized`] for non-owners,
    /// [`TaskError::InvalidDelegation`] for a bad grant, or
    /// [`TaskError::Store`] if the write fails.
    pub async fn grant_delegation(
        &self,
        key: &str,
        delegate_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Task, TaskError> {
        let task = self.current(key).await?;
        let now = self.now();
        let grant = delegation::grant(&task, &self.actor.id, delegate_id, expires_at, now)?;
        tracing::info!(task_key = %key, delegate = %grant.delegate_id, "granted delegation");
        let mut next = task;
        next.delegation = Some(grant);
        self.put_canonical(next, now).await
    }

    /// Revokes the delegation on a task.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::NotAuthorized`] for non-owners,
    /// [`TaskError::InvalidDelegation`] if there is no grant, or
    /// [`TaskError::Store`] if the write fails.
    pub async fn revoke_delegation(&self, key: &str) -> Result<Task, TaskError> {
        let task = self.current(key).await?;
        let now = self.now();
        let revoked = delegation::revoke(&task, &self.actor.id, now)?;
        tracing::info!(task_key = %key, delegate = %revoked.delegate_id, "revoked delegation");
        let mut next = task;
        next.delegation = Some(revoked);
        self.put_canonical(next, now).await
    }
}

impl<S, C> TaskService<S, C>
where
    S: LogStore + 'static,
    C: IdentityConfirmer + 'static,
{
    /// Spawns a background task that refreshes on every store change.
    ///
    /// The task ends when the store's change channel closes; abort the
    /// handle to stop it earlier.
    pub fn spawn_refresh_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        let mut changes = service.store.subscribe();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Err(e) = service.refresh().await {
                            tracing::debug!(error = %e, "background refresh failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
