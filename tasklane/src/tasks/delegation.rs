//! Delegation rules: who may write a task, and how.
//!
//! The owner writes canonical records. An active delegate may only append
//! delegation actions, and only [`DelegatedChange::SetCompleted`] or
//! [`DelegatedChange::PatchFields`]. Activity is always evaluated against
//! an explicit `now`, so expiry and revocation take effect at read time.

use chrono::{DateTime, Utc};
use serde::Serialize;

use tasklane_proto::action::{ActionKey, DelegatedChange, DelegationAction};
use tasklane_proto::task::{Delegation, Task};

use super::TaskError;

/// Result of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteAccess {
    /// May write the canonical record.
    Owner,
    /// May append delegation actions.
    Delegate,
    /// May not write.
    Denied,
}

/// Returns `true` if `identity_id` holds a live delegation on `task` at
/// `now`.
#[must_use]
pub fn is_active(task: &Task, identity_id: &str, now: DateTime<Utc>) -> bool {
    task.delegation.as_ref().is_some_and(|d| {
        d.delegate_id == identity_id
            && d.revoked_at.is_none()
            && d.expires_at.is_none_or(|expires| expires > now)
    })
}

/// Decides how `identity_id` may write `task` at `now`.
#[must_use]
pub fn write_access(task: &Task, identity_id: &str, now: DateTime<Utc>) -> WriteAccess {
    if task.is_owned_by(identity_id) {
        WriteAccess::Owner
    } else if is_active(task, identity_id, now) {
        WriteAccess::Delegate
    } else {
        WriteAccess::Denied
    }
}

fn require_owner(task: &Task, identity_id: &str) -> Result<(), TaskError> {
    if task.is_owned_by(identity_id) {
        return Ok(());
    }
    tracing::warn!(
        target: "tasklane::security",
        identity = %identity_id,
        task_key = %task.key,
        "non-owner attempted to change a delegation"
    );
    Err(TaskError::NotAuthorized {
        identity: identity_id.to_string(),
        task_key: task.key.clone(),
    })
}

/// Builds a new grant of `task` to `delegate_id`.
///
/// A new grant replaces any earlier one.
///
/// # Errors
///
/// Returns [`TaskError::NotAuthorized`] if `owner_id` does not own the
/// task, or [`TaskError::InvalidDelegation`] for an empty or
/// self-referential delegate or an expiry that is not in the future.
pub fn grant(
    task: &Task,
    owner_id: &str,
    delegate_id: &str,
    expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Delegation, TaskError> {
    require_owner(task, owner_id)?;
    let delegate_id = delegate_id.trim();
    if delegate_id.is_empty() {
        return Err(TaskError::InvalidDelegation(
            "delegate id cannot be empty".to_string(),
        ));
    }
    if delegate_id == owner_id {
        return Err(TaskError::InvalidDelegation(
            "cannot delegate a task to its owner".to_string(),
        ));
    }
    if expires_at.is_some_and(|expires| expires <= now) {
        return Err(TaskError::InvalidDelegation(
            "expiry must be in the future".to_string(),
        ));
    }
    Ok(Delegation {
        delegate_id: delegate_id.to_string(),
        granted_by: owner_id.to_string(),
        granted_at: now,
        expires_at,
        revoked_at: None,
    })
}

/// Marks the delegation on `task` as revoked at `now`.
///
/// Revoking an already revoked grant keeps the original revocation time.
///
/// # Errors
///
/// Returns [`TaskError::NotAuthorized`] if `owner_id` does not own the
/// task, or [`TaskError::InvalidDelegation`] if there is nothing to revoke.
pub fn revoke(task: &Task, owner_id: &str, now: DateTime<Utc>) -> Result<Delegation, TaskError> {
    require_owner(task, owner_id)?;
    let Some(current) = &task.delegation else {
        return Err(TaskError::InvalidDelegation(
            "task has no delegation".to_string(),
        ));
    };
    let mut revoked = current.clone();
    revoked.revoked_at.get_or_insert(now);
    Ok(revoked)
}

/// Builds the action record a delegate appends for `change`.
#[must_use]
pub fn build_action(
    task: &Task,
    delegate_id: &str,
    change: DelegatedChange,
    now: DateTime<Utc>,
    suffix: &str,
) -> (ActionKey, DelegationAction) {
    let key = ActionKey::new(&task.key, delegate_id, now, suffix);
    let action = DelegationAction {
        task_key: task.key.clone(),
        delegate_id: delegate_id.to_string(),
        change,
        performed_by: delegate_id.to_string(),
        performed_at: now,
        expires_at_snapshot: task.delegation.as_ref().and_then(|d| d.expires_at),
    };
    (key, action)
}
