//! Canonical task records for `Tasklane` lists.
//!
//! A task lives at a single `task_<millis>_<random>` key in its list's log
//! and is only ever written by its owner. Delegates never touch this record;
//! their changes are appended as [`crate::action`] entries and folded in at
//! reduce time. When the owner rewrites the record it lists the action keys
//! it has already accounted for in `foldedActions`.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum allowed task text length in characters.
pub const MAX_TASK_TEXT_LENGTH: usize = 1000;

/// Prefix of every canonical task key.
pub const TASK_KEY_PREFIX: &str = "task_";

/// Builds a canonical task key from a creation instant and a random suffix.
///
/// Layout: `task_<millis since epoch>_<suffix>`.
#[must_use]
pub fn task_key(created_at: DateTime<Utc>, suffix: &str) -> String {
    format!("{TASK_KEY_PREFIX}{}_{suffix}", created_at.timestamp_millis())
}

/// A time-bounded, revocable grant embedded in a task.
///
/// At most one delegation exists per task. Granting a new one replaces the
/// previous grant outright.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delegation {
    /// Identity allowed to act on the task while the grant is live.
    pub delegate_id: String,
    /// Identity of the owner who granted it.
    pub granted_by: String,
    /// When the grant was made.
    pub granted_at: DateTime<Utc>,
    /// End of the grant window. `None` means open-ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Set by the owner to withdraw the grant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

/// The text fields a delegate may change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    /// Replacement task text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Replacement description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TaskPatch {
    /// Returns `true` if the patch changes nothing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.text.is_none() && self.description.is_none()
    }

    /// Merges the patch into `task`, leaving absent fields untouched.
    pub fn apply_to(&self, task: &mut Task) {
        if let Some(text) = &self.text {
            task.text.clone_from(text);
        }
        if let Some(description) = &self.description {
            task.description.clone_from(description);
        }
    }
}

/// A task as stored at its canonical key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Log key of the canonical entry. The log key wins if the two differ.
    #[serde(default)]
    pub key: String,
    /// Short task text. Never empty for tasks created through this crate.
    pub text: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Completion flag.
    #[serde(default)]
    pub completed: bool,
    /// Free-form priority label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    /// Display name of the person the task is assigned to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    /// Display name of the creator.
    #[serde(default)]
    pub created_by: String,
    /// Identity id of the owner. `None` means no recorded owner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by_identity: Option<String>,
    /// Estimated effort in hours.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time: Option<f64>,
    /// Estimated cost.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_costs: Option<f64>,
    /// Current delegation grant, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegation: Option<Delegation>,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Last write instant (owner write or applied delegate action).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Identity behind the last write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
    /// Log keys of delegation actions already reflected in this record.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub folded_actions: BTreeSet<String>,
}

impl Task {
    /// Instant of the most recent write recorded on this record.
    #[must_use]
    pub fn last_written_at(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.created_at)
    }

    /// Returns `true` if `identity_id` owns this task.
    ///
    /// A task with no recorded owner is treated as owned by everyone, which
    /// keeps records written before ownership tracking editable.
    #[must_use]
    pub fn is_owned_by(&self, identity_id: &str) -> bool {
        self.created_by_identity
            .as_deref()
            .is_none_or(|owner| owner == identity_id)
    }
}
