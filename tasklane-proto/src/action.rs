//! Delegation action records.
//!
//! A delegate never writes a task's canonical key. Each delegated change is
//! appended as an immutable record under
//! `delegation-action/<taskKey>/<urlencoded delegateId>/<millis>_<random>`
//! and replayed by the reducer. The random suffix keeps two delegates
//! acting in the same millisecond from colliding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::TaskPatch;

/// Prefix of the delegation action key namespace.
pub const ACTION_KEY_PREFIX: &str = "delegation-action/";

/// Wire name of the set-completed action.
pub const SET_COMPLETED: &str = "set-completed";

/// Wire name of the patch-fields action.
pub const PATCH_FIELDS: &str = "patch-fields";

/// Returns `true` if `key` lives in the action namespace.
#[must_use]
pub fn is_action_key(key: &str) -> bool {
    key.starts_with(ACTION_KEY_PREFIX)
}

/// Parsed form of an action log key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionKey {
    /// Key of the task the action targets.
    pub task_key: String,
    /// Delegate identity (decoded).
    pub delegate_id: String,
    /// `<millis>_<random>` tail.
    pub stamp: String,
}

impl ActionKey {
    /// Builds the key for an action performed at `performed_at`.
    #[must_use]
    pub fn new(task_key: &str, delegate_id: &str, performed_at: DateTime<Utc>, suffix: &str) -> Self {
        Self {
            task_key: task_key.to_string(),
            delegate_id: delegate_id.to_string(),
            stamp: format!("{}_{suffix}", performed_at.timestamp_millis()),
        }
    }

    /// Parses a log key. Returns `None` for keys outside the namespace or
    /// with a malformed layout.
    ///
    /// The task key is everything between the prefix and the last two
    /// segments, so task keys containing `/` still parse.
    #[must_use]
    pub fn parse(key: &str) -> Option<Self> {
        let rest = key.strip_prefix(ACTION_KEY_PREFIX)?;
        let mut parts = rest.rsplitn(3, '/');
        let stamp = parts.next()?;
        let encoded_delegate = parts.next()?;
        let task_key = parts.next()?;
        if stamp.is_empty() || encoded_delegate.is_empty() || task_key.is_empty() {
            return None;
        }
        Some(Self {
            task_key: task_key.to_string(),
            delegate_id: decode_component(encoded_delegate)?,
            stamp: stamp.to_string(),
        })
    }
}

impl std::fmt::Display for ActionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let delegate: String = url::form_urlencoded::byte_serialize(self.delegate_id.as_bytes()).collect();
        write!(f, "{ACTION_KEY_PREFIX}{}/{delegate}/{}", self.task_key, self.stamp)
    }
}

fn decode_component(encoded: &str) -> Option<String> {
    let mut pairs = url::form_urlencoded::parse(encoded.as_bytes());
    let (name, value) = pairs.next()?;
    if !value.is_empty() || pairs.next().is_some() {
        return None;
    }
    Some(name.into_owned())
}

/// An action record exactly as it appears in the log.
///
/// Payload fields are kept loosely typed here so that a malformed record
/// can be rejected with a precise reason by
/// [`DelegationAction::from_record`] instead of failing wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRecord {
    /// Target task key.
    pub task_key: String,
    /// Delegate the action claims to act under.
    pub delegate_id: String,
    /// `set-completed` or `patch-fields`.
    pub action: String,
    /// Payload of `set-completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_completed: Option<serde_json::Value>,
    /// Payload of `patch-fields`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<serde_json::Value>,
    /// Identity that wrote the record.
    pub performed_by: String,
    /// Claimed action instant (RFC 3339).
    pub performed_at: String,
    /// The delegation's `expiresAt` as the writer saw it. Informational only.
    #[serde(default)]
    pub expires_at_snapshot: Option<String>,
}

/// The two mutations a delegate may perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegatedChange {
    /// Replace the completion flag.
    SetCompleted(bool),
    /// Merge text and/or description.
    PatchFields(TaskPatch),
}

/// Reasons an action record fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionRejection {
    /// The `action` field names no known kind.
    #[error("unknown action kind: {0}")]
    UnknownKind(String),
    /// `setCompleted` is missing or not a boolean.
    #[error("set-completed payload must be a boolean")]
    InvalidSetCompleted,
    /// `patch` is missing, not an object, or carries non-string fields.
    #[error("patch-fields payload must be an object of string fields")]
    InvalidPatch,
    /// `performedAt` does not parse as RFC 3339.
    #[error("unparseable performedAt: {0}")]
    UnparseableTimestamp(String),
}

/// A validated delegation action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationAction {
    /// Target task key.
    pub task_key: String,
    /// Delegate the action acts under.
    pub delegate_id: String,
    /// The change to apply.
    pub change: DelegatedChange,
    /// Identity that wrote the record.
    pub performed_by: String,
    /// Claimed action instant. Ordering follows this, not arrival.
    pub performed_at: DateTime<Utc>,
    /// Writer's view of the grant expiry.
    pub expires_at_snapshot: Option<DateTime<Utc>>,
}

impl DelegationAction {
    /// Validates a raw record.
    ///
    /// # Errors
    ///
    /// Returns an [`ActionRejection`] describing the first problem found.
    pub fn from_record(record: ActionRecord) -> Result<Self, ActionRejection> {
        let change = match record.action.as_str() {
            SET_COMPLETED => match record.set_completed {
                Some(serde_json::Value::Bool(flag)) => DelegatedChange::SetCompleted(flag),
                _ => return Err(ActionRejection::InvalidSetCompleted),
            },
            PATCH_FIELDS => DelegatedChange::PatchFields(parse_patch(record.patch.as_ref())?),
            other => return Err(ActionRejection::UnknownKind(other.to_string())),
        };
        let performed_at = DateTime::parse_from_rfc3339(&record.performed_at)
            .map_err(|_| ActionRejection::UnparseableTimestamp(record.performed_at.clone()))?
            .with_timezone(&Utc);
        let expires_at_snapshot = record
            .expires_at_snapshot
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Ok(Self {
            task_key: record.task_key,
            delegate_id: record.delegate_id,
            change,
            performed_by: record.performed_by,
            performed_at,
            expires_at_snapshot,
        })
    }

    /// Converts back into the log representation.
    #[must_use]
    pub fn to_record(&self) -> ActionRecord {
        let (action, set_completed, patch) = match &self.change {
            DelegatedChange::SetCompleted(flag) => {
                (SET_COMPLETED, Some(serde_json::Value::Bool(*flag)), None)
            }
            DelegatedChange::PatchFields(patch) => (
                PATCH_FIELDS,
                None,
                serde_json::to_value(patch).ok(),
            ),
        };
        ActionRecord {
            task_key: self.task_key.clone(),
            delegate_id: self.delegate_id.clone(),
            action: action.to_string(),
            set_completed,
            patch,
            performed_by: self.performed_by.clone(),
            performed_at: self.performed_at.to_rfc3339(),
            expires_at_snapshot: self.expires_at_snapshot.map(|dt| dt.to_rfc3339()),
        }
    }
}

fn parse_patch(value: Option<&serde_json::Value>) -> Result<TaskPatch, ActionRejection> {
    let Some(serde_json::Value::Object(fields)) = value else {
        return Err(ActionRejection::InvalidPatch);
    };
    let text_field = |name: &str| match fields.get(name) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ActionRejection::InvalidPatch),
    };
    Ok(TaskPatch {
        text: text_field("text")?,
        description: text_field("description")?,
    })
}
