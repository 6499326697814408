//! Decoding of raw log entries at the store boundary.
//!
//! Every value read from a log passes through [`decode_entry`] (list logs)
//! or [`decode_registry_entry`] (registry logs) exactly once. Anything that
//! does not match the expected shape becomes an explicit
//! [`SkippedEntry`] carrying the reason, so nothing loosely typed travels
//! further in.

use serde::{Deserialize, Serialize};

use crate::action::{ActionKey, ActionRecord, ActionRejection, DelegationAction, is_action_key};
use crate::registry::{ListAddress, RegistryEntry};
use crate::task::Task;

/// A raw key/value pair as returned by a log's `list_all`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Log key.
    pub key: String,
    /// JSON value stored at the key.
    pub value: serde_json::Value,
}

impl LogEntry {
    /// Creates a log entry.
    #[must_use]
    pub fn new(key: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Why an entry was skipped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SkipReason {
    /// The value is not a JSON object.
    #[error("value is not an object")]
    NotAnObject,
    /// The value is an object but not a task.
    #[error("malformed task: {0}")]
    MalformedTask(String),
    /// The key is in the action namespace but does not parse.
    #[error("malformed action key")]
    MalformedActionKey,
    /// The value is an object but not an action record.
    #[error("malformed action record: {0}")]
    MalformedAction(String),
    /// The action record failed validation.
    #[error(transparent)]
    Rejected(#[from] ActionRejection),
    /// The key names a different task or delegate than the payload.
    #[error("action key does not match its payload")]
    KeyMismatch,
    /// The value is an object but not a registry entry.
    #[error("malformed registry entry: {0}")]
    MalformedRegistryEntry(String),
}

/// An entry that did not decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    /// Log key of the entry.
    pub key: String,
    /// What was wrong with it.
    pub reason: SkipReason,
}

/// A validated action together with its log key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionEnvelope {
    /// Raw log key, used for deduplication and tie-breaking.
    pub log_key: String,
    /// Parsed key.
    pub key: ActionKey,
    /// Validated action.
    pub action: DelegationAction,
}

/// Result of decoding one list-log entry.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEntry {
    /// A canonical task record. `key` is set from the log key.
    Task(Task),
    /// A delegation action.
    Action(ActionEnvelope),
    /// An entry that failed to decode.
    Skipped(SkippedEntry),
}

/// Decodes one entry of a list log.
#[must_use]
pub fn decode_entry(entry: &LogEntry) -> DecodedEntry {
    let skipped = |reason| {
        DecodedEntry::Skipped(SkippedEntry {
            key: entry.key.clone(),
            reason,
        })
    };

    if !entry.value.is_object() {
        return skipped(SkipReason::NotAnObject);
    }

    if is_action_key(&entry.key) {
        let Some(key) = ActionKey::parse(&entry.key) else {
            return skipped(SkipReason::MalformedActionKey);
        };
        let record: ActionRecord = match serde_json::from_value(entry.value.clone()) {
            Ok(r) => r,
            Err(e) => return skipped(SkipReason::MalformedAction(e.to_string())),
        };
        let action = match DelegationAction::from_record(record) {
            Ok(a) => a,
            Err(e) => return skipped(SkipReason::Rejected(e)),
        };
        if action.task_key != key.task_key || action.delegate_id != key.delegate_id {
            return skipped(SkipReason::KeyMismatch);
        }
        return DecodedEntry::Action(ActionEnvelope {
            log_key: entry.key.clone(),
            key,
            action,
        });
    }

    match serde_json::from_value::<Task>(entry.value.clone()) {
        Ok(mut task) => {
            task.key.clone_from(&entry.key);
            DecodedEntry::Task(task)
        }
        Err(e) => skipped(SkipReason::MalformedTask(e.to_string())),
    }
}

/// A registry entry with its owner locator resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryRecord {
    /// Display name (the registry key).
    pub name: String,
    /// Owner locator parsed from the database name, if it has one.
    pub owner: Option<ListAddress>,
    /// The stored entry.
    pub entry: RegistryEntry,
}

/// Decodes one entry of a registry log.
///
/// # Errors
///
/// Returns a [`SkippedEntry`] if the value is not a registry entry.
pub fn decode_registry_entry(entry: &LogEntry) -> Result<RegistryRecord, SkippedEntry> {
    let skipped = |reason| SkippedEntry {
        key: entry.key.clone(),
        reason,
    };
    if !entry.value.is_object() {
        return Err(skipped(SkipReason::NotAnObject));
    }
    let registry_entry: RegistryEntry = serde_json::from_value(entry.value.clone())
        .map_err(|e| skipped(SkipReason::MalformedRegistryEntry(e.to_string())))?;
    Ok(RegistryRecord {
        name: entry.key.clone(),
        owner: ListAddress::from_entry(&entry.key, &registry_entry),
        entry: registry_entry,
    })
}
