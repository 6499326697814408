//! Replays a list log into the visible task list.
//!
//! [`reduce`] is pure: the same entries and the same `now` always give the
//! same output, whatever order the entries arrive in and however often
//! each one is repeated.
//!
//! Steps:
//! 1. Decode every entry (canonical task, delegation action, or skip).
//! 2. Collapse duplicate canonical keys; the latest write wins.
//! 3. Deduplicate actions by log key and drop those that do not apply:
//!    missing task, already listed in the record's `foldedActions`,
//!    performer is not the delegate, or delegation inactive at `now`.
//! 4. Apply surviving actions per task in `(performedAt, log key)` order.
//! 5. Mark every action seen for a task as folded in the emitted task, so
//!    the owner's next canonical write accounts for it.
//! 6. Emit tasks newest first.
//!
//! Which actions a canonical record already covers is decided by
//! `foldedActions`, never by comparing timestamps, so a delegate whose
//! clock lags the owner's does not lose writes.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use chrono::{DateTime, Utc};

use tasklane_proto::action::DelegatedChange;
use tasklane_proto::entry::{ActionEnvelope, DecodedEntry, LogEntry, SkippedEntry, decode_entry};
use tasklane_proto::task::Task;

use super::delegation::is_active;

/// Why a well-formed action was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// No canonical record exists for the target task.
    TaskMissing,
    /// `performedBy` differs from `delegateId`.
    PerformerMismatch,
    /// The delegation was not active for the delegate at evaluation time.
    InactiveDelegation,
    /// The canonical record lists the action as already folded in.
    Folded,
}

/// A decoded action that was not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscardedAction {
    /// Log key of the action.
    pub log_key: String,
    /// Why it was dropped.
    pub reason: DiscardReason,
}

/// Full outcome of a reduction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reduction {
    /// Visible tasks, newest first.
    pub tasks: Vec<Task>,
    /// Entries that did not decode.
    pub skipped: Vec<SkippedEntry>,
    /// Decoded actions that were not applied.
    pub discarded: Vec<DiscardedAction>,
    /// Number of actions applied.
    pub applied: usize,
}

/// Reduces `entries` to the visible task list at `now`.
#[must_use]
pub fn reduce(entries: &[LogEntry], now: DateTime<Utc>) -> Vec<Task> {
    reduce_detailed(entries, now).tasks
}

/// Like [`reduce`], but also reports what was skipped or discarded.
#[must_use]
pub fn reduce_detailed(entries: &[LogEntry], now: DateTime<Utc>) -> Reduction {
    let mut canonical: BTreeMap<String, Task> = BTreeMap::new();
    let mut actions: BTreeMap<String, ActionEnvelope> = BTreeMap::new();
    let mut reduction = Reduction::default();

    for entry in entries {
        match decode_entry(entry) {
            DecodedEntry::Task(task) => match canonical.entry(task.key.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(task);
                }
                Entry::Occupied(mut slot) => {
                    if prefer_incoming(slot.get(), &task) {
                        slot.insert(task);
                    }
                }
            },
            DecodedEntry::Action(envelope) => match actions.entry(envelope.log_key.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(envelope);
                }
                Entry::Occupied(mut slot) => {
                    if envelope_rank(&envelope) > envelope_rank(slot.get()) {
                        slot.insert(envelope);
                    }
                }
            },
            DecodedEntry::Skipped(skipped) => {
                tracing::warn!(key = %skipped.key, reason = %skipped.reason, "skipping malformed log entry");
                reduction.skipped.push(skipped);
            }
        }
    }

    let mut pending: BTreeMap<String, Vec<ActionEnvelope>> = BTreeMap::new();
    let mut seen: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for envelope in actions.into_values() {
        let verdict = match canonical.get(&envelope.action.task_key) {
            Some(task) => {
                seen.entry(envelope.action.task_key.clone())
                    .or_default()
                    .push(envelope.log_key.clone());
                admit(task, &envelope, now)
            }
            None => Err(DiscardReason::TaskMissing),
        };
        match verdict {
            Ok(()) => pending
                .entry(envelope.action.task_key.clone())
                .or_default()
                .push(envelope),
            Err(reason) => {
                tracing::debug!(key = %envelope.log_key, ?reason, "discarding delegation action");
                reduction.discarded.push(DiscardedAction {
                    log_key: envelope.log_key,
                    reason,
                });
            }
        }
    }

    for (task_key, mut list) in pending {
        let Some(task) = canonical.get_mut(&task_key) else {
            continue;
        };
        list.sort_by(|a, b| {
            a.action
                .performed_at
                .cmp(&b.action.performed_at)
                .then_with(|| a.log_key.cmp(&b.log_key))
        });
        for envelope in list {
            apply(task, &envelope);
            reduction.applied += 1;
        }
    }

    for (task_key, keys) in seen {
        if let Some(task) = canonical.get_mut(&task_key) {
            task.folded_actions.extend(keys);
        }
    }

    let mut tasks: Vec<Task> = canonical.into_values().collect();
    tasks.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.key.cmp(&a.key))
    });
    reduction.tasks = tasks;
    reduction
}

fn admit(task: &Task, envelope: &ActionEnvelope, now: DateTime<Utc>) -> Result<(), DiscardReason> {
    let action = &envelope.action;
    if task.folded_actions.contains(&envelope.log_key) {
        return Err(DiscardReason::Folded);
    }
    if action.performed_by != action.delegate_id {
        return Err(DiscardReason::PerformerMismatch);
    }
    if !is_active(task, &action.delegate_id, now) {
        return Err(DiscardReason::InactiveDelegation);
    }
    Ok(())
}

fn apply(task: &mut Task, envelope: &ActionEnvelope) {
    let action = &envelope.action;
    match &action.change {
        DelegatedChange::SetCompleted(flag) => task.completed = *flag,
        DelegatedChange::PatchFields(patch) => patch.apply_to(task),
    }
    task.updated_at = Some(action.performed_at);
    task.updated_by = Some(action.performed_by.clone());
}

/// Returns `true` if `incoming` should replace `current` for the same key.
///
/// The later write wins. Distinct records with the same write instant are
/// ordered by their serialized form so the winner does not depend on
/// arrival order.
fn prefer_incoming(current: &Task, incoming: &Task) -> bool {
    match incoming.last_written_at().cmp(&current.last_written_at()) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => serialized(incoming) > serialized(current),
    }
}

fn serialized(task: &Task) -> String {
    serde_json::to_string(task).unwrap_or_default()
}

fn envelope_rank(envelope: &ActionEnvelope) -> String {
    serde_json::to_string(&envelope.action.to_record()).unwrap_or_default()
}
