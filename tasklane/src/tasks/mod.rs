//! Task lists: reduction, delegation rules, and the mutation surface.
//!
//! A list is a log of canonical task records (written by the owner) and
//! delegation actions (appended by delegates). [`reduce`] replays both
//! into the visible task list; [`TaskService`] performs writes on top of
//! one list's store.

pub mod delegation;
pub mod manager;
pub mod reduce;

pub use delegation::{WriteAccess, is_active, write_access};
pub use manager::{NewTask, TaskService, TaskUpdate, WriteOutcome};
pub use reduce::{Reduction, reduce, reduce_detailed};

use rand::Rng;
use rand::distr::Alphanumeric;
use thiserror::Error;

use crate::confirm::ConfirmError;
use crate::store::StoreError;

/// Length of the random suffix appended to generated keys.
pub const KEY_SUFFIX_LEN: usize = 8;

/// Errors that can occur during task operations.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Task text cannot be empty.
    #[error("task text cannot be empty")]
    TextEmpty,
    /// Task text exceeds the configured maximum length.
    #[error("task text too long (max {max} characters)")]
    TextTooLong {
        /// Configured limit.
        max: usize,
    },
    /// The update carries no changes.
    #[error("nothing to update")]
    NothingToUpdate,
    /// Task with the given key was not found.
    #[error("task not found: {0}")]
    TaskNotFound(String),
    /// The delegation request is malformed.
    #[error("invalid delegation: {0}")]
    InvalidDelegation(String),
    /// A delegate tried to change a field outside the delegated set.
    #[error("field {0} cannot be changed by a delegate")]
    FieldNotDelegable(&'static str),
    /// The identity may not modify the task.
    #[error("{identity} is not allowed to modify {task_key}")]
    NotAuthorized {
        /// Identity that attempted the write.
        identity: String,
        /// Target task.
        task_key: String,
    },
    /// The confirmation gesture failed.
    #[error("identity confirmation failed: {0}")]
    Confirmation(#[from] ConfirmError),
    /// The log store rejected or failed the operation.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    /// A record could not be serialized.
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Broad category of a [`TaskError`], for callers that only need to pick
/// a message style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Input was rejected before anything was written.
    Validation,
    /// The identity lacks the right to perform the write.
    Authorization,
    /// The confirmation gesture failed.
    Authentication,
    /// The target does not exist.
    NotFound,
    /// The store failed.
    Storage,
}

impl TaskError {
    /// Returns the category of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::TextEmpty
            | Self::TextTooLong { .. }
            | Self::NothingToUpdate
            | Self::InvalidDelegation(_)
            | Self::FieldNotDelegable(_) => ErrorKind::Validation,
            Self::NotAuthorized { .. } => ErrorKind::Authorization,
            Self::Confirmation(_) => ErrorKind::Authentication,
            Self::TaskNotFound(_) => ErrorKind::NotFound,
            Self::Store(_) | Self::Encode(_) => ErrorKind::Storage,
        }
    }
}

/// Validates task text against `max_len` characters.
///
/// # Errors
///
/// Returns [`TaskError::TextEmpty`] for blank text or
/// [`TaskError::TextTooLong`] above the limit.
pub fn validate_text(text: &str, max_len: usize) -> Result<(), TaskError> {
    if text.trim().is_empty() {
        return Err(TaskError::TextEmpty);
    }
    if text.chars().count() > max_len {
        return Err(TaskError::TextTooLong { max: max_len });
    }
    Ok(())
}

/// Random lowercase alphanumeric suffix for generated keys.
#[must_use]
pub fn random_suffix() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(KEY_SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}
