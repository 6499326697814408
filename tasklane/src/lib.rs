//! Tasklane: delegated task lists over a replicated append-only log.
//!
//! Everything visible is derived by replaying log entries. Owners write
//! canonical task records, delegates append narrow actions, and
//! [`tasks::reduce`] folds both into the task list. Lists are found by
//! display name through a per-identity [`registry`].

pub mod config;
pub mod confirm;
pub mod crypto;
pub mod identity;
pub mod migrate;
pub mod registry;
pub mod store;
pub mod tasks;
pub mod workspace;
