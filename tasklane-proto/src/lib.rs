//! Record formats and key layout shared by every `Tasklane` peer.

pub mod action;
pub mod entry;
pub mod registry;
pub mod task;
