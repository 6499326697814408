//! Property tests for the log key layout.
//!
//! 1. Action keys survive display → parse for any delegate id, including
//!    ids with separators and non-ASCII text.
//! 2. Parsing arbitrary strings never panics and only accepts keys in the
//!    action namespace.
//! 3. Task keys embed their creation instant.

#![allow(clippy::unwrap_used)]

use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use tasklane_proto::action::{ACTION_KEY_PREFIX, ActionKey, is_action_key};
use tasklane_proto::task::{TASK_KEY_PREFIX, task_key};

fn arb_task_key() -> impl Strategy<Value = String> {
    "[a-z0-9_]{1,16}(/[a-z0-9_]{1,8})?"
}

fn arb_delegate_id() -> impl Strategy<Value = String> {
    ".{1,24}"
}

fn arb_suffix() -> impl Strategy<Value = String> {
    "[a-z0-9]{8}"
}

proptest! {
    #[test]
    fn action_key_parses_back(
        task in arb_task_key(),
        delegate in arb_delegate_id(),
        millis in 0i64..4_102_444_800_000,
        suffix in arb_suffix(),
    ) {
        let at = Utc.timestamp_millis_opt(millis).unwrap();
        let key = ActionKey::new(&task, &delegate, at, &suffix);
        let rendered = key.to_string();

        prop_assert!(is_action_key(&rendered));
        // The encoded delegate never introduces an extra segment.
        let tail = rendered.strip_prefix(ACTION_KEY_PREFIX).unwrap();
        prop_assert_eq!(tail.matches('/').count(), task.matches('/').count() + 2);

        let parsed = ActionKey::parse(&rendered).unwrap();
        prop_assert_eq!(parsed, key);
    }

    #[test]
    fn parse_never_panics(input in ".{0,64}") {
        if let Some(parsed) = ActionKey::parse(&input) {
            prop_assert!(input.starts_with(ACTION_KEY_PREFIX));
            prop_assert!(!parsed.task_key.is_empty());
            prop_assert!(!parsed.stamp.is_empty());
        }
    }

    #[test]
    fn task_key_embeds_creation_millis(millis in 0i64..4_102_444_800_000, suffix in arb_suffix()) {
        let at = Utc.timestamp_millis_opt(millis).unwrap();
        let key = task_key(at, &suffix);
        prop_assert!(key.starts_with(TASK_KEY_PREFIX));
        prop_assert!(!is_action_key(&key));
        let expected = format!("{TASK_KEY_PREFIX}{millis}_{suffix}");
        prop_assert_eq!(key, expected);
    }
}
