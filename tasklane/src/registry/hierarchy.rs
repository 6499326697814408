//! Parent/child navigation over registry records.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use tasklane_proto::entry::RegistryRecord;

/// One step of a breadcrumb.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathSegment {
    /// Display name of the list.
    pub name: String,
    /// Parent display name, if recorded.
    pub parent: Option<String>,
}

/// Builds the root-first path to `name`.
///
/// Parents are followed until one is unset, unknown (the unknown name is
/// emitted as a synthetic root segment), or already visited. The walk
/// always terminates, even on cyclic or self-parented data.
#[must_use]
pub fn build_hierarchy_path(records: &[RegistryRecord], name: &str) -> Vec<PathSegment> {
    let parents: HashMap<&str, Option<&str>> = records
        .iter()
        .map(|r| (r.name.as_str(), r.entry.parent.as_deref()))
        .collect();

    let mut path = Vec::new();
    let mut visited: HashSet<&str> = HashSet::new();
    let mut current = Some(name);
    while let Some(step) = current {
        if !visited.insert(step) {
            tracing::warn!(list = %name, revisited = %step, "cycle in list hierarchy");
            break;
        }
        match parents.get(step) {
            Some(parent) => {
                path.push(PathSegment {
                    name: step.to_string(),
                    parent: parent.map(str::to_string),
                });
                current = *parent;
            }
            None => {
                path.push(PathSegment {
                    name: step.to_string(),
                    parent: None,
                });
                current = None;
            }
        }
    }
    path.reverse();
    path
}

/// Direct sub-lists of `name`, sorted by display name.
#[must_use]
pub fn children<'a>(records: &'a [RegistryRecord], name: &str) -> Vec<&'a RegistryRecord> {
    let mut found: Vec<&RegistryRecord> = records
        .iter()
        .filter(|r| r.entry.parent.as_deref() == Some(name) && r.name != name)
        .collect();
    found.sort_by(|a, b| a.name.cmp(&b.name));
    found
}

/// Formats a path as `a > b > c`.
#[must_use]
pub fn format_path(path: &[PathSegment]) -> String {
    path.iter()
        .map(|s| s.name.as_str())
        .collect::<Vec<_>>()
        .join(" > ")
}
