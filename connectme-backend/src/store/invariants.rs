//! Checker for the four graph invariants. Used after every mutation in
//! debug builds, by the `check` command and by the property tests.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;

use super::relationships::canonical_connections;
use super::state::{GraphState, name_key};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InvariantViolation {
    /// Two or more tags share a case-insensitive name
    DuplicateName { name: String, ids: Vec<String> },
    /// `child` lists `parent` as a parent but not the other way round, or vice versa
    AsymmetricLink { parent: String, child: String },
    StaleCount { tag: String, expected: usize, actual: usize },
    /// `owner` (a person or tag id) references a tag that does not exist
    DanglingReference { owner: String, tag: String },
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvariantViolation::DuplicateName { name, ids } => {
                write!(f, "duplicate tag name \"{}\" shared by {}", name, ids.join(", "))
            }
            InvariantViolation::AsymmetricLink { parent, child } => {
                write!(f, "asymmetric link between parent {} and child {}", parent, child)
            }
            InvariantViolation::StaleCount { tag, expected, actual } => {
                write!(f, "tag {} has connection_count {} (expected {})", tag, actual, expected)
            }
            InvariantViolation::DanglingReference { owner, tag } => {
                write!(f, "{} references missing tag {}", owner, tag)
            }
        }
    }
}

pub fn check(state: &GraphState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    let mut by_name: HashMap<String, Vec<String>> = HashMap::new();
    for tag in &state.tags {
        by_name.entry(name_key(&tag.name)).or_default().push(tag.id.clone());
    }
    let mut duplicates: Vec<(String, Vec<String>)> = by_name
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .collect();
    duplicates.sort();
    for (name, ids) in duplicates {
        violations.push(InvariantViolation::DuplicateName { name, ids });
    }

    let known: HashSet<&str> = state.tags.iter().map(|t| t.id.as_str()).collect();

    for tag in &state.tags {
        for parent in &tag.parent_tags {
            if !known.contains(parent.id.as_str()) {
                violations.push(InvariantViolation::DanglingReference {
                    owner: tag.id.clone(),
                    tag: parent.id.clone(),
                });
            } else if !state.tag(&parent.id).is_some_and(|p| p.has_child(&tag.id)) {
                violations.push(InvariantViolation::AsymmetricLink {
                    parent: parent.id.clone(),
                    child: tag.id.clone(),
                });
            }
        }
        for child in &tag.child_tags {
            if !known.contains(child.id.as_str()) {
                violations.push(InvariantViolation::DanglingReference {
                    owner: tag.id.clone(),
                    tag: child.id.clone(),
                });
            } else if !state.tag(&child.id).is_some_and(|c| c.has_parent(&tag.id)) {
                violations.push(InvariantViolation::AsymmetricLink {
                    parent: tag.id.clone(),
                    child: child.id.clone(),
                });
            }
        }

        let expected = canonical_connections(state, tag).len();
        if tag.connection_count != expected {
            violations.push(InvariantViolation::StaleCount {
                tag: tag.id.clone(),
                expected,
                actual: tag.connection_count,
            });
        }
    }

    for person in &state.persons {
        for tag in &person.tags {
            if !known.contains(tag.id.as_str()) {
                violations.push(InvariantViolation::DanglingReference {
                    owner: person.id.clone(),
                    tag: tag.id.clone(),
                });
            }
        }
    }

    violations
}
