//! Control Matcher - (name, id) wildcard matching
//!
//! Either half of a key may be 0, meaning "any":
//! - name 0, id X: matches only the task with id X
//! - name N, id 0: matches every task named N
//! - name N, id X: matches the task with id X, and only if it is named N

use serde::{Deserialize, Serialize};

use capture_protocol::{name_to_string, Name, TaskId};

/// A (name, id) pair where either half may be the wildcard 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ControlKey {
    pub name: Name,
    pub id: TaskId,
}

impl ControlKey {
    pub const fn new(name: Name, id: TaskId) -> Self {
        Self { name, id }
    }

    pub const fn by_name(name: Name) -> Self {
        Self { name, id: 0 }
    }

    pub const fn by_id(id: TaskId) -> Self {
        Self { name: 0, id }
    }

    /// Both halves are the wildcard
    pub fn is_wildcard(&self) -> bool {
        self.name == 0 && self.id == 0
    }

    /// Does this key, used as a pattern, select `other`?
    pub fn matches(&self, other: ControlKey) -> bool {
        match_name_id(self.name, self.id, other.name, other.id)
    }
}

impl std::fmt::Display for ControlKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name == 0 {
            write!(f, "*/{:08x}", self.id)
        } else {
            write!(f, "{}/{:08x}", name_to_string(self.name), self.id)
        }
    }
}

/// Pattern match of `(lhs_name, lhs_id)` against `(rhs_name, rhs_id)`
///
/// An unnamed pattern matches on id alone. Otherwise the names must be
/// equal and the pattern's id must be the wildcard or equal.
pub fn match_name_id(lhs_name: Name, lhs_id: TaskId, rhs_name: Name, rhs_id: TaskId) -> bool {
    if lhs_name == 0 && lhs_id == rhs_id {
        return true;
    }
    (lhs_id == 0 || lhs_id == rhs_id) && lhs_name == rhs_name
}
