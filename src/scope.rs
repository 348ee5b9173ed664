//! Scope sets
//!
//! Scopes are kept in the order they were first requested so that the
//! `scope` string echoed back to clients matches what they asked for.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Read access to the user's data
pub const READ: &str = "read";
/// Permission to modify the user's data
pub const WRITE: &str = "write";
/// Permission to make bookings on the user's behalf
pub const BOOK: &str = "book";

/// An ordered, de-duplicated set of scope names
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct ScopeSet(Vec<String>);

impl ScopeSet {
    /// Parse a space-delimited scope string
    #[must_use]
    pub fn parse(scope: &str) -> Self {
        scope.split_whitespace().collect()
    }

    /// Whether `scope` is a member
    #[must_use]
    pub fn contains(&self, scope: &str) -> bool {
        self.0.iter().any(|s| s == scope)
    }

    /// Whether every member of `self` is also in `other`
    #[must_use]
    pub fn is_subset(&self, other: &Self) -> bool {
        self.0.iter().all(|s| other.contains(s))
    }

    /// Whether `self` carries every member of `required`
    #[must_use]
    pub fn satisfies(&self, required: &Self) -> bool {
        required.is_subset(self)
    }

    /// Members of `self` that are absent from `other`
    #[must_use]
    pub fn difference(&self, other: &Self) -> Self {
        self.0.iter().filter(|s| !other.contains(s)).cloned().collect()
    }

    /// Number of scopes
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for ScopeSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut scopes: Vec<String> = Vec::new();
        for scope in iter {
            let scope = scope.into();
            if !scope.is_empty() && !scopes.contains(&scope) {
                scopes.push(scope);
            }
        }
        Self(scopes)
    }
}

impl From<Vec<String>> for ScopeSet {
    fn from(scopes: Vec<String>) -> Self {
        scopes.into_iter().collect()
    }
}

impl From<ScopeSet> for Vec<String> {
    fn from(scopes: ScopeSet) -> Self {
        scopes.0
    }
}

impl From<&[&str]> for ScopeSet {
    fn from(scopes: &[&str]) -> Self {
        scopes.iter().copied().collect()
    }
}

// Set equality; order only matters for display.
impl PartialEq for ScopeSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.is_subset(other)
    }
}

impl Eq for ScopeSet {}

impl fmt::Display for ScopeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}
