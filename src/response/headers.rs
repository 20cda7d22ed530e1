//! Ordered header sequence carried by a response record.
//!
//! # Design Decisions
//! - Headers are an ordered list of `(name, value, append)` triples, never a map
//! - No deduplication: duplicate names are kept in insertion order
//! - `append` only matters at serialization time (see `wire.rs`)

use serde::{Deserialize, Serialize};

/// Canonical lowercase name of the content type header.
pub const CONTENT_TYPE: &str = "content-type";

/// A single header as produced by a handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderTriple {
    /// Header name. Never empty.
    pub name: String,
    /// Header value. May be empty.
    pub value: String,
    /// `true` adds alongside earlier headers of the same name,
    /// `false` replaces them.
    pub append: bool,
}

impl HeaderTriple {
    /// Header with "set" semantics.
    pub fn set(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            append: false,
        }
    }

    /// Header with "add" semantics.
    pub fn add(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            append: true,
        }
    }

    /// Case-insensitive name comparison.
    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Ordered, append-extensible header sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<HeaderTriple>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Push a header at the tail. Amortized O(1).
    pub fn push(&mut self, header: HeaderTriple) {
        self.0.push(header);
    }

    /// Whether any header carries `name` (case-insensitive).
    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|h| h.is_named(name))
    }

    /// All values recorded under `name`, in insertion order.
    pub fn values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |h| h.is_named(name))
            .map(|h| h.value.as_str())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, HeaderTriple> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<HeaderTriple> {
        self.0
    }
}

impl From<Vec<HeaderTriple>> for Headers {
    fn from(headers: Vec<HeaderTriple>) -> Self {
        Self(headers)
    }
}

impl FromIterator<HeaderTriple> for Headers {
    fn from_iter<I: IntoIterator<Item = HeaderTriple>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Headers {
    type Item = HeaderTriple;
    type IntoIter = std::vec::IntoIter<HeaderTriple>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a HeaderTriple;
    type IntoIter = std::slice::Iter<'a, HeaderTriple>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
