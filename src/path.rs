//! Dotted diagnostic paths for meta-model elements.
//!
//! Every state machine, state, transition, relation, and condition carries a
//! fully-qualified hierarchical name such as `Order.StateSet.Created` or
//! `Order.StateSet.Started.TransitionSet.DoProduce`. Verification failures
//! point at these paths so a spec author can locate the offending declaration
//! without guessing.

use std::fmt;

/// A hierarchical, dot-separated element name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DottedPath(String);

impl DottedPath {
    /// Starts a path at a root segment (a machine name).
    pub fn root(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns a new path with `segment` appended.
    pub fn child(&self, segment: &str) -> Self {
        if self.0.is_empty() {
            Self(segment.to_string())
        } else {
            Self(format!("{}.{}", self.0, segment))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DottedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
