//! Relation resolution for state guards.
//!
//! Objects expose their current state path through a shared [`StateCell`];
//! other objects bind those cells under their declared relation names. Guard
//! checks (valid-while, inbound-while) read the far side's cell at evaluation
//! time, so relation cycles between objects are fine and no object ever holds
//! another object itself.

use crate::meta::RelationConstraintMetadata;
use parking_lot::RwLock;
use std::sync::Arc;

/// Pseudo-state reported for an unbound single-valued relation. An unset
/// relation fails any constraint that names concrete states.
pub const UNSET_STATE: &str = "<unset>";

/// A shared, read-mostly view of one object's current state path
/// (outermost composite state first, innermost substate last).
#[derive(Debug, Clone, Default)]
pub struct StateCell {
    path: Arc<RwLock<Vec<String>>>,
}

impl StateCell {
    pub(crate) fn new(path: Vec<String>) -> Self {
        Self {
            path: Arc::new(RwLock::new(path)),
        }
    }

    /// The innermost occupied state, if any.
    pub fn innermost(&self) -> Option<String> {
        self.path.read().last().cloned()
    }

    /// The full occupied path, outermost first.
    pub fn path(&self) -> Vec<String> {
        self.path.read().clone()
    }

    /// True if any level of the occupied path is named `state`. A far-side
    /// object inside a composite state presents both the composite name and
    /// the substate name.
    pub fn occupies(&self, state: &str) -> bool {
        self.path.read().iter().any(|s| s == state)
    }

    pub(crate) fn set(&self, path: Vec<String>) {
        *self.path.write() = path;
    }
}

/// A runtime binding of a declared relation to far-side state cells.
#[derive(Debug, Clone)]
pub enum RelationBinding {
    /// Single-valued relation.
    Single(StateCell),
    /// Multi-keyed relation: every instance must satisfy each constraint.
    Multi(Vec<(String, StateCell)>),
}

/// A failed relation constraint check, before it is tagged as a valid-while
/// or inbound-while violation.
#[derive(Debug, Clone)]
pub struct ConstraintViolation {
    pub relation: String,
    pub required: Vec<String>,
    pub actual: String,
    /// Offending instance key for multi-keyed relations.
    pub key: Option<String>,
}

fn cell_satisfies(cell: &StateCell, on: &[String]) -> bool {
    on.iter().any(|state| cell.occupies(state))
}

fn cell_actual(cell: &StateCell) -> String {
    cell.innermost().unwrap_or_else(|| UNSET_STATE.to_string())
}

/// Checks one relation constraint against the binding for its relation.
///
/// An absent binding is the unset pseudo-state and fails. A multi-keyed
/// binding must satisfy the constraint for every instance; the first offender
/// (in binding order) is reported with its key.
pub fn check_constraint(
    binding: Option<&RelationBinding>,
    constraint: &RelationConstraintMetadata,
) -> Result<(), ConstraintViolation> {
    match binding {
        None => Err(ConstraintViolation {
            relation: constraint.relation.clone(),
            required: constraint.on.clone(),
            actual: UNSET_STATE.to_string(),
            key: None,
        }),
        Some(RelationBinding::Single(cell)) => {
            if cell_satisfies(cell, &constraint.on) {
                Ok(())
            } else {
                Err(ConstraintViolation {
                    relation: constraint.relation.clone(),
                    required: constraint.on.clone(),
                    actual: cell_actual(cell),
                    key: None,
                })
            }
        }
        Some(RelationBinding::Multi(cells)) => {
            for (key, cell) in cells {
                if !cell_satisfies(cell, &constraint.on) {
                    return Err(ConstraintViolation {
                        relation: constraint.relation.clone(),
                        required: constraint.on.clone(),
                        actual: cell_actual(cell),
                        key: Some(key.clone()),
                    });
                }
            }
            Ok(())
        }
    }
}
