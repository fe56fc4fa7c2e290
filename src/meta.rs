//! The verified, immutable meta-model.
//!
//! A [`StateMachineMetadata`] is the validated and indexed form of a
//! [`MachineSpec`](crate::spec::MachineSpec): inheritance is resolved into
//! flattened member tables (inherited members first, overridden members
//! replaced in place), composite sub-machines are linked from their owning
//! state, and every cross reference has been checked by the builder. The
//! meta-model is built once, `Arc`-shared, and read-only for the rest of the
//! process lifetime.

use crate::path::DottedPath;
use crate::spec::{CallbackPhase, GuardPhase};
use std::collections::HashMap;
use std::sync::Arc;

/// A (transition -> next-state candidates) mapping on a state.
#[derive(Debug, Clone)]
pub struct FunctionMetadata {
    pub transition: String,
    pub candidates: Vec<String>,
}

impl FunctionMetadata {
    /// Conditional dispatch: more than one candidate next state.
    pub fn conditional(&self) -> bool {
        self.candidates.len() > 1
    }
}

/// A relation-based guard: the far side of `relation` must currently occupy
/// one of the `on` states.
#[derive(Debug, Clone)]
pub struct RelationConstraintMetadata {
    pub relation: String,
    pub on: Vec<String>,
    /// Pre or post commit; occupancy (valid-while) constraints ignore this.
    pub phase: GuardPhase,
}

/// A declared pre/post state-change callback binding.
#[derive(Debug, Clone)]
pub struct CallbackMetadata {
    pub name: String,
    pub phase: CallbackPhase,
    pub from: Option<String>,
    pub to: Option<String>,
    pub relation: Option<String>,
    pub mapped_by: Option<String>,
}

impl CallbackMetadata {
    /// Whether this binding applies to an `old -> new` state change.
    pub fn matches(&self, phase: CallbackPhase, old: &str, new: &str) -> bool {
        self.phase == phase
            && self.from.as_deref().map_or(true, |f| f == old)
            && self.to.as_deref().map_or(true, |t| t == new)
    }
}

/// A named state of one machine.
#[derive(Debug)]
pub struct StateMetadata {
    pub name: String,
    pub path: DottedPath,
    pub initial: bool,
    /// Final state flag.
    pub end: bool,
    pub overrides: bool,
    /// Nested sub-machine for composite states.
    pub composite: Option<Arc<StateMachineMetadata>>,
    /// For final substates: enclosing-machine state entered automatically.
    pub shortcut: Option<String>,
    pub functions: Vec<FunctionMetadata>,
    pub valid_while: Vec<RelationConstraintMetadata>,
    /// Declaration order is invocation order.
    pub callbacks: Vec<CallbackMetadata>,
}

impl StateMetadata {
    pub fn is_composite(&self) -> bool {
        self.composite.is_some()
    }

    /// Looks up the function reacting to `transition` on this state.
    pub fn function_for(&self, transition: &str) -> Option<&FunctionMetadata> {
        self.functions.iter().find(|f| f.transition == transition)
    }
}

/// A named transition of one machine.
#[derive(Debug)]
pub struct TransitionMetadata {
    pub name: String,
    pub path: DottedPath,
    pub overrides: bool,
    /// Condition judging conditional dispatch; `Some` iff conditional.
    pub condition: Option<String>,
    pub inbound_while: Vec<RelationConstraintMetadata>,
}

impl TransitionMetadata {
    pub fn conditional(&self) -> bool {
        self.condition.is_some()
    }
}

/// A named predicate with a declared key domain.
#[derive(Debug, Clone)]
pub struct ConditionMetadata {
    pub name: String,
    pub path: DottedPath,
    pub keys: Vec<String>,
}

/// A named, typed link to an object governed by another machine. The target is
/// a lookup key rather than an embedded reference so relation cycles build.
#[derive(Debug, Clone)]
pub struct RelationMetadata {
    pub name: String,
    pub path: DottedPath,
    pub target: String,
    pub multi: bool,
    pub overrides: bool,
}

/// One verified state machine: flattened member tables plus composite links.
#[derive(Debug)]
pub struct StateMachineMetadata {
    pub name: String,
    pub path: DottedPath,
    /// CRC32C of the source spec; idempotent re-registration key.
    pub checksum: String,
    pub super_machine: Option<String>,
    /// True for nested sub-machines owned by a composite state.
    pub composite: bool,
    states: Vec<Arc<StateMetadata>>,
    state_index: HashMap<String, usize>,
    transitions: Vec<Arc<TransitionMetadata>>,
    transition_index: HashMap<String, usize>,
    relations: Vec<RelationMetadata>,
    conditions: HashMap<String, ConditionMetadata>,
}

impl StateMachineMetadata {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        path: DottedPath,
        checksum: String,
        super_machine: Option<String>,
        composite: bool,
        states: Vec<Arc<StateMetadata>>,
        transitions: Vec<Arc<TransitionMetadata>>,
        relations: Vec<RelationMetadata>,
        conditions: Vec<ConditionMetadata>,
    ) -> Self {
        let state_index = states
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();
        let transition_index = transitions
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i))
            .collect();
        let conditions = conditions.into_iter().map(|c| (c.name.clone(), c)).collect();
        Self {
            name,
            path,
            checksum,
            super_machine,
            composite,
            states,
            state_index,
            transitions,
            transition_index,
            relations,
            conditions,
        }
    }

    /// States in declaration order, inherited members first.
    pub fn states(&self) -> &[Arc<StateMetadata>] {
        &self.states
    }

    pub fn state(&self, name: &str) -> Option<&Arc<StateMetadata>> {
        self.state_index.get(name).map(|&i| &self.states[i])
    }

    pub fn has_state(&self, name: &str) -> bool {
        self.state_index.contains_key(name)
    }

    /// The unique initial state. The builder refuses machines where this does
    /// not exist.
    pub fn initial_state(&self) -> Option<&Arc<StateMetadata>> {
        self.states.iter().find(|s| s.initial)
    }

    pub fn transitions(&self) -> &[Arc<TransitionMetadata>] {
        &self.transitions
    }

    pub fn transition(&self, name: &str) -> Option<&Arc<TransitionMetadata>> {
        self.transition_index.get(name).map(|&i| &self.transitions[i])
    }

    pub fn relations(&self) -> &[RelationMetadata] {
        &self.relations
    }

    pub fn relation(&self, name: &str) -> Option<&RelationMetadata> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn condition(&self, name: &str) -> Option<&ConditionMetadata> {
        self.conditions.get(name)
    }

    pub fn conditions(&self) -> impl Iterator<Item = &ConditionMetadata> {
        self.conditions.values()
    }

    /// Relation lookup across this machine and every nested sub-machine.
    /// Runtime objects bind relations in one flat namespace.
    pub fn relation_anywhere(&self, name: &str) -> Option<&RelationMetadata> {
        if let Some(r) = self.relation(name) {
            return Some(r);
        }
        for state in &self.states {
            if let Some(sub) = &state.composite {
                if let Some(r) = sub.relation_anywhere(name) {
                    return Some(r);
                }
            }
        }
        None
    }

    /// Condition lookup across this machine and every nested sub-machine.
    pub fn condition_anywhere(&self, name: &str) -> Option<&ConditionMetadata> {
        if let Some(c) = self.condition(name) {
            return Some(c);
        }
        for state in &self.states {
            if let Some(sub) = &state.composite {
                if let Some(c) = sub.condition_anywhere(name) {
                    return Some(c);
                }
            }
        }
        None
    }

    /// Names of every state in this machine and its nested sub-machines.
    /// Relation constraints may name substates of the far side.
    pub fn all_state_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.collect_state_names(&mut names);
        names
    }

    fn collect_state_names(&self, names: &mut Vec<String>) {
        for state in &self.states {
            names.push(state.name.clone());
            if let Some(sub) = &state.composite {
                sub.collect_state_names(names);
            }
        }
    }
}

/// The full verified model: every machine built in one registry startup.
#[derive(Debug, Default)]
pub struct MetaModel {
    machines: HashMap<String, Arc<StateMachineMetadata>>,
}

impl MetaModel {
    pub(crate) fn new(machines: HashMap<String, Arc<StateMachineMetadata>>) -> Self {
        Self { machines }
    }

    pub fn machine(&self, name: &str) -> Option<&Arc<StateMachineMetadata>> {
        self.machines.get(name)
    }

    pub fn machines(&self) -> impl Iterator<Item = &Arc<StateMachineMetadata>> {
        self.machines.values()
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    pub(crate) fn into_machines(self) -> HashMap<String, Arc<StateMachineMetadata>> {
        self.machines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(name: &str, initial: bool, end: bool) -> Arc<StateMetadata> {
        Arc::new(StateMetadata {
            name: name.to_string(),
            path: DottedPath::root("M").child("StateSet").child(name),
            initial,
            end,
            overrides: false,
            composite: None,
            shortcut: None,
            functions: vec![FunctionMetadata {
                transition: "Go".to_string(),
                candidates: vec!["B".to_string()],
            }],
            valid_while: Vec::new(),
            callbacks: Vec::new(),
        })
    }

    fn machine() -> StateMachineMetadata {
        StateMachineMetadata::new(
            "M".to_string(),
            DottedPath::root("M"),
            "00000000".to_string(),
            None,
            false,
            vec![state("A", true, false), state("B", false, true)],
            vec![Arc::new(TransitionMetadata {
                name: "Go".to_string(),
                path: DottedPath::root("M").child("TransitionSet").child("Go"),
                overrides: false,
                condition: None,
                inbound_while: Vec::new(),
            })],
            Vec::new(),
            Vec::new(),
        )
    }

    #[test]
    fn test_state_lookup_and_initial() {
        let m = machine();
        assert!(m.has_state("A"));
        assert!(!m.has_state("C"));
        assert_eq!(m.initial_state().unwrap().name, "A");
    }

    #[test]
    fn test_function_lookup() {
        let m = machine();
        let a = m.state("A").unwrap();
        assert_eq!(a.function_for("Go").unwrap().candidates, vec!["B"]);
        assert!(a.function_for("Stop").is_none());
    }

    #[test]
    fn test_callback_matching() {
        let cb = CallbackMetadata {
            name: "notify".to_string(),
            phase: CallbackPhase::Post,
            from: Some("A".to_string()),
            to: None,
            relation: None,
            mapped_by: None,
        };
        assert!(cb.matches(CallbackPhase::Post, "A", "B"));
        assert!(!cb.matches(CallbackPhase::Post, "B", "A"));
        assert!(!cb.matches(CallbackPhase::Pre, "A", "B"));
    }
}
