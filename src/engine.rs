//! Runtime lifecycle objects: transition firing against verified metadata.
//!
//! A [`StateMachineObject`] owns its state path and reactive context, binds
//! relation cells, condition judges and callback closures by declared name,
//! and fires transitions through the guard pipeline: occupancy guards, the
//! pre-phase inbound guards, entry guards on the computed new path, pre
//! callbacks, commit, post-phase inbound guards, post callbacks.

use crate::condition::ConditionJudge;
use crate::meta::{RelationConstraintMetadata, StateMachineMetadata, StateMetadata};
use crate::relation::{check_constraint, ConstraintViolation, RelationBinding, StateCell};
use crate::spec::{CallbackPhase, GuardPhase};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Failures raised while driving a lifecycle object at runtime. Structural
/// problems never reach here; they are refused at build time.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("transition '{transition}' cannot fire from state '{state}' of machine '{machine}'")]
    InvalidTransition {
        machine: String,
        state: String,
        transition: String,
    },

    #[error("state '{state}' does not exist in machine '{machine}'")]
    InvalidState { machine: String, state: String },

    #[error("state machine '{name}' is not registered")]
    MachineNotFound { name: String },

    #[error("relation '{name}' is not declared by this machine")]
    RelationNotDeclared { name: String },

    #[error("relation '{relation}' cardinality does not match the binding")]
    RelationCardinalityMismatch { relation: String },

    #[error("condition '{name}' is not declared by this machine")]
    ConditionNotDeclared { name: String },

    #[error("callback '{name}' is not declared by this machine")]
    CallbackNotDeclared { name: String },

    #[error("transition '{transition}' is conditional but no judge is bound for condition '{condition}'")]
    ConditionNotBound {
        transition: String,
        condition: String,
    },

    #[error("condition '{condition}' returned '{result}', which is not a declared candidate")]
    ConditionResultInvalid { condition: String, result: String },

    #[error(
        "state '{state}' requires relation '{relation}' in one of {required:?}, found '{actual}'"
    )]
    ValidWhileViolation {
        state: String,
        relation: String,
        required: Vec<String>,
        actual: String,
        key: Option<String>,
    },

    #[error(
        "{phase} guard of transition '{transition}' requires relation '{relation}' in one of {required:?}, found '{actual}'"
    )]
    InboundWhileViolation {
        phase: GuardPhase,
        transition: String,
        relation: String,
        required: Vec<String>,
        actual: String,
        key: Option<String>,
    },
}

impl LifecycleError {
    pub fn error_code(&self) -> &'static str {
        match self {
            LifecycleError::InvalidTransition { .. } => "INVALID_TRANSITION",
            LifecycleError::InvalidState { .. } => "INVALID_STATE",
            LifecycleError::MachineNotFound { .. } => "MACHINE_NOT_FOUND",
            LifecycleError::RelationNotDeclared { .. } => "RELATION_NOT_DECLARED",
            LifecycleError::RelationCardinalityMismatch { .. } => "RELATION_CARDINALITY_MISMATCH",
            LifecycleError::ConditionNotDeclared { .. } => "CONDITION_NOT_DECLARED",
            LifecycleError::CallbackNotDeclared { .. } => "CALLBACK_NOT_DECLARED",
            LifecycleError::ConditionNotBound { .. } => "CONDITION_NOT_BOUND",
            LifecycleError::ConditionResultInvalid { .. } => "CONDITION_RESULT_INVALID",
            LifecycleError::ValidWhileViolation { .. } => "VALID_WHILE_VIOLATION",
            LifecycleError::InboundWhileViolation { .. } => "INBOUND_WHILE_VIOLATION",
        }
    }
}

/// What a callback closure sees: the firing transition, the path being left,
/// the path being entered, and the object context at invocation time.
pub struct CallbackContext<'a> {
    pub transition: &'a str,
    pub from: &'a [String],
    pub to: &'a [String],
    pub ctx: &'a Value,
}

pub type CallbackFn = Box<dyn Fn(&CallbackContext<'_>) + Send + Sync>;

/// A live instance of a verified state machine.
///
/// Firing takes `&mut self`, so a callback can never re-enter the same
/// object's transition pipeline.
pub struct StateMachineObject {
    machine: Arc<StateMachineMetadata>,
    cell: StateCell,
    ctx: Value,
    relations: HashMap<String, RelationBinding>,
    conditions: HashMap<String, Box<dyn ConditionJudge>>,
    callbacks: HashMap<String, CallbackFn>,
}

impl fmt::Debug for StateMachineObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachineObject")
            .field("machine", &self.machine.name)
            .field("path", &self.cell.path())
            .finish_non_exhaustive()
    }
}

impl StateMachineObject {
    pub(crate) fn new(
        machine: Arc<StateMachineMetadata>,
        initial_ctx: Value,
    ) -> Result<Self, LifecycleError> {
        let initial = machine
            .initial_state()
            .ok_or_else(|| LifecycleError::InvalidState {
                machine: machine.name.clone(),
                state: "<initial>".to_string(),
            })?;
        let mut path = Vec::new();
        entry_cascade(initial, &mut path);
        Ok(Self {
            machine,
            cell: StateCell::new(path),
            ctx: initial_ctx,
            relations: HashMap::new(),
            conditions: HashMap::new(),
            callbacks: HashMap::new(),
        })
    }

    pub fn machine(&self) -> &Arc<StateMachineMetadata> {
        &self.machine
    }

    /// Innermost current state name.
    pub fn state(&self) -> String {
        self.cell.innermost().unwrap_or_default()
    }

    /// Full current path, outermost level first.
    pub fn state_path(&self) -> Vec<String> {
        self.cell.path()
    }

    pub fn ctx(&self) -> &Value {
        &self.ctx
    }

    /// A cell observing this object's path, for binding into the relation
    /// slot of another object.
    pub fn watch(&self) -> StateCell {
        self.cell.clone()
    }

    /// The current innermost state, after asserting every occupancy guard
    /// along the path still holds.
    pub fn checked_state(&self) -> Result<String, LifecycleError> {
        let path = self.cell.path();
        let chain = self.machine_chain(&path)?;
        self.check_occupancy(&chain)?;
        Ok(self.cell.innermost().unwrap_or_default())
    }

    pub fn bind_relation(&mut self, name: &str, cell: StateCell) -> Result<(), LifecycleError> {
        let meta = self.machine.relation_anywhere(name).ok_or_else(|| {
            LifecycleError::RelationNotDeclared {
                name: name.to_string(),
            }
        })?;
        if meta.multi {
            return Err(LifecycleError::RelationCardinalityMismatch {
                relation: name.to_string(),
            });
        }
        self.relations
            .insert(name.to_string(), RelationBinding::Single(cell));
        Ok(())
    }

    /// Adds one keyed cell to a multi-valued relation.
    pub fn bind_relation_keyed(
        &mut self,
        name: &str,
        key: impl Into<String>,
        cell: StateCell,
    ) -> Result<(), LifecycleError> {
        let meta = self.machine.relation_anywhere(name).ok_or_else(|| {
            LifecycleError::RelationNotDeclared {
                name: name.to_string(),
            }
        })?;
        if !meta.multi {
            return Err(LifecycleError::RelationCardinalityMismatch {
                relation: name.to_string(),
            });
        }
        match self
            .relations
            .entry(name.to_string())
            .or_insert_with(|| RelationBinding::Multi(Vec::new()))
        {
            RelationBinding::Multi(cells) => cells.push((key.into(), cell)),
            RelationBinding::Single(_) => {
                return Err(LifecycleError::RelationCardinalityMismatch {
                    relation: name.to_string(),
                })
            }
        }
        Ok(())
    }

    pub fn bind_condition(
        &mut self,
        name: &str,
        judge: impl ConditionJudge + 'static,
    ) -> Result<(), LifecycleError> {
        if self.machine.condition_anywhere(name).is_none() {
            return Err(LifecycleError::ConditionNotDeclared {
                name: name.to_string(),
            });
        }
        self.conditions.insert(name.to_string(), Box::new(judge));
        Ok(())
    }

    pub fn bind_callback(
        &mut self,
        name: &str,
        callback: impl Fn(&CallbackContext<'_>) + Send + Sync + 'static,
    ) -> Result<(), LifecycleError> {
        let declared = self
            .machine
            .states()
            .iter()
            .any(|s| state_declares_callback(s, name));
        if !declared {
            return Err(LifecycleError::CallbackNotDeclared {
                name: name.to_string(),
            });
        }
        self.callbacks.insert(name.to_string(), Box::new(callback));
        Ok(())
    }

    /// Fires a transition and returns the new state path.
    ///
    /// A pre-phase guard violation leaves the object untouched. A post-phase
    /// inbound guard violation is reported as an error but the transition has
    /// already committed; the object stays in the new state and post
    /// callbacks are skipped.
    pub fn fire(
        &mut self,
        transition: &str,
        payload: Option<Value>,
    ) -> Result<Vec<String>, LifecycleError> {
        let old_path = self.cell.path();
        let chain = self.machine_chain(&old_path)?;

        // Occupancy: every level of the current path must still be legal.
        self.check_occupancy(&chain)?;

        // Innermost level that can serve this transition wins.
        let (level, machine, state) = chain
            .iter()
            .enumerate()
            .rev()
            .find_map(|(i, (m, s))| {
                s.function_for(transition)?;
                m.transition(transition).map(|_| (i, m.clone(), s.clone()))
            })
            .ok_or_else(|| LifecycleError::InvalidTransition {
                machine: self.machine.name.clone(),
                state: self.cell.innermost().unwrap_or_default(),
                transition: transition.to_string(),
            })?;
        let transition_meta = match machine.transition(transition) {
            Some(t) => t.clone(),
            None => {
                return Err(LifecycleError::InvalidTransition {
                    machine: self.machine.name.clone(),
                    state: state.name.clone(),
                    transition: transition.to_string(),
                })
            }
        };
        let function = match state.function_for(transition) {
            Some(f) => f.clone(),
            None => {
                return Err(LifecycleError::InvalidTransition {
                    machine: self.machine.name.clone(),
                    state: state.name.clone(),
                    transition: transition.to_string(),
                })
            }
        };

        // The judge sees the context as it will be after the merge, evaluated
        // exactly once per firing.
        let target = if function.candidates.len() == 1 {
            function.candidates[0].clone()
        } else {
            let condition = transition_meta.condition.clone().ok_or_else(|| {
                LifecycleError::InvalidTransition {
                    machine: self.machine.name.clone(),
                    state: state.name.clone(),
                    transition: transition.to_string(),
                }
            })?;
            let judge = self.conditions.get(&condition).ok_or_else(|| {
                LifecycleError::ConditionNotBound {
                    transition: transition.to_string(),
                    condition: condition.clone(),
                }
            })?;
            let mut view = self.ctx.clone();
            if let Some(patch) = &payload {
                merge_ctx(&mut view, patch);
            }
            let result = judge.judge(&view);
            if !function.candidates.contains(&result) {
                return Err(LifecycleError::ConditionResultInvalid {
                    condition,
                    result,
                });
            }
            result
        };

        for constraint in &transition_meta.inbound_while {
            if constraint.phase == GuardPhase::Pre {
                self.check_inbound(transition, constraint)?;
            }
        }

        let new_path = self.entry_path(&old_path, level, &machine, &target)?;

        // Entry guards along the whole new path.
        let new_chain = self.machine_chain(&new_path)?;
        self.check_occupancy(&new_chain)?;

        let old_inner = self.cell.innermost().unwrap_or_default();
        let new_inner = new_path.last().cloned().unwrap_or_default();

        self.run_callbacks(
            CallbackPhase::Pre,
            &chain,
            &new_chain,
            transition,
            &old_path,
            &new_path,
            &old_inner,
            &new_inner,
        );

        // Commit.
        self.cell.set(new_path.clone());
        if let Some(patch) = &payload {
            merge_ctx(&mut self.ctx, patch);
        }
        tracing::debug!(
            machine = %self.machine.name,
            %transition,
            from = %old_inner,
            to = %new_inner,
            "transition fired"
        );

        // Post-phase inbound guards observe the committed state. A violation
        // is an error, yet the transition stands.
        for constraint in &transition_meta.inbound_while {
            if constraint.phase == GuardPhase::Post {
                if let Err(err) = self.check_inbound(transition, constraint) {
                    tracing::warn!(
                        machine = %self.machine.name,
                        %transition,
                        "post-phase inbound guard violated after commit: {err}"
                    );
                    return Err(err);
                }
            }
        }

        self.run_callbacks(
            CallbackPhase::Post,
            &chain,
            &new_chain,
            transition,
            &old_path,
            &new_path,
            &old_inner,
            &new_inner,
        );

        Ok(new_path)
    }

    /// Metadata for every level of a path, outermost first.
    fn machine_chain(
        &self,
        path: &[String],
    ) -> Result<Vec<(Arc<StateMachineMetadata>, Arc<StateMetadata>)>, LifecycleError> {
        let mut chain = Vec::with_capacity(path.len());
        let mut machine = self.machine.clone();
        for (i, name) in path.iter().enumerate() {
            let state = machine
                .state(name)
                .ok_or_else(|| LifecycleError::InvalidState {
                    machine: machine.name.clone(),
                    state: name.clone(),
                })?
                .clone();
            let next = state.composite.clone();
            chain.push((machine.clone(), state));
            if i + 1 < path.len() {
                let owner = machine.name.clone();
                machine = next.ok_or_else(|| LifecycleError::InvalidState {
                    machine: owner,
                    state: path[i + 1].clone(),
                })?;
            }
        }
        Ok(chain)
    }

    fn check_occupancy(
        &self,
        chain: &[(Arc<StateMachineMetadata>, Arc<StateMetadata>)],
    ) -> Result<(), LifecycleError> {
        for (_, state) in chain {
            for constraint in &state.valid_while {
                let binding = self.relations.get(&constraint.relation);
                if let Err(violation) = check_constraint(binding, constraint) {
                    return Err(valid_while_error(&state.name, violation));
                }
            }
        }
        Ok(())
    }

    fn check_inbound(
        &self,
        transition: &str,
        constraint: &RelationConstraintMetadata,
    ) -> Result<(), LifecycleError> {
        let binding = self.relations.get(&constraint.relation);
        check_constraint(binding, constraint).map_err(|violation| {
            LifecycleError::InboundWhileViolation {
                phase: constraint.phase,
                transition: transition.to_string(),
                relation: violation.relation,
                required: violation.required,
                actual: violation.actual,
                key: violation.key,
            }
        })
    }

    /// The path after firing at `level` towards `target`: outer levels stay,
    /// a final target with a shortcut hops out one level, and composite
    /// targets cascade down into their initial states.
    fn entry_path(
        &self,
        old_path: &[String],
        level: usize,
        machine: &StateMachineMetadata,
        target: &str,
    ) -> Result<Vec<String>, LifecycleError> {
        let mut level = level;
        let mut machine = machine;
        let mut target = target.to_string();

        // Shortcut hop: a final substate may redirect the firing one level
        // out, possibly repeatedly through nested composites.
        loop {
            let state = machine
                .state(&target)
                .ok_or_else(|| LifecycleError::InvalidState {
                    machine: machine.name.clone(),
                    state: target.clone(),
                })?;
            match (&state.shortcut, level) {
                (Some(shortcut), l) if l > 0 => {
                    level -= 1;
                    target = shortcut.clone();
                    machine = self.machine_at(old_path, level)?;
                }
                _ => break,
            }
        }

        let mut path: Vec<String> = old_path[..level].to_vec();
        let state = machine
            .state(&target)
            .ok_or_else(|| LifecycleError::InvalidState {
                machine: machine.name.clone(),
                state: target.clone(),
            })?;
        entry_cascade(state, &mut path);
        Ok(path)
    }

    /// The machine governing level `level` of a path.
    fn machine_at(
        &self,
        path: &[String],
        level: usize,
    ) -> Result<&StateMachineMetadata, LifecycleError> {
        let mut machine: &StateMachineMetadata = &self.machine;
        for name in path.iter().take(level) {
            let state = machine
                .state(name)
                .ok_or_else(|| LifecycleError::InvalidState {
                    machine: machine.name.clone(),
                    state: name.clone(),
                })?;
            machine = state
                .composite
                .as_deref()
                .ok_or_else(|| LifecycleError::InvalidState {
                    machine: machine.name.clone(),
                    state: name.clone(),
                })?;
        }
        Ok(machine)
    }

    /// Runs the bound callbacks of the leaving and entering innermost states
    /// that match the phase, in declaration order, leaving state first.
    #[allow(clippy::too_many_arguments)]
    fn run_callbacks(
        &self,
        phase: CallbackPhase,
        old_chain: &[(Arc<StateMachineMetadata>, Arc<StateMetadata>)],
        new_chain: &[(Arc<StateMachineMetadata>, Arc<StateMetadata>)],
        transition: &str,
        old_path: &[String],
        new_path: &[String],
        old_inner: &str,
        new_inner: &str,
    ) {
        let context = CallbackContext {
            transition,
            from: old_path,
            to: new_path,
            ctx: &self.ctx,
        };
        let old_state = old_chain.last().map(|(_, s)| s);
        let new_state = new_chain.last().map(|(_, s)| s);
        if let Some(state) = old_state {
            self.run_state_callbacks(state, phase, old_inner, new_inner, &context);
        }
        let same = match (old_state, new_state) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        if !same {
            if let Some(state) = new_state {
                self.run_state_callbacks(state, phase, old_inner, new_inner, &context);
            }
        }
    }

    fn run_state_callbacks(
        &self,
        state: &StateMetadata,
        phase: CallbackPhase,
        old_inner: &str,
        new_inner: &str,
        context: &CallbackContext<'_>,
    ) {
        for declared in &state.callbacks {
            if !declared.matches(phase, old_inner, new_inner) {
                continue;
            }
            if let Some(callback) = self.callbacks.get(&declared.name) {
                callback(context);
            }
        }
    }
}

fn state_declares_callback(state: &StateMetadata, name: &str) -> bool {
    state.callbacks.iter().any(|cb| cb.name == name)
        || state
            .composite
            .as_ref()
            .map_or(false, |sub| {
                sub.states().iter().any(|s| state_declares_callback(s, name))
            })
}

fn valid_while_error(state: &str, violation: ConstraintViolation) -> LifecycleError {
    LifecycleError::ValidWhileViolation {
        state: state.to_string(),
        relation: violation.relation,
        required: violation.required,
        actual: violation.actual,
        key: violation.key,
    }
}

/// Appends `state` and, when composite, the cascade of nested initial states.
fn entry_cascade(state: &StateMetadata, path: &mut Vec<String>) {
    path.push(state.name.clone());
    let mut current = state.composite.clone();
    while let Some(machine) = current {
        match machine.initial_state() {
            Some(initial) => {
                path.push(initial.name.clone());
                current = initial.composite.clone();
            }
            None => break,
        }
    }
}

/// Shallow merge of a JSON object patch into the object context. Non-object
/// values replace the context wholesale.
pub(crate) fn merge_ctx(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                base.insert(key.clone(), value.clone());
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}
