//! Meta-model verification and construction.
//!
//! The builder walks raw [`MachineSpec`]s bottom-up, resolves inheritance into
//! flattened member tables, validates composite sub-machines before their
//! owning state, and accumulates every independent structural violation into
//! one [`VerificationFailureSet`]. Cross-machine relation checks run as a
//! second phase over lookup keys, so machines that relate to each other in a
//! cycle still build.

use crate::meta::{
    CallbackMetadata, ConditionMetadata, FunctionMetadata, MetaModel, RelationConstraintMetadata,
    RelationMetadata, StateMachineMetadata, StateMetadata, TransitionMetadata,
};
use crate::path::DottedPath;
use crate::spec::{
    CallbackPhase, GuardPhase, MachineBody, MachineSpec, StateSpec,
};
use crate::verification::{SyntaxErrorCode, VerificationFailureSet};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Builds a verified [`MetaModel`] out of raw machine specs.
///
/// ```
/// use statemeta::{MachineSpec, MetaModelBuilder};
/// use serde_json::json;
///
/// let spec = MachineSpec::from_json(&json!({
///     "name": "Door",
///     "state_sets": [{"states": [
///         {"name": "Closed", "initial": true,
///          "functions": [{"transition": "Open", "candidates": "Opened"}]},
///         {"name": "Opened", "end": true}
///     ]}],
///     "transition_sets": [{"transitions": [{"name": "Open"}]}]
/// })).unwrap();
///
/// let mut builder = MetaModelBuilder::new();
/// builder.add_machine(spec);
/// let model = builder.build().unwrap();
/// assert!(model.machine("Door").is_some());
/// ```
#[derive(Default)]
pub struct MetaModelBuilder {
    specs: Vec<MachineSpec>,
    /// Machines from an earlier build, usable as inheritance parents and
    /// relation targets.
    context: HashMap<String, Arc<StateMachineMetadata>>,
}

/// Cross-machine checks deferred until every machine has been built by name.
#[derive(Default)]
struct Deferred {
    /// Declared relation -> its target machine must exist.
    relation_targets: Vec<(DottedPath, String)>,
    /// Constraint `on` states must exist somewhere in the target machine.
    constraint_states: Vec<(DottedPath, String, Vec<String>)>,
    /// Callback `mapped_by` must name a relation of the target machine.
    mapped_by: Vec<(DottedPath, String, String)>,
}

/// Relation name resolution scope: a nested sub-machine sees its own
/// relations first, then the enclosing machine chain.
struct RelationScope<'a> {
    relations: &'a [RelationMetadata],
    parent: Option<&'a RelationScope<'a>>,
}

impl RelationScope<'_> {
    fn resolve(&self, name: &str) -> Option<&RelationMetadata> {
        self.relations
            .iter()
            .find(|r| r.name == name)
            .or_else(|| self.parent.and_then(|p| p.resolve(name)))
    }
}

impl MetaModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_context(context: HashMap<String, Arc<StateMachineMetadata>>) -> Self {
        Self {
            specs: Vec::new(),
            context,
        }
    }

    pub fn add_machine(&mut self, spec: MachineSpec) -> &mut Self {
        self.specs.push(spec);
        self
    }

    /// Verifies every added spec and produces the meta-model, or the full set
    /// of structural violations. There is no partially-valid meta-model.
    pub fn build(self) -> Result<MetaModel, VerificationFailureSet> {
        let mut failures = VerificationFailureSet::new();
        let mut deferred = Deferred::default();

        // Duplicate machine names within the batch.
        let mut seen: HashSet<&str> = HashSet::new();
        for spec in &self.specs {
            if !seen.insert(&spec.name) {
                failures.push(
                    SyntaxErrorCode::DuplicateMachineName,
                    DottedPath::root(&spec.name),
                    format!("state machine '{}' declared more than once", spec.name),
                );
            }
        }

        let order = inheritance_order(&self.specs, &self.context, &mut failures);

        let mut built: HashMap<String, Arc<StateMachineMetadata>> = self.context.clone();
        let batch_names: HashSet<String> = self.specs.iter().map(|s| s.name.clone()).collect();

        for i in order {
            let spec = &self.specs[i];
            let super_meta = spec
                .extends
                .as_ref()
                .and_then(|name| built.get(name))
                .cloned();
            let machine = build_machine(
                &spec.name,
                &spec.body,
                spec.checksum(),
                super_meta.as_deref(),
                spec.extends.clone(),
                DottedPath::root(&spec.name),
                false,
                None,
                None,
                &mut failures,
                &mut deferred,
            );
            built.insert(spec.name.clone(), Arc::new(machine));
        }

        // Phase 2: cross-machine checks by lookup key.
        for (path, target) in &deferred.relation_targets {
            if !built.contains_key(target) && !batch_names.contains(target) {
                failures.push(
                    SyntaxErrorCode::RelationTargetMachineNotFound,
                    path.clone(),
                    format!("related state machine '{}' is not registered", target),
                );
            }
        }
        for (path, target, on) in &deferred.constraint_states {
            if let Some(machine) = built.get(target) {
                let names = machine.all_state_names();
                for state in on {
                    if !names.iter().any(|n| n == state) {
                        failures.push(
                            SyntaxErrorCode::RelationConstraintStateInvalid,
                            path.clone(),
                            format!(
                                "state '{}' does not exist in related machine '{}'",
                                state, target
                            ),
                        );
                    }
                }
            }
        }
        for (path, target, mapped_by) in &deferred.mapped_by {
            if let Some(machine) = built.get(target) {
                if machine.relation_anywhere(mapped_by).is_none() {
                    failures.push(
                        SyntaxErrorCode::CallbackMappedByInvalid,
                        path.clone(),
                        format!(
                            "mapped-by '{}' does not resolve to a relation of machine '{}'",
                            mapped_by, target
                        ),
                    );
                }
            }
        }

        if failures.is_empty() {
            let machines = built
                .into_iter()
                .filter(|(name, _)| batch_names.contains(name))
                .collect();
            let model = MetaModel::new(machines);
            tracing::debug!("meta-model verified: {} machine(s)", model.len());
            Ok(model)
        } else {
            Err(failures)
        }
    }
}

/// Parent-first build order over the `extends` graph. Specs with a missing
/// super or on an inheritance cycle are excluded, with a failure recorded.
fn inheritance_order(
    specs: &[MachineSpec],
    context: &HashMap<String, Arc<StateMachineMetadata>>,
    failures: &mut VerificationFailureSet,
) -> Vec<usize> {
    let index: HashMap<&str, usize> = specs
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.as_str(), i))
        .collect();

    // 0 = unvisited, 1 = visiting, 2 = usable, 3 = failed.
    let mut marks = vec![0u8; specs.len()];
    let mut order = Vec::with_capacity(specs.len());

    fn visit(
        i: usize,
        specs: &[MachineSpec],
        index: &HashMap<&str, usize>,
        context: &HashMap<String, Arc<StateMachineMetadata>>,
        marks: &mut [u8],
        order: &mut Vec<usize>,
        failures: &mut VerificationFailureSet,
    ) -> bool {
        match marks[i] {
            2 => return true,
            3 => return false,
            1 => {
                failures.push(
                    SyntaxErrorCode::CyclicInheritance,
                    DottedPath::root(&specs[i].name),
                    format!("inheritance cycle through machine '{}'", specs[i].name),
                );
                marks[i] = 3;
                return false;
            }
            _ => {}
        }
        marks[i] = 1;
        let ok = match specs[i].extends.as_deref() {
            None => true,
            Some(parent) if context.contains_key(parent) => true,
            Some(parent) => match index.get(parent) {
                Some(&j) => visit(j, specs, index, context, marks, order, failures),
                None => {
                    failures.push(
                        SyntaxErrorCode::SuperMachineNotFound,
                        DottedPath::root(&specs[i].name),
                        format!(
                            "super state machine '{}' of '{}' is not registered",
                            parent, specs[i].name
                        ),
                    );
                    false
                }
            },
        };
        if ok && marks[i] == 1 {
            marks[i] = 2;
            order.push(i);
            true
        } else {
            marks[i] = 3;
            false
        }
    }

    for i in 0..specs.len() {
        visit(i, specs, &index, context, &mut marks, &mut order, failures);
    }
    order
}

fn body_checksum(body: &MachineBody) -> String {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    format!("{:08x}", crc32c::crc32c(&bytes))
}

fn resolve_constraint(
    scope: &RelationScope<'_>,
    relation: &str,
    on: &[String],
    path: &DottedPath,
    failures: &mut VerificationFailureSet,
    deferred: &mut Deferred,
) {
    match scope.resolve(relation) {
        Some(meta) => deferred
            .constraint_states
            .push((path.clone(), meta.target.clone(), on.to_vec())),
        None => failures.push(
            SyntaxErrorCode::ConstraintRelationInvalid,
            path.clone(),
            format!("relation '{}' is not declared in scope", relation),
        ),
    }
}

/// Builds one machine (top-level or composite sub-machine) into verified
/// metadata. Always returns a best-effort machine so that inheriting machines
/// and relation targets can still be checked; the accumulated failures decide
/// whether the model is ultimately rejected.
#[allow(clippy::too_many_arguments)]
fn build_machine(
    name: &str,
    body: &MachineBody,
    checksum: String,
    super_meta: Option<&StateMachineMetadata>,
    super_name: Option<String>,
    path: DottedPath,
    composite: bool,
    outer_states: Option<&HashSet<String>>,
    outer_relations: Option<&RelationScope<'_>>,
    failures: &mut VerificationFailureSet,
    deferred: &mut Deferred,
) -> StateMachineMetadata {
    // Exactly one state-set and one transition-set.
    let state_set = match body.state_sets.len() {
        0 => {
            failures.push(
                SyntaxErrorCode::MachineWithoutStateSet,
                path.clone(),
                format!("state machine '{}' declares no state-set", name),
            );
            None
        }
        1 => Some(&body.state_sets[0]),
        _ => {
            failures.push(
                SyntaxErrorCode::MachineMultipleStateSet,
                path.clone(),
                format!("state machine '{}' declares multiple state-sets", name),
            );
            Some(&body.state_sets[0])
        }
    };
    let transition_set = match body.transition_sets.len() {
        0 => {
            failures.push(
                SyntaxErrorCode::MachineWithoutTransitionSet,
                path.clone(),
                format!("state machine '{}' declares no transition-set", name),
            );
            None
        }
        1 => Some(&body.transition_sets[0]),
        _ => {
            failures.push(
                SyntaxErrorCode::MachineMultipleTransitionSet,
                path.clone(),
                format!("state machine '{}' declares multiple transition-sets", name),
            );
            Some(&body.transition_sets[0])
        }
    };

    // An inheriting machine may declare empty sets and live off its ancestors.
    let inherits_states = super_meta.map_or(false, |m| !m.states().is_empty());
    let inherits_transitions = super_meta.map_or(false, |m| !m.transitions().is_empty());
    if let Some(ss) = state_set {
        if ss.states.is_empty() && !inherits_states {
            failures.push(
                SyntaxErrorCode::StateSetWithoutState,
                path.child(&ss.name),
                "state-set declares no state",
            );
        }
    }
    if let Some(ts) = transition_set {
        if ts.transitions.is_empty() && !inherits_transitions {
            failures.push(
                SyntaxErrorCode::TransitionSetWithoutTransition,
                path.child(&ts.name),
                "transition-set declares no transition",
            );
        }
    }

    let ancestor_states: HashSet<String> = super_meta
        .map(|m| m.states().iter().map(|s| s.name.clone()).collect())
        .unwrap_or_default();
    let ancestor_transitions: HashSet<String> = super_meta
        .map(|m| m.transitions().iter().map(|t| t.name.clone()).collect())
        .unwrap_or_default();
    let ancestor_relations: HashSet<String> = super_meta
        .map(|m| m.relations().iter().map(|r| r.name.clone()).collect())
        .unwrap_or_default();

    // Relations merge first: constraints everywhere else resolve against them.
    let mut relations: Vec<RelationMetadata> = super_meta
        .map(|m| m.relations().to_vec())
        .unwrap_or_default();
    let mut declared_relations: HashSet<String> = HashSet::new();
    for r in &body.relations {
        let rpath = path.child("RelationSet").child(&r.name);
        if !declared_relations.insert(r.name.clone()) {
            failures.push(
                SyntaxErrorCode::DuplicateRelationName,
                rpath,
                format!("relation '{}' declared more than once", r.name),
            );
            continue;
        }
        let inherited = ancestor_relations.contains(&r.name);
        if r.overrides && !inherited {
            failures.push(
                SyntaxErrorCode::RelationOverridesNothing,
                rpath.clone(),
                format!("relation '{}' overrides no ancestor relation", r.name),
            );
        } else if !r.overrides && inherited {
            failures.push(
                SyntaxErrorCode::RelationShadowsAncestor,
                rpath.clone(),
                format!(
                    "relation '{}' collides with an ancestor relation without overriding it",
                    r.name
                ),
            );
        }
        deferred
            .relation_targets
            .push((rpath.clone(), r.target.clone()));
        let meta = RelationMetadata {
            name: r.name.clone(),
            path: rpath,
            target: r.target.clone(),
            multi: r.multi,
            overrides: r.overrides,
        };
        if let Some(pos) = relations.iter().position(|m| m.name == r.name) {
            relations[pos] = meta;
        } else {
            relations.push(meta);
        }
    }

    // Conditions: inherited, own replacing by name.
    let mut conditions: Vec<ConditionMetadata> = super_meta
        .map(|m| m.conditions().cloned().collect())
        .unwrap_or_default();
    for c in &body.conditions {
        let meta = ConditionMetadata {
            name: c.name.clone(),
            path: path.child("ConditionSet").child(&c.name),
            keys: c.keys.clone(),
        };
        if let Some(pos) = conditions.iter().position(|m| m.name == c.name) {
            conditions[pos] = meta;
        } else {
            conditions.push(meta);
        }
    }
    let condition_by_name: HashMap<String, &ConditionMetadata> =
        conditions.iter().map(|c| (c.name.clone(), c)).collect();

    let scope = RelationScope {
        relations: &relations,
        parent: outer_relations,
    };

    // Transitions: inherited first, declared appended or replacing.
    let mut transitions: Vec<Arc<TransitionMetadata>> = super_meta
        .map(|m| m.transitions().to_vec())
        .unwrap_or_default();
    let mut declared_transitions: HashSet<String> = HashSet::new();
    if let Some(ts) = transition_set {
        for t in &ts.transitions {
            let tpath = path.child(&ts.name).child(&t.name);
            if !declared_transitions.insert(t.name.clone()) {
                failures.push(
                    SyntaxErrorCode::DuplicateTransitionName,
                    tpath,
                    format!("transition '{}' declared more than once", t.name),
                );
                continue;
            }
            let inherited = ancestor_transitions.contains(&t.name);
            if t.overrides && !inherited {
                failures.push(
                    SyntaxErrorCode::TransitionOverridesNothing,
                    tpath.clone(),
                    format!("transition '{}' overrides no ancestor transition", t.name),
                );
            } else if !t.overrides && t.extends.is_none() && inherited {
                failures.push(
                    SyntaxErrorCode::TransitionShadowsAncestor,
                    tpath.clone(),
                    format!(
                        "transition '{}' collides with an ancestor transition without overriding it",
                        t.name
                    ),
                );
            }
            if let Some(extended) = &t.extends {
                if ancestor_transitions.contains(extended) {
                    // Extension target exists and is a transition.
                } else if ancestor_states.contains(extended)
                    || ancestor_relations.contains(extended)
                {
                    failures.push(
                        SyntaxErrorCode::TransitionIllegalExtension,
                        tpath.clone(),
                        format!(
                            "transition '{}' extends '{}', which is not a transition",
                            t.name, extended
                        ),
                    );
                } else {
                    failures.push(
                        SyntaxErrorCode::TransitionExtendedNotFoundInSuper,
                        tpath.clone(),
                        format!(
                            "extended transition '{}' not found in any super state machine",
                            extended
                        ),
                    );
                }
            }
            if let Some(cond) = &t.condition {
                if !condition_by_name.contains_key(cond) {
                    failures.push(
                        SyntaxErrorCode::TransitionConditionInvalid,
                        tpath.clone(),
                        format!(
                            "condition '{}' of transition '{}' is not declared",
                            cond, t.name
                        ),
                    );
                }
            }
            let mut inbound_while = Vec::with_capacity(t.inbound_while.len());
            for iw in &t.inbound_while {
                resolve_constraint(&scope, &iw.relation, &iw.on, &tpath, failures, deferred);
                inbound_while.push(RelationConstraintMetadata {
                    relation: iw.relation.clone(),
                    on: iw.on.clone(),
                    phase: iw.phase,
                });
            }
            let meta = Arc::new(TransitionMetadata {
                name: t.name.clone(),
                path: tpath,
                overrides: t.overrides,
                condition: t.condition.clone(),
                inbound_while,
            });
            if let Some(pos) = transitions.iter().position(|m| m.name == t.name) {
                transitions[pos] = meta;
            } else {
                transitions.push(meta);
            }
        }
    }
    let transition_names: HashSet<String> =
        transitions.iter().map(|t| t.name.clone()).collect();

    // Full state name table (ancestors plus declared) and the map of which
    // states each state's functions can lead to, for callback scope checks.
    let declared_states: &[StateSpec] = state_set.map(|ss| ss.states.as_slice()).unwrap_or(&[]);
    let mut state_names: HashSet<String> = ancestor_states.clone();
    for s in declared_states {
        state_names.insert(s.name.clone());
    }
    let mut leads_to: HashMap<String, HashSet<String>> = HashMap::new();
    if let Some(m) = super_meta {
        for s in m.states() {
            let targets = s
                .functions
                .iter()
                .flat_map(|f| f.candidates.iter().cloned())
                .collect();
            leads_to.insert(s.name.clone(), targets);
        }
    }
    for s in declared_states {
        let targets = s
            .functions
            .iter()
            .flat_map(|f| f.candidates.iter().cloned())
            .collect();
        leads_to.insert(s.name.clone(), targets);
    }

    // Build states: inherited first, declared appended or replacing.
    let mut states: Vec<Arc<StateMetadata>> = super_meta
        .map(|m| m.states().to_vec())
        .unwrap_or_default();
    let set_name = state_set.map(|ss| ss.name.as_str()).unwrap_or("StateSet");
    let mut declared_names: HashSet<String> = HashSet::new();
    for s in declared_states {
        let spath = path.child(set_name).child(&s.name);
        if !declared_names.insert(s.name.clone()) {
            failures.push(
                SyntaxErrorCode::DuplicateStateName,
                spath,
                format!("state '{}' declared more than once", s.name),
            );
            continue;
        }
        let inherited = ancestor_states.contains(&s.name);
        if s.overrides && !inherited {
            failures.push(
                SyntaxErrorCode::StateOverridesNothing,
                spath.clone(),
                format!("state '{}' overrides no ancestor state", s.name),
            );
        } else if !s.overrides && inherited {
            failures.push(
                SyntaxErrorCode::StateShadowsAncestor,
                spath.clone(),
                format!(
                    "state '{}' collides with an ancestor state without overriding it",
                    s.name
                ),
            );
        }

        if s.composite.is_some() && s.end {
            failures.push(
                SyntaxErrorCode::CompositeStateFinal,
                spath.clone(),
                format!("composite state '{}' must not be final", s.name),
            );
        }
        if !s.end && s.functions.is_empty() {
            failures.push(
                SyntaxErrorCode::StateNonFinalWithoutFunctions,
                spath.clone(),
                format!("non-final state '{}' declares no function", s.name),
            );
        }

        // Shortcuts only make sense on final substates of a composite machine.
        if let Some(target) = &s.shortcut {
            if !s.end {
                failures.push(
                    SyntaxErrorCode::ShortcutOnNonFinalState,
                    spath.clone(),
                    format!("shortcut declared on non-final state '{}'", s.name),
                );
            }
            if !composite {
                failures.push(
                    SyntaxErrorCode::ShortcutTargetInvalid,
                    spath.clone(),
                    "shortcut declared outside a composite sub-machine",
                );
            } else if !outer_states.map_or(false, |outer| outer.contains(target)) {
                failures.push(
                    SyntaxErrorCode::ShortcutTargetInvalid,
                    spath.clone(),
                    format!("shortcut target '{}' is not a state of the enclosing machine", target),
                );
            }
        }

        // Functions.
        let mut seen_transitions: HashSet<&str> = HashSet::new();
        for f in &s.functions {
            if !seen_transitions.insert(&f.transition) {
                failures.push(
                    SyntaxErrorCode::StateDuplicateFunction,
                    spath.clone(),
                    format!(
                        "state '{}' declares more than one function for transition '{}'",
                        s.name, f.transition
                    ),
                );
            }
            let transition = if transition_names.contains(&f.transition) {
                transitions.iter().find(|t| t.name == f.transition)
            } else {
                failures.push(
                    SyntaxErrorCode::FunctionInvalidTransitionReference,
                    spath.clone(),
                    format!(
                        "function on state '{}' references unknown transition '{}'",
                        s.name, f.transition
                    ),
                );
                None
            };
            if f.candidates.is_empty() {
                failures.push(
                    SyntaxErrorCode::FunctionWithEmptyStateCandidates,
                    spath.clone(),
                    format!(
                        "function for transition '{}' declares no next-state candidate",
                        f.transition
                    ),
                );
            }
            for candidate in &f.candidates {
                if !state_names.contains(candidate) {
                    failures.push(
                        SyntaxErrorCode::FunctionNextStateInvalid,
                        spath.clone(),
                        format!(
                            "next-state candidate '{}' does not resolve in machine '{}' or an ancestor",
                            candidate, name
                        ),
                    );
                }
            }
            if let Some(t) = transition {
                if f.candidates.len() > 1 {
                    match &t.condition {
                        None => failures.push(
                            SyntaxErrorCode::FunctionConditionalTransitionWithoutCondition,
                            t.path.clone(),
                            format!(
                                "transition '{}' maps to multiple candidates but carries no condition",
                                t.name
                            ),
                        ),
                        Some(cond) => {
                            if let Some(meta) = condition_by_name.get(cond) {
                                let missing: Vec<&String> = f
                                    .candidates
                                    .iter()
                                    .filter(|c| !meta.keys.contains(c))
                                    .collect();
                                if !missing.is_empty() {
                                    failures.push(
                                        SyntaxErrorCode::ConditionKeysNotMatchCandidates,
                                        t.path.clone(),
                                        format!(
                                            "condition '{}' key domain does not cover candidates {:?}",
                                            cond, missing
                                        ),
                                    );
                                }
                            }
                        }
                    }
                } else if f.candidates.len() == 1 && t.conditional() {
                    failures.push(
                        SyntaxErrorCode::FunctionSingleCandidateWithCondition,
                        spath.clone(),
                        format!(
                            "single-candidate function routes through conditional transition '{}'",
                            t.name
                        ),
                    );
                }
            }
        }

        // Occupancy guards.
        let mut valid_while = Vec::with_capacity(s.valid_while.len());
        for vw in &s.valid_while {
            resolve_constraint(&scope, &vw.relation, &vw.on, &spath, failures, deferred);
            valid_while.push(RelationConstraintMetadata {
                relation: vw.relation.clone(),
                on: vw.on.clone(),
                phase: GuardPhase::Pre,
            });
        }

        // Callback bindings.
        let mut callbacks = Vec::with_capacity(s.callbacks.len());
        for cb in &s.callbacks {
            let (from_code, to_code) = match cb.phase {
                CallbackPhase::Pre => (
                    SyntaxErrorCode::PreStateChangeFromStateInvalid,
                    SyntaxErrorCode::PreStateChangeToStateInvalid,
                ),
                CallbackPhase::Post => (
                    SyntaxErrorCode::PostStateChangeFromStateInvalid,
                    SyntaxErrorCode::PostStateChangeToStateInvalid,
                ),
            };
            if let Some(from) = &cb.from {
                if !state_names.contains(from) {
                    failures.push(
                        from_code,
                        spath.clone(),
                        format!("callback '{}' from-state '{}' does not resolve", cb.name, from),
                    );
                } else if from != &s.name
                    && !leads_to.get(from).map_or(false, |t| t.contains(&s.name))
                {
                    failures.push(
                        from_code,
                        spath.clone(),
                        format!(
                            "callback '{}' from-state '{}' can never lead to state '{}'",
                            cb.name, from, s.name
                        ),
                    );
                }
            }
            if let Some(to) = &cb.to {
                if !state_names.contains(to) {
                    failures.push(
                        to_code,
                        spath.clone(),
                        format!("callback '{}' to-state '{}' does not resolve", cb.name, to),
                    );
                } else if to != &s.name
                    && !leads_to.get(&s.name).map_or(false, |t| t.contains(to))
                {
                    failures.push(
                        to_code,
                        spath.clone(),
                        format!(
                            "callback '{}' to-state '{}' can never occur from state '{}'",
                            cb.name, to, s.name
                        ),
                    );
                }
            }
            match (&cb.relation, &cb.mapped_by) {
                (Some(rel), mapped_by) => match scope.resolve(rel) {
                    Some(meta) => {
                        if let Some(mapped) = mapped_by {
                            deferred.mapped_by.push((
                                spath.clone(),
                                meta.target.clone(),
                                mapped.clone(),
                            ));
                        }
                    }
                    None => failures.push(
                        SyntaxErrorCode::CallbackRelationInvalid,
                        spath.clone(),
                        format!(
                            "callback '{}' relation '{}' is not declared in scope",
                            cb.name, rel
                        ),
                    ),
                },
                (None, Some(mapped)) => failures.push(
                    SyntaxErrorCode::CallbackMappedByInvalid,
                    spath.clone(),
                    format!(
                        "callback '{}' declares mapped-by '{}' without a relation",
                        cb.name, mapped
                    ),
                ),
                (None, None) => {}
            }
            callbacks.push(CallbackMetadata {
                name: cb.name.clone(),
                phase: cb.phase,
                from: cb.from.clone(),
                to: cb.to.clone(),
                relation: cb.relation.clone(),
                mapped_by: cb.mapped_by.clone(),
            });
        }

        // Composite sub-machine, verified before the owning state is sealed.
        let sub_machine = s.composite.as_ref().map(|sub| {
            Arc::new(build_machine(
                &s.name,
                sub,
                body_checksum(sub),
                None,
                None,
                spath.clone(),
                true,
                Some(&state_names),
                Some(&scope),
                failures,
                deferred,
            ))
        });

        let meta = Arc::new(StateMetadata {
            name: s.name.clone(),
            path: spath,
            initial: s.initial,
            end: s.end,
            overrides: s.overrides,
            composite: sub_machine,
            shortcut: s.shortcut.clone(),
            functions: s
                .functions
                .iter()
                .map(|f| FunctionMetadata {
                    transition: f.transition.clone(),
                    candidates: f.candidates.clone(),
                })
                .collect(),
            valid_while,
            callbacks,
        });
        if let Some(pos) = states.iter().position(|m| m.name == s.name) {
            states[pos] = meta;
        } else {
            states.push(meta);
        }
    }

    // Exactly one initial, at least one final, over the flattened table.
    if state_set.is_some() && !states.is_empty() {
        let set_path = path.child(set_name);
        let initial_count = states.iter().filter(|s| s.initial).count();
        if initial_count == 0 {
            failures.push(
                SyntaxErrorCode::StateSetWithoutInitialState,
                set_path.clone(),
                "no state is marked initial",
            );
        } else if initial_count > 1 {
            failures.push(
                SyntaxErrorCode::StateSetMultipleInitialStates,
                set_path.clone(),
                "more than one state is marked initial",
            );
        }
        if !states.iter().any(|s| s.end) {
            failures.push(
                SyntaxErrorCode::StateSetWithoutFinalState,
                set_path,
                "no state is marked final",
            );
        }
    }

    // A non-conditional transition with inbound-while guards fanned out to
    // several candidates has no defined guard evaluation order.
    for t in &transitions {
        if !t.conditional() && !t.inbound_while.is_empty() {
            let ambiguous = states.iter().any(|s| {
                s.function_for(&t.name)
                    .map_or(false, |f| f.candidates.len() > 1)
            });
            if ambiguous {
                failures.push(
                    SyntaxErrorCode::InboundWhileAmbiguous,
                    t.path.clone(),
                    format!(
                        "inbound-while on non-conditional transition '{}' with multiple candidates",
                        t.name
                    ),
                );
            }
        }
    }

    StateMachineMetadata::new(
        name.to_string(),
        path,
        checksum,
        super_name,
        composite,
        states,
        transitions,
        relations,
        conditions,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn build_all(specs: Vec<Value>) -> Result<MetaModel, VerificationFailureSet> {
        let mut builder = MetaModelBuilder::new();
        for spec in specs {
            builder.add_machine(MachineSpec::from_json(&spec).unwrap());
        }
        builder.build()
    }

    fn build_one(spec: Value) -> Result<MetaModel, VerificationFailureSet> {
        build_all(vec![spec])
    }

    fn assert_single(result: Result<MetaModel, VerificationFailureSet>, code: SyntaxErrorCode) {
        let err = result.expect_err("expected a verification failure");
        assert!(err.contains(code), "missing {:?} in {}", code, err);
        assert_eq!(err.len(), 1, "expected exactly one failure, got {}", err);
    }

    fn order_spec() -> Value {
        json!({
            "name": "Order",
            "state_sets": [{"states": [
                {"name": "Created", "initial": true,
                 "functions": [{"transition": "Start", "candidates": "Started"}]},
                {"name": "Started",
                 "functions": [{"transition": "Deliver", "candidates": "Delivering"}]},
                {"name": "Delivering",
                 "functions": [{"transition": "Complete", "candidates": "Done"}]},
                {"name": "Done", "end": true}
            ]}],
            "transition_sets": [{"transitions": [
                {"name": "Start"}, {"name": "Deliver"}, {"name": "Complete"}
            ]}]
        })
    }

    #[test]
    fn valid_machine_builds() {
        let model = build_one(order_spec()).unwrap();
        let machine = model.machine("Order").unwrap();
        assert_eq!(machine.states().len(), 4);
        assert_eq!(machine.initial_state().unwrap().name, "Created");
        assert!(!machine.transition("Start").unwrap().conditional());
        assert_eq!(machine.path.as_str(), "Order");
        assert_eq!(
            machine.state("Started").unwrap().path.as_str(),
            "Order.StateSet.Started"
        );
    }

    #[test]
    fn machine_without_sets() {
        let err = build_one(json!({"name": "Bare"})).unwrap_err();
        assert_eq!(err.len(), 2);
        assert!(err.contains(SyntaxErrorCode::MachineWithoutStateSet));
        assert!(err.contains(SyntaxErrorCode::MachineWithoutTransitionSet));
    }

    #[test]
    fn machine_with_multiple_sets() {
        let mut spec = order_spec();
        let extra_ss = spec["state_sets"][0].clone();
        spec["state_sets"].as_array_mut().unwrap().push(extra_ss);
        let extra_ts = spec["transition_sets"][0].clone();
        spec["transition_sets"].as_array_mut().unwrap().push(extra_ts);
        let err = build_one(spec).unwrap_err();
        assert_eq!(err.len(), 2);
        assert!(err.contains(SyntaxErrorCode::MachineMultipleStateSet));
        assert!(err.contains(SyntaxErrorCode::MachineMultipleTransitionSet));
    }

    #[test]
    fn empty_sets() {
        let err = build_one(json!({
            "name": "Empty",
            "state_sets": [{"states": []}],
            "transition_sets": [{"transitions": []}]
        }))
        .unwrap_err();
        assert_eq!(err.len(), 2);
        assert!(err.contains(SyntaxErrorCode::StateSetWithoutState));
        assert!(err.contains(SyntaxErrorCode::TransitionSetWithoutTransition));
    }

    #[test]
    fn no_initial_state() {
        let mut spec = order_spec();
        spec["state_sets"][0]["states"][0]["initial"] = json!(false);
        assert_single(build_one(spec), SyntaxErrorCode::StateSetWithoutInitialState);
    }

    #[test]
    fn multiple_initial_states() {
        let mut spec = order_spec();
        spec["state_sets"][0]["states"][1]["initial"] = json!(true);
        assert_single(build_one(spec), SyntaxErrorCode::StateSetMultipleInitialStates);
    }

    #[test]
    fn no_final_state() {
        let err = build_one(json!({
            "name": "Loop",
            "state_sets": [{"states": [
                {"name": "Closed", "initial": true,
                 "functions": [{"transition": "Open", "candidates": "Opened"}]},
                {"name": "Opened",
                 "functions": [{"transition": "Close", "candidates": "Closed"}]}
            ]}],
            "transition_sets": [{"transitions": [{"name": "Open"}, {"name": "Close"}]}]
        }));
        assert_single(err, SyntaxErrorCode::StateSetWithoutFinalState);
    }

    #[test]
    fn non_final_state_without_functions() {
        let mut spec = order_spec();
        spec["state_sets"][0]["states"][1]["functions"] = json!([]);
        let err = build_one(spec).unwrap_err();
        assert!(err.contains(SyntaxErrorCode::StateNonFinalWithoutFunctions));
    }

    #[test]
    fn function_references_unknown_transition() {
        let mut spec = order_spec();
        spec["state_sets"][0]["states"][0]["functions"][0]["transition"] = json!("Teleport");
        assert_single(
            build_one(spec),
            SyntaxErrorCode::FunctionInvalidTransitionReference,
        );
    }

    #[test]
    fn function_with_empty_candidates() {
        let mut spec = order_spec();
        spec["state_sets"][0]["states"][0]["functions"][0]["candidates"] = json!([]);
        assert_single(
            build_one(spec),
            SyntaxErrorCode::FunctionWithEmptyStateCandidates,
        );
    }

    #[test]
    fn function_candidate_does_not_resolve() {
        let mut spec = order_spec();
        spec["state_sets"][0]["states"][0]["functions"][0]["candidates"] = json!("Nowhere");
        assert_single(build_one(spec), SyntaxErrorCode::FunctionNextStateInvalid);
    }

    #[test]
    fn duplicate_state_name() {
        let mut spec = order_spec();
        let dup = spec["state_sets"][0]["states"][3].clone();
        spec["state_sets"][0]["states"].as_array_mut().unwrap().push(dup);
        assert_single(build_one(spec), SyntaxErrorCode::DuplicateStateName);
    }

    #[test]
    fn duplicate_transition_name() {
        let mut spec = order_spec();
        spec["transition_sets"][0]["transitions"]
            .as_array_mut()
            .unwrap()
            .push(json!({"name": "Start"}));
        assert_single(build_one(spec), SyntaxErrorCode::DuplicateTransitionName);
    }

    #[test]
    fn duplicate_function_for_same_transition() {
        let mut spec = order_spec();
        spec["state_sets"][0]["states"][0]["functions"]
            .as_array_mut()
            .unwrap()
            .push(json!({"transition": "Start", "candidates": "Done"}));
        assert_single(build_one(spec), SyntaxErrorCode::StateDuplicateFunction);
    }

    #[test]
    fn duplicate_machine_name() {
        assert_single(
            build_all(vec![order_spec(), order_spec()]),
            SyntaxErrorCode::DuplicateMachineName,
        );
    }

    fn conditional_spec(keys: Value) -> Value {
        json!({
            "name": "Job",
            "state_sets": [{"states": [
                {"name": "Running", "initial": true,
                 "functions": [{"transition": "Finish", "candidates": ["Succeeded", "Failed"]}]},
                {"name": "Succeeded", "end": true},
                {"name": "Failed", "end": true}
            ]}],
            "transition_sets": [{"transitions": [
                {"name": "Finish", "condition": "Outcome"}
            ]}],
            "conditions": [{"name": "Outcome", "keys": keys}]
        })
    }

    #[test]
    fn conditional_transition_builds() {
        let model = build_one(conditional_spec(json!(["Succeeded", "Failed"]))).unwrap();
        let machine = model.machine("Job").unwrap();
        assert!(machine.transition("Finish").unwrap().conditional());
        assert_eq!(machine.condition("Outcome").unwrap().keys.len(), 2);
    }

    #[test]
    fn condition_keys_do_not_cover_candidates() {
        assert_single(
            build_one(conditional_spec(json!(["Succeeded"]))),
            SyntaxErrorCode::ConditionKeysNotMatchCandidates,
        );
    }

    #[test]
    fn multiple_candidates_without_condition() {
        let mut spec = conditional_spec(json!(["Succeeded", "Failed"]));
        spec["transition_sets"][0]["transitions"][0] = json!({"name": "Finish"});
        assert_single(
            build_one(spec),
            SyntaxErrorCode::FunctionConditionalTransitionWithoutCondition,
        );
    }

    #[test]
    fn single_candidate_through_conditional_transition() {
        let mut spec = conditional_spec(json!(["Succeeded"]));
        spec["state_sets"][0]["states"][0]["functions"][0]["candidates"] = json!("Succeeded");
        assert_single(
            build_one(spec),
            SyntaxErrorCode::FunctionSingleCandidateWithCondition,
        );
    }

    #[test]
    fn transition_condition_not_declared() {
        let mut spec = conditional_spec(json!(["Succeeded", "Failed"]));
        spec["conditions"] = json!([]);
        assert_single(build_one(spec), SyntaxErrorCode::TransitionConditionInvalid);
    }

    fn base_spec() -> Value {
        json!({
            "name": "Base",
            "state_sets": [{"states": [
                {"name": "Draft", "initial": true,
                 "functions": [{"transition": "Submit", "candidates": "Submitted"}]},
                {"name": "Submitted", "end": true}
            ]}],
            "transition_sets": [{"transitions": [{"name": "Submit"}]}]
        })
    }

    #[test]
    fn child_inherits_and_overrides() {
        let child = json!({
            "name": "Child",
            "extends": "Base",
            "state_sets": [{"states": [
                {"name": "Submitted", "overrides": true,
                 "functions": [{"transition": "Archive", "candidates": "Archived"}]},
                {"name": "Archived", "end": true}
            ]}],
            "transition_sets": [{"transitions": [{"name": "Archive"}]}]
        });
        let model = build_all(vec![base_spec(), child]).unwrap();
        let machine = model.machine("Child").unwrap();
        assert_eq!(machine.super_machine.as_deref(), Some("Base"));
        assert_eq!(machine.states().len(), 3);
        // Overriding keeps the ancestor's position in declaration order.
        assert_eq!(machine.states()[1].name, "Submitted");
        assert!(!machine.state("Submitted").unwrap().end);
        assert!(machine.transition("Submit").is_some());
        assert!(machine.transition("Archive").is_some());
    }

    #[test]
    fn state_shadows_ancestor() {
        let child = json!({
            "name": "Child",
            "extends": "Base",
            "state_sets": [{"states": [
                {"name": "Draft", "initial": true,
                 "functions": [{"transition": "Submit", "candidates": "Submitted"}]}
            ]}],
            "transition_sets": [{"transitions": []}]
        });
        assert_single(
            build_all(vec![base_spec(), child]),
            SyntaxErrorCode::StateShadowsAncestor,
        );
    }

    #[test]
    fn state_overrides_nothing() {
        let child = json!({
            "name": "Child",
            "extends": "Base",
            "state_sets": [{"states": [
                {"name": "Extra", "overrides": true, "end": true}
            ]}],
            "transition_sets": [{"transitions": []}]
        });
        assert_single(
            build_all(vec![base_spec(), child]),
            SyntaxErrorCode::StateOverridesNothing,
        );
    }

    #[test]
    fn transition_extension() {
        let child = json!({
            "name": "Child",
            "extends": "Base",
            "state_sets": [{"states": []}],
            "transition_sets": [{"transitions": [
                {"name": "FastSubmit", "extends": "Submit"}
            ]}]
        });
        let model = build_all(vec![base_spec(), child]).unwrap();
        assert!(model.machine("Child").unwrap().transition("FastSubmit").is_some());
    }

    #[test]
    fn transition_extends_a_state() {
        let child = json!({
            "name": "Child",
            "extends": "Base",
            "state_sets": [{"states": []}],
            "transition_sets": [{"transitions": [
                {"name": "FastSubmit", "extends": "Draft"}
            ]}]
        });
        assert_single(
            build_all(vec![base_spec(), child]),
            SyntaxErrorCode::TransitionIllegalExtension,
        );
    }

    #[test]
    fn transition_extends_nothing_in_super() {
        let child = json!({
            "name": "Child",
            "extends": "Base",
            "state_sets": [{"states": []}],
            "transition_sets": [{"transitions": [
                {"name": "FastSubmit", "extends": "Missing"}
            ]}]
        });
        assert_single(
            build_all(vec![base_spec(), child]),
            SyntaxErrorCode::TransitionExtendedNotFoundInSuper,
        );
    }

    #[test]
    fn super_machine_not_registered() {
        let child = json!({
            "name": "Orphan",
            "extends": "Ghost",
            "state_sets": [{"states": []}],
            "transition_sets": [{"transitions": []}]
        });
        assert_single(build_all(vec![child]), SyntaxErrorCode::SuperMachineNotFound);
    }

    #[test]
    fn cyclic_inheritance() {
        let a = json!({"name": "A", "extends": "B",
            "state_sets": [{"states": []}], "transition_sets": [{"transitions": []}]});
        let b = json!({"name": "B", "extends": "A",
            "state_sets": [{"states": []}], "transition_sets": [{"transitions": []}]});
        assert_single(build_all(vec![a, b]), SyntaxErrorCode::CyclicInheritance);
    }

    fn composite_spec(sub_states: Value) -> Value {
        json!({
            "name": "Order",
            "state_sets": [{"states": [
                {"name": "Created", "initial": true,
                 "functions": [{"transition": "Start", "candidates": "Started"}]},
                {"name": "Started",
                 "functions": [{"transition": "Finish", "candidates": "Finished"}],
                 "composite": {
                     "state_sets": [{"states": sub_states}],
                     "transition_sets": [{"transitions": [{"name": "Confirm"}]}]
                 }},
                {"name": "Finished", "end": true}
            ]}],
            "transition_sets": [{"transitions": [{"name": "Start"}, {"name": "Finish"}]}]
        })
    }

    #[test]
    fn composite_state_builds() {
        let model = build_one(composite_spec(json!([
            {"name": "OrderCreated", "initial": true,
             "functions": [{"transition": "Confirm", "candidates": "Done"}]},
            {"name": "Done", "end": true, "shortcut": "Finished"}
        ])))
        .unwrap();
        let machine = model.machine("Order").unwrap();
        let started = machine.state("Started").unwrap();
        assert!(started.is_composite());
        let sub = started.composite.as_ref().unwrap();
        assert!(sub.composite);
        assert_eq!(sub.path.as_str(), "Order.StateSet.Started");
        assert_eq!(sub.initial_state().unwrap().name, "OrderCreated");
        assert_eq!(
            sub.state("Done").unwrap().shortcut.as_deref(),
            Some("Finished")
        );
    }

    #[test]
    fn composite_state_must_not_be_final() {
        let mut spec = composite_spec(json!([
            {"name": "OrderCreated", "initial": true,
             "functions": [{"transition": "Confirm", "candidates": "Done"}]},
            {"name": "Done", "end": true}
        ]));
        spec["state_sets"][0]["states"][1]["end"] = json!(true);
        assert_single(build_one(spec), SyntaxErrorCode::CompositeStateFinal);
    }

    #[test]
    fn shortcut_on_non_final_substate() {
        assert_single(
            build_one(composite_spec(json!([
                {"name": "OrderCreated", "initial": true, "shortcut": "Finished",
                 "functions": [{"transition": "Confirm", "candidates": "Done"}]},
                {"name": "Done", "end": true}
            ]))),
            SyntaxErrorCode::ShortcutOnNonFinalState,
        );
    }

    #[test]
    fn shortcut_target_outside_enclosing_machine() {
        assert_single(
            build_one(composite_spec(json!([
                {"name": "OrderCreated", "initial": true,
                 "functions": [{"transition": "Confirm", "candidates": "Done"}]},
                {"name": "Done", "end": true, "shortcut": "Nowhere"}
            ]))),
            SyntaxErrorCode::ShortcutTargetInvalid,
        );
    }

    #[test]
    fn shortcut_outside_composite() {
        let mut spec = order_spec();
        spec["state_sets"][0]["states"][3]["shortcut"] = json!("Created");
        assert_single(build_one(spec), SyntaxErrorCode::ShortcutTargetInvalid);
    }

    fn contract_spec() -> Value {
        json!({
            "name": "Contract",
            "state_sets": [{"states": [
                {"name": "Active", "initial": true,
                 "functions": [{"transition": "Expire", "candidates": "Expired"}]},
                {"name": "Expired", "end": true}
            ]}],
            "transition_sets": [{"transitions": [{"name": "Expire"}]}]
        })
    }

    fn related_order(valid_while: Value) -> Value {
        json!({
            "name": "Order",
            "relations": [{"name": "contract", "target": "Contract"}],
            "state_sets": [{"states": [
                {"name": "Created", "initial": true,
                 "valid_while": valid_while,
                 "functions": [{"transition": "Start", "candidates": "Started"}]},
                {"name": "Started", "end": true}
            ]}],
            "transition_sets": [{"transitions": [{"name": "Start"}]}]
        })
    }

    #[test]
    fn relation_guard_builds() {
        let specs = vec![
            contract_spec(),
            related_order(json!([{"relation": "contract", "on": ["Active"]}])),
        ];
        let model = build_all(specs).unwrap();
        let machine = model.machine("Order").unwrap();
        assert_eq!(machine.relations().len(), 1);
        assert_eq!(
            machine.state("Created").unwrap().valid_while[0].relation,
            "contract"
        );
    }

    #[test]
    fn constraint_relation_not_declared() {
        let specs = vec![
            contract_spec(),
            related_order(json!([{"relation": "customer", "on": ["Active"]}])),
        ];
        assert_single(build_all(specs), SyntaxErrorCode::ConstraintRelationInvalid);
    }

    #[test]
    fn relation_target_machine_missing() {
        let specs = vec![related_order(json!([]))];
        assert_single(
            build_all(specs),
            SyntaxErrorCode::RelationTargetMachineNotFound,
        );
    }

    #[test]
    fn constraint_state_not_in_target_machine() {
        let specs = vec![
            contract_spec(),
            related_order(json!([{"relation": "contract", "on": ["Suspended"]}])),
        ];
        assert_single(
            build_all(specs),
            SyntaxErrorCode::RelationConstraintStateInvalid,
        );
    }

    #[test]
    fn inbound_while_builds_with_phase() {
        let mut order = related_order(json!([]));
        order["transition_sets"][0]["transitions"][0] = json!({
            "name": "Start",
            "inbound_while": [{"relation": "contract", "on": ["Active"], "phase": "post"}]
        });
        let model = build_all(vec![contract_spec(), order]).unwrap();
        let transition = model.machine("Order").unwrap().transition("Start").unwrap().clone();
        assert_eq!(transition.inbound_while[0].phase, GuardPhase::Post);
    }

    #[test]
    fn inbound_while_ambiguous_fan_out() {
        let spec = json!({
            "name": "Job",
            "relations": [{"name": "quota", "target": "Job"}],
            "state_sets": [{"states": [
                {"name": "Running", "initial": true,
                 "functions": [{"transition": "Finish", "candidates": ["Succeeded", "Failed"]}]},
                {"name": "Succeeded", "end": true},
                {"name": "Failed", "end": true}
            ]}],
            "transition_sets": [{"transitions": [
                {"name": "Finish",
                 "inbound_while": [{"relation": "quota", "on": ["Running"]}]}
            ]}]
        });
        let err = build_one(spec).unwrap_err();
        assert!(err.contains(SyntaxErrorCode::InboundWhileAmbiguous));
        assert!(err.contains(SyntaxErrorCode::FunctionConditionalTransitionWithoutCondition));
        assert_eq!(err.len(), 2);
    }

    fn callback_order(callbacks: Value) -> Value {
        json!({
            "name": "Order",
            "relations": [{"name": "contract", "target": "Contract"}],
            "state_sets": [{"states": [
                {"name": "Created", "initial": true,
                 "functions": [{"transition": "Start", "candidates": "Started"}]},
                {"name": "Started",
                 "callbacks": callbacks,
                 "functions": [{"transition": "Finish", "candidates": "Finished"}]},
                {"name": "Finished", "end": true}
            ]}],
            "transition_sets": [{"transitions": [{"name": "Start"}, {"name": "Finish"}]}]
        })
    }

    #[test]
    fn callback_scoped_to_reachable_states() {
        let specs = vec![
            contract_spec(),
            callback_order(json!([
                {"name": "audit_in", "phase": "post", "from": "Created"},
                {"name": "audit_out", "phase": "pre", "to": "Finished"}
            ])),
        ];
        let model = build_all(specs).unwrap();
        let started = model.machine("Order").unwrap().state("Started").unwrap().clone();
        assert_eq!(started.callbacks.len(), 2);
        assert!(started.callbacks[0].matches(CallbackPhase::Post, "Created", "Started"));
        assert!(!started.callbacks[0].matches(CallbackPhase::Post, "Finished", "Started"));
    }

    #[test]
    fn callback_from_state_unreachable() {
        let specs = vec![
            contract_spec(),
            callback_order(json!([
                {"name": "audit", "phase": "post", "from": "Finished"}
            ])),
        ];
        assert_single(
            build_all(specs),
            SyntaxErrorCode::PostStateChangeFromStateInvalid,
        );
    }

    #[test]
    fn callback_to_state_unreachable() {
        let specs = vec![
            contract_spec(),
            callback_order(json!([
                {"name": "audit", "phase": "pre", "to": "Created"}
            ])),
        ];
        assert_single(
            build_all(specs),
            SyntaxErrorCode::PreStateChangeToStateInvalid,
        );
    }

    #[test]
    fn callback_relation_not_declared() {
        let specs = vec![
            contract_spec(),
            callback_order(json!([
                {"name": "audit", "phase": "post", "relation": "customer"}
            ])),
        ];
        assert_single(build_all(specs), SyntaxErrorCode::CallbackRelationInvalid);
    }

    #[test]
    fn callback_mapped_by_without_relation() {
        let specs = vec![
            contract_spec(),
            callback_order(json!([
                {"name": "audit", "phase": "post", "mapped_by": "order"}
            ])),
        ];
        assert_single(build_all(specs), SyntaxErrorCode::CallbackMappedByInvalid);
    }

    #[test]
    fn callback_mapped_by_not_in_target_machine() {
        let specs = vec![
            contract_spec(),
            callback_order(json!([
                {"name": "audit", "phase": "post", "relation": "contract", "mapped_by": "order"}
            ])),
        ];
        assert_single(build_all(specs), SyntaxErrorCode::CallbackMappedByInvalid);
    }

    #[test]
    fn one_defect_leaves_the_rest_clean() {
        // A machine with a single defect reports exactly that defect; the
        // unrelated valid machine in the same batch contributes nothing.
        let mut broken = order_spec();
        broken["name"] = json!("Broken");
        broken["state_sets"][0]["states"][3]["end"] = json!(false);
        broken["state_sets"][0]["states"][3]["functions"] =
            json!([{"transition": "Start", "candidates": "Created"}]);
        let err = build_all(vec![contract_spec(), broken]).unwrap_err();
        assert_eq!(err.len(), 1);
        assert!(err.contains(SyntaxErrorCode::StateSetWithoutFinalState));
    }
}
