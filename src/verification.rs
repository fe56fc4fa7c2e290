//! Build-time verification failures.
//!
//! The builder never fails fast: every independent structural violation is
//! collected into one [`VerificationFailureSet`] and surfaced together. A
//! non-empty set refuses meta-model construction outright; there is no
//! partially-valid meta-model.

use crate::path::DottedPath;
use std::fmt;
use thiserror::Error;

/// Closed taxonomy of build-time (static) failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyntaxErrorCode {
    MachineWithoutStateSet,
    MachineMultipleStateSet,
    MachineWithoutTransitionSet,
    MachineMultipleTransitionSet,
    StateSetWithoutState,
    TransitionSetWithoutTransition,
    StateSetWithoutInitialState,
    StateSetMultipleInitialStates,
    StateSetWithoutFinalState,
    StateNonFinalWithoutFunctions,
    CompositeStateFinal,
    DuplicateStateName,
    DuplicateTransitionName,
    DuplicateRelationName,
    DuplicateMachineName,
    StateDuplicateFunction,
    FunctionInvalidTransitionReference,
    FunctionWithEmptyStateCandidates,
    FunctionNextStateInvalid,
    FunctionConditionalTransitionWithoutCondition,
    FunctionSingleCandidateWithCondition,
    TransitionConditionInvalid,
    ConditionKeysNotMatchCandidates,
    TransitionIllegalExtension,
    TransitionExtendedNotFoundInSuper,
    StateOverridesNothing,
    TransitionOverridesNothing,
    RelationOverridesNothing,
    StateShadowsAncestor,
    TransitionShadowsAncestor,
    RelationShadowsAncestor,
    ShortcutTargetInvalid,
    ShortcutOnNonFinalState,
    PreStateChangeFromStateInvalid,
    PreStateChangeToStateInvalid,
    PostStateChangeFromStateInvalid,
    PostStateChangeToStateInvalid,
    CallbackRelationInvalid,
    CallbackMappedByInvalid,
    ConstraintRelationInvalid,
    InboundWhileAmbiguous,
    SuperMachineNotFound,
    CyclicInheritance,
    RelationTargetMachineNotFound,
    RelationConstraintStateInvalid,
    MachineAlreadyRegistered,
    SpecNotParseable,
}

impl SyntaxErrorCode {
    /// Returns the stable error code string for diagnostics.
    pub fn code(&self) -> &'static str {
        match self {
            SyntaxErrorCode::MachineWithoutStateSet => "STATEMACHINE_WITHOUT_STATESET",
            SyntaxErrorCode::MachineMultipleStateSet => "STATEMACHINE_MULTIPLE_STATESET",
            SyntaxErrorCode::MachineWithoutTransitionSet => "STATEMACHINE_WITHOUT_TRANSITIONSET",
            SyntaxErrorCode::MachineMultipleTransitionSet => "STATEMACHINE_MULTIPLE_TRANSITIONSET",
            SyntaxErrorCode::StateSetWithoutState => "STATESET_WITHOUT_STATE",
            SyntaxErrorCode::TransitionSetWithoutTransition => "TRANSITIONSET_WITHOUT_TRANSITION",
            SyntaxErrorCode::StateSetWithoutInitialState => "STATESET_WITHOUT_INITIAL_STATE",
            SyntaxErrorCode::StateSetMultipleInitialStates => "STATESET_MULTIPLE_INITIAL_STATES",
            SyntaxErrorCode::StateSetWithoutFinalState => "STATESET_WITHOUT_FINAL_STATE",
            SyntaxErrorCode::StateNonFinalWithoutFunctions => "STATE_NON_FINAL_WITHOUT_FUNCTIONS",
            SyntaxErrorCode::CompositeStateFinal => "COMPOSITE_STATE_FINAL",
            SyntaxErrorCode::DuplicateStateName => "STATESET_DUPLICATE_STATE_NAME",
            SyntaxErrorCode::DuplicateTransitionName => "TRANSITIONSET_DUPLICATE_TRANSITION_NAME",
            SyntaxErrorCode::DuplicateRelationName => "RELATIONSET_DUPLICATE_RELATION_NAME",
            SyntaxErrorCode::DuplicateMachineName => "STATEMACHINE_DUPLICATE_NAME",
            SyntaxErrorCode::StateDuplicateFunction => "STATE_DUPLICATE_FUNCTION",
            SyntaxErrorCode::FunctionInvalidTransitionReference => {
                "FUNCTION_INVALID_TRANSITION_REFERENCE"
            }
            SyntaxErrorCode::FunctionWithEmptyStateCandidates => {
                "FUNCTION_WITH_EMPTY_STATE_CANDIDATES"
            }
            SyntaxErrorCode::FunctionNextStateInvalid => "FUNCTION_NEXT_STATESET_INVALID",
            SyntaxErrorCode::FunctionConditionalTransitionWithoutCondition => {
                "FUNCTION_CONDITIONAL_TRANSITION_WITHOUT_CONDITION"
            }
            SyntaxErrorCode::FunctionSingleCandidateWithCondition => {
                "FUNCTION_SINGLE_CANDIDATE_WITH_CONDITION"
            }
            SyntaxErrorCode::TransitionConditionInvalid => "TRANSITION_CONDITION_INVALID",
            SyntaxErrorCode::ConditionKeysNotMatchCandidates => {
                "TRANSITION_CONDITIONAL_CONDITION_NOT_MATCH_JUDGER"
            }
            SyntaxErrorCode::TransitionIllegalExtension => "TRANSITION_ILLEGAL_EXTENSION",
            SyntaxErrorCode::TransitionExtendedNotFoundInSuper => {
                "TRANSITION_EXTENDED_TRANSITION_NOT_FOUND_IN_SUPER_STATEMACHINE"
            }
            SyntaxErrorCode::StateOverridesNothing => "STATE_OVERRIDES_NOTHING",
            SyntaxErrorCode::TransitionOverridesNothing => "TRANSITION_OVERRIDES_NOTHING",
            SyntaxErrorCode::RelationOverridesNothing => "RELATION_OVERRIDES_NOTHING",
            SyntaxErrorCode::StateShadowsAncestor => "STATE_SHADOWS_ANCESTOR",
            SyntaxErrorCode::TransitionShadowsAncestor => "TRANSITION_SHADOWS_ANCESTOR",
            SyntaxErrorCode::RelationShadowsAncestor => "RELATION_SHADOWS_ANCESTOR",
            SyntaxErrorCode::ShortcutTargetInvalid => "SHORTCUT_TARGET_INVALID",
            SyntaxErrorCode::ShortcutOnNonFinalState => "SHORTCUT_ON_NON_FINAL_STATE",
            SyntaxErrorCode::PreStateChangeFromStateInvalid => {
                "PRE_STATE_CHANGE_FROM_STATE_IS_INVALID"
            }
            SyntaxErrorCode::PreStateChangeToStateInvalid => "PRE_STATE_CHANGE_TO_STATE_IS_INVALID",
            SyntaxErrorCode::PostStateChangeFromStateInvalid => {
                "POST_STATE_CHANGE_FROM_STATE_IS_INVALID"
            }
            SyntaxErrorCode::PostStateChangeToStateInvalid => {
                "POST_STATE_CHANGE_TO_STATE_IS_INVALID"
            }
            SyntaxErrorCode::CallbackRelationInvalid => "STATE_CHANGE_RELATION_INVALID",
            SyntaxErrorCode::CallbackMappedByInvalid => "STATE_CHANGE_MAPPEDBY_INVALID",
            SyntaxErrorCode::ConstraintRelationInvalid => "RELATION_CONSTRAINT_RELATION_INVALID",
            SyntaxErrorCode::InboundWhileAmbiguous => {
                "INBOUND_WHILE_ON_NON_CONDITIONAL_TRANSITION_AMBIGUOUS"
            }
            SyntaxErrorCode::SuperMachineNotFound => "SUPER_STATEMACHINE_NOT_FOUND",
            SyntaxErrorCode::CyclicInheritance => "STATEMACHINE_CYCLIC_INHERITANCE",
            SyntaxErrorCode::RelationTargetMachineNotFound => "RELATED_STATEMACHINE_NOT_FOUND",
            SyntaxErrorCode::RelationConstraintStateInvalid => "RELATION_ON_STATE_INVALID",
            SyntaxErrorCode::MachineAlreadyRegistered => "STATEMACHINE_ALREADY_REGISTERED",
            SyntaxErrorCode::SpecNotParseable => "SPEC_NOT_PARSEABLE",
        }
    }
}

/// One structural violation found during verification.
#[derive(Debug, Clone, Error)]
#[error("[{}] {path}: {message}", .code.code())]
pub struct VerificationFailure {
    pub code: SyntaxErrorCode,
    pub path: DottedPath,
    pub message: String,
}

impl VerificationFailure {
    pub fn new(code: SyntaxErrorCode, path: DottedPath, message: impl Into<String>) -> Self {
        Self {
            code,
            path,
            message: message.into(),
        }
    }
}

/// An ordered, accumulating collection of verification failures.
#[derive(Debug, Clone, Default)]
pub struct VerificationFailureSet {
    failures: Vec<VerificationFailure>,
}

impl VerificationFailureSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, failure: VerificationFailure) {
        self.failures.push(failure);
    }

    pub fn push(
        &mut self,
        code: SyntaxErrorCode,
        path: DottedPath,
        message: impl Into<String>,
    ) {
        self.add(VerificationFailure::new(code, path, message));
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VerificationFailure> {
        self.failures.iter()
    }

    /// Returns true if any failure carries the given code.
    pub fn contains(&self, code: SyntaxErrorCode) -> bool {
        self.failures.iter().any(|f| f.code == code)
    }

    /// Returns all failures with the given code.
    pub fn with_code(&self, code: SyntaxErrorCode) -> Vec<&VerificationFailure> {
        self.failures.iter().filter(|f| f.code == code).collect()
    }
}

impl fmt::Display for VerificationFailureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} verification failure(s)", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "\n  {}", failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for VerificationFailureSet {}

impl IntoIterator for VerificationFailureSet {
    type Item = VerificationFailure;
    type IntoIter = std::vec::IntoIter<VerificationFailure>;

    fn into_iter(self) -> Self::IntoIter {
        self.failures.into_iter()
    }
}
