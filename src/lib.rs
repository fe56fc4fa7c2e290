//! # statemeta
//!
//! Declarative lifecycle engine: state machines are described as data,
//! verified into an immutable meta-model, and driven at runtime with
//! composite states, inheritance, conditional transitions and relation
//! guards between objects.
//!
//! This crate provides:
//! - Machine spec parsing (JSON) and exhaustive structural verification
//! - A flattened, `Arc`-shared meta-model with inheritance resolved
//! - A transition engine with composite entry, shortcuts, condition judges,
//!   valid-while / inbound-while relation guards and state-change callbacks
//! - A checksum-idempotent registry of verified machines

pub mod builder;
pub mod condition;
pub mod engine;
pub mod meta;
pub mod path;
pub mod registry;
pub mod relation;
pub mod spec;
pub mod verification;

pub use builder::MetaModelBuilder;
pub use condition::ConditionJudge;
pub use engine::{CallbackContext, CallbackFn, LifecycleError, StateMachineObject};
pub use meta::{
    CallbackMetadata, ConditionMetadata, FunctionMetadata, MetaModel, RelationConstraintMetadata,
    RelationMetadata, StateMachineMetadata, StateMetadata, TransitionMetadata,
};
pub use path::DottedPath;
pub use registry::LifecycleRegistry;
pub use relation::{RelationBinding, StateCell, UNSET_STATE};
pub use spec::{CallbackPhase, GuardPhase, MachineSpec};
pub use verification::{SyntaxErrorCode, VerificationFailure, VerificationFailureSet};
