//! Condition judges for conditional transitions.
//!
//! A conditional transition fans out to several candidate next states; its
//! declared condition selects exactly one of them at fire time. The meta-model
//! carries the condition's name and key domain; the implementation is plain
//! Rust, bound on the runtime object by name.

use serde_json::Value;

/// Selects one candidate next state for a conditional transition.
///
/// The judge receives the object's context (with the fire payload already
/// merged in) and returns a state name. A result outside the function's
/// declared candidate set fails the transition with `ConditionResultInvalid`.
pub trait ConditionJudge: Send + Sync {
    fn judge(&self, ctx: &Value) -> String;
}

impl<F> ConditionJudge for F
where
    F: Fn(&Value) -> String + Send + Sync,
{
    fn judge(&self, ctx: &Value) -> String {
        self(ctx)
    }
}
