//! Declarative machine specifications.
//!
//! A machine spec is the raw, unverified input to the builder. Specs use a
//! JSON DSL and can equally be constructed programmatically:
//!
//! ```json
//! {
//!   "name": "Order",
//!   "state_sets": [{"states": [
//!     {"name": "Created", "initial": true,
//!      "functions": [{"transition": "Start", "candidates": "Started"}]},
//!     {"name": "Started",
//!      "functions": [{"transition": "Deliver", "candidates": "Delivered"}],
//!      "valid_while": [{"relation": "contract", "on": ["Active"]}]},
//!     {"name": "Delivered", "end": true}
//!   ]}],
//!   "transition_sets": [{"transitions": [
//!     {"name": "Start"},
//!     {"name": "Deliver", "inbound_while": [
//!       {"relation": "contract", "on": ["Active"], "phase": "pre"}]}
//!   ]}],
//!   "relations": [{"name": "contract", "target": "Contract"}]
//! }
//! ```
//!
//! Composite states nest a full sub-machine body under `"composite"`; a final
//! substate may carry a `"shortcut"` naming a state of the enclosing machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Evaluation phase of an inbound-while guard relative to the state commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardPhase {
    /// Checked before the transition commits; a violation aborts atomically.
    #[default]
    Pre,
    /// Checked after the commit; a violation fails the call but the new state
    /// is retained.
    Post,
}

impl fmt::Display for GuardPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardPhase::Pre => f.write_str("pre"),
            GuardPhase::Post => f.write_str("post"),
        }
    }
}

/// Invocation phase of a state-change callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackPhase {
    /// Invoked before the state commit.
    #[default]
    Pre,
    /// Invoked after the state commit.
    Post,
}

/// A (transition -> next-state candidates) mapping declared on a state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSpec {
    /// Transition this function reacts to.
    pub transition: String,

    /// Candidate next states. More than one candidate makes the dispatch
    /// conditional and requires the transition to carry a condition.
    #[serde(deserialize_with = "deserialize_candidates")]
    pub candidates: Vec<String>,
}

fn deserialize_candidates<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct CandidatesVisitor;

    impl<'de> Visitor<'de> for CandidatesVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a state name or array of state names")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(vec![v.to_string()])
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut candidates = Vec::new();
            while let Some(s) = seq.next_element::<String>()? {
                candidates.push(s);
            }
            Ok(candidates)
        }
    }

    deserializer.deserialize_any(CandidatesVisitor)
}

/// An occupancy guard: while the declaring state is occupied, the related
/// object must stay within the `on` set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidWhileSpec {
    pub relation: String,
    pub on: Vec<String>,
}

/// A transition guard checked against a related object's state, either before
/// or after the transition commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundWhileSpec {
    pub relation: String,
    pub on: Vec<String>,
    #[serde(default)]
    pub phase: GuardPhase,
}

/// A named pre/post state-change callback binding, scoped by from-state and/or
/// to-state. Implementations are bound on the runtime object by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackSpec {
    pub name: String,
    #[serde(default)]
    pub phase: CallbackPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapped_by: Option<String>,
}

/// A state declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSpec {
    pub name: String,

    #[serde(default)]
    pub initial: bool,

    /// Final state flag.
    #[serde(default)]
    pub end: bool,

    /// Marks this state as replacing a same-named ancestor state.
    #[serde(default)]
    pub overrides: bool,

    /// Nested sub-machine body; present iff this is a composite state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite: Option<Box<MachineBody>>,

    /// For a final substate: state of the enclosing machine entered
    /// automatically when the sub-machine reaches this state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shortcut: Option<String>,

    #[serde(default)]
    pub functions: Vec<FunctionSpec>,

    #[serde(default)]
    pub valid_while: Vec<ValidWhileSpec>,

    #[serde(default)]
    pub callbacks: Vec<CallbackSpec>,
}

/// A transition declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionSpec {
    pub name: String,

    /// Marks this transition as replacing a same-named ancestor transition.
    #[serde(default)]
    pub overrides: bool,

    /// Declares this transition as an extension of the named ancestor member,
    /// which must be a transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,

    /// Condition judging conditional dispatch for this transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    #[serde(default)]
    pub inbound_while: Vec<InboundWhileSpec>,
}

/// A named predicate selecting one candidate for a conditional transition.
/// The declared key domain must cover every candidate set routed through it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionSpec {
    pub name: String,
    pub keys: Vec<String>,
}

/// A named, typed link to an object governed by another machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationSpec {
    pub name: String,

    /// Name of the related state machine.
    pub target: String,

    /// Multi-keyed relations hold many related instances, each validated.
    #[serde(default)]
    pub multi: bool,

    /// Marks this relation as replacing a same-named ancestor relation.
    #[serde(default)]
    pub overrides: bool,
}

fn default_state_set_name() -> String {
    "StateSet".to_string()
}

fn default_transition_set_name() -> String {
    "TransitionSet".to_string()
}

/// A state-set declaration; a well-formed machine has exactly one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSetSpec {
    #[serde(default = "default_state_set_name")]
    pub name: String,
    #[serde(default)]
    pub states: Vec<StateSpec>,
}

/// A transition-set declaration; a well-formed machine has exactly one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionSetSpec {
    #[serde(default = "default_transition_set_name")]
    pub name: String,
    #[serde(default)]
    pub transitions: Vec<TransitionSpec>,
}

/// The member declarations of a machine, shared between top-level machines and
/// composite sub-machines.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineBody {
    #[serde(default)]
    pub state_sets: Vec<StateSetSpec>,

    #[serde(default)]
    pub transition_sets: Vec<TransitionSetSpec>,

    #[serde(default)]
    pub relations: Vec<RelationSpec>,

    #[serde(default)]
    pub conditions: Vec<ConditionSpec>,
}

/// A raw, unverified state machine specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineSpec {
    pub name: String,

    /// Parent machine this one inherits states/transitions/relations from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,

    #[serde(flatten)]
    pub body: MachineBody,
}

impl MachineSpec {
    /// Parses a machine spec from JSON.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(json.clone())
    }

    /// Returns the spec as JSON.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// CRC32C checksum of the canonical JSON form, used for idempotent
    /// re-registration.
    pub fn checksum(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        format!("{:08x}", crc32c::crc32c(&bytes))
    }
}
