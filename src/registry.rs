//! Process-wide registry of verified state machines.
//!
//! Specs are registered in batches; each batch is verified as one unit
//! against the machines already present, so a new machine may extend or
//! relate to anything registered earlier. Registration is idempotent by
//! checksum: re-registering an unchanged spec is a no-op, while a changed
//! spec under a live name is refused.

use crate::builder::MetaModelBuilder;
use crate::engine::{LifecycleError, StateMachineObject};
use crate::meta::StateMachineMetadata;
use crate::path::DottedPath;
use crate::spec::MachineSpec;
use crate::verification::{SyntaxErrorCode, VerificationFailureSet};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct LifecycleRegistry {
    machines: DashMap<String, Arc<StateMachineMetadata>>,
}

impl LifecycleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verifies and registers a batch of machine specs.
    pub fn register(&self, specs: Vec<MachineSpec>) -> Result<(), VerificationFailureSet> {
        let mut failures = VerificationFailureSet::new();
        let mut fresh = Vec::new();
        for spec in specs {
            match self.machines.get(&spec.name) {
                Some(existing) if existing.checksum == spec.checksum() => {
                    tracing::debug!(machine = %spec.name, "spec unchanged, skipping");
                }
                Some(_) => failures.push(
                    SyntaxErrorCode::MachineAlreadyRegistered,
                    DottedPath::root(&spec.name),
                    format!(
                        "state machine '{}' is already registered with a different spec",
                        spec.name
                    ),
                ),
                None => fresh.push(spec),
            }
        }
        if !failures.is_empty() {
            return Err(failures);
        }
        if fresh.is_empty() {
            return Ok(());
        }

        let context: HashMap<String, Arc<StateMachineMetadata>> = self
            .machines
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let mut builder = MetaModelBuilder::with_context(context);
        for spec in fresh {
            builder.add_machine(spec);
        }
        let model = builder.build()?;
        let count = model.len();
        for (name, machine) in model.into_machines() {
            self.machines.insert(name, machine);
        }
        tracing::info!(
            registered = count,
            total = self.machines.len(),
            "state machines registered"
        );
        Ok(())
    }

    /// Parses and registers raw JSON specs as one batch.
    pub fn register_json(&self, specs: &[Value]) -> Result<(), VerificationFailureSet> {
        let mut failures = VerificationFailureSet::new();
        let mut parsed = Vec::with_capacity(specs.len());
        for (i, json) in specs.iter().enumerate() {
            match MachineSpec::from_json(json) {
                Ok(spec) => parsed.push(spec),
                Err(err) => failures.push(
                    SyntaxErrorCode::SpecNotParseable,
                    DottedPath::root(format!("<spec #{i}>")),
                    err.to_string(),
                ),
            }
        }
        if !failures.is_empty() {
            return Err(failures);
        }
        self.register(parsed)
    }

    pub fn machine(&self, name: &str) -> Option<Arc<StateMachineMetadata>> {
        self.machines.get(name).map(|entry| entry.value().clone())
    }

    pub fn machine_names(&self) -> Vec<String> {
        self.machines.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    /// Creates a live object of a registered machine, placed on its initial
    /// state path with the given context.
    pub fn new_object(
        &self,
        name: &str,
        initial_ctx: Value,
    ) -> Result<StateMachineObject, LifecycleError> {
        let machine = self
            .machine(name)
            .ok_or_else(|| LifecycleError::MachineNotFound {
                name: name.to_string(),
            })?;
        StateMachineObject::new(machine, initial_ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn door_spec() -> Value {
        json!({
            "name": "Door",
            "state_sets": [{"states": [
                {"name": "Closed", "initial": true,
                 "functions": [{"transition": "Open", "candidates": "Opened"}]},
                {"name": "Opened", "end": true}
            ]}],
            "transition_sets": [{"transitions": [{"name": "Open"}]}]
        })
    }

    #[test]
    fn test_register_and_instantiate() {
        let registry = LifecycleRegistry::new();
        registry.register_json(&[door_spec()]).unwrap();
        assert_eq!(registry.len(), 1);

        let mut door = registry.new_object("Door", json!({})).unwrap();
        assert_eq!(door.state(), "Closed");
        door.fire("Open", None).unwrap();
        assert_eq!(door.state(), "Opened");
    }

    #[test]
    fn test_reregistering_unchanged_spec_is_a_noop() {
        let registry = LifecycleRegistry::new();
        registry.register_json(&[door_spec()]).unwrap();
        registry.register_json(&[door_spec()]).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_changed_spec_under_live_name_is_refused() {
        let registry = LifecycleRegistry::new();
        registry.register_json(&[door_spec()]).unwrap();

        let mut changed = door_spec();
        changed["transition_sets"][0]["transitions"]
            .as_array_mut()
            .unwrap()
            .push(json!({"name": "Slam"}));
        let err = registry.register_json(&[changed]).unwrap_err();
        assert!(err.contains(SyntaxErrorCode::MachineAlreadyRegistered));
    }

    #[test]
    fn test_later_batch_extends_earlier_machines() {
        let registry = LifecycleRegistry::new();
        registry.register_json(&[door_spec()]).unwrap();

        registry
            .register_json(&[json!({
                "name": "VaultDoor",
                "extends": "Door",
                "state_sets": [{"states": [
                    {"name": "Opened", "overrides": true,
                     "functions": [{"transition": "Seal", "candidates": "Sealed"}]},
                    {"name": "Sealed", "end": true}
                ]}],
                "transition_sets": [{"transitions": [{"name": "Seal"}]}]
            })])
            .unwrap();

        let mut vault = registry.new_object("VaultDoor", json!({})).unwrap();
        vault.fire("Open", None).unwrap();
        vault.fire("Seal", None).unwrap();
        assert_eq!(vault.state(), "Sealed");
    }

    #[test]
    fn test_later_batch_relates_to_earlier_machines() {
        let registry = LifecycleRegistry::new();
        registry.register_json(&[door_spec()]).unwrap();

        registry
            .register_json(&[json!({
                "name": "Alarm",
                "relations": [{"name": "door", "target": "Door"}],
                "state_sets": [{"states": [
                    {"name": "Armed", "initial": true,
                     "valid_while": [{"relation": "door", "on": ["Closed"]}],
                     "functions": [{"transition": "Disarm", "candidates": "Disarmed"}]},
                    {"name": "Disarmed", "end": true}
                ]}],
                "transition_sets": [{"transitions": [{"name": "Disarm"}]}]
            })])
            .unwrap();

        let mut door = registry.new_object("Door", json!({})).unwrap();
        let mut alarm = registry.new_object("Alarm", json!({})).unwrap();
        alarm.bind_relation("door", door.watch()).unwrap();
        assert_eq!(alarm.checked_state().unwrap(), "Armed");

        door.fire("Open", None).unwrap();
        assert!(alarm.checked_state().is_err());
        assert!(alarm.fire("Disarm", None).is_err());
    }

    #[test]
    fn test_unregistered_machine() {
        let registry = LifecycleRegistry::new();
        let err = registry.new_object("Ghost", json!({})).unwrap_err();
        assert_eq!(err.error_code(), "MACHINE_NOT_FOUND");
    }

    #[test]
    fn test_unparseable_spec() {
        let registry = LifecycleRegistry::new();
        let err = registry
            .register_json(&[json!({"state_sets": "nope"})])
            .unwrap_err();
        assert!(err.contains(SyntaxErrorCode::SpecNotParseable));
    }
}
