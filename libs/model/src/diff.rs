//! Model snapshots, validation, and diffing.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::component::Component;
use crate::error::ModelError;

/// Immutable snapshot of intended topology. Replacing the model is atomic
/// from the caller's perspective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Model {
    pub components: Vec<Component>,
}

impl Model {
    pub fn new(components: Vec<Component>) -> Self {
        Self { components }
    }

    /// Synchronous validation: duplicate component ids, duplicate unit keys
    /// within a component, components with neither spec nor error.
    pub fn validate(&self) -> Result<(), ModelError> {
        let mut ids = BTreeSet::new();
        for component in &self.components {
            if !ids.insert(component.id.as_str()) {
                return Err(ModelError::DuplicateComponent(component.id.clone()));
            }
            if component.spec.is_none() && component.error.is_none() {
                return Err(ModelError::MissingSpec(component.id.clone()));
            }
            let mut keys = BTreeSet::new();
            for unit in &component.units {
                if !keys.insert(unit.key()) {
                    return Err(ModelError::DuplicateUnit {
                        component: component.id.clone(),
                        key: unit.key(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Components keyed by id, in model order.
    pub fn by_id(&self) -> BTreeMap<String, &Component> {
        self.components
            .iter()
            .map(|c| (c.id.clone(), c))
            .collect()
    }
}

/// Result of diffing the current component set against a new model.
#[derive(Debug, Default)]
pub struct ModelDiff {
    /// Components present in the new model but not in the current set.
    pub added: Vec<Component>,

    /// Ids present in the current set but absent from the new model.
    pub removed: Vec<String>,

    /// Components present in both whose definition changed.
    pub changed: Vec<Component>,
}

impl ModelDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Diff the currently applied components against a new model.
///
/// `current` is keyed by component id. Identical components are elided so
/// that applying the same model twice is a no-op.
pub fn diff(current: &BTreeMap<String, Component>, next: &Model) -> ModelDiff {
    let mut out = ModelDiff::default();
    let next_ids: BTreeSet<&str> = next.components.iter().map(|c| c.id.as_str()).collect();

    for id in current.keys() {
        if !next_ids.contains(id.as_str()) {
            out.removed.push(id.clone());
        }
    }

    for component in &next.components {
        match current.get(&component.id) {
            None => out.added.push(component.clone()),
            Some(existing) if existing != component => out.changed.push(component.clone()),
            Some(_) => {}
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{CommandSpec, InputRuntimeSpec, RuntimeSpec, Unit};
    use crate::state::{LogLevel, UnitType};
    use std::path::PathBuf;

    fn component(id: &str) -> Component {
        Component {
            id: id.to_string(),
            spec: Some(RuntimeSpec::Input(InputRuntimeSpec {
                input_type: "fake".to_string(),
                binary_name: "fake".to_string(),
                binary_path: PathBuf::from("/bin/fake"),
                command: CommandSpec::default(),
            })),
            error: None,
            features: None,
            apm_config: None,
            limits: None,
            shipper_ref: None,
            units: vec![Unit {
                unit_type: UnitType::Input,
                id: format!("{id}-unit"),
                log_level: LogLevel::Info,
                config: None,
                error: None,
            }],
        }
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let model = Model::new(vec![component("a"), component("a")]);
        assert!(matches!(
            model.validate(),
            Err(ModelError::DuplicateComponent(id)) if id == "a"
        ));
    }

    #[test]
    fn validate_rejects_missing_spec() {
        let mut c = component("a");
        c.spec = None;
        let model = Model::new(vec![c]);
        assert!(matches!(model.validate(), Err(ModelError::MissingSpec(_))));
    }

    #[test]
    fn validate_accepts_error_only_component() {
        let mut c = component("a");
        c.spec = None;
        c.error = Some("hard-coded error".to_string());
        assert!(Model::new(vec![c]).validate().is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_unit_keys() {
        let mut c = component("a");
        c.units.push(c.units[0].clone());
        let model = Model::new(vec![c]);
        assert!(matches!(
            model.validate(),
            Err(ModelError::DuplicateUnit { .. })
        ));
    }

    #[test]
    fn diff_classifies_added_removed_changed() {
        let mut current = BTreeMap::new();
        current.insert("a".to_string(), component("a"));
        current.insert("b".to_string(), component("b"));

        let mut changed_b = component("b");
        changed_b.units[0].config = Some(serde_json::json!({"state": 2}));

        let next = Model::new(vec![changed_b, component("c")]);
        let diff = diff(&current, &next);

        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].id, "c");
        assert_eq!(diff.removed, vec!["a".to_string()]);
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.changed[0].id, "b");
    }

    #[test]
    fn diff_of_identical_model_is_empty() {
        let mut current = BTreeMap::new();
        current.insert("a".to_string(), component("a"));
        let next = Model::new(vec![component("a")]);
        assert!(diff(&current, &next).is_empty());
    }
}
