//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Engine-declared variable catalogue for the active model."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::collections::HashSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};
use tracing::{error, warn};

use crate::adapter::EngineAdapter;
use crate::errors::{Result, SimError};
use crate::model_id::ModelIdentifier;

fn default_min() -> f64 {
    f64::NEG_INFINITY
}

fn default_max() -> f64 {
    f64::INFINITY
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum VariableKind {
    Input,
    Output,
    Parameter,
    State,
}

/// One model variable as declared by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub kind: VariableKind,
    #[serde(default)]
    pub default_value: Value,
    #[serde(default = "default_min")]
    pub min: f64,
    #[serde(default = "default_max")]
    pub max: f64,
}

impl Variable {
    pub fn new(name: impl Into<String>, kind: VariableKind, default_value: Value) -> Self {
        Self {
            name: name.into(),
            kind,
            default_value,
            min: default_min(),
            max: default_max(),
        }
    }

    pub fn with_bounds(mut self, min: f64, max: f64) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn within_bounds(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Result of looking up names in the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub found: Vec<String>,
    pub missing: Vec<String>,
}

/// Catalogue of the active model's variables, partitioned by kind.
///
/// A registry belongs to exactly one model. Switching models builds a new
/// registry through [`VariableRegistry::load`]; partitions are never merged.
#[derive(Debug, Clone, Default)]
pub struct VariableRegistry {
    model: String,
    inputs: IndexMap<String, Variable>,
    outputs: IndexMap<String, Variable>,
    parameters: IndexMap<String, Variable>,
    states: IndexMap<String, Variable>,
    result_names: Vec<String>,
}

impl VariableRegistry {
    /// Introspect the model currently loaded in `engine`.
    pub fn load(engine: &mut dyn EngineAdapter, model: &ModelIdentifier) -> Result<Self> {
        let variables = engine.variables().map_err(|err| match err {
            SimError::ModelLoad { .. } => err,
            other => SimError::ModelLoad {
                model: model.to_string(),
                log: other.to_string(),
            },
        })?;
        Ok(Self::from_variables(model.base(), variables))
    }

    pub fn from_variables(model: impl Into<String>, variables: Vec<Variable>) -> Self {
        let mut registry = Self {
            model: model.into(),
            ..Self::default()
        };
        for variable in variables {
            if let Some(existing) = registry.get(&variable.name) {
                warn!(
                    model = %registry.model,
                    variable = %variable.name,
                    kept = %existing.kind,
                    ignored = %variable.kind,
                    "variable declared under more than one kind; keeping the first"
                );
                continue;
            }
            let partition = match variable.kind {
                VariableKind::Input => &mut registry.inputs,
                VariableKind::Output => &mut registry.outputs,
                VariableKind::Parameter => &mut registry.parameters,
                VariableKind::State => &mut registry.states,
            };
            partition.insert(variable.name.clone(), variable);
        }
        registry.reset_result_names();
        registry
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn inputs(&self) -> &IndexMap<String, Variable> {
        &self.inputs
    }

    pub fn outputs(&self) -> &IndexMap<String, Variable> {
        &self.outputs
    }

    pub fn parameters(&self) -> &IndexMap<String, Variable> {
        &self.parameters
    }

    pub fn states(&self) -> &IndexMap<String, Variable> {
        &self.states
    }

    pub fn partition(&self, kind: VariableKind) -> &IndexMap<String, Variable> {
        match kind {
            VariableKind::Input => &self.inputs,
            VariableKind::Output => &self.outputs,
            VariableKind::Parameter => &self.parameters,
            VariableKind::State => &self.states,
        }
    }

    /// Look up a name across all partitions.
    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.parameters
            .get(name)
            .or_else(|| self.outputs.get(name))
            .or_else(|| self.inputs.get(name))
            .or_else(|| self.states.get(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.inputs.len() + self.outputs.len() + self.parameters.len() + self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn resolve<S: AsRef<str>>(&self, names: &[S]) -> Resolution {
        let mut resolution = Resolution::default();
        for name in names {
            let name = name.as_ref();
            if self.contains(name) {
                resolution.found.push(name.to_owned());
            } else {
                resolution.missing.push(name.to_owned());
            }
        }
        resolution
    }

    pub fn result_names(&self) -> &[String] {
        &self.result_names
    }

    /// Return to storing every output.
    pub fn reset_result_names(&mut self) {
        self.result_names = self.outputs.keys().cloned().collect();
    }

    /// Narrow the names stored in results.
    ///
    /// Unknown names are logged and kept: the engine performs the authoritative
    /// check when simulating.
    pub fn set_result_names<S: AsRef<str>>(&mut self, names: &[S]) -> Resolution {
        let resolution = self.resolve(names);
        for name in &resolution.missing {
            error!(
                model = %self.model,
                variable = %name,
                "variable not found in model; simulating will most probably fail"
            );
        }
        self.result_names = names.iter().map(|n| n.as_ref().to_owned()).collect();
        resolution
    }

    /// Warn about names absent from one partition, or from all partitions when `kind` is `None`.
    /// Returns `true` when at least one name is unsupported.
    pub fn check_unsupported<S: AsRef<str>>(&self, names: &[S], kind: Option<VariableKind>) -> bool {
        let known: HashSet<&str> = match kind {
            Some(kind) => self.partition(kind).keys().map(String::as_str).collect(),
            None => self
                .parameters
                .keys()
                .chain(self.outputs.keys())
                .chain(self.inputs.keys())
                .chain(self.states.keys())
                .map(String::as_str)
                .collect(),
        };
        let unsupported: Vec<&str> = names
            .iter()
            .map(AsRef::as_ref)
            .filter(|name| !known.contains(name))
            .collect();
        if unsupported.is_empty() {
            return false;
        }
        warn!(
            model = %self.model,
            kind = kind.map(|k| k.to_string()).unwrap_or_else(|| "any".to_owned()),
            variables = %unsupported.join(", "),
            "variables not found in model; simulating will most probably fail"
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> VariableRegistry {
        VariableRegistry::from_variables(
            "Building.Zone",
            vec![
                Variable::new("T_set", VariableKind::Input, json!(293.15)),
                Variable::new("heater.Q_flow", VariableKind::Output, json!(0.0)),
                Variable::new("zone.T", VariableKind::Output, json!(293.15)),
                Variable::new("C", VariableKind::Parameter, json!(2000.0)).with_bounds(100.0, 5000.0),
                Variable::new("zone.U", VariableKind::State, json!(0.0)),
            ],
        )
    }

    #[test]
    fn partitions_variables_and_defaults_result_names_to_outputs() {
        let registry = registry();
        assert_eq!(registry.len(), 5);
        assert_eq!(registry.inputs().len(), 1);
        assert_eq!(registry.parameters().len(), 1);
        assert_eq!(registry.result_names(), ["heater.Q_flow", "zone.T"]);
        assert_eq!(registry.get("C").unwrap().kind, VariableKind::Parameter);
    }

    #[test]
    fn resolve_splits_found_and_missing_in_order() {
        let registry = registry();
        let resolution = registry.resolve(&["zone.T", "nope", "C"]);
        assert_eq!(resolution.found, ["zone.T", "C"]);
        assert_eq!(resolution.missing, ["nope"]);
    }

    #[test]
    fn unknown_result_names_are_kept_and_reported() {
        let mut registry = registry();
        let resolution = registry.set_result_names(&["zone.T", "ghost"]);
        assert_eq!(resolution.missing, ["ghost"]);
        assert_eq!(registry.result_names(), ["zone.T", "ghost"]);
    }

    #[test]
    fn check_unsupported_respects_partition() {
        let registry = registry();
        assert!(!registry.check_unsupported(&["C"], Some(VariableKind::Parameter)));
        assert!(registry.check_unsupported(&["zone.T"], Some(VariableKind::Parameter)));
        assert!(!registry.check_unsupported(&["zone.T", "zone.U"], None));
    }

    #[test]
    fn bounds_default_to_unbounded() {
        let variable = Variable::new("x", VariableKind::Parameter, Value::Null);
        assert!(variable.within_bounds(f64::MAX));
        let bounded = registry();
        let c = bounded.get("C").unwrap();
        assert!(c.within_bounds(2000.0));
        assert!(!c.within_bounds(6000.0));
    }

    #[test]
    fn duplicate_names_keep_the_first_kind() {
        let registry = VariableRegistry::from_variables(
            "Building.Zone",
            vec![
                Variable::new("zone.T", VariableKind::Output, json!(293.15)),
                Variable::new("zone.T", VariableKind::State, json!(0.0)),
            ],
        );
        assert_eq!(registry.len(), 1);
        assert!(registry.states().is_empty());
        assert_eq!(registry.get("zone.T").unwrap().kind, VariableKind::Output);
    }

    #[test]
    fn reset_restores_all_outputs() {
        let mut registry = registry();
        registry.set_result_names(&["zone.T"]);
        registry.reset_result_names();
        assert_eq!(registry.result_names(), ["heater.Q_flow", "zone.T"]);
    }

    #[test]
    fn kind_parses_from_lowercase() {
        assert_eq!("state".parse::<VariableKind>().unwrap(), VariableKind::State);
        assert_eq!(VariableKind::Output.to_string(), "output");
    }
}
