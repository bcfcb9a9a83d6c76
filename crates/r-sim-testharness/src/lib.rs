//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Scripted in-process engine for orchestration tests."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
//! [`ScriptedEngine`] behaves like a native engine without spawning one.
//!
//! * Every non-time trajectory is `t + sum(row)` so batch rows are
//!   distinguishable.
//! * Parameters registered with [`ScriptedEngine::with_structural`] produce the
//!   translation warning pair while they are set through `initial_names` on
//!   a model that does not carry them as modifiers.
//! * File-based runs write the result, log and final-state files into the
//!   working directory.
//!
//! A shared [`ProbeHandle`] records every call for assertions.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use r_sim_core::{
    EngineAdapter, EngineCapabilities, ExecutionRequest, ModelIdentifier, OutputRequest,
    RawResult, Result, SimError, Variable, VariableKind, STRUCTURAL_MARKER,
};
use serde_json::json;
use tracing::debug;

pub const BACKEND: &str = "scripted";

/// Calls observed by a [`ScriptedEngine`].
#[derive(Debug, Default, Clone)]
pub struct Probe {
    pub opens: u32,
    pub closes: u32,
    /// Model identifiers in load order, rendered as sent to the engine.
    pub loads: Vec<String>,
    pub runs: Vec<RecordedRun>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRun {
    pub model: String,
    pub initial_names: Vec<String>,
    pub initial_values: Vec<Vec<f64>>,
    pub output: OutputRequest,
    pub show_eventlog: bool,
}

pub type ProbeHandle = Arc<Mutex<Probe>>;

/// Capabilities close to the native process backend.
pub fn scripted_capabilities() -> EngineCapabilities {
    EngineCapabilities {
        allowed_solvers: vec!["Dassl".to_owned(), "Euler".to_owned(), "Cvode".to_owned()],
        default_solver: "Dassl".to_owned(),
        requires_interval_count: true,
        ..EngineCapabilities::default()
    }
}

/// Small model: two outputs, two parameters with bounds, one state.
pub fn sample_variables() -> Vec<Variable> {
    vec![
        Variable::new("x", VariableKind::Output, json!(0.0)),
        Variable::new("y", VariableKind::Output, json!(0.0)),
        Variable::new("C", VariableKind::Parameter, json!(1000.0)).with_bounds(0.0, 5000.0),
        Variable::new("n", VariableKind::Parameter, json!(2)).with_bounds(1.0, 10.0),
        Variable::new("T", VariableKind::State, json!(293.15)),
    ]
}

#[derive(Debug)]
pub struct ScriptedEngine {
    dir: PathBuf,
    model: String,
    capabilities: EngineCapabilities,
    variables: Vec<Variable>,
    structural: Vec<String>,
    reject_modified: bool,
    failures: VecDeque<String>,
    probe: ProbeHandle,
    open: bool,
    loaded: Option<ModelIdentifier>,
    last_log: String,
}

impl ScriptedEngine {
    /// Engine providing `model` with [`sample_variables`], writing into `dir`.
    pub fn new(dir: impl Into<PathBuf>, model: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            model: model.into(),
            capabilities: scripted_capabilities(),
            variables: sample_variables(),
            structural: Vec::new(),
            reject_modified: false,
            failures: VecDeque::new(),
            probe: ProbeHandle::default(),
            open: false,
            loaded: None,
            last_log: String::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: EngineCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_variables(mut self, variables: Vec<Variable>) -> Self {
        self.variables = variables;
        self
    }

    /// Treat `names` as structural parameters.
    pub fn with_structural<S: AsRef<str>>(mut self, names: &[S]) -> Self {
        self.structural = names.iter().map(|n| n.as_ref().to_owned()).collect();
        self
    }

    /// Fail every load of a model identifier carrying modifiers.
    pub fn rejecting_modified_models(mut self) -> Self {
        self.reject_modified = true;
        self
    }

    /// Report the next run as failed with `log`.
    pub fn failing_next_run(mut self, log: impl Into<String>) -> Self {
        self.failures.push_back(log.into());
        self
    }

    pub fn with_probe(mut self, probe: ProbeHandle) -> Self {
        self.probe = probe;
        self
    }

    pub fn probe(&self) -> ProbeHandle {
        self.probe.clone()
    }

    fn structural_warnings(&self, request: &ExecutionRequest<'_>) -> String {
        let applied: Vec<&str> = request
            .model
            .modifiers()
            .iter()
            .map(|(name, _)| name.as_str())
            .collect();
        self.structural
            .iter()
            .filter(|name| request.setup.initial_names().contains(*name))
            .filter(|name| !applied.contains(&name.as_str()))
            .map(|name| format!("Warning: Setting {name} has no effect in model.\n{STRUCTURAL_MARKER}.\n"))
            .collect()
    }

    fn time_grid(request: &ExecutionRequest<'_>) -> Vec<f64> {
        let setup = request.setup;
        let steps = ((setup.stop_time() - setup.start_time()) / setup.output_interval()).round();
        (0..=steps as u64)
            .map(|i| setup.start_time() + i as f64 * setup.output_interval())
            .collect()
    }

    fn trajectories(
        &self,
        request: &ExecutionRequest<'_>,
        result_names: &[String],
    ) -> std::result::Result<Vec<Vec<Vec<f64>>>, String> {
        let time = Self::time_grid(request);
        let rows: Vec<&[f64]> = if request.setup.initial_values().is_empty() {
            vec![&[] as &[f64]]
        } else {
            request.setup.initial_values().iter().map(Vec::as_slice).collect()
        };
        let mut batch = Vec::with_capacity(rows.len());
        for row in rows {
            let offset: f64 = row.iter().sum();
            let mut trajectories = Vec::with_capacity(result_names.len());
            for name in result_names {
                if *name == self.capabilities.time_column {
                    trajectories.push(time.clone());
                } else if self.variables.iter().any(|v| v.name == *name) {
                    trajectories.push(time.iter().map(|t| t + offset).collect());
                } else {
                    return Err(format!("Error: variable {name} not found in model"));
                }
            }
            batch.push(trajectories);
        }
        Ok(batch)
    }

    fn write_artifacts(&self, stem: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        for file in self.capabilities.artifacts.files(stem) {
            fs::write(self.dir.join(&file), format!("scripted artifact {file}\n"))?;
        }
        Ok(())
    }
}

impl EngineAdapter for ScriptedEngine {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn capabilities(&self) -> EngineCapabilities {
        self.capabilities.clone()
    }

    fn working_dir(&self) -> &Path {
        &self.dir
    }

    fn open(&mut self) -> Result<()> {
        self.open = true;
        self.probe.lock().opens += 1;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn load_model(&mut self, model: &ModelIdentifier, _search_paths: &[PathBuf]) -> Result<()> {
        if !self.open {
            return Err(SimError::Connection("scripted engine is not open".to_owned()));
        }
        self.probe.lock().loads.push(model.to_string());
        if model.base() != self.model {
            self.last_log = format!("Error: model {} not found", model.base());
            return Err(SimError::ModelLoad {
                model: model.to_string(),
                log: self.last_log.clone(),
            });
        }
        if self.reject_modified && model.is_modified() {
            self.last_log = format!("Error: translation of {model} failed");
            return Err(SimError::ModelLoad {
                model: model.to_string(),
                log: self.last_log.clone(),
            });
        }
        self.loaded = Some(model.clone());
        Ok(())
    }

    fn variables(&mut self) -> Result<Vec<Variable>> {
        Ok(self.variables.clone())
    }

    fn execute(&mut self, request: &ExecutionRequest<'_>) -> Result<RawResult> {
        if self.loaded.is_none() {
            return Err(SimError::Execution {
                model: request.model.to_string(),
                log: "no model loaded".to_owned(),
            });
        }
        self.probe.lock().runs.push(RecordedRun {
            model: request.model.to_string(),
            initial_names: request.setup.initial_names().to_vec(),
            initial_values: request.setup.initial_values().to_vec(),
            output: request.output.clone(),
            show_eventlog: request.show_eventlog,
        });
        debug!(model = %request.model, "scripted run");

        let mut log = self.structural_warnings(request);
        let forced_failure = self.failures.pop_front();
        if let Some(failure) = &forced_failure {
            log.push_str(failure);
        }
        let mut success = forced_failure.is_none();

        let raw = match &request.output {
            OutputRequest::Artifacts { result_file } => {
                if success {
                    self.write_artifacts(result_file)?;
                }
                RawResult::Artifacts {
                    success,
                    location: self.dir.clone(),
                    result_file: result_file.clone(),
                }
            }
            OutputRequest::Trajectories { result_names, .. } => {
                let batch = match self.trajectories(request, result_names) {
                    Ok(batch) => batch,
                    Err(message) => {
                        log.push_str(&message);
                        success = false;
                        Vec::new()
                    }
                };
                RawResult::Trajectories {
                    success,
                    names: result_names.clone(),
                    batch,
                }
            }
        };
        self.last_log = log;
        Ok(raw)
    }

    fn last_error_log(&self) -> String {
        self.last_log.clone()
    }

    fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            self.loaded = None;
            self.probe.lock().closes += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use r_sim_core::{SetupOverrides, SimulationSetup};

    fn setup(value: serde_json::Value) -> SimulationSetup {
        let caps = scripted_capabilities();
        let overrides: SetupOverrides = serde_json::from_value(value).unwrap();
        SimulationSetup::new(&caps).apply(&overrides, &caps).unwrap()
    }

    #[test]
    fn structural_warning_only_without_modifier() {
        let engine = ScriptedEngine::new(".", "M").with_structural(&["n"]);
        let setup = setup(serde_json::json!({"initial_names": ["n"], "initial_values": [3]}));
        let plain = ModelIdentifier::new("M");
        let request = ExecutionRequest {
            model: &plain,
            setup: &setup,
            output: OutputRequest::Artifacts {
                result_file: "r".into(),
            },
            show_eventlog: false,
        };
        assert!(engine.structural_warnings(&request).contains("Setting n has no effect"));

        let modified = ModelIdentifier::new("M(n = 3)");
        let modified = ModelIdentifier::with_structural(modified.base(), &["n"], &["n".to_owned()], &[3.0]);
        let request = ExecutionRequest {
            model: &modified,
            ..request
        };
        assert!(engine.structural_warnings(&request).is_empty());
    }

    #[test]
    fn time_grid_includes_both_ends() {
        let setup = setup(serde_json::json!({"stop_time": 10, "output_interval": 2.5}));
        let model = ModelIdentifier::new("M");
        let request = ExecutionRequest {
            model: &model,
            setup: &setup,
            output: OutputRequest::Trajectories {
                result_names: vec![],
                number_of_intervals: Some(4),
            },
            show_eventlog: false,
        };
        assert_eq!(ScriptedEngine::time_grid(&request), [0.0, 2.5, 5.0, 7.5, 10.0]);
    }
}
