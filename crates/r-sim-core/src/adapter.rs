//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Capability contract implemented by every simulation backend."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};

use crate::errors::Result;
use crate::model_id::ModelIdentifier;
use crate::setup::{EngineCapabilities, SimulationSetup};
use crate::variables::Variable;

/// How the engine should hand back the outcome of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputRequest {
    /// Write the result, log and final-state files into the engine's working directory.
    Artifacts { result_file: String },
    /// Return trajectories for the named variables, sampled on `number_of_intervals` steps.
    Trajectories {
        result_names: Vec<String>,
        number_of_intervals: Option<u64>,
    },
}

/// Everything an engine needs to run one setup against the loaded model.
#[derive(Debug, Clone)]
pub struct ExecutionRequest<'a> {
    pub model: &'a ModelIdentifier,
    pub setup: &'a SimulationSetup,
    pub output: OutputRequest,
    pub show_eventlog: bool,
}

/// Raw engine output before reshaping.
///
/// `success == false` is a failed simulation, not a failed call: diagnostics
/// are available through [`EngineAdapter::last_error_log`].
#[derive(Debug, Clone, PartialEq)]
pub enum RawResult {
    Artifacts {
        success: bool,
        location: PathBuf,
        result_file: String,
    },
    /// `batch[row][name_idx]` holds the trajectory of `names[name_idx]` for one initial-value row.
    Trajectories {
        success: bool,
        names: Vec<String>,
        batch: Vec<Vec<Vec<f64>>>,
    },
}

impl RawResult {
    pub fn success(&self) -> bool {
        match self {
            RawResult::Artifacts { success, .. } | RawResult::Trajectories { success, .. } => {
                *success
            }
        }
    }
}

/// Execution backend driven by the orchestration layer.
///
/// Implementations hold one stateful connection and are not reentrant; the
/// caller serialises every call.
pub trait EngineAdapter: Send {
    /// Short backend label used in logs and configuration snapshots.
    fn backend(&self) -> &'static str;

    fn capabilities(&self) -> EngineCapabilities;

    /// Directory where the engine writes artifacts.
    fn working_dir(&self) -> &Path;

    /// Start or attach to the engine. Fails with `SimError::Connection`.
    fn open(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Load `model`, resolving packages from `search_paths`. Fails with `SimError::ModelLoad`.
    fn load_model(&mut self, model: &ModelIdentifier, search_paths: &[PathBuf]) -> Result<()>;

    /// Variables of the loaded model.
    fn variables(&mut self) -> Result<Vec<Variable>>;

    /// Run one setup to completion. Fails with `SimError::Execution` only when
    /// the engine could not be driven at all.
    fn execute(&mut self, request: &ExecutionRequest<'_>) -> Result<RawResult>;

    fn last_error_log(&self) -> String;

    /// Release the connection. Closing twice is a no-op.
    fn close(&mut self) -> Result<()>;
}

