//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Validated simulation setup and engine capability declarations."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ValidationError;

/// Flat key/value overrides accepted by [`SimulationSetup::apply`].
pub type SetupOverrides = IndexMap<String, Value>;

/// Keys every backend recognises.
pub const SETUP_KEYS: [&str; 9] = [
    "start_time",
    "stop_time",
    "output_interval",
    "fixed_step_size",
    "solver",
    "tolerance",
    "result_names",
    "initial_names",
    "initial_values",
];

const NUMERIC_KEYS: [&str; 5] = [
    "start_time",
    "stop_time",
    "output_interval",
    "fixed_step_size",
    "tolerance",
];

/// Fixed names of the files a file-based run leaves in the engine's working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLayout {
    pub result_extension: String,
    pub log_file: String,
    pub final_state_file: String,
}

impl ArtifactLayout {
    pub fn result_file(&self, stem: &str) -> String {
        format!("{}.{}", stem, self.result_extension)
    }

    /// Result data file, execution log and final-state file, in that order.
    pub fn files(&self, stem: &str) -> [String; 3] {
        [
            self.result_file(stem),
            self.log_file.clone(),
            self.final_state_file.clone(),
        ]
    }
}

impl Default for ArtifactLayout {
    fn default() -> Self {
        Self {
            result_extension: "mat".to_owned(),
            log_file: "dslog.txt".to_owned(),
            final_state_file: "dsfinal.txt".to_owned(),
        }
    }
}

/// What a backend declares about itself. Setup validation is checked against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineCapabilities {
    pub allowed_solvers: Vec<String>,
    pub default_solver: String,
    /// Named-result retrieval takes an interval count instead of an interval length.
    pub requires_interval_count: bool,
    /// Column promoted to the index of in-memory results.
    pub time_column: String,
    pub artifacts: ArtifactLayout,
    /// Backend-specific keys accepted on top of [`SETUP_KEYS`] and passed through untouched.
    pub extra_options: Vec<String>,
}

impl Default for EngineCapabilities {
    fn default() -> Self {
        Self {
            allowed_solvers: Vec::new(),
            default_solver: String::new(),
            requires_interval_count: false,
            time_column: "Time".to_owned(),
            artifacts: ArtifactLayout::default(),
            extra_options: Vec::new(),
        }
    }
}

impl EngineCapabilities {
    fn accepts_key(&self, key: &str) -> bool {
        SETUP_KEYS.contains(&key) || self.extra_options.iter().any(|k| k == key)
    }
}

/// One simulation run's configuration.
///
/// Instances only change through [`SimulationSetup::apply`], which validates
/// the complete result and hands back a replacement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationSetup {
    start_time: f64,
    stop_time: f64,
    output_interval: f64,
    fixed_step_size: f64,
    solver: String,
    tolerance: f64,
    result_names: Vec<String>,
    initial_names: Vec<String>,
    initial_values: Vec<Vec<f64>>,
    engine_options: IndexMap<String, Value>,
}

impl SimulationSetup {
    /// Fresh defaults for a backend.
    pub fn new(capabilities: &EngineCapabilities) -> Self {
        Self {
            start_time: 0.0,
            stop_time: 1.0,
            output_interval: 1.0,
            fixed_step_size: 0.0,
            solver: capabilities.default_solver.clone(),
            tolerance: 1e-4,
            result_names: Vec::new(),
            initial_names: Vec::new(),
            initial_values: Vec::new(),
            engine_options: IndexMap::new(),
        }
    }

    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    pub fn stop_time(&self) -> f64 {
        self.stop_time
    }

    pub fn output_interval(&self) -> f64 {
        self.output_interval
    }

    pub fn fixed_step_size(&self) -> f64 {
        self.fixed_step_size
    }

    pub fn solver(&self) -> &str {
        &self.solver
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn result_names(&self) -> &[String] {
        &self.result_names
    }

    pub fn initial_names(&self) -> &[String] {
        &self.initial_names
    }

    /// Batch of initial-value rows, one per parameter set.
    pub fn initial_values(&self) -> &[Vec<f64>] {
        &self.initial_values
    }

    pub fn engine_options(&self) -> &IndexMap<String, Value> {
        &self.engine_options
    }

    pub fn engine_option(&self, key: &str) -> Option<&Value> {
        self.engine_options.get(key)
    }

    /// Number of parameter sets in the batch; a setup without initial values runs once.
    pub fn batch_len(&self) -> usize {
        self.initial_values.len().max(1)
    }

    /// Interval count equivalent to `output_interval` over the time window.
    pub fn number_of_intervals(&self) -> Result<u64, ValidationError> {
        let intervals = (self.stop_time - self.start_time) / self.output_interval;
        let rounded = intervals.round();
        if !intervals.is_finite() || (intervals - rounded).abs() > 1e-9 * rounded.max(1.0) {
            return Err(ValidationError::NonIntegralInterval {
                start_time: self.start_time,
                stop_time: self.stop_time,
                output_interval: self.output_interval,
                intervals,
            });
        }
        Ok(rounded as u64)
    }

    /// Apply `overrides` on top of this setup and validate the result as a whole.
    ///
    /// Checks run in order: unknown keys, value types, interval divisibility
    /// for named-result retrieval, then the setup invariants. Flat
    /// `initial_values` lists become a single-row batch.
    pub fn apply(
        &self,
        overrides: &SetupOverrides,
        capabilities: &EngineCapabilities,
    ) -> Result<Self, ValidationError> {
        let unsupported: Vec<String> = overrides
            .keys()
            .filter(|key| !capabilities.accepts_key(key))
            .cloned()
            .collect();
        if !unsupported.is_empty() {
            return Err(ValidationError::UnsupportedOption(unsupported));
        }

        let mut next = self.clone();
        for (key, value) in overrides {
            match key.as_str() {
                k if NUMERIC_KEYS.contains(&k) => {
                    let number = expect_number(key, value)?;
                    match k {
                        "start_time" => next.start_time = number,
                        "stop_time" => next.stop_time = number,
                        "output_interval" => next.output_interval = number,
                        "fixed_step_size" => next.fixed_step_size = number,
                        _ => next.tolerance = number,
                    }
                }
                "solver" => {
                    let solver = value.as_str().ok_or_else(|| mismatch(key, "a string", value))?;
                    next.solver = if solver.is_empty() {
                        capabilities.default_solver.clone()
                    } else {
                        solver.to_owned()
                    };
                }
                "result_names" => next.result_names = expect_names(key, value)?,
                "initial_names" => next.initial_names = expect_names(key, value)?,
                "initial_values" => next.initial_values = normalize_initial_values(value)?,
                _ => {
                    next.engine_options.insert(key.clone(), value.clone());
                }
            }
        }

        let explicit_initials =
            overrides.contains_key("initial_values") || overrides.contains_key("initial_names");
        if capabilities.requires_interval_count
            && !next.result_names.is_empty()
            && !explicit_initials
        {
            next.number_of_intervals()?;
        }

        next.check_invariants(capabilities)?;
        Ok(next)
    }

    fn check_invariants(&self, capabilities: &EngineCapabilities) -> Result<(), ValidationError> {
        if self.start_time >= self.stop_time {
            return Err(ValidationError::InvalidTimeWindow {
                start_time: self.start_time,
                stop_time: self.stop_time,
            });
        }
        if self.output_interval <= 0.0 {
            return Err(ValidationError::TypeMismatch {
                key: "output_interval".to_owned(),
                expected: "a positive number",
                found: self.output_interval.to_string(),
            });
        }
        if !capabilities.allowed_solvers.is_empty()
            && !capabilities.allowed_solvers.contains(&self.solver)
        {
            return Err(ValidationError::UnsupportedSolver {
                solver: self.solver.clone(),
                allowed: capabilities.allowed_solvers.clone(),
            });
        }
        for (idx, row) in self.initial_values.iter().enumerate() {
            if row.len() != self.initial_names.len() {
                return Err(ValidationError::TypeMismatch {
                    key: "initial_values".to_owned(),
                    expected: "rows with one value per initial name",
                    found: format!(
                        "row {} with {} value(s) for {} name(s)",
                        idx,
                        row.len(),
                        self.initial_names.len()
                    ),
                });
            }
        }
        Ok(())
    }
}

fn mismatch(key: &str, expected: &'static str, value: &Value) -> ValidationError {
    ValidationError::TypeMismatch {
        key: key.to_owned(),
        expected,
        found: describe(value),
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_owned(),
        Value::Bool(b) => format!("boolean {b}"),
        Value::Number(n) => format!("number {n}"),
        Value::String(s) => format!("string {s:?}"),
        Value::Array(items) => format!("list of {} item(s)", items.len()),
        Value::Object(_) => "table".to_owned(),
    }
}

fn expect_number(key: &str, value: &Value) -> Result<f64, ValidationError> {
    value.as_f64().ok_or_else(|| mismatch(key, "a number", value))
}

fn expect_names(key: &str, value: &Value) -> Result<Vec<String>, ValidationError> {
    let items = value
        .as_array()
        .ok_or_else(|| mismatch(key, "a list of strings", value))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_owned)
                .ok_or_else(|| mismatch(key, "a list of strings", value))
        })
        .collect()
}

fn numeric_row(value: &Value) -> Option<Vec<f64>> {
    value.as_array()?.iter().map(Value::as_f64).collect()
}

/// A flat list is one parameter set; a list of lists is a batch.
fn normalize_initial_values(value: &Value) -> Result<Vec<Vec<f64>>, ValidationError> {
    const EXPECTED: &str = "a list of numbers or a list of number lists";
    let items = value
        .as_array()
        .ok_or_else(|| mismatch("initial_values", EXPECTED, value))?;
    if items.is_empty() {
        return Ok(Vec::new());
    }
    if items.iter().all(Value::is_number) {
        let row = numeric_row(value).ok_or_else(|| mismatch("initial_values", EXPECTED, value))?;
        return Ok(vec![row]);
    }
    items
        .iter()
        .map(|item| numeric_row(item).ok_or_else(|| mismatch("initial_values", EXPECTED, value)))
        .collect()
}
