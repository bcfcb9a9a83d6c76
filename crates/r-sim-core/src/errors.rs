//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Error taxonomy for simulation orchestration."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SimError>;

/// Failures raised while checking a simulation setup. These never reach an engine.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("unsupported simulation option(s): {}", .0.join(", "))]
    UnsupportedOption(Vec<String>),
    #[error("option '{key}' expects {expected} but got {found}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: String,
    },
    #[error(
        "output_interval {output_interval} does not evenly divide [{start_time}, {stop_time}] \
         ({intervals} intervals); use an output_interval that yields an integral interval count"
    )]
    NonIntegralInterval {
        start_time: f64,
        stop_time: f64,
        output_interval: f64,
        intervals: f64,
    },
    #[error("solver '{solver}' is not supported, expected one of: {}", .allowed.join(", "))]
    UnsupportedSolver { solver: String, allowed: Vec<String> },
    #[error("start_time {start_time} must be smaller than stop_time {stop_time}")]
    InvalidTimeWindow { start_time: f64, stop_time: f64 },
}

#[derive(Debug, Error)]
pub enum SimError {
    #[error("engine connection failed: {0}")]
    Connection(String),
    #[error("model '{model}' could not be loaded: {log}")]
    ModelLoad { model: String, log: String },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("simulation of '{model}' failed; last engine log:\n{log}")]
    Execution { model: String, log: String },
    #[error("engine reported success but artifact {} is missing", .path.display())]
    MissingArtifact { path: PathBuf },
    #[error("engine protocol error: {0}")]
    Protocol(String),
    #[error("worker pool error: {0}")]
    Pool(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

impl SimError {
    /// Whether the failure happened before any engine interaction.
    pub fn is_validation(&self) -> bool {
        matches!(self, SimError::Validation(_))
    }
}
