//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Line-delimited JSON command channel to an engine process."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
//! One JSON object per line in each direction. Every command receives
//! exactly one reply of the form `{"ok": bool, "error": str?, "payload": any}`.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use r_sim_core::{ExecutionRequest, OutputRequest, Result, SimError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command<'a> {
    Open {
        working_dir: &'a Path,
        show_window: bool,
        equidistant_output: bool,
        startup_timeout_s: u64,
    },
    LoadModel {
        model: String,
        search_paths: &'a [PathBuf],
    },
    Variables,
    Simulate(SimulateCommand<'a>),
    LastErrorLog,
    Close,
}

/// Flattened view of one execution request.
#[derive(Debug, Clone, Serialize)]
pub struct SimulateCommand<'a> {
    pub model: String,
    pub start_time: f64,
    pub stop_time: f64,
    pub output_interval: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_of_intervals: Option<u64>,
    pub fixed_step_size: f64,
    pub solver: &'a str,
    pub tolerance: f64,
    pub initial_names: &'a [String],
    pub initial_values: &'a [Vec<f64>],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_names: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_file: Option<&'a str>,
    pub show_eventlog: bool,
    pub options: &'a IndexMap<String, Value>,
}

impl<'a> SimulateCommand<'a> {
    pub fn from_request(request: &'a ExecutionRequest<'a>) -> Self {
        let setup = request.setup;
        let (result_names, number_of_intervals, result_file) = match &request.output {
            OutputRequest::Artifacts { result_file } => (None, None, Some(result_file.as_str())),
            OutputRequest::Trajectories {
                result_names,
                number_of_intervals,
            } => (Some(result_names.as_slice()), *number_of_intervals, None),
        };
        Self {
            model: request.model.to_string(),
            start_time: setup.start_time(),
            stop_time: setup.stop_time(),
            output_interval: setup.output_interval(),
            number_of_intervals,
            fixed_step_size: setup.fixed_step_size(),
            solver: setup.solver(),
            tolerance: setup.tolerance(),
            initial_names: setup.initial_names(),
            initial_values: setup.initial_values(),
            result_names,
            result_file,
            show_eventlog: request.show_eventlog,
            options: setup.engine_options(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Reply {
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl Reply {
    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "engine reported failure without a message".to_owned())
    }

    pub fn payload<T: serde::de::DeserializeOwned>(self) -> Result<T> {
        Ok(serde_json::from_value(self.payload)?)
    }
}

/// Payload of a `simulate` reply. The default is a failed run without data.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SimulatePayload {
    pub success: bool,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub batch: Vec<Vec<Vec<f64>>>,
}

/// Request/reply channel over any buffered reader and writer pair.
#[derive(Debug)]
pub struct CommandChannel<R, W> {
    reader: R,
    writer: W,
    line: String,
}

impl<R: BufRead, W: Write> CommandChannel<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            line: String::new(),
        }
    }

    pub fn call(&mut self, command: &Command<'_>) -> Result<Reply> {
        let encoded = serde_json::to_string(command)?;
        trace!(command = %encoded, "engine command");
        self.writer.write_all(encoded.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;

        self.line.clear();
        if self.reader.read_line(&mut self.line)? == 0 {
            return Err(SimError::Protocol(
                "engine closed the channel before replying".to_owned(),
            ));
        }
        let reply: Reply = serde_json::from_str(self.line.trim_end()).map_err(|err| {
            SimError::Protocol(format!("malformed engine reply {:?}: {err}", self.line.trim_end()))
        })?;
        Ok(reply)
    }

    pub fn into_parts(self) -> (R, W) {
        (self.reader, self.writer)
    }
}
