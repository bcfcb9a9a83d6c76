//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Backend driving a long-lived native engine process."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command as ProcessCommand, Stdio};
use std::time::Duration;

use path_absolutize::Absolutize;
use r_sim_core::{
    EngineAdapter, EngineCapabilities, ExecutionRequest, ModelIdentifier, OutputRequest,
    RawResult, Result, SimError, Variable,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::protocol::{Command, CommandChannel, Reply, SimulateCommand, SimulatePayload};

pub const BACKEND: &str = "native-process";

/// Integrators the native engine accepts.
pub const NATIVE_SOLVERS: [&str; 17] = [
    "Dassl", "Euler", "Cerk23", "Cerk34", "Cerk45", "Esdirk23a", "Esdirk34a", "Esdirk45a",
    "Cvode", "Rkfix2", "Rkfix3", "Rkfix4", "Lsodar", "Radau", "Dopri45", "Dopri853",
    "Sdirk34hw",
];

pub fn native_capabilities() -> EngineCapabilities {
    EngineCapabilities {
        allowed_solvers: NATIVE_SOLVERS.iter().map(|s| (*s).to_owned()).collect(),
        default_solver: "Dassl".to_owned(),
        requires_interval_count: true,
        ..EngineCapabilities::default()
    }
}

#[derive(Debug, Clone)]
pub struct ProcessEngineConfig {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub show_window: bool,
    /// Ask the engine for equidistant output so every run yields the same row count.
    pub equidistant_output: bool,
    pub startup_timeout: Duration,
}

impl ProcessEngineConfig {
    pub fn new(executable: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            show_window: false,
            equidistant_output: true,
            startup_timeout: Duration::from_secs(30),
        }
    }
}

struct Session {
    child: Child,
    channel: CommandChannel<BufReader<ChildStdout>, ChildStdin>,
}

/// Engine reached through a child process speaking the JSON-lines protocol.
pub struct ProcessEngine {
    config: ProcessEngineConfig,
    working_dir: PathBuf,
    session: Option<Session>,
    last_log: String,
}

impl std::fmt::Debug for ProcessEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessEngine")
            .field("executable", &self.config.executable)
            .field("working_dir", &self.working_dir)
            .field("open", &self.session.is_some())
            .finish()
    }
}

impl ProcessEngine {
    /// Create the working directory and resolve it to an absolute path. The
    /// process itself starts on [`EngineAdapter::open`].
    pub fn new(config: ProcessEngineConfig) -> Result<Self> {
        fs::create_dir_all(&config.working_dir)?;
        let working_dir = config.working_dir.absolutize()?.into_owned();
        Ok(Self {
            config,
            working_dir,
            session: None,
            last_log: String::new(),
        })
    }

    fn call(&mut self, command: &Command<'_>) -> Result<Reply> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| SimError::Connection("engine connection is not open".to_owned()))?;
        session.channel.call(command)
    }

    fn refresh_log(&mut self) -> Result<()> {
        let reply = self.call(&Command::LastErrorLog)?;
        self.last_log = match reply.payload {
            Value::String(log) => log,
            Value::Null => String::new(),
            other => other.to_string(),
        };
        Ok(())
    }

    fn kill(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(err) = session.child.kill() {
                debug!(error = %err, "engine process already exited");
            }
            let _ = session.child.wait();
        }
    }
}

impl EngineAdapter for ProcessEngine {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn capabilities(&self) -> EngineCapabilities {
        native_capabilities()
    }

    fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    fn open(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let mut child = ProcessCommand::new(&self.config.executable)
            .args(&self.config.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| {
                SimError::Connection(format!(
                    "failed to start engine {}: {err}",
                    self.config.executable.display()
                ))
            })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(SimError::Connection("engine process has no stdio pipes".to_owned()));
        };
        self.session = Some(Session {
            child,
            channel: CommandChannel::new(BufReader::new(stdout), stdin),
        });

        let working_dir = self.working_dir.clone();
        let reply = self.call(&Command::Open {
            working_dir: &working_dir,
            show_window: self.config.show_window,
            equidistant_output: self.config.equidistant_output,
            startup_timeout_s: self.config.startup_timeout.as_secs(),
        });
        match reply {
            Ok(reply) if reply.ok => {
                info!(
                    executable = %self.config.executable.display(),
                    working_dir = %self.working_dir.display(),
                    "engine process started"
                );
                Ok(())
            }
            Ok(reply) => {
                self.kill();
                Err(SimError::Connection(reply.error_message()))
            }
            Err(err) => {
                self.kill();
                Err(SimError::Connection(err.to_string()))
            }
        }
    }

    fn is_open(&self) -> bool {
        self.session.is_some()
    }

    fn load_model(&mut self, model: &ModelIdentifier, search_paths: &[PathBuf]) -> Result<()> {
        let reply = self.call(&Command::LoadModel {
            model: model.to_string(),
            search_paths,
        })?;
        if reply.ok {
            debug!(model = %model, "model loaded");
            return Ok(());
        }
        self.refresh_log()?;
        let mut log = reply.error_message();
        if !self.last_log.is_empty() {
            log.push('\n');
            log.push_str(&self.last_log);
        }
        Err(SimError::ModelLoad {
            model: model.to_string(),
            log,
        })
    }

    fn variables(&mut self) -> Result<Vec<Variable>> {
        let reply = self.call(&Command::Variables)?;
        if !reply.ok {
            return Err(SimError::Protocol(reply.error_message()));
        }
        reply.payload()
    }

    fn execute(&mut self, request: &ExecutionRequest<'_>) -> Result<RawResult> {
        let reply = self.call(&Command::Simulate(SimulateCommand::from_request(request)))?;
        self.refresh_log()?;
        let payload: SimulatePayload = if reply.ok {
            reply.payload()?
        } else {
            // reported as a failed run so the caller sees the engine log
            let mut log = reply.error_message();
            if !self.last_log.is_empty() {
                log.push('\n');
                log.push_str(&self.last_log);
            }
            warn!(model = %request.model, error = %reply.error_message(), "engine rejected the simulate command");
            self.last_log = log;
            SimulatePayload::default()
        };
        Ok(match &request.output {
            OutputRequest::Artifacts { result_file } => RawResult::Artifacts {
                success: payload.success,
                location: self.working_dir.clone(),
                result_file: result_file.clone(),
            },
            OutputRequest::Trajectories { result_names, .. } => RawResult::Trajectories {
                success: payload.success,
                names: if payload.names.is_empty() {
                    result_names.clone()
                } else {
                    payload.names
                },
                batch: payload.batch,
            },
        })
    }

    fn last_error_log(&self) -> String {
        self.last_log.clone()
    }

    fn close(&mut self) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        if let Err(err) = session.channel.call(&Command::Close) {
            warn!(error = %err, "engine did not acknowledge close");
            self.kill();
            return Ok(());
        }
        if let Some(session) = self.session.take() {
            let Session { mut child, channel } = session;
            drop(channel);
            child.wait()?;
        }
        info!(executable = %self.config.executable.display(), "engine process stopped");
        Ok(())
    }
}

impl Drop for ProcessEngine {
    fn drop(&mut self) {
        self.kill();
    }
}
