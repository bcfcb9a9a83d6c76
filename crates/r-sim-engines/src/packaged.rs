//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Backend running a self-contained packaged model unit."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
//! A packaged unit is a directory holding a `unit.json` manifest and an
//! entry executable. The unit is copied into the working directory on open
//! and the copy is removed on close. Each initial-value row runs the entry
//! once; it prints the trajectories as CSV with a header row on stdout.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command as ProcessCommand, Stdio};

use path_absolutize::Absolutize;
use r_sim_core::{
    EngineAdapter, EngineCapabilities, ExecutionRequest, ModelIdentifier, OutputRequest,
    RawResult, Result, SimError, ValidationError, Variable,
};
use serde::Deserialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const BACKEND: &str = "packaged-unit";
pub const MANIFEST_FILE: &str = "unit.json";

pub fn packaged_capabilities() -> EngineCapabilities {
    EngineCapabilities {
        allowed_solvers: vec!["CVode".to_owned(), "Euler".to_owned()],
        default_solver: "CVode".to_owned(),
        requires_interval_count: false,
        time_column: "time".to_owned(),
        extra_options: vec!["timeout".to_owned()],
        ..EngineCapabilities::default()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnitManifest {
    pub model: String,
    /// Entry executable, relative to the unit root.
    pub entry: PathBuf,
    #[serde(default)]
    pub variables: Vec<Variable>,
}

#[derive(Debug)]
pub struct PackagedUnitEngine {
    unit: PathBuf,
    working_dir: PathBuf,
    extracted: Option<PathBuf>,
    manifest: Option<UnitManifest>,
    last_log: String,
}

impl PackagedUnitEngine {
    pub fn new(unit: impl AsRef<Path>, working_dir: impl AsRef<Path>) -> Result<Self> {
        fs::create_dir_all(working_dir.as_ref())?;
        Ok(Self {
            unit: unit.as_ref().absolutize()?.into_owned(),
            working_dir: working_dir.as_ref().absolutize()?.into_owned(),
            extracted: None,
            manifest: None,
            last_log: String::new(),
        })
    }

    /// Directory the unit is copied to while open.
    pub fn extraction_dir(&self) -> PathBuf {
        let stem = self
            .unit
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unit".to_owned());
        self.working_dir.join(format!("{stem}_extracted"))
    }

    fn manifest(&self) -> Result<&UnitManifest> {
        self.manifest
            .as_ref()
            .ok_or_else(|| SimError::Connection("packaged unit is not open".to_owned()))
    }

    fn run_row(
        &self,
        entry: &Path,
        request: &ExecutionRequest<'_>,
        row: &[f64],
    ) -> Result<(bool, String, Vec<u8>)> {
        let setup = request.setup;
        let mut command = ProcessCommand::new(entry);
        command
            .current_dir(entry.parent().unwrap_or(&self.working_dir))
            .arg("--start")
            .arg(setup.start_time().to_string())
            .arg("--stop")
            .arg(setup.stop_time().to_string())
            .arg("--interval")
            .arg(setup.output_interval().to_string())
            .arg("--solver")
            .arg(setup.solver())
            .arg("--tolerance")
            .arg(setup.tolerance().to_string());
        if let Some(timeout) = setup.engine_option("timeout").and_then(|v| v.as_f64()) {
            command.arg("--timeout").arg(timeout.to_string());
        }
        for (name, value) in setup.initial_names().iter().zip(row) {
            command.arg("--set").arg(format!("{name}={value}"));
        }
        let output = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()?;
        let log = String::from_utf8_lossy(&output.stderr).into_owned();
        Ok((output.status.success(), log, output.stdout))
    }
}

#[derive(Debug, PartialEq)]
enum Columns {
    Found(Vec<Vec<f64>>),
    Missing(String),
}

/// Pick `names` out of a CSV document, in request order.
fn select_columns(csv_data: &[u8], names: &[String]) -> Result<Columns> {
    let mut reader = csv::Reader::from_reader(csv_data);
    let headers = reader.headers()?.clone();
    let mut indices = Vec::with_capacity(names.len());
    for name in names {
        match headers.iter().position(|h| h == name) {
            Some(idx) => indices.push(idx),
            None => {
                return Ok(Columns::Missing(format!(
                    "variable '{name}' is not part of the unit output"
                )))
            }
        }
    }
    let mut columns = vec![Vec::new(); names.len()];
    for record in reader.records() {
        let record = record?;
        for (column, idx) in columns.iter_mut().zip(&indices) {
            let field = record.get(*idx).unwrap_or_default();
            let value = field.trim().parse::<f64>().map_err(|err| {
                SimError::Protocol(format!("non-numeric output value {field:?}: {err}"))
            })?;
            column.push(value);
        }
    }
    Ok(Columns::Found(columns))
}

fn copy_tree(source: &Path, target: &Path) -> Result<()> {
    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry.map_err(|err| SimError::Connection(err.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|err| SimError::Connection(err.to_string()))?;
        let destination = target.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&destination)?;
        } else {
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &destination)?;
        }
    }
    Ok(())
}

impl EngineAdapter for PackagedUnitEngine {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn capabilities(&self) -> EngineCapabilities {
        packaged_capabilities()
    }

    fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    fn open(&mut self) -> Result<()> {
        if self.extracted.is_some() {
            return Ok(());
        }
        if !self.unit.is_dir() {
            return Err(SimError::Connection(format!(
                "packaged unit {} does not exist",
                self.unit.display()
            )));
        }
        let target = self.extraction_dir();
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        fs::create_dir_all(&target)?;
        copy_tree(&self.unit, &target)?;

        let manifest_path = target.join(MANIFEST_FILE);
        let raw = fs::read_to_string(&manifest_path).map_err(|err| {
            SimError::Connection(format!("cannot read {}: {err}", manifest_path.display()))
        })?;
        let manifest: UnitManifest = serde_json::from_str(&raw)?;
        info!(unit = %self.unit.display(), extracted = %target.display(), model = %manifest.model, "packaged unit extracted");
        self.manifest = Some(manifest);
        self.extracted = Some(target);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.extracted.is_some()
    }

    fn load_model(&mut self, model: &ModelIdentifier, _search_paths: &[PathBuf]) -> Result<()> {
        let manifest = self.manifest()?;
        if model.is_modified() {
            return Err(SimError::ModelLoad {
                model: model.to_string(),
                log: "packaged units are pre-compiled and cannot take structural modifiers"
                    .to_owned(),
            });
        }
        if model.base() != manifest.model {
            return Err(SimError::ModelLoad {
                model: model.to_string(),
                log: format!("unit provides model '{}'", manifest.model),
            });
        }
        Ok(())
    }

    fn variables(&mut self) -> Result<Vec<Variable>> {
        Ok(self.manifest()?.variables.clone())
    }

    fn execute(&mut self, request: &ExecutionRequest<'_>) -> Result<RawResult> {
        let OutputRequest::Trajectories { result_names, .. } = &request.output else {
            return Err(ValidationError::UnsupportedOption(vec![format!(
                "file-based results are not available from the {BACKEND} backend"
            )])
            .into());
        };
        let entry = match (&self.extracted, self.manifest()) {
            (Some(root), Ok(manifest)) => root.join(&manifest.entry),
            _ => return Err(SimError::Connection("packaged unit is not open".to_owned())),
        };

        let rows: Vec<&[f64]> = if request.setup.initial_values().is_empty() {
            vec![&[] as &[f64]]
        } else {
            request.setup.initial_values().iter().map(Vec::as_slice).collect()
        };

        let mut logs = Vec::new();
        let mut batch = Vec::with_capacity(rows.len());
        let mut success = true;
        for (idx, row) in rows.into_iter().enumerate() {
            debug!(row = idx, entry = %entry.display(), "running packaged unit");
            let (ok, log, stdout) = self.run_row(&entry, request, row)?;
            if !log.trim().is_empty() {
                logs.push(log);
            }
            if !ok {
                success = false;
                break;
            }
            match select_columns(&stdout, result_names)? {
                Columns::Found(columns) => batch.push(columns),
                Columns::Missing(missing) => {
                    logs.push(missing);
                    success = false;
                    break;
                }
            }
        }
        self.last_log = logs.join("\n");
        Ok(RawResult::Trajectories {
            success,
            names: result_names.clone(),
            batch,
        })
    }

    fn last_error_log(&self) -> String {
        self.last_log.clone()
    }

    fn close(&mut self) -> Result<()> {
        self.manifest = None;
        if let Some(extracted) = self.extracted.take() {
            if let Err(err) = fs::remove_dir_all(&extracted) {
                warn!(path = %extracted.display(), error = %err, "failed to remove extracted unit");
            } else {
                debug!(path = %extracted.display(), "extracted unit removed");
            }
        }
        Ok(())
    }
}

impl Drop for PackagedUnitEngine {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_columns_in_request_order() {
        let csv = b"time,x,y\n0,1,10\n1,2,20\n";
        let columns = select_columns(csv, &["y".into(), "time".into()]).unwrap();
        assert_eq!(
            columns,
            Columns::Found(vec![vec![10.0, 20.0], vec![0.0, 1.0]])
        );
    }

    #[test]
    fn unknown_column_is_reported_not_raised() {
        let csv = b"time,x\n0,1\n";
        let Columns::Missing(missing) = select_columns(csv, &["z".into()]).unwrap() else {
            panic!("expected a missing column");
        };
        assert!(missing.contains("'z'"));
    }

    #[test]
    fn extraction_dir_sits_under_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let engine = PackagedUnitEngine::new(dir.path().join("Zone.unit"), dir.path()).unwrap();
        assert_eq!(engine.extraction_dir(), engine.working_dir().join("Zone_extracted"));
    }

    #[test]
    fn open_fails_for_missing_unit() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = PackagedUnitEngine::new(dir.path().join("absent"), dir.path()).unwrap();
        assert!(matches!(engine.open(), Err(SimError::Connection(_))));
    }
}
