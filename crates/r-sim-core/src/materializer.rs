//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Reshaping of raw engine output into caller-facing results."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::{debug, info};

use crate::adapter::RawResult;
use crate::errors::{Result, SimError};
use crate::setup::{ArtifactLayout, EngineCapabilities};

/// Tag attached to tables produced from simulation output.
pub const SIMULATION_TAG: &str = "sim";

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReturnOption {
    #[default]
    TimeSeries,
    LastPoint,
    Savepath,
}

/// Time-indexed result table for one parameter set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeSeriesTable {
    tag: String,
    index_name: String,
    index: Vec<f64>,
    columns: IndexMap<String, Vec<f64>>,
}

impl TimeSeriesTable {
    pub fn new(index_name: impl Into<String>, index: Vec<f64>, tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            index_name: index_name.into(),
            index,
            columns: IndexMap::new(),
        }
    }

    /// Add a column; its length must match the index.
    pub fn insert_column(&mut self, name: impl Into<String>, values: Vec<f64>) -> Result<()> {
        let name = name.into();
        if values.len() != self.index.len() {
            return Err(SimError::Protocol(format!(
                "column '{}' has {} values for an index of {}",
                name,
                values.len(),
                self.index.len()
            )));
        }
        self.columns.insert(name, values);
        Ok(())
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn index(&self) -> &[f64] {
        &self.index
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn columns(&self) -> &IndexMap<String, Vec<f64>> {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    pub fn variable_names(&self) -> Vec<&str> {
        self.columns.keys().map(String::as_str).collect()
    }

    /// Final row as a name to value mapping.
    pub fn last_point(&self) -> IndexMap<String, f64> {
        self.columns
            .iter()
            .filter_map(|(name, values)| values.last().map(|v| (name.clone(), *v)))
            .collect()
    }

    /// Write the table as CSV with the index as first column.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut csv = csv::Writer::from_writer(writer);
        let mut header = vec![self.index_name.as_str()];
        header.extend(self.columns.keys().map(String::as_str));
        csv.write_record(&header)?;
        for (row, time) in self.index.iter().enumerate() {
            let mut record = vec![time.to_string()];
            record.extend(self.columns.values().map(|values| values[row].to_string()));
            csv.write_record(&record)?;
        }
        csv.flush()?;
        Ok(())
    }
}

/// One value per parameter set, or the bare value when a single set was squeezed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Batched<T> {
    Single(T),
    Many(Vec<T>),
}

impl<T> Batched<T> {
    pub fn from_vec(mut items: Vec<T>, squeeze: bool) -> Self {
        if squeeze && items.len() == 1 {
            if let Some(item) = items.pop() {
                return Batched::Single(item);
            }
        }
        Batched::Many(items)
    }

    pub fn len(&self) -> usize {
        match self {
            Batched::Single(_) => 1,
            Batched::Many(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn single(&self) -> Option<&T> {
        match self {
            Batched::Single(item) => Some(item),
            Batched::Many(_) => None,
        }
    }

    pub fn into_vec(self) -> Vec<T> {
        match self {
            Batched::Single(item) => vec![item],
            Batched::Many(items) => items,
        }
    }
}

/// Shaped outcome of one simulation call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunResult {
    TimeSeries(Batched<TimeSeriesTable>),
    LastPoint(Batched<IndexMap<String, f64>>),
    SavedArtifactPath(PathBuf),
}

impl RunResult {
    pub fn return_option(&self) -> ReturnOption {
        match self {
            RunResult::TimeSeries(_) => ReturnOption::TimeSeries,
            RunResult::LastPoint(_) => ReturnOption::LastPoint,
            RunResult::SavedArtifactPath(_) => ReturnOption::Savepath,
        }
    }

    pub fn into_time_series(self) -> Option<Batched<TimeSeriesTable>> {
        match self {
            RunResult::TimeSeries(tables) => Some(tables),
            _ => None,
        }
    }

    pub fn into_last_point(self) -> Option<Batched<IndexMap<String, f64>>> {
        match self {
            RunResult::LastPoint(points) => Some(points),
            _ => None,
        }
    }

    pub fn into_saved_path(self) -> Option<PathBuf> {
        match self {
            RunResult::SavedArtifactPath(path) => Some(path),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MaterializeOptions {
    pub return_option: ReturnOption,
    /// Destination directory for `savepath` returns. Artifacts stay in place when unset.
    pub savepath: Option<PathBuf>,
    pub squeeze: bool,
}

#[derive(Debug, Clone)]
pub struct ResultMaterializer {
    time_column: String,
    artifacts: ArtifactLayout,
}

impl ResultMaterializer {
    pub fn new(capabilities: &EngineCapabilities) -> Self {
        Self {
            time_column: capabilities.time_column.clone(),
            artifacts: capabilities.artifacts.clone(),
        }
    }

    pub fn time_column(&self) -> &str {
        &self.time_column
    }

    pub fn materialize(&self, raw: RawResult, options: &MaterializeOptions) -> Result<RunResult> {
        match (raw, options.return_option) {
            (
                RawResult::Artifacts {
                    location,
                    result_file,
                    ..
                },
                ReturnOption::Savepath,
            ) => {
                let path = self.relocate(&location, &result_file, options.savepath.as_deref())?;
                Ok(RunResult::SavedArtifactPath(path))
            }
            (RawResult::Trajectories { names, batch, .. }, ReturnOption::TimeSeries) => {
                let tables = self.tables(&names, batch)?;
                Ok(RunResult::TimeSeries(Batched::from_vec(tables, options.squeeze)))
            }
            (RawResult::Trajectories { names, batch, .. }, ReturnOption::LastPoint) => {
                let points = self
                    .tables(&names, batch)?
                    .iter()
                    .map(TimeSeriesTable::last_point)
                    .collect();
                Ok(RunResult::LastPoint(Batched::from_vec(points, options.squeeze)))
            }
            (raw, option) => Err(SimError::Protocol(format!(
                "engine returned {} output for return option '{}'",
                match raw {
                    RawResult::Artifacts { .. } => "file-based",
                    RawResult::Trajectories { .. } => "in-memory",
                },
                option
            ))),
        }
    }

    fn tables(&self, names: &[String], batch: Vec<Vec<Vec<f64>>>) -> Result<Vec<TimeSeriesTable>> {
        let time_idx = names
            .iter()
            .position(|n| *n == self.time_column)
            .ok_or_else(|| {
                SimError::Protocol(format!(
                    "time column '{}' missing from engine output",
                    self.time_column
                ))
            })?;
        batch
            .into_iter()
            .enumerate()
            .map(|(row, mut trajectories)| {
                if trajectories.len() != names.len() {
                    return Err(SimError::Protocol(format!(
                        "row {} carries {} trajectories for {} result names",
                        row,
                        trajectories.len(),
                        names.len()
                    )));
                }
                let index = std::mem::take(&mut trajectories[time_idx]);
                let mut table = TimeSeriesTable::new(&self.time_column, index, SIMULATION_TAG);
                for (idx, (name, values)) in names.iter().zip(trajectories).enumerate() {
                    if idx != time_idx {
                        table.insert_column(name.clone(), values)?;
                    }
                }
                Ok(table)
            })
            .collect()
    }

    /// Move the run's artifacts into `destination`, replacing same-named files.
    fn relocate(&self, location: &Path, stem: &str, destination: Option<&Path>) -> Result<PathBuf> {
        let files = self.artifacts.files(stem);
        for file in &files {
            let source = location.join(file);
            if !source.is_file() {
                return Err(SimError::MissingArtifact { path: source });
            }
        }
        let Some(destination) = destination else {
            return Ok(location.join(&files[0]));
        };
        fs::create_dir_all(destination)?;
        // `..` segments or symlinks can still name the working directory
        if fs::canonicalize(destination)? == fs::canonicalize(location)? {
            debug!(path = %location.display(), "savepath is the working directory; artifacts stay in place");
            return Ok(location.join(&files[0]));
        }
        for file in &files {
            let target = destination.join(file);
            if target.is_file() {
                debug!(path = %target.display(), "removing previous artifact");
                fs::remove_file(&target)?;
            }
            move_file(&location.join(file), &target)?;
        }
        let result = destination.join(&files[0]);
        info!(path = %result.display(), "simulation artifacts saved");
        Ok(result)
    }
}

fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    // rename fails across filesystems
    fs::copy(from, to)?;
    fs::remove_file(from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn materializer() -> ResultMaterializer {
        ResultMaterializer::new(&EngineCapabilities::default())
    }

    fn trajectories(rows: &[f64]) -> RawResult {
        RawResult::Trajectories {
            success: true,
            names: vec!["x".into(), "Time".into()],
            batch: rows
                .iter()
                .map(|offset| vec![vec![offset + 0.0, offset + 1.0, offset + 2.0], vec![0.0, 1.0, 2.0]])
                .collect(),
        }
    }

    fn options(return_option: ReturnOption, squeeze: bool) -> MaterializeOptions {
        MaterializeOptions {
            return_option,
            savepath: None,
            squeeze,
        }
    }

    #[test]
    fn single_row_squeezes_to_a_table() {
        let result = materializer()
            .materialize(trajectories(&[10.0]), &options(ReturnOption::TimeSeries, true))
            .unwrap();
        let tables = result.into_time_series().unwrap();
        let table = tables.single().expect("squeezed table");
        assert_eq!(table.index(), &[0.0, 1.0, 2.0]);
        assert_eq!(table.variable_names(), ["x"]);
        assert_eq!(table.column("x").unwrap(), &[10.0, 11.0, 12.0]);
        assert_eq!(table.tag(), SIMULATION_TAG);
    }

    #[test]
    fn single_row_without_squeeze_stays_a_collection() {
        let result = materializer()
            .materialize(trajectories(&[10.0]), &options(ReturnOption::TimeSeries, false))
            .unwrap();
        assert!(matches!(result, RunResult::TimeSeries(Batched::Many(ref t)) if t.len() == 1));
    }

    #[test]
    fn batches_preserve_input_order() {
        let result = materializer()
            .materialize(trajectories(&[10.0, 20.0]), &options(ReturnOption::TimeSeries, true))
            .unwrap();
        let tables = result.into_time_series().unwrap().into_vec();
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].column("x").unwrap()[0], 10.0);
        assert_eq!(tables[1].column("x").unwrap()[0], 20.0);
    }

    #[test]
    fn last_point_reduces_each_row() {
        let result = materializer()
            .materialize(trajectories(&[10.0, 20.0]), &options(ReturnOption::LastPoint, true))
            .unwrap();
        let points = result.into_last_point().unwrap().into_vec();
        assert_eq!(points[0]["x"], 12.0);
        assert_eq!(points[1]["x"], 22.0);
        assert!(!points[0].contains_key("Time"));
    }

    #[test]
    fn missing_time_column_is_a_protocol_error() {
        let raw = RawResult::Trajectories {
            success: true,
            names: vec!["x".into()],
            batch: vec![vec![vec![1.0]]],
        };
        let err = materializer()
            .materialize(raw, &options(ReturnOption::TimeSeries, true))
            .unwrap_err();
        assert!(matches!(err, SimError::Protocol(_)));
    }

    #[test]
    fn savepath_moves_artifacts_and_replaces_existing() -> anyhow::Result<()> {
        let work = tempdir()?;
        let dest = tempdir()?;
        for file in ["resultFile.mat", "dslog.txt", "dsfinal.txt"] {
            fs::write(work.path().join(file), file)?;
        }
        fs::write(dest.path().join("dslog.txt"), "stale")?;

        let raw = RawResult::Artifacts {
            success: true,
            location: work.path().to_path_buf(),
            result_file: "resultFile".into(),
        };
        let mut opts = options(ReturnOption::Savepath, true);
        opts.savepath = Some(dest.path().to_path_buf());
        let path = materializer().materialize(raw, &opts)?.into_saved_path().unwrap();

        assert_eq!(path, dest.path().join("resultFile.mat"));
        assert_eq!(fs::read_to_string(dest.path().join("dslog.txt"))?, "dslog.txt");
        assert!(!work.path().join("dsfinal.txt").exists());
        Ok(())
    }

    #[test]
    fn savepath_naming_the_working_dir_keeps_artifacts() -> anyhow::Result<()> {
        let root = tempdir()?;
        let work = root.path().join("wd");
        fs::create_dir_all(&work)?;
        for file in ["resultFile.mat", "dslog.txt", "dsfinal.txt"] {
            fs::write(work.join(file), file)?;
        }
        let raw = RawResult::Artifacts {
            success: true,
            location: work.clone(),
            result_file: "resultFile".into(),
        };
        let mut opts = options(ReturnOption::Savepath, true);
        opts.savepath = Some(work.join("..").join("wd"));
        let path = materializer().materialize(raw, &opts)?.into_saved_path().unwrap();

        assert_eq!(path, work.join("resultFile.mat"));
        for file in ["resultFile.mat", "dslog.txt", "dsfinal.txt"] {
            assert_eq!(fs::read_to_string(work.join(file))?, file);
        }
        Ok(())
    }

    #[test]
    fn savepath_without_artifacts_is_missing_artifact() -> anyhow::Result<()> {
        let work = tempdir()?;
        let dest = tempdir()?;
        fs::write(work.path().join("resultFile.mat"), "data")?;
        let raw = RawResult::Artifacts {
            success: true,
            location: work.path().to_path_buf(),
            result_file: "resultFile".into(),
        };
        let mut opts = options(ReturnOption::Savepath, true);
        opts.savepath = Some(dest.path().to_path_buf());
        let err = materializer().materialize(raw, &opts).unwrap_err();
        assert!(matches!(err, SimError::MissingArtifact { ref path } if path.ends_with("dslog.txt")));
        // nothing moved when one artifact is absent
        assert!(work.path().join("resultFile.mat").exists());
        Ok(())
    }

    #[test]
    fn table_writes_csv_with_index_first() -> anyhow::Result<()> {
        let mut table = TimeSeriesTable::new("Time", vec![0.0, 1.0], SIMULATION_TAG);
        table.insert_column("x", vec![1.5, 2.5])?;
        let mut out = Vec::new();
        table.write_csv(&mut out)?;
        assert_eq!(String::from_utf8(out)?, "Time,x\n0,1.5\n1,2.5\n");
        Ok(())
    }

    #[test]
    fn return_option_parses_snake_case() {
        assert_eq!("last_point".parse::<ReturnOption>().unwrap(), ReturnOption::LastPoint);
        assert_eq!(ReturnOption::Savepath.to_string(), "savepath");
    }
}
