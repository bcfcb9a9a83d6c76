//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Subcommands of the simulation control CLI."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, ValueEnum};
use indexmap::IndexMap;
use r_sim_common::AppConfig;
use r_sim_core::{ReturnOption, SetupOverrides, SimulateRequest, VariableKind, WorkerPool};
use r_sim_engines::api_from_config;
use serde_json::Value;
use tracing::{info, warn};

use crate::output;

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum ReturnArg {
    TimeSeries,
    LastPoint,
    Savepath,
}

impl From<ReturnArg> for ReturnOption {
    fn from(value: ReturnArg) -> Self {
        match value {
            ReturnArg::TimeSeries => ReturnOption::TimeSeries,
            ReturnArg::LastPoint => ReturnOption::LastPoint,
            ReturnArg::Savepath => ReturnOption::Savepath,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KindArg {
    Input,
    Output,
    Parameter,
    State,
}

impl From<KindArg> for VariableKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Input => VariableKind::Input,
            KindArg::Output => VariableKind::Output,
            KindArg::Parameter => VariableKind::Parameter,
            KindArg::State => VariableKind::State,
        }
    }
}

/// Parse `key=<json>`; values that are not valid JSON are taken as strings.
pub fn parse_setting(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing key in '{raw}'"));
    }
    let value = serde_json::from_str(value.trim())
        .unwrap_or_else(|_| Value::String(value.trim().to_owned()));
    Ok((key.to_owned(), value))
}

/// Parse `name=<number>`.
pub fn parse_parameter(raw: &str) -> Result<(String, f64), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))?;
    let value = value
        .trim()
        .parse::<f64>()
        .map_err(|err| format!("invalid value for '{}': {err}", name.trim()))?;
    Ok((name.trim().to_owned(), value))
}

#[derive(Debug, Args)]
pub struct RunCommand {
    /// Setup override, repeatable: key=<json>.
    #[arg(long = "set", value_name = "KEY=JSON", value_parser = parse_setting)]
    settings: Vec<(String, Value)>,

    /// Parameter value for this run, repeatable: name=value.
    #[arg(long = "param", value_name = "NAME=VALUE", value_parser = parse_parameter)]
    parameters: Vec<(String, f64)>,

    #[arg(long = "return", value_enum, default_value_t = ReturnArg::TimeSeries)]
    return_option: ReturnArg,

    /// Destination directory for savepath returns.
    #[arg(long, value_name = "DIR")]
    savepath: Option<PathBuf>,

    #[arg(long = "result-file", value_name = "NAME", default_value = "resultFile")]
    result_file_name: String,

    /// Write results here; `.csv` writes tables, anything else JSON. Defaults to stdout JSON.
    #[arg(long, short = 'o', value_name = "FILE")]
    output: Option<PathBuf>,

    /// Keep the batch dimension even for a single parameter set.
    #[arg(long = "no-squeeze", action = clap::ArgAction::SetTrue)]
    no_squeeze: bool,

    #[arg(long = "show-eventlog", action = clap::ArgAction::SetTrue)]
    show_eventlog: bool,
}

impl RunCommand {
    pub fn execute(self, config: &AppConfig) -> Result<()> {
        let mut api = api_from_config(config).context("failed to initialise simulation api")?;
        if !self.settings.is_empty() {
            let overrides: SetupOverrides = self.settings.into_iter().collect();
            api.set_sim_setup(&overrides)
                .context("invalid simulation setup override")?;
        }
        let request = SimulateRequest {
            parameters: self.parameters.into_iter().collect(),
            return_option: self.return_option.into(),
            savepath: self.savepath,
            result_file_name: self.result_file_name,
            squeeze: !self.no_squeeze,
            show_eventlog: self.show_eventlog,
        };
        let result = api.simulate(request);
        if let Err(err) = api.close() {
            warn!(error = %err, "engine did not close cleanly");
        }
        let result = result.context("simulation failed")?;
        output::write_result(&result, self.output.as_deref())
    }
}

#[derive(Debug, Args)]
pub struct VariablesCommand {
    /// Only list one kind of variable.
    #[arg(long, value_enum)]
    kind: Option<KindArg>,

    /// Emit JSON instead of a plain listing.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    json: bool,
}

impl VariablesCommand {
    pub fn execute(self, config: &AppConfig) -> Result<()> {
        let mut api = api_from_config(config).context("failed to initialise simulation api")?;
        let kinds: Vec<VariableKind> = match self.kind {
            Some(kind) => vec![kind.into()],
            None => vec![
                VariableKind::Input,
                VariableKind::Output,
                VariableKind::Parameter,
                VariableKind::State,
            ],
        };
        let mut listing = IndexMap::new();
        for kind in kinds {
            let variables: Vec<_> = api.registry().partition(kind).values().cloned().collect();
            listing.insert(kind.to_string(), variables);
        }
        api.close()?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&listing)?);
            return Ok(());
        }
        for (kind, variables) in &listing {
            println!("{kind} ({})", variables.len());
            for variable in variables {
                println!(
                    "  {:<32} default={} range=[{}, {}]",
                    variable.name, variable.default_value, variable.min, variable.max
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct BatchCommand {
    /// CSV file: header row with parameter names, one parameter set per row.
    #[arg(long, value_name = "FILE")]
    parameters: PathBuf,

    /// Setup override applied on every worker, repeatable: key=<json>.
    #[arg(long = "set", value_name = "KEY=JSON", value_parser = parse_setting)]
    settings: Vec<(String, Value)>,

    #[arg(long = "return", value_enum, default_value_t = ReturnArg::LastPoint)]
    return_option: ReturnArg,

    /// Number of workers; defaults to the configured pool size.
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Output directory for per-run tables, or a JSON file for last points.
    #[arg(long, short = 'o', value_name = "PATH")]
    output: Option<PathBuf>,
}

pub fn read_parameter_sets(path: &Path) -> Result<Vec<IndexMap<String, f64>>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("unable to open parameter file {}", path.display()))?;
    let names: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_owned()).collect();
    let mut sets = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let mut set = IndexMap::with_capacity(names.len());
        for (name, field) in names.iter().zip(record.iter()) {
            let value = field.trim().parse::<f64>().with_context(|| {
                format!("row {}: '{}' is not a number for {}", line + 1, field, name)
            })?;
            set.insert(name.clone(), value);
        }
        sets.push(set);
    }
    Ok(sets)
}

impl BatchCommand {
    pub fn execute(self, config: &AppConfig) -> Result<()> {
        if self.return_option == ReturnArg::Savepath {
            return Err(anyhow!("batch runs return time-series or last-point results"));
        }
        let sets = read_parameter_sets(&self.parameters)?;
        if sets.is_empty() {
            return Err(anyhow!("{} holds no parameter sets", self.parameters.display()));
        }
        let workers = self.workers.unwrap_or(config.pool.workers).min(sets.len());
        let overrides: SetupOverrides = self.settings.into_iter().collect();

        let pool = WorkerPool::new(workers, |idx| {
            let mut worker_config = config.clone();
            worker_config.engine.working_dir =
                config.engine.working_dir.join(format!("worker-{idx}"));
            let mut api = api_from_config(&worker_config)?;
            if !overrides.is_empty() {
                api.set_sim_setup(&overrides)?;
            }
            Ok(api)
        })
        .context("failed to start worker pool")?;
        info!(workers, runs = sets.len(), "running batch");

        let requests = sets
            .into_iter()
            .map(|parameters| SimulateRequest {
                parameters,
                return_option: self.return_option.into(),
                ..SimulateRequest::default()
            })
            .collect();
        let results = pool.map(requests);
        pool.shutdown()?;

        let mut failures = 0;
        let mut succeeded = Vec::with_capacity(results.len());
        for (idx, result) in results.into_iter().enumerate() {
            match result {
                Ok(result) => succeeded.push((idx, result)),
                Err(err) => {
                    failures += 1;
                    warn!(run = idx, error = %err, "batch run failed");
                }
            }
        }
        output::write_batch(&succeeded, self.output.as_deref())?;
        if failures > 0 {
            return Err(anyhow!("{failures} batch run(s) failed"));
        }
        Ok(())
    }
}
