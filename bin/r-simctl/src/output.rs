//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Result serialisation for the simulation control CLI."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use r_sim_core::{RunResult, TimeSeriesTable};
use tracing::info;

fn is_csv(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
}

/// `base` for the first table, `<stem>-<i>.csv` alongside it for batches.
fn table_paths(base: &Path, count: usize) -> Vec<PathBuf> {
    if count == 1 {
        return vec![base.to_path_buf()];
    }
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "result".to_owned());
    (0..count)
        .map(|idx| base.with_file_name(format!("{stem}-{idx}.csv")))
        .collect()
}

fn write_table(table: &TimeSeriesTable, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file =
        File::create(path).with_context(|| format!("unable to create {}", path.display()))?;
    table.write_csv(BufWriter::new(file))?;
    info!(path = %path.display(), rows = table.len(), "result table written");
    Ok(())
}

fn write_json<T: serde::Serialize>(value: &T, path: Option<&Path>) -> Result<()> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("unable to create {}", path.display()))?;
            serde_json::to_writer_pretty(BufWriter::new(file), value)?;
            info!(path = %path.display(), "result written");
        }
        None => {
            serde_json::to_writer_pretty(io::stdout().lock(), value)?;
            println!();
        }
    }
    Ok(())
}

pub fn write_result(result: &RunResult, path: Option<&Path>) -> Result<()> {
    match (result, path) {
        (RunResult::TimeSeries(tables), Some(path)) if is_csv(path) => {
            let tables = tables.clone().into_vec();
            for (table, target) in tables.iter().zip(table_paths(path, tables.len())) {
                write_table(table, &target)?;
            }
            Ok(())
        }
        (RunResult::SavedArtifactPath(saved), None) => {
            println!("{}", saved.display());
            Ok(())
        }
        _ => write_json(result, path),
    }
}

/// Time series go to `<dir>/run-<i>.csv`; last points to one JSON document keyed by run index.
pub fn write_batch(results: &[(usize, RunResult)], path: Option<&Path>) -> Result<()> {
    let all_tables = results
        .iter()
        .all(|(_, result)| matches!(result, RunResult::TimeSeries(_)));
    if let (true, Some(dir)) = (all_tables && !results.is_empty(), path) {
        for (idx, result) in results {
            if let RunResult::TimeSeries(tables) = result {
                for (row, table) in tables.clone().into_vec().iter().enumerate() {
                    let name = if row == 0 {
                        format!("run-{idx}.csv")
                    } else {
                        format!("run-{idx}-{row}.csv")
                    };
                    write_table(table, &dir.join(name))?;
                }
            }
        }
        return Ok(());
    }
    let keyed: IndexMap<String, &RunResult> = results
        .iter()
        .map(|(idx, result)| (idx.to_string(), result))
        .collect();
    write_json(&keyed, path)
}
