//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Construction of engines and simulation APIs from configuration."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use r_sim_common::{AppConfig, Backend, EngineConfig};
use r_sim_core::{EngineAdapter, Result, SimError, SimulationApi};
use tracing::debug;

use crate::packaged::PackagedUnitEngine;
use crate::process::{ProcessEngine, ProcessEngineConfig};

/// Build the backend selected by `config.backend`.
pub fn engine_from_config(config: &EngineConfig) -> Result<Box<dyn EngineAdapter>> {
    debug!(backend = %config.backend, "constructing engine");
    match config.backend {
        Backend::NativeProcess => {
            let executable = config.executable.clone().ok_or_else(|| {
                SimError::Connection("no engine executable configured".to_owned())
            })?;
            let process = ProcessEngineConfig {
                executable,
                args: config.args.clone(),
                working_dir: config.working_dir.clone(),
                show_window: config.show_window,
                equidistant_output: config.equidistant_output,
                startup_timeout: config.startup_timeout,
            };
            Ok(Box::new(ProcessEngine::new(process)?))
        }
        Backend::PackagedUnit => {
            let unit = config
                .unit
                .as_ref()
                .ok_or_else(|| SimError::Connection("no packaged unit configured".to_owned()))?;
            Ok(Box::new(PackagedUnitEngine::new(unit, &config.working_dir)?))
        }
    }
}

/// Build a ready [`SimulationApi`] for `config`.
pub fn api_from_config(config: &AppConfig) -> Result<SimulationApi> {
    let engine = engine_from_config(&config.engine)?;
    let mut builder = SimulationApi::builder(engine, config.engine.model.clone())
        .packages(config.engine.packages.clone())
        .restart_ceiling(config.lifecycle.restart_ceiling)
        .structural_parameters(config.structural.enabled)
        .max_rounds(config.structural.max_rounds)
        .setup(config.setup.clone());
    if config.lifecycle.placeholder && config.engine.backend == Backend::NativeProcess {
        builder = builder.placeholder(engine_from_config(&config.engine)?);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn packaged_unit_backend_is_selected() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::from_str(&format!(
            "[engine]\nbackend = \"packaged-unit\"\nunit = {:?}\nmodel = \"Zone\"\nworking_dir = {:?}\n",
            dir.path().join("Zone").display().to_string(),
            dir.path().join("work").display().to_string(),
        ))
        .unwrap();
        let engine = engine_from_config(&config.engine).unwrap();
        assert_eq!(engine.backend(), crate::packaged::BACKEND);
        assert!(!engine.is_open());
        assert_eq!(engine.capabilities().time_column, "time");
    }

    #[test]
    fn native_backend_does_not_spawn_before_open() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::from_str(&format!(
            "[engine]\nexecutable = \"/nonexistent/engine\"\nmodel = \"Zone\"\nworking_dir = {:?}\n",
            dir.path().display().to_string(),
        ))
        .unwrap();
        let mut engine = engine_from_config(&config.engine).unwrap();
        assert_eq!(engine.backend(), crate::process::BACKEND);
        assert!(matches!(engine.open(), Err(SimError::Connection(_))));
    }
}
