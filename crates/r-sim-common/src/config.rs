//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Application configuration for simulation orchestration."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{serde_as, DurationSeconds};
use strum::{Display, EnumString};
use tracing::debug;

use crate::logging::LogFormat;

fn default_working_dir() -> PathBuf {
    PathBuf::from("target/sim")
}

fn default_equidistant_output() -> bool {
    true
}

fn default_startup_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_restart_ceiling() -> i64 {
    -1
}

fn default_structural_enabled() -> bool {
    true
}

fn default_max_rounds() -> u32 {
    1
}

fn default_workers() -> usize {
    1
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

/// Primary configuration object for the R-SIM tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub engine: EngineConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub structural: StructuralConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    /// Overrides applied to the default simulation setup on start-up.
    #[serde(default)]
    pub setup: IndexMap<String, Value>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "R_SIM_CONFIG";

    /// Load configuration from disk, respecting the `R_SIM_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        if self.structural.max_rounds == 0 {
            return Err(anyhow!("structural.max_rounds must be at least 1"));
        }
        if self.pool.workers == 0 {
            return Err(anyhow!("pool.workers must be at least 1"));
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Execution backend selected by `[engine] backend`.
#[derive(
    Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Backend {
    #[default]
    NativeProcess,
    PackagedUnit,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub backend: Backend,
    /// Engine executable for the native process backend.
    #[serde(default)]
    pub executable: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Directory of a packaged model unit.
    #[serde(default)]
    pub unit: Option<PathBuf>,
    pub model: String,
    #[serde(default)]
    pub packages: Vec<PathBuf>,
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    #[serde(default)]
    pub show_window: bool,
    #[serde(default = "default_equidistant_output")]
    pub equidistant_output: bool,
    #[serde(default = "default_startup_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub startup_timeout: Duration,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(anyhow!("engine.model must name the model to simulate"));
        }
        match self.backend {
            Backend::NativeProcess if self.executable.is_none() => Err(anyhow!(
                "engine.executable is required for the {} backend",
                self.backend
            )),
            Backend::PackagedUnit if self.unit.is_none() => Err(anyhow!(
                "engine.unit is required for the {} backend",
                self.backend
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Runs between forced restarts; zero or below disables restarts.
    #[serde(default = "default_restart_ceiling")]
    pub restart_ceiling: i64,
    #[serde(default)]
    pub placeholder: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            restart_ceiling: default_restart_ceiling(),
            placeholder: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuralConfig {
    #[serde(default = "default_structural_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
}

impl Default for StructuralConfig {
    fn default() -> Self {
        Self {
            enabled: default_structural_enabled(),
            max_rounds: default_max_rounds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const MINIMAL: &str = r#"
        [engine]
        executable = "/opt/engine/bin/engine"
        model = "Building.Zone"
    "#;

    #[test]
    fn minimal_config_takes_defaults() {
        let config = AppConfig::from_str(MINIMAL).unwrap();
        assert_eq!(config.engine.backend, Backend::NativeProcess);
        assert_eq!(config.engine.working_dir, PathBuf::from("target/sim"));
        assert!(config.engine.equidistant_output);
        assert_eq!(config.engine.startup_timeout, Duration::from_secs(30));
        assert_eq!(config.lifecycle.restart_ceiling, -1);
        assert!(config.structural.enabled);
        assert_eq!(config.structural.max_rounds, 1);
        assert_eq!(config.pool.workers, 1);
        assert!(config.setup.is_empty());
        assert_eq!(config.logging.format, LogFormat::StructuredJson);
    }

    #[test]
    fn setup_section_keeps_key_order_and_types() {
        let config = AppConfig::from_str(&format!(
            "{MINIMAL}\n[setup]\nstop_time = 3600\noutput_interval = 60.0\nsolver = \"Dassl\"\n"
        ))
        .unwrap();
        let keys: Vec<&str> = config.setup.keys().map(String::as_str).collect();
        assert_eq!(keys, ["stop_time", "output_interval", "solver"]);
        assert_eq!(config.setup["stop_time"], serde_json::json!(3600));
        assert_eq!(config.setup["solver"], serde_json::json!("Dassl"));
    }

    #[test]
    fn packaged_unit_requires_unit_path() {
        let err = AppConfig::from_str(
            r#"
            [engine]
            backend = "packaged-unit"
            model = "Zone"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("engine.unit"));
    }

    #[test]
    fn zero_rounds_and_workers_are_rejected() {
        assert!(AppConfig::from_str(&format!("{MINIMAL}\n[structural]\nmax_rounds = 0\n")).is_err());
        assert!(AppConfig::from_str(&format!("{MINIMAL}\n[pool]\nworkers = 0\n")).is_err());
    }

    #[test]
    fn loads_first_existing_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r-sim.toml");
        fs::write(&path, MINIMAL).unwrap();
        let missing = dir.path().join("missing.toml");
        let loaded = AppConfig::load_with_source(&[missing, path.clone()]).unwrap();
        assert_eq!(loaded.source, path);
        assert_eq!(loaded.config.engine.model, "Building.Zone");
    }
}
