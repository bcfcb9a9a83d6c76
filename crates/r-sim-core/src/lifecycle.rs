//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Engine connection lifetime and periodic restart policy."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::adapter::EngineAdapter;
use crate::errors::Result;
use crate::model_id::ModelIdentifier;

/// Owns the engine connection for one orchestrator.
///
/// Native engines grow their memory footprint over many translate/simulate
/// cycles, so the connection is closed and reopened after `restart_ceiling`
/// runs. A ceiling of zero or below disables restarts. An optional
/// placeholder connection stays open across restarts to keep the licence
/// checked out. Both connections are closed when the manager is dropped.
pub struct LifecycleManager {
    engine: Box<dyn EngineAdapter>,
    placeholder: Option<Box<dyn EngineAdapter>>,
    restart_ceiling: i64,
    run_count: i64,
    restarts: u64,
    model: Option<ModelIdentifier>,
    search_paths: Vec<PathBuf>,
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("backend", &self.engine.backend())
            .field("open", &self.engine.is_open())
            .field("placeholder", &self.placeholder.is_some())
            .field("restart_ceiling", &self.restart_ceiling)
            .field("run_count", &self.run_count)
            .field("model", &self.model)
            .finish()
    }
}

impl LifecycleManager {
    pub fn new(engine: Box<dyn EngineAdapter>, restart_ceiling: i64) -> Self {
        Self {
            engine,
            placeholder: None,
            restart_ceiling,
            run_count: 0,
            restarts: 0,
            model: None,
            search_paths: Vec::new(),
        }
    }

    /// Hold `placeholder` open for the manager's lifetime. Only used when restarts are enabled.
    pub fn with_placeholder(mut self, placeholder: Box<dyn EngineAdapter>) -> Self {
        self.placeholder = Some(placeholder);
        self
    }

    pub fn with_search_paths(mut self, search_paths: Vec<PathBuf>) -> Self {
        self.search_paths = search_paths;
        self
    }

    pub fn engine(&self) -> &dyn EngineAdapter {
        self.engine.as_ref()
    }

    pub fn engine_mut(&mut self) -> &mut dyn EngineAdapter {
        self.engine.as_mut()
    }

    pub fn run_count(&self) -> i64 {
        self.run_count
    }

    pub fn restart_ceiling(&self) -> i64 {
        self.restart_ceiling
    }

    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    pub fn model(&self) -> Option<&ModelIdentifier> {
        self.model.as_ref()
    }

    pub fn has_placeholder(&self) -> bool {
        self.placeholder.as_ref().is_some_and(|p| p.is_open())
    }

    /// Open the connection once, reloading the current model if one is set.
    pub fn ensure_open(&mut self) -> Result<()> {
        self.connect(true)
    }

    fn connect(&mut self, reload_model: bool) -> Result<()> {
        if self.restart_ceiling > 0 {
            if let Some(placeholder) = self.placeholder.as_mut() {
                if !placeholder.is_open() {
                    info!(
                        backend = placeholder.backend(),
                        "opening placeholder connection to hold the licence across restarts"
                    );
                    placeholder.open()?;
                }
            }
        }
        if self.engine.is_open() {
            return Ok(());
        }
        debug!(backend = self.engine.backend(), "opening engine connection");
        self.engine.open()?;
        if let Some(model) = self.model.as_ref().filter(|_| reload_model) {
            self.engine.load_model(model, &self.search_paths)?;
        }
        Ok(())
    }

    /// Load `model` and remember it for reloads after restarts.
    pub fn load_model(&mut self, model: ModelIdentifier) -> Result<()> {
        let reopened = !self.engine.is_open();
        self.connect(false)?;
        if let Err(err) = self.engine.load_model(&model, &self.search_paths) {
            // a fresh connection holds no model yet; keep the previous one usable
            if let Some(previous) = self.model.as_ref().filter(|_| reopened) {
                if let Err(reload) = self.engine.load_model(previous, &self.search_paths) {
                    warn!(model = %previous, error = %reload, "failed to restore previous model");
                }
            }
            return Err(err);
        }
        self.model = Some(model);
        Ok(())
    }

    /// Account for the next run. Returns `true` when the connection was restarted.
    pub fn before_run(&mut self) -> Result<bool> {
        self.ensure_open()?;
        if self.restart_ceiling > 0 && self.run_count == self.restart_ceiling {
            info!(
                backend = self.engine.backend(),
                runs = self.run_count,
                "closing and restarting engine to free memory"
            );
            self.restart()?;
            self.run_count = 0;
            return Ok(true);
        }
        self.run_count += 1;
        Ok(false)
    }

    fn restart(&mut self) -> Result<()> {
        self.engine.close()?;
        self.engine.open()?;
        if let Some(model) = &self.model {
            self.engine.load_model(model, &self.search_paths)?;
        }
        self.restarts += 1;
        Ok(())
    }

    /// Close the primary connection; the placeholder stays open.
    pub fn close(&mut self) -> Result<()> {
        if self.engine.is_open() {
            info!(backend = self.engine.backend(), "closing engine connection");
        }
        self.engine.close()
    }

    /// Close every connection held by the manager.
    pub fn shutdown(&mut self) -> Result<()> {
        let primary = self.close();
        if let Some(placeholder) = self.placeholder.as_mut() {
            if placeholder.is_open() {
                info!(backend = placeholder.backend(), "closing placeholder connection");
            }
            placeholder.close()?;
        }
        primary
    }
}

impl Drop for LifecycleManager {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "failed to close engine connection on teardown");
        }
    }
}
