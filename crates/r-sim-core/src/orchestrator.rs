//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Simulation API facade composing registry, lifecycle and result shaping."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::adapter::{EngineAdapter, ExecutionRequest, OutputRequest, RawResult};
use crate::errors::{Result, SimError, ValidationError};
use crate::lifecycle::LifecycleManager;
use crate::materializer::{MaterializeOptions, ResultMaterializer, ReturnOption, RunResult};
use crate::model_id::ModelIdentifier;
use crate::resolver::{DiagnosticParser, ResolutionPlan, StructuralParameterResolver};
use crate::setup::{EngineCapabilities, SetupOverrides, SimulationSetup};
use crate::variables::VariableRegistry;

pub const DEFAULT_RESULT_FILE: &str = "resultFile";

/// Per-call options for [`SimulationApi::simulate`].
#[derive(Debug, Clone)]
pub struct SimulateRequest {
    /// Parameter values for this call, merged into the setup as one initial-value row.
    pub parameters: IndexMap<String, f64>,
    pub return_option: ReturnOption,
    /// Destination directory for `savepath` returns.
    pub savepath: Option<PathBuf>,
    pub result_file_name: String,
    /// Return a bare table or mapping when the batch has one row.
    pub squeeze: bool,
    pub show_eventlog: bool,
}

impl Default for SimulateRequest {
    fn default() -> Self {
        Self {
            parameters: IndexMap::new(),
            return_option: ReturnOption::TimeSeries,
            savepath: None,
            result_file_name: DEFAULT_RESULT_FILE.to_owned(),
            squeeze: true,
            show_eventlog: false,
        }
    }
}

impl SimulateRequest {
    pub fn new(return_option: ReturnOption) -> Self {
        Self {
            return_option,
            ..Self::default()
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: f64) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    pub fn with_savepath(mut self, savepath: impl Into<PathBuf>) -> Self {
        self.savepath = Some(savepath.into());
        self
    }

    pub fn with_squeeze(mut self, squeeze: bool) -> Self {
        self.squeeze = squeeze;
        self
    }
}

/// Serialisable description of an API instance, sufficient to rebuild it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiSnapshot {
    pub backend: String,
    pub model: String,
    pub working_dir: PathBuf,
    pub packages: Vec<PathBuf>,
    pub restart_ceiling: i64,
    pub structural_parameters: bool,
    pub max_rounds: u32,
    pub setup: SimulationSetup,
}

pub struct SimulationApiBuilder {
    engine: Box<dyn EngineAdapter>,
    placeholder: Option<Box<dyn EngineAdapter>>,
    model: String,
    packages: Vec<PathBuf>,
    restart_ceiling: i64,
    structural_parameters: bool,
    max_rounds: u32,
    parser: Option<Box<dyn DiagnosticParser>>,
    setup: SetupOverrides,
}

impl SimulationApiBuilder {
    /// Model search paths handed to the engine on every load.
    pub fn packages(mut self, packages: Vec<PathBuf>) -> Self {
        self.packages = packages;
        self
    }

    pub fn restart_ceiling(mut self, ceiling: i64) -> Self {
        self.restart_ceiling = ceiling;
        self
    }

    pub fn placeholder(mut self, placeholder: Box<dyn EngineAdapter>) -> Self {
        self.placeholder = Some(placeholder);
        self
    }

    /// Toggle detection of structural parameters in engine diagnostics.
    pub fn structural_parameters(mut self, enabled: bool) -> Self {
        self.structural_parameters = enabled;
        self
    }

    pub fn max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = rounds;
        self
    }

    pub fn diagnostic_parser(mut self, parser: Box<dyn DiagnosticParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    /// Overrides applied to the default setup during `build`.
    pub fn setup(mut self, overrides: SetupOverrides) -> Self {
        self.setup = overrides;
        self
    }

    /// Open the engine, load the model and introspect its variables.
    pub fn build(self) -> Result<SimulationApi> {
        let capabilities = self.engine.capabilities();
        let backend = self.engine.backend();
        let working_dir = self.engine.working_dir().to_path_buf();
        info!(backend, model = %self.model, working_dir = %working_dir.display(), "initialising simulation api");

        let mut lifecycle = LifecycleManager::new(self.engine, self.restart_ceiling)
            .with_search_paths(self.packages);
        if let Some(placeholder) = self.placeholder {
            lifecycle = lifecycle.with_placeholder(placeholder);
        }
        let model = ModelIdentifier::new(&self.model);
        lifecycle.load_model(model.clone())?;
        let registry = VariableRegistry::load(lifecycle.engine_mut(), &model)?;
        debug!(model = %model, variables = registry.len(), "variable registry loaded");

        let resolver = match self.parser {
            Some(parser) => StructuralParameterResolver::new(parser),
            None => StructuralParameterResolver::default(),
        }
        .with_max_rounds(self.max_rounds);

        let mut api = SimulationApi {
            materializer: ResultMaterializer::new(&capabilities),
            setup: SimulationSetup::new(&capabilities),
            capabilities,
            lifecycle,
            registry,
            resolver,
            model,
            structural_parameters: self.structural_parameters,
        };
        if !self.setup.is_empty() {
            api.set_sim_setup(&self.setup)?;
        }
        Ok(api)
    }
}

/// Orchestrates simulations of one model on one engine connection.
///
/// Not reentrant: every call runs to completion before the next one starts.
/// Use [`crate::pool::WorkerPool`] for parallel parameter sets.
#[derive(Debug)]
pub struct SimulationApi {
    lifecycle: LifecycleManager,
    registry: VariableRegistry,
    setup: SimulationSetup,
    capabilities: EngineCapabilities,
    model: ModelIdentifier,
    resolver: StructuralParameterResolver,
    materializer: ResultMaterializer,
    structural_parameters: bool,
}

impl SimulationApi {
    pub fn builder(engine: Box<dyn EngineAdapter>, model: impl Into<String>) -> SimulationApiBuilder {
        SimulationApiBuilder {
            engine,
            placeholder: None,
            model: model.into(),
            packages: Vec::new(),
            restart_ceiling: -1,
            structural_parameters: true,
            max_rounds: 1,
            parser: None,
            setup: SetupOverrides::new(),
        }
    }

    /// Active model identifier, including structural modifiers.
    pub fn model(&self) -> &ModelIdentifier {
        &self.model
    }

    pub fn model_name(&self) -> &str {
        self.model.base()
    }

    pub fn registry(&self) -> &VariableRegistry {
        &self.registry
    }

    pub fn sim_setup(&self) -> &SimulationSetup {
        &self.setup
    }

    pub fn capabilities(&self) -> &EngineCapabilities {
        &self.capabilities
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn resolver(&self) -> &StructuralParameterResolver {
        &self.resolver
    }

    pub fn working_dir(&self) -> &Path {
        self.lifecycle.engine().working_dir()
    }

    /// Switch to another model. Its variables replace the current registry.
    pub fn set_model(&mut self, name: impl AsRef<str>) -> Result<()> {
        let model = ModelIdentifier::new(name);
        self.lifecycle.load_model(model.clone())?;
        self.registry = VariableRegistry::load(self.lifecycle.engine_mut(), &model)?;
        self.resolver.reset();
        info!(model = %model, variables = self.registry.len(), "model changed");
        self.model = model;
        Ok(())
    }

    /// Validate `overrides` against the current setup and replace it on success.
    pub fn set_sim_setup(&mut self, overrides: &SetupOverrides) -> Result<()> {
        let next = self.setup.apply(overrides, &self.capabilities)?;
        if overrides.contains_key("result_names") {
            self.registry.set_result_names(next.result_names());
        }
        if overrides.contains_key("initial_names") {
            self.registry.check_unsupported(next.initial_names(), None);
        }
        self.setup = next;
        Ok(())
    }

    /// Restore the backend's default setup. Results go back to every output.
    pub fn reset_sim_setup(&mut self) {
        self.setup = SimulationSetup::new(&self.capabilities);
        self.registry.reset_result_names();
    }

    /// Narrow the variables returned by in-memory results. Same as a
    /// `result_names` override, so it replaces any earlier one.
    pub fn set_result_names<S: AsRef<str>>(&mut self, names: &[S]) -> Result<()> {
        let names: Vec<&str> = names.iter().map(|n| n.as_ref()).collect();
        let mut overrides = SetupOverrides::new();
        overrides.insert("result_names".to_owned(), json!(names));
        self.set_sim_setup(&overrides)
    }

    /// Run the current setup and shape the output per `request.return_option`.
    pub fn simulate(&mut self, request: SimulateRequest) -> Result<RunResult> {
        if !request.parameters.is_empty() {
            self.apply_parameters(&request.parameters)?;
        }
        let output = self.output_request(&request)?;

        self.resolver.begin();
        if self.structural_parameters {
            if let Some(next) = self.resolver.prepare(&self.model, &self.setup) {
                warn!(
                    parameters = %self.resolver.known().join(", "),
                    "model is re-translated for each simulation; add annotation(Evaluate=false) to these parameters"
                );
                self.lifecycle.load_model(next.clone())?;
                self.model = next;
            }
        }
        self.lifecycle.before_run()?;

        let mut raw = self.execute(&output, request.show_eventlog)?;
        // Terminates: every retranslation spends one of the resolver's rounds.
        while self.structural_parameters {
            let log = self.lifecycle.engine().last_error_log();
            let ResolutionPlan::Retranslate { model, .. } =
                self.resolver.inspect(&log, &self.setup, &self.model)
            else {
                break;
            };
            if let Err(err) = self.lifecycle.load_model(model.clone()) {
                self.resolver.exhausted();
                error!(model = %model, "re-translated model failed to load");
                error!("{}", self.lifecycle.engine().last_error_log());
                return Err(err);
            }
            self.resolver.retranslated();
            self.model = model;
            raw = self.execute(&output, request.show_eventlog)?;
        }

        if !raw.success() {
            let log = self.lifecycle.engine().last_error_log();
            error!(model = %self.model, "simulation failed; last engine log follows");
            error!("{}", log);
            return Err(SimError::Execution {
                model: self.model.to_string(),
                log,
            });
        }

        let options = MaterializeOptions {
            return_option: request.return_option,
            savepath: request.savepath,
            squeeze: request.squeeze,
        };
        self.materializer.materialize(raw, &options)
    }

    /// Close the engine and any placeholder connection.
    pub fn close(&mut self) -> Result<()> {
        self.lifecycle.shutdown()
    }

    pub fn describe(&self) -> ApiSnapshot {
        ApiSnapshot {
            backend: self.lifecycle.engine().backend().to_owned(),
            model: self.model.base().to_owned(),
            working_dir: self.working_dir().to_path_buf(),
            packages: self.lifecycle.search_paths().to_vec(),
            restart_ceiling: self.lifecycle.restart_ceiling(),
            structural_parameters: self.structural_parameters,
            max_rounds: self.resolver.max_rounds(),
            setup: self.setup.clone(),
        }
    }

    fn apply_parameters(&mut self, parameters: &IndexMap<String, f64>) -> Result<()> {
        let names: Vec<&String> = parameters.keys().collect();
        self.registry.check_unsupported(&names, None);
        for (name, value) in parameters {
            if let Some(variable) = self.registry.get(name) {
                if !variable.within_bounds(*value) {
                    warn!(
                        parameter = %name,
                        value,
                        min = variable.min,
                        max = variable.max,
                        "parameter value outside declared bounds"
                    );
                }
            }
        }
        let mut overrides = SetupOverrides::new();
        overrides.insert("initial_names".to_owned(), json!(names));
        overrides.insert(
            "initial_values".to_owned(),
            Value::Array(vec![json!(parameters.values().collect::<Vec<_>>())]),
        );
        self.set_sim_setup(&overrides)
    }

    fn output_request(&self, request: &SimulateRequest) -> Result<OutputRequest> {
        if request.return_option == ReturnOption::Savepath {
            if self.setup.initial_values().len() > 1 {
                return Err(ValidationError::UnsupportedOption(vec![format!(
                    "savepath return with a batch of {} initial-value rows",
                    self.setup.initial_values().len()
                )])
                .into());
            }
            return Ok(OutputRequest::Artifacts {
                result_file: request.result_file_name.clone(),
            });
        }

        let mut result_names: Vec<String> = if self.setup.result_names().is_empty() {
            self.registry.result_names().to_vec()
        } else {
            self.setup.result_names().to_vec()
        };
        let time_column = self.materializer.time_column();
        if !result_names.iter().any(|n| n == time_column) {
            result_names.push(time_column.to_owned());
        }
        let number_of_intervals = if self.capabilities.requires_interval_count {
            Some(self.setup.number_of_intervals()?)
        } else {
            None
        };
        Ok(OutputRequest::Trajectories {
            result_names,
            number_of_intervals,
        })
    }

    fn execute(&mut self, output: &OutputRequest, show_eventlog: bool) -> Result<RawResult> {
        let request = ExecutionRequest {
            model: &self.model,
            setup: &self.setup,
            output: output.clone(),
            show_eventlog,
        };
        debug!(model = %self.model, run = self.lifecycle.run_count(), "executing simulation");
        self.lifecycle.engine_mut().execute(&request)
    }
}
