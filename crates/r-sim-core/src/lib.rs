//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Engine-agnostic simulation orchestration core."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
//! Orchestration of simulation runs against interchangeable engines.
//! Backends implement [`EngineAdapter`]; callers drive them through
//! [`SimulationApi`] or fan work out with [`WorkerPool`].

pub mod adapter;
pub mod errors;
pub mod lifecycle;
pub mod materializer;
pub mod model_id;
pub mod orchestrator;
pub mod pool;
pub mod resolver;
pub mod setup;
pub mod variables;

pub use adapter::{EngineAdapter, ExecutionRequest, OutputRequest, RawResult};
pub use errors::{Result, SimError, ValidationError};
pub use lifecycle::LifecycleManager;
pub use materializer::{
    Batched, MaterializeOptions, ResultMaterializer, ReturnOption, RunResult, TimeSeriesTable,
};
pub use model_id::ModelIdentifier;
pub use orchestrator::{ApiSnapshot, SimulateRequest, SimulationApi, SimulationApiBuilder};
pub use pool::{available_parallelism, worker_idx, WorkerPool};
pub use resolver::{
    DiagnosticParser, ResolutionPlan, ResolverState, StructuralParameterResolver,
    TranslationLogParser, STRUCTURAL_MARKER,
};
pub use setup::{ArtifactLayout, EngineCapabilities, SetupOverrides, SimulationSetup, SETUP_KEYS};
pub use variables::{Resolution, Variable, VariableKind, VariableRegistry};
