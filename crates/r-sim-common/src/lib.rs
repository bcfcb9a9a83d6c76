//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared configuration and logging primitives."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
//! Configuration loading and tracing bootstrap shared by the simulation
//! crates and the `r-simctl` binary.

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, Backend, EngineConfig, LifecycleConfig, LoadedAppConfig, LoggingConfig, PoolConfig,
    StructuralConfig,
};
pub use logging::{init_for_tests, init_tracing, LogFormat};
