//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Concrete simulation engine backends."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
//! Backends for the orchestration core: a long-lived native engine process
//! and a self-contained packaged model unit.

pub mod factory;
pub mod packaged;
pub mod process;
pub mod protocol;

pub use factory::{api_from_config, engine_from_config};
pub use packaged::{packaged_capabilities, PackagedUnitEngine, UnitManifest};
pub use process::{native_capabilities, ProcessEngine, ProcessEngineConfig};
