//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "integration-tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Structural parameter detection and model re-translation."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use anyhow::Result;
use r_sim_common::init_for_tests;
use r_sim_core::{
    ResolverState, SetupOverrides, SimError, SimulateRequest, SimulationApi,
    TranslationLogParser,
};
use r_sim_testharness::ScriptedEngine;
use serde_json::json;

fn overrides(value: serde_json::Value) -> SetupOverrides {
    serde_json::from_value(value).expect("override map")
}

fn run_models(probe: &r_sim_testharness::ProbeHandle) -> Vec<String> {
    probe.lock().runs.iter().map(|r| r.model.clone()).collect()
}

#[test]
fn structural_parameter_triggers_one_retranslation() -> Result<()> {
    init_for_tests();
    let dir = tempfile::tempdir()?;
    let engine = ScriptedEngine::new(dir.path(), "Zone").with_structural(&["n"]);
    let probe = engine.probe();
    let mut api = SimulationApi::builder(Box::new(engine), "Zone").build()?;
    api.set_sim_setup(&overrides(json!({
        "initial_names": ["C", "n"],
        "initial_values": [2000, 3],
    })))?;

    api.simulate(SimulateRequest::default())?;

    assert_eq!(probe.lock().loads, ["Zone", "Zone(n = 3)"]);
    assert_eq!(run_models(&probe), ["Zone", "Zone(n = 3)"]);
    assert_eq!(api.resolver().known(), ["n"]);
    assert_eq!(api.resolver().state(), ResolverState::Idle);
    assert_eq!(api.model().to_string(), "Zone(n = 3)");
    Ok(())
}

#[test]
fn known_structural_parameters_apply_before_the_next_run() -> Result<()> {
    init_for_tests();
    let dir = tempfile::tempdir()?;
    let engine = ScriptedEngine::new(dir.path(), "Zone").with_structural(&["n"]);
    let probe = engine.probe();
    let mut api = SimulationApi::builder(Box::new(engine), "Zone").build()?;
    api.set_sim_setup(&overrides(json!({
        "initial_names": ["C", "n"],
        "initial_values": [2000, 3],
    })))?;
    api.simulate(SimulateRequest::default())?;

    api.set_sim_setup(&overrides(json!({"initial_values": [2000, 5]})))?;
    api.simulate(SimulateRequest::default())?;

    assert_eq!(
        probe.lock().loads.last().map(String::as_str),
        Some("Zone(n = 5)")
    );
    // one run per call once the modifier is carried up front
    assert_eq!(
        run_models(&probe),
        ["Zone", "Zone(n = 3)", "Zone(n = 5)"]
    );

    // an unchanged value keeps the loaded model
    api.simulate(SimulateRequest::default())?;
    assert_eq!(probe.lock().loads.len(), 3);
    Ok(())
}

#[test]
fn failed_retranslation_exhausts_the_resolver() -> Result<()> {
    init_for_tests();
    let dir = tempfile::tempdir()?;
    let engine = ScriptedEngine::new(dir.path(), "Zone")
        .with_structural(&["n"])
        .rejecting_modified_models();
    let mut api = SimulationApi::builder(Box::new(engine), "Zone").build()?;
    api.set_sim_setup(&overrides(json!({
        "initial_names": ["n"],
        "initial_values": [4],
    })))?;

    let err = api.simulate(SimulateRequest::default()).unwrap_err();
    match err {
        SimError::ModelLoad { model, log } => {
            assert_eq!(model, "Zone(n = 4)");
            assert!(log.contains("translation of Zone(n = 4) failed"));
        }
        other => panic!("expected a model load failure, got {other:?}"),
    }
    assert_eq!(api.resolver().state(), ResolverState::Exhausted);
    assert_eq!(api.model().to_string(), "Zone");
    Ok(())
}

#[test]
fn disabled_resolution_keeps_the_original_model() -> Result<()> {
    init_for_tests();
    let dir = tempfile::tempdir()?;
    let engine = ScriptedEngine::new(dir.path(), "Zone").with_structural(&["n"]);
    let probe = engine.probe();
    let mut api = SimulationApi::builder(Box::new(engine), "Zone")
        .structural_parameters(false)
        .build()?;
    api.set_sim_setup(&overrides(json!({
        "initial_names": ["n"],
        "initial_values": [4],
    })))?;

    api.simulate(SimulateRequest::default())?;
    assert_eq!(probe.lock().loads, ["Zone"]);
    assert!(api.resolver().known().is_empty());
    Ok(())
}

#[test]
fn parameters_outside_initial_names_are_not_retranslated() -> Result<()> {
    init_for_tests();
    let dir = tempfile::tempdir()?;
    let log = format!(
        "Warning: Setting k has no effect in model.\n{}.\n",
        r_sim_core::STRUCTURAL_MARKER
    );
    let engine = ScriptedEngine::new(dir.path(), "Zone").failing_next_run(log);
    let probe = engine.probe();
    let mut api = SimulationApi::builder(Box::new(engine), "Zone").build()?;

    let err = api.simulate(SimulateRequest::default()).unwrap_err();
    assert!(matches!(err, SimError::Execution { .. }));
    assert_eq!(probe.lock().loads, ["Zone"]);
    assert_eq!(probe.lock().runs.len(), 1);
    Ok(())
}

#[test]
fn custom_diagnostic_wording_recovers_a_failed_run() -> Result<()> {
    init_for_tests();
    let dir = tempfile::tempdir()?;
    let engine = ScriptedEngine::new(dir.path(), "Zone")
        .failing_next_run("Notice: C is structural\nrebuild required\n");
    let probe = engine.probe();
    let parser = TranslationLogParser::new("rebuild required", "Notice: ", " is structural");
    let mut api = SimulationApi::builder(Box::new(engine), "Zone")
        .diagnostic_parser(Box::new(parser))
        .build()?;

    let request = SimulateRequest::default().with_parameter("C", 1500.0);
    api.simulate(request)?;
    assert_eq!(run_models(&probe), ["Zone", "Zone(C = 1500)"]);
    Ok(())
}

#[test]
fn switching_models_forgets_structural_parameters() -> Result<()> {
    init_for_tests();
    let dir = tempfile::tempdir()?;
    let engine = ScriptedEngine::new(dir.path(), "Zone").with_structural(&["n"]);
    let mut api = SimulationApi::builder(Box::new(engine), "Zone").build()?;
    api.simulate(SimulateRequest::default().with_parameter("n", 3.0))?;
    assert_eq!(api.resolver().known(), ["n"]);

    api.set_model("Zone")?;
    assert!(api.resolver().known().is_empty());
    assert_eq!(api.model().to_string(), "Zone");
    Ok(())
}
