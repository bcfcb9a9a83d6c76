//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "integration-tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Engine restarts, placeholder connections and saved artifacts."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::fs;

use anyhow::Result;
use r_sim_common::init_for_tests;
use r_sim_core::{
    ReturnOption, SetupOverrides, SimError, SimulateRequest, SimulationApi, ValidationError,
};
use r_sim_testharness::ScriptedEngine;
use serde_json::json;

#[test]
fn engine_restarts_after_the_ceiling() -> Result<()> {
    init_for_tests();
    let dir = tempfile::tempdir()?;
    let engine = ScriptedEngine::new(dir.path(), "Zone");
    let probe = engine.probe();
    let mut api = SimulationApi::builder(Box::new(engine), "Zone")
        .restart_ceiling(2)
        .build()?;

    for _ in 0..2 {
        api.simulate(SimulateRequest::default())?;
    }
    assert_eq!(api.lifecycle().run_count(), 2);
    assert_eq!(probe.lock().opens, 1);

    api.simulate(SimulateRequest::default())?;
    assert_eq!(api.lifecycle().restarts(), 1);
    assert_eq!(api.lifecycle().run_count(), 0);
    {
        let probe = probe.lock();
        assert_eq!(probe.opens, 2);
        assert_eq!(probe.closes, 1);
        // the model is reloaded on the fresh connection
        assert_eq!(probe.loads, ["Zone", "Zone"]);
        assert_eq!(probe.runs.len(), 3);
    }

    for _ in 0..2 {
        api.simulate(SimulateRequest::default())?;
    }
    assert_eq!(api.lifecycle().restarts(), 1);
    assert_eq!(api.lifecycle().run_count(), 2);
    Ok(())
}

#[test]
fn no_ceiling_never_restarts() -> Result<()> {
    init_for_tests();
    let dir = tempfile::tempdir()?;
    let engine = ScriptedEngine::new(dir.path(), "Zone");
    let probe = engine.probe();
    let mut api = SimulationApi::builder(Box::new(engine), "Zone").build()?;
    for _ in 0..5 {
        api.simulate(SimulateRequest::default())?;
    }
    assert_eq!(api.lifecycle().restarts(), 0);
    assert_eq!(probe.lock().opens, 1);
    Ok(())
}

#[test]
fn placeholder_stays_open_across_restarts() -> Result<()> {
    init_for_tests();
    let dir = tempfile::tempdir()?;
    let engine = ScriptedEngine::new(dir.path(), "Zone");
    let placeholder = ScriptedEngine::new(dir.path(), "Zone");
    let probe = engine.probe();
    let placeholder_probe = placeholder.probe();
    let mut api = SimulationApi::builder(Box::new(engine), "Zone")
        .restart_ceiling(1)
        .placeholder(Box::new(placeholder))
        .build()?;
    assert!(api.lifecycle().has_placeholder());

    for _ in 0..3 {
        api.simulate(SimulateRequest::default())?;
    }
    assert_eq!(probe.lock().closes, 1);
    assert_eq!(placeholder_probe.lock().opens, 1);
    assert_eq!(placeholder_probe.lock().closes, 0);
    // the placeholder never loads or runs anything
    assert!(placeholder_probe.lock().loads.is_empty());

    api.close()?;
    assert_eq!(probe.lock().closes, 2);
    assert_eq!(placeholder_probe.lock().closes, 1);
    assert!(!api.lifecycle().has_placeholder());
    Ok(())
}

#[test]
fn placeholder_is_unused_without_restarts() -> Result<()> {
    init_for_tests();
    let dir = tempfile::tempdir()?;
    let placeholder = ScriptedEngine::new(dir.path(), "Zone");
    let placeholder_probe = placeholder.probe();
    let api = SimulationApi::builder(Box::new(ScriptedEngine::new(dir.path(), "Zone")), "Zone")
        .placeholder(Box::new(placeholder))
        .build()?;
    assert!(!api.lifecycle().has_placeholder());
    assert_eq!(placeholder_probe.lock().opens, 0);
    Ok(())
}

#[test]
fn dropping_the_api_closes_the_engine() -> Result<()> {
    init_for_tests();
    let dir = tempfile::tempdir()?;
    let engine = ScriptedEngine::new(dir.path(), "Zone");
    let probe = engine.probe();
    {
        let mut api = SimulationApi::builder(Box::new(engine), "Zone").build()?;
        api.simulate(SimulateRequest::default())?;
    }
    assert_eq!(probe.lock().closes, 1);
    Ok(())
}

#[test]
fn savepath_moves_artifacts_and_replaces_previous_files() -> Result<()> {
    init_for_tests();
    let work = tempfile::tempdir()?;
    let dest = tempfile::tempdir()?;
    fs::write(dest.path().join("dslog.txt"), "stale log")?;
    let mut api =
        SimulationApi::builder(Box::new(ScriptedEngine::new(work.path(), "Zone")), "Zone").build()?;

    let request = SimulateRequest {
        result_file_name: "run1".to_owned(),
        ..SimulateRequest::new(ReturnOption::Savepath).with_savepath(dest.path())
    };
    let saved = api.simulate(request)?.into_saved_path().expect("saved path");

    assert_eq!(saved, dest.path().join("run1.mat"));
    assert!(saved.is_file());
    assert_eq!(
        fs::read_to_string(dest.path().join("dslog.txt"))?,
        "scripted artifact dslog.txt\n"
    );
    assert!(dest.path().join("dsfinal.txt").is_file());
    assert!(!work.path().join("run1.mat").exists());
    Ok(())
}

#[test]
fn savepath_without_destination_stays_in_working_dir() -> Result<()> {
    init_for_tests();
    let work = tempfile::tempdir()?;
    let mut api =
        SimulationApi::builder(Box::new(ScriptedEngine::new(work.path(), "Zone")), "Zone").build()?;
    let saved = api
        .simulate(SimulateRequest::new(ReturnOption::Savepath))?
        .into_saved_path()
        .expect("saved path");
    assert_eq!(saved, work.path().join("resultFile.mat"));
    assert!(saved.is_file());
    Ok(())
}

#[test]
fn savepath_rejects_batches() -> Result<()> {
    init_for_tests();
    let work = tempfile::tempdir()?;
    let engine = ScriptedEngine::new(work.path(), "Zone");
    let probe = engine.probe();
    let mut api = SimulationApi::builder(Box::new(engine), "Zone").build()?;
    let batch: SetupOverrides = serde_json::from_value(json!({
        "initial_names": ["C"],
        "initial_values": [[1], [2]],
    }))?;
    api.set_sim_setup(&batch)?;

    let err = api
        .simulate(SimulateRequest::new(ReturnOption::Savepath))
        .unwrap_err();
    assert!(matches!(
        err,
        SimError::Validation(ValidationError::UnsupportedOption(_))
    ));
    assert!(probe.lock().runs.is_empty());
    Ok(())
}
