//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "integration-tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Parallel parameter sets across a pool of simulation workers."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::path::Path;

use anyhow::Result;
use r_sim_common::init_for_tests;
use r_sim_core::{ReturnOption, SimError, SimulateRequest, SimulationApi, WorkerPool};
use r_sim_testharness::{ProbeHandle, ScriptedEngine};

fn pool(root: &Path, size: usize, fail_on: Option<usize>) -> Result<(WorkerPool, Vec<ProbeHandle>)> {
    init_for_tests();
    let mut probes = Vec::new();
    let pool = WorkerPool::with_parallelism(size, size, |idx| {
        let mut engine = ScriptedEngine::new(root.join(format!("worker-{idx}")), "Zone");
        if fail_on == Some(idx) {
            engine = engine.failing_next_run("Error: solver diverged");
        }
        probes.push(engine.probe());
        SimulationApi::builder(Box::new(engine), "Zone").build()
    })?;
    Ok((pool, probes))
}

fn request(c: f64) -> SimulateRequest {
    SimulateRequest::new(ReturnOption::LastPoint).with_parameter("C", c)
}

fn last_x(result: r_sim_core::RunResult) -> f64 {
    let points = result.into_last_point().expect("last point");
    points.single().expect("one point")["x"]
}

#[test]
fn map_returns_results_in_input_order() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (pool, probes) = pool(dir.path(), 2, None)?;
    assert_eq!(pool.size(), 2);

    let results = pool.map(vec![request(10.0), request(20.0), request(30.0), request(40.0)]);
    let xs = results
        .into_iter()
        .map(|r| r.map(last_x))
        .collect::<Result<Vec<_>, _>>()?;
    assert_eq!(xs, [11.0, 21.0, 31.0, 41.0]);

    // round-robin: worker 0 took the first and third set
    let first: Vec<_> = probes[0]
        .lock()
        .runs
        .iter()
        .map(|r| r.initial_values.clone())
        .collect();
    assert_eq!(first, [vec![vec![10.0]], vec![vec![30.0]]]);
    assert_eq!(probes[1].lock().runs.len(), 2);

    pool.shutdown()?;
    for probe in &probes {
        assert_eq!(probe.lock().closes, 1);
    }
    Ok(())
}

#[test]
fn run_targets_one_worker() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (pool, probes) = pool(dir.path(), 2, None)?;
    let result = pool.run(1, request(5.0))?;
    assert_eq!(last_x(result), 6.0);
    assert!(probes[0].lock().runs.is_empty());
    assert_eq!(probes[1].lock().runs.len(), 1);

    let err = pool.run(7, request(5.0)).unwrap_err();
    assert!(matches!(err, SimError::Pool(msg) if msg.contains("no worker with index 7")));
    Ok(())
}

#[test]
fn failing_worker_does_not_affect_the_others() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (pool, _) = pool(dir.path(), 2, Some(1))?;
    let results = pool.map(vec![request(1.0), request(2.0), request(3.0), request(4.0)]);

    assert!(results[0].is_ok());
    assert!(matches!(
        &results[1],
        Err(SimError::Execution { log, .. }) if log.contains("solver diverged")
    ));
    assert!(results[2].is_ok());
    // the failure is consumed; the worker keeps serving
    assert!(results[3].is_ok());
    Ok(())
}

#[test]
fn dropping_the_pool_closes_every_engine() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (pool, probes) = pool(dir.path(), 2, None)?;
    drop(pool);
    for probe in &probes {
        let probe = probe.lock();
        assert_eq!(probe.opens, 1);
        assert_eq!(probe.closes, 1);
    }
    Ok(())
}

#[test]
fn factory_errors_abort_startup() -> Result<()> {
    let dir = tempfile::tempdir()?;
    init_for_tests();
    let err = WorkerPool::with_parallelism(2, 2, |idx| {
        let model = if idx == 1 { "Missing" } else { "Zone" };
        SimulationApi::builder(Box::new(ScriptedEngine::new(dir.path(), "Zone")), model).build()
    })
    .err()
    .expect("second worker fails to load");
    assert!(matches!(err, SimError::ModelLoad { .. }));
    Ok(())
}
