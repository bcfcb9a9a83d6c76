//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Fixed pool of worker threads, each owning one simulation API."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::cell::Cell;
use std::thread::{self, JoinHandle};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::errors::{Result, SimError};
use crate::materializer::RunResult;
use crate::orchestrator::{SimulateRequest, SimulationApi};

thread_local! {
    static WORKER_IDX: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Index of the pool worker running on the current thread.
pub fn worker_idx() -> Option<usize> {
    WORKER_IDX.with(Cell::get)
}

/// Number of cores the pool may use.
pub fn available_parallelism() -> usize {
    thread::available_parallelism().map(usize::from).unwrap_or(1)
}

struct Job {
    request: SimulateRequest,
    reply: oneshot::Sender<Result<RunResult>>,
}

struct Worker {
    sender: Option<mpsc::UnboundedSender<Job>>,
    handle: Option<JoinHandle<()>>,
}

/// Runs parameter sets in parallel across independent engine connections.
///
/// Each worker thread owns its [`SimulationApi`] for the pool's lifetime, so
/// no engine state is shared. Blocking helpers must be called from synchronous
/// code; async callers await the receivers returned by [`WorkerPool::submit`].
pub struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Spawn `size` workers, building each API with `factory(worker_idx)`.
    /// Fails when `size` exceeds the available cores.
    pub fn new<F>(size: usize, factory: F) -> Result<Self>
    where
        F: FnMut(usize) -> Result<SimulationApi>,
    {
        Self::with_parallelism(size, available_parallelism(), factory)
    }

    pub fn with_parallelism<F>(size: usize, parallelism: usize, mut factory: F) -> Result<Self>
    where
        F: FnMut(usize) -> Result<SimulationApi>,
    {
        if size == 0 {
            return Err(SimError::Pool("pool size must be at least 1".to_owned()));
        }
        if size > parallelism {
            return Err(SimError::Pool(format!(
                "requested {size} workers but only {parallelism} cores are available"
            )));
        }

        let mut workers = Vec::with_capacity(size);
        for idx in 0..size {
            let api = factory(idx)?;
            let (sender, receiver) = mpsc::unbounded_channel();
            let handle = thread::Builder::new()
                .name(format!("sim-worker-{idx}"))
                .spawn(move || worker_loop(idx, api, receiver))?;
            workers.push(Worker {
                sender: Some(sender),
                handle: Some(handle),
            });
        }
        info!(workers = size, "simulation worker pool started");
        Ok(Self { workers })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queue `request` on one worker and return the reply channel.
    pub fn submit(
        &self,
        worker_idx: usize,
        request: SimulateRequest,
    ) -> Result<oneshot::Receiver<Result<RunResult>>> {
        let worker = self
            .workers
            .get(worker_idx)
            .ok_or_else(|| SimError::Pool(format!("no worker with index {worker_idx}")))?;
        let sender = worker
            .sender
            .as_ref()
            .ok_or_else(|| SimError::Pool("pool is shut down".to_owned()))?;
        let (reply, receiver) = oneshot::channel();
        sender
            .send(Job { request, reply })
            .map_err(|_| SimError::Pool(format!("worker {worker_idx} has stopped")))?;
        Ok(receiver)
    }

    /// Run one request on a given worker and wait for it.
    pub fn run(&self, worker_idx: usize, request: SimulateRequest) -> Result<RunResult> {
        let receiver = self.submit(worker_idx, request)?;
        await_reply(worker_idx, receiver)
    }

    /// Distribute `requests` round-robin and collect results in input order.
    pub fn map(&self, requests: Vec<SimulateRequest>) -> Vec<Result<RunResult>> {
        let pending: Vec<_> = requests
            .into_iter()
            .enumerate()
            .map(|(i, request)| {
                let idx = i % self.workers.len();
                (idx, self.submit(idx, request))
            })
            .collect();
        pending
            .into_iter()
            .map(|(idx, submitted)| submitted.and_then(|rx| await_reply(idx, rx)))
            .collect()
    }

    /// Stop accepting work, let queued jobs finish and close every engine.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        for worker in &mut self.workers {
            worker.sender.take();
        }
        let mut panicked = 0;
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    panicked += 1;
                }
            }
        }
        if panicked > 0 {
            return Err(SimError::Pool(format!("{panicked} worker(s) panicked")));
        }
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(error = %err, "worker pool did not stop cleanly");
        }
    }
}

fn await_reply(worker_idx: usize, receiver: oneshot::Receiver<Result<RunResult>>) -> Result<RunResult> {
    receiver
        .blocking_recv()
        .map_err(|_| SimError::Pool(format!("worker {worker_idx} dropped the request")))?
}

fn worker_loop(idx: usize, mut api: SimulationApi, mut receiver: mpsc::UnboundedReceiver<Job>) {
    WORKER_IDX.with(|cell| cell.set(Some(idx)));
    debug!(worker = idx, model = %api.model(), "worker ready");
    while let Some(job) = receiver.blocking_recv() {
        let result = api.simulate(job.request);
        if job.reply.send(result).is_err() {
            debug!(worker = idx, "caller went away before the result was ready");
        }
    }
    if let Err(err) = api.close() {
        warn!(worker = idx, error = %err, "failed to close worker engine");
    }
    debug!(worker = idx, "worker stopped");
}
