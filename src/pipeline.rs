//! Worker-per-partition runtime. Workers share nothing but read-only config (and
//! the optional feature thread pool).

use std::sync::Arc;
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use log::{info, warn};

use crate::config::PipelineConfig;
use crate::coordinator::{EnrichmentCoordinator, WorkerCommand, WorkerParts, WorkerReport};
use crate::error::{PipelineError, Result};

struct Worker {
    partition: usize,
    commands: Sender<WorkerCommand>,
    handle: JoinHandle<Result<WorkerReport>>,
}

pub struct PipelineHandle {
    workers: Vec<Worker>,
}

/// Builds one coordinator per partition with `parts_for` and runs each on its own
/// thread.
pub fn spawn<F>(config: PipelineConfig, mut parts_for: F) -> Result<PipelineHandle>
where
    F: FnMut(usize, Option<Arc<rayon::ThreadPool>>) -> Result<WorkerParts>,
{
    config
        .validate()
        .map_err(|err| PipelineError::Config(format!("{err:#}")))?;
    let pool = build_feature_pool(config.feature_threads);
    let config = Arc::new(config);
    let mut workers = Vec::with_capacity(config.partitions);

    for partition in 0..config.partitions {
        let parts = parts_for(partition, pool.clone())?;
        let coordinator = EnrichmentCoordinator::new(partition, Arc::clone(&config), parts)?;
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(format!("worker-p{partition}"))
            .spawn(move || coordinator.run(rx))
            .map_err(|err| PipelineError::Config(format!("spawn worker p{partition}: {err}")))?;
        workers.push(Worker {
            partition,
            commands: tx,
            handle,
        });
    }
    info!("Pipeline started with {} workers", workers.len());
    Ok(PipelineHandle { workers })
}

impl PipelineHandle {
    pub fn partitions(&self) -> usize {
        self.workers.len()
    }

    pub fn drain(&self) {
        self.broadcast(WorkerCommand::Drain);
    }

    pub fn stop(&self) {
        self.broadcast(WorkerCommand::Stop);
    }

    /// Number of workers that have already exited (normally only after a fatal error).
    pub fn finished(&self) -> usize {
        self.workers.iter().filter(|w| w.handle.is_finished()).count()
    }

    /// Waits for every worker. The first fatal error wins; the others are logged.
    pub fn join(self) -> Result<Vec<WorkerReport>> {
        let mut reports = Vec::with_capacity(self.workers.len());
        let mut first_err = None;
        for worker in self.workers {
            let outcome = worker
                .handle
                .join()
                .unwrap_or(Err(PipelineError::WorkerPanicked {
                    partition: worker.partition,
                }));
            match outcome {
                Ok(report) => reports.push(report),
                Err(err) if first_err.is_none() => first_err = Some(err),
                Err(err) => warn!("Worker 'p{}': also failed: {err}", worker.partition),
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(reports),
        }
    }

    fn broadcast(&self, command: WorkerCommand) {
        for worker in &self.workers {
            // A worker that already exited has nothing left to drain.
            let _ = worker.commands.send(command);
        }
    }
}

fn build_feature_pool(threads: usize) -> Option<Arc<rayon::ThreadPool>> {
    if threads == 0 {
        return None;
    }
    match rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|idx| format!("features-{idx}"))
        .build()
    {
        Ok(pool) => Some(Arc::new(pool)),
        Err(err) => {
            warn!("Feature pool unavailable, using global pool: {err}");
            None
        }
    }
}
