//! Bounded worker pool over a shared FIFO queue.
//!
//! Each worker pops the next job, runs its whole pipeline and moves on.
//! A failed, timed out or panicking job becomes a [`FailureRecord`] and
//! never stops the pool; the run ends once the queue is drained and every
//! in-flight job has finished.
//!
//! [`FailureRecord`]: crate::failure::FailureRecord

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info};

use crate::error::{Error, JobError, Result, Stage};
use crate::failure::FailureTracker;

/// The per-job work of one run mode.
#[async_trait]
pub trait JobPipeline: Send + Sync + 'static {
    type Job: Send + 'static;

    /// Name of `job` in logs and failure reports.
    fn describe(&self, job: &Self::Job) -> String;

    async fn process(&self, job: Self::Job) -> std::result::Result<(), JobError>;
}

/// Counts reported by [`Scheduler::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolOutcome {
    pub succeeded: usize,
    pub failed: usize,
}

pub struct Scheduler {
    workers: usize,
    job_timeout: Option<Duration>,
}

impl Scheduler {
    /// A pool of `workers` workers; zero is treated as one.
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            job_timeout: None,
        }
    }

    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run every job to completion.
    pub async fn run<P: JobPipeline>(
        &self,
        pipeline: Arc<P>,
        jobs: Vec<P::Job>,
        failures: Arc<FailureTracker>,
    ) -> Result<PoolOutcome> {
        let total = jobs.len();
        let queue = Arc::new(Mutex::new(VecDeque::from(jobs)));
        let succeeded = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let spawned = self.workers.min(total);

        info!(jobs = total, workers = spawned, "starting worker pool");

        let mut pool = JoinSet::new();
        for worker in 0..spawned {
            let queue = queue.clone();
            let pipeline = pipeline.clone();
            let failures = failures.clone();
            let succeeded = succeeded.clone();
            let failed = failed.clone();
            let job_timeout = self.job_timeout;

            pool.spawn(async move {
                loop {
                    let next = queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
                    let Some(job) = next else { break };
                    let name = pipeline.describe(&job);
                    debug!(worker, job = %name, "job started");

                    match run_one(pipeline.clone(), job, &name, job_timeout).await {
                        Ok(()) => {
                            succeeded.fetch_add(1, Ordering::SeqCst);
                            info!(job = %name, "job completed");
                        }
                        Err(e) => {
                            failed.fetch_add(1, Ordering::SeqCst);
                            failures.record_error(name, &e);
                        }
                    }
                }
                debug!(worker, "worker idle, queue drained");
            });
        }

        while let Some(joined) = pool.join_next().await {
            joined.map_err(|e| Error::Task(format!("worker task failed: {}", e)))?;
        }

        Ok(PoolOutcome {
            succeeded: succeeded.load(Ordering::SeqCst),
            failed: failed.load(Ordering::SeqCst),
        })
    }
}

/// Run one job in its own task so a panic or timeout is contained.  The
/// task is aborted when its set is dropped.
async fn run_one<P: JobPipeline>(
    pipeline: Arc<P>,
    job: P::Job,
    name: &str,
    job_timeout: Option<Duration>,
) -> std::result::Result<(), JobError> {
    let mut task = JoinSet::new();
    task.spawn(async move { pipeline.process(job).await });

    let joined = match job_timeout {
        Some(limit) => match tokio::time::timeout(limit, task.join_next()).await {
            Ok(joined) => joined,
            Err(_) => {
                return Err(JobError::other(
                    Stage::Timeout,
                    format!(
                        "{} did not finish within {}",
                        name,
                        humantime::format_duration(limit)
                    ),
                ))
            }
        },
        None => task.join_next().await,
    };

    match joined {
        Some(Ok(result)) => result,
        Some(Err(e)) => Err(JobError::other(Stage::Panic, panic_message(e))),
        None => Err(JobError::other(Stage::Panic, "job task vanished")),
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("job panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("job panicked: {}", s)
    } else {
        "job panicked".to_string()
    }
}
