//! Bounded parallel execution of independent jobs.
//!
//! A rayon pool of `W` workers pulls from one queue. Each job reaches a
//! terminal state exactly once and produces exactly one [`ReportRecord`].
//! Errors and panics stop at the job boundary. Three pieces of state are
//! shared: the queue, the progress counters and the report log. Each has its
//! own mutex, held only for bookkeeping and never across a job.

use crate::cancel::CancellationToken;
use crate::error::Error;
use crate::progress::ProgressReporter;
use crate::report::{FailureCause, Outcome, ReportRecord, Stage};
use crate::tasks::{Job, TaskState};
use rayon::ThreadPoolBuilder;
use std::any::Any;
use std::collections::{BTreeSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub const MAX_WORKERS: usize = 12;

/// `min(requested or available cores, MAX_WORKERS)`, at least 1 and no more than `jobs`.
pub fn worker_count(requested: Option<usize>, jobs: usize) -> usize {
    let available = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    requested
        .unwrap_or(available)
        .min(MAX_WORKERS)
        .min(jobs)
        .max(1)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct ProgressState {
    total: usize,
    completed: usize,
    succeeded: usize,
    failed: usize,
    cancelled: usize,
    running: BTreeSet<String>,
    peak_running: usize,
}

impl ProgressState {
    fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total,
            completed: self.completed,
            succeeded: self.succeeded,
            failed: self.failed,
            cancelled: self.cancelled,
            running: self.running.iter().cloned().collect(),
            peak_running: self.peak_running,
        }
    }
}

/// Copy of the progress counters at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub running: Vec<String>,
    /// Most jobs seen running at once in this batch.
    pub peak_running: usize,
}

impl ProgressSnapshot {
    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.completed)
    }
}

/// Readable from any thread while a batch runs.
#[derive(Debug, Clone, Default)]
pub struct ProgressHandle {
    state: Arc<Mutex<ProgressState>>,
}

impl ProgressHandle {
    pub fn snapshot(&self) -> ProgressSnapshot {
        lock(&self.state).snapshot()
    }
}

/// Append-only log of every record produced, across batches.
#[derive(Debug, Clone, Default)]
pub struct ReportLog {
    records: Arc<Mutex<Vec<ReportRecord>>>,
}

impl ReportLog {
    fn push(&self, record: ReportRecord) {
        lock(&self.records).push(record);
    }

    pub fn snapshot(&self) -> Vec<ReportRecord> {
        lock(&self.records).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a successful job hands back.
#[derive(Debug, Default)]
pub struct TaskOutput {
    pub outputs: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

/// One finished batch: the jobs in submission order with their final
/// states, and this batch's records in completion order.
#[derive(Debug)]
pub struct BatchOutcome<J> {
    pub jobs: Vec<J>,
    pub records: Vec<ReportRecord>,
    pub workers: usize,
    pub duration: Duration,
}

pub struct Executor {
    requested_workers: Option<usize>,
    cancel: CancellationToken,
    progress: ProgressHandle,
    log: ReportLog,
}

struct Shared<'a, J> {
    queue: Mutex<VecDeque<(usize, J)>>,
    finished: Mutex<Vec<(usize, J)>>,
    records: Mutex<Vec<ReportRecord>>,
    stage: Stage,
    reporter: &'a dyn ProgressReporter,
}

impl Executor {
    pub fn new(requested_workers: Option<usize>, cancel: CancellationToken) -> Self {
        Self {
            requested_workers,
            cancel,
            progress: ProgressHandle::default(),
            log: ReportLog::default(),
        }
    }

    /// Share an existing log so several executors append to one report.
    pub fn with_report_log(mut self, log: ReportLog) -> Self {
        self.log = log;
        self
    }

    pub fn with_progress(mut self, progress: ProgressHandle) -> Self {
        self.progress = progress;
        self
    }

    pub fn progress(&self) -> ProgressHandle {
        self.progress.clone()
    }

    pub fn report_log(&self) -> ReportLog {
        self.log.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run `work` on every job. Returns once every job is terminal.
    ///
    /// The cancellation token is checked before each job is taken from the
    /// queue. Jobs still queued when it is set are recorded as cancelled.
    pub fn run<J, F>(
        &self,
        jobs: Vec<J>,
        stage: Stage,
        reporter: &dyn ProgressReporter,
        work: F,
    ) -> Result<BatchOutcome<J>, Error>
    where
        J: Job,
        F: Fn(&J) -> Result<TaskOutput, Error> + Sync,
    {
        let total = jobs.len();
        let workers = worker_count(self.requested_workers, total);
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(move |i| format!("bidsmith-{}-{}", stage, i))
            .build()?;

        *lock(&self.progress.state) = ProgressState {
            total,
            ..ProgressState::default()
        };
        info!("Starting {} of {} task(s) with {} worker(s)", stage, total, workers);
        reporter.on_batch_start(stage, total, workers);

        let start = Instant::now();
        let shared = Shared {
            queue: Mutex::new(jobs.into_iter().enumerate().collect()),
            finished: Mutex::new(Vec::with_capacity(total)),
            records: Mutex::new(Vec::with_capacity(total)),
            stage,
            reporter,
        };

        pool.scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|_| self.worker_loop(&shared, &work));
            }
        });

        let leftover: Vec<(usize, J)> = lock(&shared.queue).drain(..).collect();
        if !leftover.is_empty() {
            warn!("Cancelled {} queued {} task(s)", leftover.len(), stage);
        }
        for (index, mut job) in leftover {
            job.set_state(TaskState::Cancelled);
            let record = make_record(&job, stage, Outcome::Cancelled, Vec::new(), Vec::new(), 0.0);
            self.finish(&shared, record);
            lock(&shared.finished).push((index, job));
        }

        let duration = start.elapsed();
        let snapshot = self.progress.snapshot();
        reporter.on_batch_complete(stage, &snapshot, duration.as_secs_f64());
        info!(
            "Finished {} in {:.2}s: {} succeeded, {} failed, {} cancelled",
            stage,
            duration.as_secs_f64(),
            snapshot.succeeded,
            snapshot.failed,
            snapshot.cancelled
        );

        let Shared { finished, records, .. } = shared;
        let mut finished = finished.into_inner().unwrap_or_else(|p| p.into_inner());
        finished.sort_by_key(|(index, _)| *index);

        Ok(BatchOutcome {
            jobs: finished.into_iter().map(|(_, job)| job).collect(),
            records: records.into_inner().unwrap_or_else(|p| p.into_inner()),
            workers,
            duration,
        })
    }

    fn worker_loop<J, F>(&self, shared: &Shared<'_, J>, work: &F)
    where
        J: Job,
        F: Fn(&J) -> Result<TaskOutput, Error> + Sync,
    {
        loop {
            if self.cancel.is_cancelled() {
                debug!("Cancellation requested; worker stopping");
                return;
            }
            let next = lock(&shared.queue).pop_front();
            let Some((index, mut job)) = next else {
                return;
            };

            job.set_state(TaskState::Running);
            {
                let mut progress = lock(&self.progress.state);
                progress.running.insert(job.id().to_string());
                progress.peak_running = progress.peak_running.max(progress.running.len());
                shared.reporter.on_task_start(job.id(), &progress.snapshot());
            }

            let started = Instant::now();
            let result = panic::catch_unwind(AssertUnwindSafe(|| work(&job)))
                .unwrap_or_else(|payload| Err(Error::Panic(panic_message(payload.as_ref()))));
            let elapsed = started.elapsed().as_secs_f64();

            let record = match result {
                Ok(output) => {
                    job.set_state(TaskState::Succeeded);
                    debug!("{} finished in {:.2}s", job.id(), elapsed);
                    make_record(&job, shared.stage, Outcome::Succeeded, output.outputs, output.warnings, elapsed)
                }
                Err(e) => {
                    job.set_state(TaskState::Failed);
                    error!("{} {} failed: {}", shared.stage, job.id(), e);
                    let outcome = Outcome::Failed {
                        cause: FailureCause::from_error(&e, shared.stage),
                        diagnostic: e.to_string(),
                    };
                    make_record(&job, shared.stage, outcome, Vec::new(), Vec::new(), elapsed)
                }
            };

            self.finish(shared, record);
            lock(&shared.finished).push((index, job));
        }
    }

    fn finish<J>(&self, shared: &Shared<'_, J>, record: ReportRecord) {
        {
            let mut progress = lock(&self.progress.state);
            progress.running.remove(&record.task_id);
            progress.completed += 1;
            match record.outcome {
                Outcome::Succeeded => progress.succeeded += 1,
                Outcome::Failed { .. } => progress.failed += 1,
                Outcome::Cancelled => progress.cancelled += 1,
            }
            shared.reporter.on_task_finish(&record, &progress.snapshot());
        }
        self.log.push(record.clone());
        lock(&shared.records).push(record);
    }
}

fn make_record<J: Job>(
    job: &J,
    stage: Stage,
    outcome: Outcome,
    outputs: Vec<PathBuf>,
    warnings: Vec<String>,
    duration_secs: f64,
) -> ReportRecord {
    ReportRecord {
        task_id: job.id().to_string(),
        subject: job.subject().to_string(),
        session: job.session().map(str::to_string),
        stage,
        outcome,
        warnings,
        outputs,
        duration_secs,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
