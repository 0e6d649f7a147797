use crate::executor::ProgressSnapshot;
use crate::report::{ReportRecord, Stage};

/// Trait for reporting pipeline progress.
///
/// CLI implements with indicatif; tests use it to observe the scheduler.
/// All methods have default no-op implementations. Task callbacks are invoked
/// while the executor holds its progress lock, so implementations never see
/// two callbacks at once and must not block.
pub trait ProgressReporter: Send + Sync {
    fn on_discovery_start(&self, _input_root: &str) {}
    fn on_discovery_complete(&self, _sessions: usize, _series: usize, _duration_secs: f64) {}
    fn on_batch_start(&self, _stage: Stage, _total: usize, _workers: usize) {}
    fn on_task_start(&self, _task_id: &str, _snapshot: &ProgressSnapshot) {}
    fn on_task_finish(&self, _record: &ReportRecord, _snapshot: &ProgressSnapshot) {}
    fn on_batch_complete(&self, _stage: Stage, _snapshot: &ProgressSnapshot, _duration_secs: f64) {}
}

/// No-op progress reporter for silent operation.
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}
