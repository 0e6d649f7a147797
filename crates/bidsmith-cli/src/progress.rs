use bidsmith_core::report::format_duration;
use bidsmith_core::{Outcome, ProgressReporter, ProgressSnapshot, ReportRecord, Stage};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const TICKS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

/// CLI progress reporter using indicatif progress bars.
///
/// - Discovery: spinner (number of folders unknown upfront)
/// - Conversion and preprocessing: bar over the batch, message lists running tasks
pub struct CliReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn guard(&self) -> MutexGuard<'_, Option<ProgressBar>> {
        self.bar.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_bar(&self, pb: ProgressBar) {
        let mut guard = self.guard();
        if let Some(old) = guard.take() {
            old.finish_and_clear();
        }
        *guard = Some(pb);
    }

    fn finish_bar(&self) {
        if let Some(pb) = self.guard().take() {
            pb.finish_and_clear();
        }
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars(TICKS)
}

fn batch_style(stage: Stage) -> ProgressStyle {
    let template = format!(
        "  {{spinner:.cyan}} {} [{{bar:30.cyan/dim}}] {{pos}}/{{len}} {{msg}}",
        stage
    );
    ProgressStyle::with_template(&template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("━╸─")
        .tick_chars(TICKS)
}

fn running_message(snapshot: &ProgressSnapshot) -> String {
    match snapshot.running.as_slice() {
        [] => String::new(),
        [only] => only.clone(),
        [first, rest @ ..] => format!("{} (+{} more)", first, rest.len()),
    }
}

impl ProgressReporter for CliReporter {
    fn on_discovery_start(&self, input_root: &str) {
        let pb = ProgressBar::new_spinner();
        pb.set_style(spinner_style());
        pb.set_message(format!("Discovering series in {}...", input_root));
        pb.enable_steady_tick(Duration::from_millis(80));
        self.set_bar(pb);
    }

    fn on_discovery_complete(&self, sessions: usize, series: usize, duration_secs: f64) {
        self.finish_bar();
        eprintln!(
            "  \x1b[32m✓\x1b[0m Discovery complete: {} session(s), {} series in {:.2}s",
            sessions, series, duration_secs
        );
    }

    fn on_batch_start(&self, stage: Stage, total: usize, workers: usize) {
        let pb = ProgressBar::new(total as u64);
        pb.set_style(batch_style(stage));
        pb.set_message(format!("{} worker(s)", workers));
        pb.enable_steady_tick(Duration::from_millis(80));
        self.set_bar(pb);
    }

    fn on_task_start(&self, _task_id: &str, snapshot: &ProgressSnapshot) {
        if let Some(pb) = self.guard().as_ref() {
            pb.set_message(running_message(snapshot));
        }
    }

    fn on_task_finish(&self, record: &ReportRecord, snapshot: &ProgressSnapshot) {
        if let Some(pb) = self.guard().as_ref() {
            pb.set_position(snapshot.completed as u64);
            pb.set_message(running_message(snapshot));
            if let Outcome::Failed { cause, .. } = &record.outcome {
                pb.println(format!(
                    "  \x1b[31m✗\x1b[0m {} failed: {}",
                    record.task_id,
                    cause.title()
                ));
            }
        }
    }

    fn on_batch_complete(&self, stage: Stage, snapshot: &ProgressSnapshot, duration_secs: f64) {
        self.finish_bar();
        eprintln!(
            "  \x1b[32m✓\x1b[0m {} complete: {} succeeded, {} failed, {} cancelled in {}",
            stage,
            snapshot.succeeded,
            snapshot.failed,
            snapshot.cancelled,
            format_duration(duration_secs)
        );
    }
}
