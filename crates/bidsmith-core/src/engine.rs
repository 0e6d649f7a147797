use crate::cancel::CancellationToken;
use crate::config::AppConfig;
use crate::convert::{CommandConverter, Converter, TaskRunner};
use crate::discovery::{self, SessionFilter};
use crate::error::Error;
use crate::executor::{Executor, ProgressHandle, ReportLog, TaskOutput};
use crate::metadata::{CommandReader, DicomReader, MetadataReader};
use crate::naming::{Normalizer, SubjectLabel};
use crate::preprocess::{eligible_subjects, CommandPreprocessor, PreprocessJob, PreprocessRequest, Preprocessor};
use crate::progress::ProgressReporter;
use crate::report::{write_report, Report, ReportContext, Stage};
use crate::rules::RuleSet;
use crate::tasks::{build_tasks, Task, TaskPlan, UnclassifiedScan};
use chrono::Local;
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DATASET_DESCRIPTION: &str = "dataset_description.json";
pub const BIDS_VERSION: &str = "1.8.0";
pub const DERIVATIVES_DIR: &str = "derivatives";
pub const UNCLASSIFIED_AUDIT_DIR: &str = "sourcedata/unclassified";
/// Written and removed during pre-flight to prove the output root is writable.
pub const WRITE_CHECK_NAME: &str = ".bidsmith-write-check";

#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub filter: SessionFilter,
    /// Shown in the report only.
    pub rules_file: Option<PathBuf>,
    /// Preprocess subjects already present in the output tree without converting.
    pub skip_conversion: bool,
    pub skip_preprocessing: bool,
    /// Discover and classify only. Nothing is written.
    pub dry_run: bool,
}

#[derive(Debug)]
pub struct RunResult {
    pub report: Report,
    /// (text, JSON). `None` for a dry run or when writing failed.
    pub report_files: Option<(PathBuf, PathBuf)>,
    /// In (subject, session) order with their final states.
    pub tasks: Vec<Task>,
    pub unclassified: Vec<UnclassifiedScan>,
    pub duration: Duration,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.report.is_success()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct DatasetDescription<'a> {
    name: &'a str,
    #[serde(rename = "BIDSVersion")]
    bids_version: &'a str,
    dataset_type: &'a str,
    generated_by: Vec<GeneratedBy<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct GeneratedBy<'a> {
    name: &'a str,
    version: &'a str,
}

pub struct ConversionEngine {
    config: AppConfig,
    rules: RuleSet,
    normalizer: Normalizer,
    reader: Box<dyn MetadataReader>,
    converter: Box<dyn Converter>,
    preprocessor: Box<dyn Preprocessor>,
    cancel: CancellationToken,
    progress: ProgressHandle,
}

impl ConversionEngine {
    pub fn new(config: AppConfig, rules: RuleSet) -> Self {
        let reader: Box<dyn MetadataReader> = match CommandReader::from_config(&config.reader) {
            Some(reader) => Box::new(reader),
            None => Box::new(DicomReader::new(&config.reader)),
        };
        let converter = Box::new(CommandConverter::from_config(&config));
        let preprocessor = Box::new(CommandPreprocessor::from_config(&config.preprocessor));
        Self {
            config,
            rules,
            normalizer: Normalizer::default(),
            reader,
            converter,
            preprocessor,
            cancel: CancellationToken::new(),
            progress: ProgressHandle::default(),
        }
    }

    pub fn with_reader(mut self, reader: Box<dyn MetadataReader>) -> Self {
        self.reader = reader;
        self
    }

    pub fn with_converter(mut self, converter: Box<dyn Converter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn with_preprocessor(mut self, preprocessor: Box<dyn Preprocessor>) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    /// Get a clone of the cancellation token (for Ctrl-C handlers).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Live counters of whichever batch is running.
    pub fn progress(&self) -> ProgressHandle {
        self.progress.clone()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    /// Discover, classify and build tasks. Discovery warnings come first in
    /// the plan's warnings.
    pub fn plan(
        &self,
        input_root: &Path,
        output_root: &Path,
        filter: &SessionFilter,
        reporter: &dyn ProgressReporter,
    ) -> Result<TaskPlan, Error> {
        reporter.on_discovery_start(&input_root.to_string_lossy());
        let start = Instant::now();
        let found = discovery::discover(input_root, &self.normalizer, self.reader.as_ref(), filter)?;
        let duration = start.elapsed();
        reporter.on_discovery_complete(found.sessions.len(), found.series_count(), duration.as_secs_f64());
        info!(
            "Discovered {} session(s) with {} series in {:.2}s",
            found.sessions.len(),
            found.series_count(),
            duration.as_secs_f64()
        );

        let mut plan = build_tasks(found.sessions, &self.rules, output_root);
        let mut warnings = found.warnings;
        warnings.append(&mut plan.warnings);
        plan.warnings = warnings;
        info!(
            "Planned {} task(s), {} scan(s), {} unclassified series",
            plan.tasks.len(),
            plan.scan_count(),
            plan.unclassified.len()
        );
        Ok(plan)
    }

    /// Run the full pipeline:
    /// 1. Discovery, classification and task building
    /// 2. Pre-flight: output root and dataset description
    /// 3. Conversion batch, one task per subject/session
    /// 4. Preprocessing batch, one job per fully converted subject
    /// 5. Report files in the output root
    pub fn run(
        &self,
        input_root: &Path,
        output_root: &Path,
        options: &EngineOptions,
        reporter: &dyn ProgressReporter,
    ) -> Result<RunResult, Error> {
        let started = Local::now();
        let clock = Instant::now();
        let mut plan = self.plan(input_root, output_root, &options.filter, reporter)?;

        if options.dry_run {
            info!("Dry run: nothing written");
            return Ok(RunResult {
                report: Report::aggregate(Vec::new(), plan.warnings),
                report_files: None,
                tasks: plan.tasks,
                unclassified: plan.unclassified,
                duration: clock.elapsed(),
            });
        }

        self.preflight(output_root)?;
        let audit_warnings = write_audit_copies(output_root, &plan.unclassified);
        plan.warnings.extend(audit_warnings);

        let log = ReportLog::default();
        let mut tasks = std::mem::take(&mut plan.tasks);

        if options.skip_conversion {
            info!("Skipping conversion");
        } else {
            let executor = Executor::new(self.config.workers, self.cancel.clone())
                .with_report_log(log.clone())
                .with_progress(self.progress.clone());
            let converter_options = self
                .rules
                .converter_options()
                .unwrap_or(&self.config.converter.options);
            let runner = TaskRunner::new(
                self.converter.as_ref(),
                converter_options,
                self.config.converter.expected_extension.as_str(),
            )
            .with_timeout(self.config.task_timeout());
            let outcome = executor.run(tasks, Stage::Conversion, reporter, |task| runner.run(task))?;
            tasks = outcome.jobs;
        }

        if options.skip_preprocessing {
            info!("Skipping preprocessing");
        } else {
            let subjects = if options.skip_conversion {
                converted_subjects(output_root, &tasks)
            } else {
                eligible_subjects(&tasks)
            };
            self.preprocess(output_root, subjects, &log, reporter)?;
        }

        let context = ReportContext {
            input_root: input_root.to_path_buf(),
            output_root: output_root.to_path_buf(),
            rules_file: options.rules_file.clone(),
            started,
            finished: Local::now(),
        };
        let report = Report::aggregate(log.snapshot(), plan.warnings);
        let report_files = match write_report(&report, &context) {
            Ok(paths) => Some(paths),
            Err(e) => {
                warn!("Could not save report: {}", e);
                None
            }
        };

        Ok(RunResult {
            report,
            report_files,
            tasks,
            unclassified: plan.unclassified,
            duration: clock.elapsed(),
        })
    }

    fn preflight(&self, output_root: &Path) -> Result<(), Error> {
        fs::create_dir_all(output_root).map_err(|e| Error::filesystem(output_root, e))?;
        let check = output_root.join(WRITE_CHECK_NAME);
        fs::write(&check, b"")
            .and_then(|_| fs::remove_file(&check))
            .map_err(|e| Error::filesystem(&check, e))?;

        let path = output_root.join(DATASET_DESCRIPTION);
        if path.exists() {
            debug!("{} already present", path.display());
            return Ok(());
        }
        let description = DatasetDescription {
            name: &self.config.dataset_name,
            bids_version: BIDS_VERSION,
            dataset_type: "raw",
            generated_by: vec![GeneratedBy {
                name: "bidsmith",
                version: env!("CARGO_PKG_VERSION"),
            }],
        };
        let text = serde_json::to_string_pretty(&description)?;
        fs::write(&path, text).map_err(|e| Error::filesystem(&path, e))?;
        info!("Created {}", path.display());
        Ok(())
    }

    fn preprocess(
        &self,
        output_root: &Path,
        subjects: Vec<SubjectLabel>,
        log: &ReportLog,
        reporter: &dyn ProgressReporter,
    ) -> Result<(), Error> {
        if subjects.is_empty() {
            info!("No subjects eligible for preprocessing");
            return Ok(());
        }
        let derivatives_dir = output_root.join(DERIVATIVES_DIR);
        fs::create_dir_all(&derivatives_dir).map_err(|e| Error::filesystem(&derivatives_dir, e))?;

        let executor = Executor::new(Some(self.config.preprocessor.workers), self.cancel.clone())
            .with_report_log(log.clone())
            .with_progress(self.progress.clone());
        let jobs: Vec<PreprocessJob> = subjects.into_iter().map(PreprocessJob::new).collect();
        executor.run(jobs, Stage::Preprocessing, reporter, |job| {
            self.preprocessor
                .preprocess(&PreprocessRequest {
                    bids_dir: output_root,
                    derivatives_dir: &derivatives_dir,
                    subject: &job.subject,
                })
                .map(|_| TaskOutput::default())
        })?;
        Ok(())
    }
}

/// With conversion skipped, a subject is ready when its folder exists.
fn converted_subjects(output_root: &Path, tasks: &[Task]) -> Vec<SubjectLabel> {
    let mut subjects: Vec<SubjectLabel> = tasks.iter().map(|t| t.identity.subject.clone()).collect();
    subjects.sort();
    subjects.dedup();
    subjects.retain(|s| {
        let present = output_root.join(s.as_str()).is_dir();
        if !present {
            warn!("Not preprocessing {}: no converted data in {}", s, output_root.display());
        }
        present
    });
    subjects
}

/// Keep a copy of each unclassified series' metadata next to the output.
/// Returns one warning per copy that could not be written.
fn write_audit_copies(output_root: &Path, unclassified: &[UnclassifiedScan]) -> Vec<String> {
    let mut warnings = Vec::new();
    let mut used: HashSet<PathBuf> = HashSet::new();

    for scan in unclassified {
        let mut dir = output_root.join(UNCLASSIFIED_AUDIT_DIR).join(scan.identity.subject.as_str());
        if let Some(session) = &scan.identity.session {
            dir.push(session.as_str());
        }

        let name = scan.series.name();
        let mut path = dir.join(format!("{}.json", name));
        let mut n = 2;
        while used.contains(&path) {
            path = dir.join(format!("{}-{}.json", name, n));
            n += 1;
        }
        used.insert(path.clone());

        let document = json!({
            "source": scan.series.path,
            "slices": scan.series.slices.len(),
            "rule": scan.rule_id,
            "metadata": scan.series.metadata,
        });
        let written = fs::create_dir_all(&dir).and_then(|_| {
            let text = serde_json::to_string_pretty(&document).map_err(std::io::Error::from)?;
            fs::write(&path, text)
        });
        match written {
            Ok(()) => debug!("Audit copy {}", path.display()),
            Err(e) => {
                warn!("Could not write audit copy {}: {}", path.display(), e);
                warnings.push(format!("Could not write audit copy {}: {}", path.display(), e));
            }
        }
    }

    warnings
}
