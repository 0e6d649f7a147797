use crate::config::AppConfig;
use crate::error::Error;
use crate::executor::TaskOutput;
use crate::process::run_captured;
use crate::tasks::Task;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// One series to convert into `<output_dir>/<stem>.*`.
#[derive(Debug, Clone, Copy)]
pub struct ConversionRequest<'a> {
    pub input: &'a Path,
    pub output_dir: &'a Path,
    pub stem: &'a str,
    pub options: &'a str,
    /// What is left of the task's time budget.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct ConversionOutput {
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ConversionOutput {
    /// Lines the converter flagged as warnings.
    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.stdout
            .lines()
            .chain(self.stderr.lines())
            .map(str::trim)
            .filter(|line| line.to_ascii_lowercase().starts_with("warning"))
    }
}

/// Turns a slice stack into a volumetric file plus JSON sidecar.
pub trait Converter: Send + Sync {
    fn convert(&self, request: &ConversionRequest<'_>) -> Result<ConversionOutput, Error>;
}

/// Runs `<program> <options…> -o <output_dir> -f <stem> <input>`, killed
/// once the request's timeout runs out.
pub struct CommandConverter {
    program: String,
}

impl CommandConverter {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.converter.program.clone())
    }
}

impl Converter for CommandConverter {
    fn convert(&self, request: &ConversionRequest<'_>) -> Result<ConversionOutput, Error> {
        let mut cmd = Command::new(&self.program);
        cmd.args(request.options.split_whitespace())
            .arg("-o")
            .arg(request.output_dir)
            .arg("-f")
            .arg(request.stem)
            .arg(request.input);
        debug!("Running {:?}", cmd);

        let output = run_captured(&mut cmd, request.timeout)?;
        if !output.success() {
            return Err(Error::ConverterFailure {
                status: output.status_text(),
                diagnostic: output.diagnostic(),
            });
        }
        Ok(ConversionOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            duration: output.duration,
        })
    }
}

/// Converts every classified scan of one task into its output subtree.
pub struct TaskRunner<'a> {
    converter: &'a dyn Converter,
    options: String,
    expected_extension: String,
    timeout: Option<Duration>,
}

impl<'a> TaskRunner<'a> {
    pub fn new(converter: &'a dyn Converter, options: impl Into<String>, expected_extension: impl Into<String>) -> Self {
        Self {
            converter,
            options: options.into(),
            expected_extension: expected_extension.into().trim_start_matches('.').to_string(),
            timeout: None,
        }
    }

    /// Time budget for a whole task, shared by all of its scans.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// The task's previous subtree is removed first, so a re-run leaves the
    /// same tree as a first run. The first failing scan fails the task, and
    /// so does running past the task's time budget.
    pub fn run(&self, task: &Task) -> Result<TaskOutput, Error> {
        let deadline = self.timeout.map(|limit| (Instant::now() + limit, limit));

        if task.output_path.exists() {
            debug!("Removing previous output {}", task.output_path.display());
            fs::remove_dir_all(&task.output_path).map_err(|e| Error::filesystem(&task.output_path, e))?;
        }

        let mut result = TaskOutput::default();
        for scan in &task.scans {
            let Some(stem) = scan.stem.as_deref() else {
                continue;
            };
            let output_dir = task.output_path.join(scan.category().dir_name());
            fs::create_dir_all(&output_dir).map_err(|e| Error::filesystem(&output_dir, e))?;

            let remaining = match deadline {
                Some((at, limit)) => {
                    let left = at.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(Error::Timeout(limit));
                    }
                    Some(left)
                }
                None => None,
            };
            let request = ConversionRequest {
                input: &scan.series.path,
                output_dir: &output_dir,
                stem,
                options: &self.options,
                timeout: remaining,
            };
            let output = self.converter.convert(&request).map_err(|e| match (e, deadline) {
                (Error::Timeout(_), Some((_, limit))) => Error::Timeout(limit),
                (e, _) => e,
            })?;
            result
                .warnings
                .extend(output.warnings().map(|w| format!("{}: {}", stem, w)));

            let expected = output_dir.join(format!("{}.{}", stem, self.expected_extension));
            if !expected.is_file() {
                return Err(Error::MissingOutput(expected));
            }
            result.outputs.push(expected);
        }

        if let Some((at, limit)) = deadline {
            if Instant::now() > at {
                return Err(Error::Timeout(limit));
            }
        }

        info!("Converted {} ({} volumes)", task.id, result.outputs.len());
        Ok(result)
    }
}
