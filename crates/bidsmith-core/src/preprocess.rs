use crate::config::PreprocessorConfig;
use crate::error::Error;
use crate::naming::SubjectLabel;
use crate::process::run_captured;
use crate::tasks::{Job, Task, TaskState};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct PreprocessRequest<'a> {
    pub bids_dir: &'a Path,
    pub derivatives_dir: &'a Path,
    pub subject: &'a SubjectLabel,
}

/// Runs the preprocessing pipeline for one subject.
pub trait Preprocessor: Send + Sync {
    fn preprocess(&self, request: &PreprocessRequest<'_>) -> Result<(), Error>;
}

/// Runs a configured command. Each argument may use `{bids_dir}`,
/// `{derivatives_dir}`, `{participant}` (the bare id, `001`) and `{subject}`
/// (the full label).
pub struct CommandPreprocessor {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandPreprocessor {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Option<Duration>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    pub fn from_config(config: &PreprocessorConfig) -> Self {
        Self::new(
            config.program.clone(),
            config.args.clone(),
            config.timeout_secs.filter(|s| *s > 0).map(Duration::from_secs),
        )
    }

    fn expand(&self, request: &PreprocessRequest<'_>) -> Vec<String> {
        let bids_dir = request.bids_dir.to_string_lossy();
        let derivatives_dir = request.derivatives_dir.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{bids_dir}", &bids_dir)
                    .replace("{derivatives_dir}", &derivatives_dir)
                    .replace("{participant}", request.subject.id())
                    .replace("{subject}", request.subject.as_str())
            })
            .collect()
    }
}

impl Preprocessor for CommandPreprocessor {
    fn preprocess(&self, request: &PreprocessRequest<'_>) -> Result<(), Error> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.expand(request));
        debug!("Running {:?}", cmd);

        let output = run_captured(&mut cmd, self.timeout)?;
        if !output.success() {
            return Err(Error::PreprocessingFailure {
                status: output.status_text(),
                diagnostic: output.diagnostic(),
            });
        }
        info!(
            "Preprocessed {} in {:.1}s",
            request.subject,
            output.duration.as_secs_f64()
        );
        Ok(())
    }
}

/// Preprocessing of one subject, scheduled like a conversion task.
#[derive(Debug, Clone)]
pub struct PreprocessJob {
    pub subject: SubjectLabel,
    state: TaskState,
}

impl PreprocessJob {
    pub fn new(subject: SubjectLabel) -> Self {
        Self {
            subject,
            state: TaskState::Pending,
        }
    }
}

impl Job for PreprocessJob {
    fn id(&self) -> &str {
        self.subject.as_str()
    }

    fn subject(&self) -> &str {
        self.subject.as_str()
    }

    fn session(&self) -> Option<&str> {
        None
    }

    fn state(&self) -> TaskState {
        self.state
    }

    fn set_state(&mut self, next: TaskState) -> bool {
        self.state.advance(next, self.subject.as_str())
    }
}

/// Subjects whose every conversion task succeeded, in label order.
pub fn eligible_subjects(tasks: &[Task]) -> Vec<SubjectLabel> {
    let mut all_ok: BTreeMap<&SubjectLabel, bool> = BTreeMap::new();
    for task in tasks {
        let ok = all_ok.entry(&task.identity.subject).or_insert(true);
        *ok &= task.state() == TaskState::Succeeded;
    }
    all_ok
        .into_iter()
        .filter_map(|(subject, ok)| {
            if !ok {
                warn!("Not preprocessing {}: a conversion task did not succeed", subject);
            }
            ok.then(|| subject.clone())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::Normalizer;
    use std::path::PathBuf;

    fn subject(raw: &str) -> SubjectLabel {
        Normalizer::default().normalize_subject(raw).unwrap()
    }

    #[test]
    fn test_placeholders_are_expanded() {
        let pre = CommandPreprocessor::from_config(&PreprocessorConfig::default());
        let label = subject("001");
        let args = pre.expand(&PreprocessRequest {
            bids_dir: Path::new("/out"),
            derivatives_dir: Path::new("/out/derivatives"),
            subject: &label,
        });
        assert_eq!(
            args,
            vec!["/out", "/out/derivatives", "participant", "--participant-label", "001"]
        );
    }

    #[test]
    fn test_only_fully_converted_subjects_are_eligible() {
        let n = Normalizer::default();
        let make = |subj: &str, ses: &str, state: TaskState| {
            let identity = crate::naming::SessionIdentity::new(
                n.normalize_subject(subj).unwrap(),
                n.normalize_session(ses),
            );
            let mut task = Task::new(identity, vec![], &PathBuf::from("/out"));
            task.set_state(TaskState::Running);
            task.set_state(state);
            task
        };
        let tasks = vec![
            make("001", "MRI1", TaskState::Succeeded),
            make("001", "MRI2", TaskState::Succeeded),
            make("002", "MRI1", TaskState::Succeeded),
            make("002", "MRI2", TaskState::Failed),
        ];
        assert_eq!(eligible_subjects(&tasks), vec![subject("001")]);
    }

    #[test]
    fn test_job_identity() {
        let mut job = PreprocessJob::new(subject("007"));
        assert_eq!(job.id(), "subject-007");
        assert_eq!(job.session(), None);
        assert_eq!(job.state(), TaskState::Pending);
        assert!(!job.set_state(TaskState::Failed));
        assert!(job.set_state(TaskState::Running));
        assert!(job.set_state(TaskState::Succeeded));
        assert!(!job.set_state(TaskState::Cancelled));
        assert_eq!(job.state(), TaskState::Succeeded);
    }

    #[cfg(unix)]
    #[test]
    fn test_nonzero_exit_is_preprocessing_failure() {
        let pre = CommandPreprocessor::new("false", vec![], None);
        let label = subject("001");
        let result = pre.preprocess(&PreprocessRequest {
            bids_dir: Path::new("/out"),
            derivatives_dir: Path::new("/out/derivatives"),
            subject: &label,
        });
        assert!(matches!(result, Err(Error::PreprocessingFailure { .. })));
    }
}
