use crate::discovery::SubjectSession;
use crate::error::Error;
use crate::metadata::RawSeries;
use crate::naming::SessionIdentity;
use crate::rules::{ClassifiedScan, RuleSet};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// `pending -> running -> succeeded | failed`, or `pending -> cancelled`.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Pending, TaskState::Running)
                | (TaskState::Pending, TaskState::Cancelled)
                | (TaskState::Running, TaskState::Succeeded)
                | (TaskState::Running, TaskState::Failed)
        )
    }

    /// Move to `next` if the transition is legal. `id` names the job in the log.
    pub fn advance(&mut self, next: TaskState, id: &str) -> bool {
        if !self.can_transition_to(next) {
            warn!("Ignoring {:?} -> {:?} for {}", self, next, id);
            return false;
        }
        *self = next;
        true
    }
}

/// Anything the executor can schedule.
pub trait Job: Send {
    fn id(&self) -> &str;
    fn subject(&self) -> &str;
    fn session(&self) -> Option<&str>;
    fn state(&self) -> TaskState;
    /// Returns false, leaving the state untouched, on an illegal transition.
    fn set_state(&mut self, next: TaskState) -> bool;
}

/// Conversion of one subject/session.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub identity: SessionIdentity,
    pub scans: Vec<ClassifiedScan>,
    pub output_path: PathBuf,
    state: TaskState,
}

impl Task {
    pub fn new(identity: SessionIdentity, scans: Vec<ClassifiedScan>, output_root: &Path) -> Self {
        let mut output_path = output_root.join(identity.subject.as_str());
        if let Some(session) = &identity.session {
            output_path.push(session.as_str());
        }
        Self {
            id: identity.task_id(),
            identity,
            scans,
            output_path,
            state: TaskState::Pending,
        }
    }
}

impl Job for Task {
    fn id(&self) -> &str {
        &self.id
    }

    fn subject(&self) -> &str {
        self.identity.subject.as_str()
    }

    fn session(&self) -> Option<&str> {
        self.identity.session.as_ref().map(|s| s.as_str())
    }

    fn state(&self) -> TaskState {
        self.state
    }

    fn set_state(&mut self, next: TaskState) -> bool {
        self.state.advance(next, &self.id)
    }
}

/// A series kept out of the canonical tree.
#[derive(Debug, Clone)]
pub struct UnclassifiedScan {
    pub identity: SessionIdentity,
    pub series: RawSeries,
    /// Set when an `unclassified` rule matched, empty when no rule did.
    pub rule_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct TaskPlan {
    pub tasks: Vec<Task>,
    pub warnings: Vec<String>,
    pub unclassified: Vec<UnclassifiedScan>,
}

impl TaskPlan {
    pub fn scan_count(&self) -> usize {
        self.tasks.iter().map(|t| t.scans.len()).sum()
    }
}

/// Classify every series and group the results into one task per
/// subject/session, ordered by (subject, session).
pub fn build_tasks(mut sessions: Vec<SubjectSession>, rules: &RuleSet, output_root: &Path) -> TaskPlan {
    sessions.sort_by(|a, b| a.identity.cmp(&b.identity));
    let mut plan = TaskPlan::default();

    for session in sessions {
        let identity = session.identity;
        let mut scans = Vec::new();

        for series in session.series {
            let scan = rules.classify(series, &identity);
            if scan.is_classified() {
                scans.push(scan);
                continue;
            }
            if scan.rule.is_none() {
                let e = Error::NoRuleMatched(scan.series.describe());
                warn!("{}: {}", identity, e);
                plan.warnings.push(format!("{}: {}", identity, e));
            }
            plan.unclassified.push(UnclassifiedScan {
                identity: identity.clone(),
                rule_id: scan.rule.as_ref().map(|r| r.id.clone()),
                series: scan.series,
            });
        }

        if scans.is_empty() {
            warn!("No classified scans for {}; skipped", identity);
            plan.warnings
                .push(format!("No classified scans for {}; skipped", identity));
            continue;
        }

        disambiguate_runs(&mut scans, &identity);
        scans.sort_by(|a, b| {
            a.category()
                .cmp(&b.category())
                .then_with(|| a.stem.cmp(&b.stem))
                .then_with(|| a.series.path.cmp(&b.series.path))
        });

        debug!("Task {} with {} scans", identity, scans.len());
        plan.tasks.push(Task::new(identity, scans, output_root));
    }

    plan
}

/// Scans sharing a stem inside one task get `run-01`, `run-02`… in
/// source-path order. A run number whose stem another scan of the task
/// already uses is skipped.
fn disambiguate_runs(scans: &mut [ClassifiedScan], identity: &SessionIdentity) {
    let mut by_stem: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (index, scan) in scans.iter().enumerate() {
        if let Some(stem) = &scan.stem {
            by_stem.entry(stem.clone()).or_default().push(index);
        }
    }
    let mut taken: HashSet<String> = by_stem
        .iter()
        .filter(|(_, indices)| indices.len() == 1)
        .map(|(stem, _)| stem.clone())
        .collect();

    for (stem, mut indices) in by_stem {
        if indices.len() < 2 {
            continue;
        }
        indices.sort_by(|a, b| scans[*a].series.path.cmp(&scans[*b].series.path));
        debug!("{} series share {}; numbering runs", indices.len(), stem);
        let mut run = 0;
        for index in indices {
            let (value, renamed) = loop {
                run += 1;
                let value = format!("{:02}", run);
                match scans[index].stem_with("run", &value, identity) {
                    Some(candidate) if taken.contains(&candidate) => continue,
                    Some(candidate) => break (value, candidate),
                    None => break (value, stem.clone()),
                }
            };
            scans[index].set_entity("run", &value, identity);
            taken.insert(renamed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MetadataRecord, MetadataValue};
    use crate::naming::Normalizer;
    use crate::rules::ScanCategory;

    const RULES: &str = r#"{"descriptions": [
        {"id": "t1", "datatype": "anat", "suffix": "T1w", "criteria": {"SeriesDescription": "*T1*"}},
        {"id": "rest", "datatype": "func", "suffix": "bold", "custom_entities": "task-rest",
         "criteria": {"SeriesDescription": "*rest*"}},
        {"id": "loc", "datatype": "unclassified", "suffix": "localizer",
         "criteria": {"SeriesDescription": "*localizer*"}}
    ]}"#;

    fn session(subject: &str, session: Option<&str>, descriptions: &[&str]) -> SubjectSession {
        let n = Normalizer::default();
        let identity = SessionIdentity::new(
            n.normalize_subject(subject).unwrap(),
            session.and_then(|s| n.normalize_session(s)),
        );
        let source = PathBuf::from("/in").join(subject);
        let series = descriptions
            .iter()
            .enumerate()
            .map(|(i, d)| RawSeries {
                path: source.join(format!("{:02}_{}", i, d)),
                slices: vec![],
                metadata: MetadataRecord::new()
                    .with("SeriesDescription", MetadataValue::Text(d.to_string())),
            })
            .collect();
        SubjectSession {
            raw_label: subject.to_string(),
            identity,
            source,
            series,
        }
    }

    fn rules() -> RuleSet {
        RuleSet::from_json_str(RULES).unwrap()
    }

    #[test]
    fn test_tasks_are_ordered_by_identity() {
        let sessions = vec![
            session("002", Some("MRI1"), &["T1"]),
            session("001", Some("MRI2"), &["T1"]),
            session("001", Some("MRI1"), &["T1"]),
        ];
        let plan = build_tasks(sessions, &rules(), Path::new("/out"));
        let ids: Vec<&str> = plan.tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["subject-001/session-01", "subject-001/session-02", "subject-002/session-01"]
        );
        assert_eq!(
            plan.tasks[0].output_path,
            PathBuf::from("/out/subject-001/session-01")
        );
        assert!(plan.tasks.iter().all(|t| t.state() == TaskState::Pending));
    }

    #[test]
    fn test_scans_sorted_by_category_then_stem() {
        let plan = build_tasks(
            vec![session("001", None, &["rest", "T1"])],
            &rules(),
            Path::new("/out"),
        );
        let task = &plan.tasks[0];
        assert_eq!(task.scans[0].category(), ScanCategory::Anatomical);
        assert_eq!(task.scans[1].stem.as_deref(), Some("subject-001_task-rest_bold"));
        assert_eq!(task.output_path, PathBuf::from("/out/subject-001"));
    }

    #[test]
    fn test_empty_session_is_skipped_with_warning() {
        let plan = build_tasks(
            vec![
                session("001", Some("MRI1"), &["DTI", "localizer"]),
                session("002", Some("MRI1"), &["T1"]),
            ],
            &rules(),
            Path::new("/out"),
        );
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.unclassified.len(), 2);
        // one NoRuleMatched (DTI) plus the skipped session; the localizer rule is silent
        assert_eq!(plan.warnings.len(), 2);
        assert!(plan.warnings[0].contains("No classification rule matched"));
        assert_eq!(plan.unclassified[1].rule_id.as_deref(), Some("loc"));
    }

    #[test]
    fn test_repeated_stems_get_run_numbers() {
        let plan = build_tasks(
            vec![session("001", Some("MRI1"), &["rest_a", "T1", "rest_b"])],
            &rules(),
            Path::new("/out"),
        );
        let stems: Vec<&str> = plan.tasks[0]
            .scans
            .iter()
            .filter_map(|s| s.stem.as_deref())
            .collect();
        assert_eq!(
            stems,
            vec![
                "subject-001_session-01_T1w",
                "subject-001_session-01_task-rest_run-01_bold",
                "subject-001_session-01_task-rest_run-02_bold",
            ]
        );
        assert!(plan.tasks[0].scans[1].series.path.ends_with("00_rest_a"));
    }

    #[test]
    fn test_run_numbers_skip_indices_already_in_use() {
        let rules = RuleSet::from_json_str(
            r#"{"descriptions": [
                {"id": "rest-second", "datatype": "func", "suffix": "bold",
                 "custom_entities": "task-rest_run-02", "criteria": {"SeriesDescription": "*second*"}},
                {"id": "rest", "datatype": "func", "suffix": "bold", "custom_entities": "task-rest",
                 "criteria": {"SeriesDescription": "*rest*"}}
            ]}"#,
        )
        .unwrap();
        let plan = build_tasks(
            vec![session("001", None, &["rest_second", "rest_a", "rest_b"])],
            &rules,
            Path::new("/out"),
        );
        let scans = &plan.tasks[0].scans;
        let stems: Vec<&str> = scans.iter().filter_map(|s| s.stem.as_deref()).collect();
        assert_eq!(
            stems,
            vec![
                "subject-001_task-rest_run-01_bold",
                "subject-001_task-rest_run-02_bold",
                "subject-001_task-rest_run-03_bold",
            ]
        );
        assert!(scans[1].series.path.ends_with("00_rest_second"));
        assert!(scans[2].series.path.ends_with("02_rest_b"));
    }

    #[test]
    fn test_state_machine() {
        assert!(TaskState::Pending.can_transition_to(TaskState::Running));
        assert!(TaskState::Pending.can_transition_to(TaskState::Cancelled));
        assert!(!TaskState::Running.can_transition_to(TaskState::Cancelled));
        assert!(!TaskState::Succeeded.can_transition_to(TaskState::Failed));

        let mut state = TaskState::Pending;
        assert!(!state.advance(TaskState::Succeeded, "subject-001"));
        assert_eq!(state, TaskState::Pending);
        assert!(state.advance(TaskState::Cancelled, "subject-001"));
        assert!(!state.advance(TaskState::Running, "subject-001"));
        assert_eq!(state, TaskState::Cancelled);

        let plan = build_tasks(vec![session("001", None, &["T1"])], &rules(), Path::new("/out"));
        let mut task = plan.tasks.into_iter().next().unwrap();
        assert!(!task.set_state(TaskState::Succeeded));
        assert!(task.set_state(TaskState::Running));
        assert!(task.set_state(TaskState::Failed));
        assert!(task.state().is_terminal());
    }
}
