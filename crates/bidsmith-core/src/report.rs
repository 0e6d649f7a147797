//! Per-task outcomes folded into the final conversion report.
//!
//! [`Report::aggregate`] is a pure function of the records, so it can be
//! called on a mid-run snapshot of the executor's log as well as at the end.

use crate::error::Error;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const TEXT_REPORT_NAME: &str = "conversion_report.txt";
pub const JSON_REPORT_NAME: &str = "conversion_report.json";
const DIAGNOSTIC_LIMIT: usize = 300;
const RULE_WIDTH: usize = 70;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Conversion,
    Preprocessing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Conversion => f.write_str("conversion"),
            Stage::Preprocessing => f.write_str("preprocessing"),
        }
    }
}

/// Category of a task failure, used to group failures and explain them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    ConverterFailure,
    Timeout,
    MissingOutput,
    Filesystem,
    Preprocessing,
    Panic,
}

impl FailureCause {
    pub fn from_error(error: &Error, stage: Stage) -> Self {
        match error {
            Error::Timeout(_) => FailureCause::Timeout,
            Error::MissingOutput(_) => FailureCause::MissingOutput,
            Error::Filesystem { .. } | Error::Io(_) => FailureCause::Filesystem,
            Error::Panic(_) => FailureCause::Panic,
            Error::PreprocessingFailure { .. } => FailureCause::Preprocessing,
            Error::ConverterFailure { .. } => FailureCause::ConverterFailure,
            _ => match stage {
                Stage::Conversion => FailureCause::ConverterFailure,
                Stage::Preprocessing => FailureCause::Preprocessing,
            },
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            FailureCause::ConverterFailure => "Converter failure",
            FailureCause::Timeout => "Timeout",
            FailureCause::MissingOutput => "Missing output",
            FailureCause::Filesystem => "File system error",
            FailureCause::Preprocessing => "Preprocessing failure",
            FailureCause::Panic => "Internal error",
        }
    }

    /// Explanation for someone who does not read stack traces.
    pub fn plain_language(&self, diagnostic: &str) -> String {
        match self {
            FailureCause::Timeout => {
                return "The conversion took too long and was stopped. The data might be very large or the converter may be stuck.".to_string()
            }
            FailureCause::Panic => {
                return "An internal error interrupted this task. Please report it together with the log file.".to_string()
            }
            FailureCause::MissingOutput => {
                return "The converter finished but did not produce the expected image file. The series may be incomplete or corrupted.".to_string()
            }
            _ => {}
        }

        let lower = diagnostic.to_lowercase();
        let hint = if lower.contains("no such file") || lower.contains("not found") {
            "The input files or a required program could not be found. Please check that the folder exists and the converter is installed."
        } else if lower.contains("permission denied") {
            "The program doesn't have permission to access these files. Check folder permissions."
        } else if lower.contains("no space") || lower.contains("disk") {
            "Not enough disk space to complete the conversion."
        } else if lower.contains("memory") {
            "Not enough computer memory (RAM) available."
        } else if lower.contains("no dicom") || lower.contains("no valid") {
            "No valid image slices were found in this folder."
        } else {
            match self {
                FailureCause::Filesystem => "A file or folder could not be written or read.",
                FailureCause::Preprocessing => "The preprocessing pipeline reported a problem. See the detailed error below.",
                _ => "The converter encountered an issue. The scan may be incomplete or corrupted.",
            }
        };
        hint.to_string()
    }
}

/// Terminal result of one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    Succeeded,
    Failed {
        cause: FailureCause,
        diagnostic: String,
    },
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportRecord {
    pub task_id: String,
    pub subject: String,
    pub session: Option<String>,
    pub stage: Stage,
    pub outcome: Outcome,
    pub warnings: Vec<String>,
    pub outputs: Vec<PathBuf>,
    pub duration_secs: f64,
}

impl ReportRecord {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Succeeded)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, Outcome::Failed { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.outcome, Outcome::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StageCounts {
    pub fn success_rate(&self) -> Option<f64> {
        (self.total > 0).then(|| self.succeeded as f64 * 100.0 / self.total as f64)
    }

    fn add(&mut self, outcome: &Outcome) {
        self.total += 1;
        match outcome {
            Outcome::Succeeded => self.succeeded += 1,
            Outcome::Failed { .. } => self.failed += 1,
            Outcome::Cancelled => self.cancelled += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub conversion: StageCounts,
    pub preprocessing: StageCounts,
    pub warning_count: usize,
    pub failures_by_cause: BTreeMap<FailureCause, usize>,
    /// Produced volumes per output folder (`anat`, `func`…).
    pub outputs_by_category: BTreeMap<String, usize>,
    pub warnings: Vec<String>,
    /// In completion order.
    pub records: Vec<ReportRecord>,
}

impl Report {
    pub fn aggregate(records: Vec<ReportRecord>, batch_warnings: Vec<String>) -> Self {
        let mut conversion = StageCounts::default();
        let mut preprocessing = StageCounts::default();
        let mut failures_by_cause = BTreeMap::new();
        let mut outputs_by_category = BTreeMap::new();
        let mut warnings = batch_warnings;

        for record in &records {
            match record.stage {
                Stage::Conversion => conversion.add(&record.outcome),
                Stage::Preprocessing => preprocessing.add(&record.outcome),
            }
            if let Outcome::Failed { cause, .. } = &record.outcome {
                *failures_by_cause.entry(*cause).or_insert(0) += 1;
            }
            if record.stage == Stage::Conversion {
                for output in &record.outputs {
                    let category = output
                        .parent()
                        .and_then(Path::file_name)
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    *outputs_by_category.entry(category).or_insert(0) += 1;
                }
            }
            warnings.extend(
                record
                    .warnings
                    .iter()
                    .map(|w| format!("{}: {}", record.task_id, w)),
            );
        }

        Self {
            conversion,
            preprocessing,
            warning_count: warnings.len(),
            failures_by_cause,
            outputs_by_category,
            warnings,
            records,
        }
    }

    /// No task failed or was cancelled, in either stage.
    pub fn is_success(&self) -> bool {
        self.conversion.failed + self.conversion.cancelled + self.preprocessing.failed + self.preprocessing.cancelled == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &ReportRecord> {
        self.records.iter().filter(|r| r.is_failure())
    }

    pub fn render_text(&self, context: &ReportContext) -> String {
        let mut out = TextWriter::default();
        let c = &self.conversion;

        out.line("");
        out.line(&format!("+{}+", "=".repeat(RULE_WIDTH - 2)));
        out.line(&format!("|{:^68}|", "BIDSMITH CONVERSION REPORT"));
        out.line(&format!("+{}+", "=".repeat(RULE_WIDTH - 2)));
        out.line("");
        out.line(&format!(
            "  Generated: {}",
            context.finished.format("%B %d, %Y at %I:%M %p")
        ));

        out.section("SUMMARY");
        out.line(&format!("  {}", self.banner()));
        out.line("");
        out.line(&format!("  Sessions processed:           {}", c.total));
        out.line(&format!("  Successfully converted:       {}", c.succeeded));
        if c.failed > 0 {
            out.line(&format!("  Failed (needs attention):     {}", c.failed));
        }
        if c.cancelled > 0 {
            out.line(&format!("  Cancelled:                    {}", c.cancelled));
        }
        out.line(&format!("  Warnings:                     {}", self.warning_count));
        out.line(&format!(
            "  Total time:                   {}",
            format_duration(context.elapsed_secs())
        ));
        if let Some(rate) = c.success_rate() {
            out.line(&format!("  Success rate:                 {:.0}%", rate));
        }

        if c.succeeded > 0 {
            out.section("CONVERTED DATA");
            out.line(&format!("  Output location: {}", context.output_root.display()));
            out.line("");
            for (category, count) in &self.outputs_by_category {
                out.line(&format!("    {:<6} {} volume(s)", category, count));
            }
            out.line("");
            let mut succeeded: Vec<&ReportRecord> = self
                .records
                .iter()
                .filter(|r| r.stage == Stage::Conversion && r.is_success())
                .collect();
            succeeded.sort_by(|a, b| a.task_id.cmp(&b.task_id));
            for record in succeeded {
                out.line(&format!(
                    "    [OK] {} ({})",
                    record.task_id,
                    format_duration(record.duration_secs)
                ));
            }
        }

        let mut failed: Vec<&ReportRecord> = self.failures().collect();
        if !failed.is_empty() {
            failed.sort_by(|a, b| (a.stage, &a.task_id).cmp(&(b.stage, &b.task_id)));
            out.section("PROBLEMS THAT NEED ATTENTION");
            for record in failed {
                if let Outcome::Failed { cause, diagnostic } = &record.outcome {
                    out.line(&format!(
                        "    [FAILED] {} ({}, {})",
                        record.task_id,
                        record.stage,
                        cause.title()
                    ));
                    out.line(&format!("             What went wrong: {}", cause.plain_language(diagnostic)));
                    out.line(&format!("             Details: {}", truncate(diagnostic, DIAGNOSTIC_LIMIT)));
                    out.line("");
                }
            }
        }

        let cancelled: Vec<&ReportRecord> = self.records.iter().filter(|r| r.is_cancelled()).collect();
        if !cancelled.is_empty() {
            out.section("CANCELLED");
            for record in cancelled {
                out.line(&format!("    [CANCELLED] {} ({})", record.task_id, record.stage));
            }
        }

        if self.preprocessing.total > 0 {
            out.section("PREPROCESSING");
            for record in self.records.iter().filter(|r| r.stage == Stage::Preprocessing) {
                let status = match &record.outcome {
                    Outcome::Succeeded => "[OK]",
                    Outcome::Failed { .. } => "[FAILED]",
                    Outcome::Cancelled => "[CANCELLED]",
                };
                out.line(&format!(
                    "    {} {} ({})",
                    status,
                    record.subject,
                    format_duration(record.duration_secs)
                ));
            }
        }

        if !self.warnings.is_empty() {
            out.section("NOTES AND WARNINGS");
            for warning in &self.warnings {
                out.line(&format!("    - {}", warning));
            }
        }

        out.section("TECHNICAL DETAILS");
        out.line(&format!("    Source folder:     {}", context.input_root.display()));
        out.line(&format!("    Output folder:     {}", context.output_root.display()));
        if let Some(rules) = &context.rules_file {
            out.line(&format!("    Rules file:        {}", rules.display()));
        }
        out.line(&format!("    Started:           {}", context.started.format("%Y-%m-%d %H:%M:%S")));
        out.line(&format!("    Finished:          {}", context.finished.format("%Y-%m-%d %H:%M:%S")));
        out.line("");

        out.finish()
    }

    fn banner(&self) -> &'static str {
        let c = &self.conversion;
        if c.total == 0 {
            "NO DATA PROCESSED - Nothing was found to convert."
        } else if self.is_success() {
            "SUCCESS! All your data was converted correctly."
        } else if c.succeeded == 0 {
            "CONVERSION FAILED - No data was converted."
        } else {
            "PARTIAL SUCCESS - Some sessions had problems. Please review the errors below."
        }
    }

    pub fn to_json(&self, context: &ReportContext) -> Result<String, Error> {
        let document = ReportDocument {
            input_root: &context.input_root,
            output_root: &context.output_root,
            rules_file: context.rules_file.as_deref(),
            started: context.started.to_rfc3339(),
            finished: context.finished.to_rfc3339(),
            success: self.is_success(),
            report: self,
        };
        Ok(serde_json::to_string_pretty(&document)?)
    }
}

/// Run-level facts the report prints alongside the aggregated records.
#[derive(Debug, Clone)]
pub struct ReportContext {
    pub input_root: PathBuf,
    pub output_root: PathBuf,
    pub rules_file: Option<PathBuf>,
    pub started: DateTime<Local>,
    pub finished: DateTime<Local>,
}

impl ReportContext {
    fn elapsed_secs(&self) -> f64 {
        (self.finished - self.started).num_milliseconds().max(0) as f64 / 1000.0
    }
}

#[derive(Serialize)]
struct ReportDocument<'a> {
    input_root: &'a Path,
    output_root: &'a Path,
    rules_file: Option<&'a Path>,
    started: String,
    finished: String,
    success: bool,
    #[serde(flatten)]
    report: &'a Report,
}

/// Write both renderings to the output root. Returns (text path, JSON path).
pub fn write_report(report: &Report, context: &ReportContext) -> Result<(PathBuf, PathBuf), Error> {
    let text_path = context.output_root.join(TEXT_REPORT_NAME);
    let json_path = context.output_root.join(JSON_REPORT_NAME);
    fs::write(&text_path, report.render_text(context)).map_err(|e| Error::filesystem(&text_path, e))?;
    fs::write(&json_path, report.to_json(context)?).map_err(|e| Error::filesystem(&json_path, e))?;
    info!("Report written to {}", text_path.display());
    Ok((text_path, json_path))
}

pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{:.1} seconds", seconds)
    } else if seconds < 3600.0 {
        let whole = seconds as u64;
        format!("{} min {} sec", whole / 60, whole % 60)
    } else {
        let whole = seconds as u64;
        format!("{} hr {} min", whole / 3600, (whole % 3600) / 60)
    }
}

fn truncate(text: &str, limit: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= limit {
        return trimmed.to_string();
    }
    let head: String = trimmed.chars().take(limit).collect();
    format!("{}... ({} chars total)", head, trimmed.chars().count())
}

#[derive(Default)]
struct TextWriter {
    lines: Vec<String>,
}

impl TextWriter {
    fn line(&mut self, text: &str) {
        self.lines.push(text.to_string());
    }

    fn section(&mut self, title: &str) {
        self.line("");
        self.line(&"-".repeat(RULE_WIDTH));
        self.line(&format!("  {}", title));
        self.line(&"-".repeat(RULE_WIDTH));
        self.line("");
    }

    fn finish(self) -> String {
        self.lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(task_id: &str, stage: Stage, outcome: Outcome) -> ReportRecord {
        let subject = task_id.split('/').next().unwrap_or(task_id).to_string();
        ReportRecord {
            task_id: task_id.to_string(),
            subject,
            session: task_id.split('/').nth(1).map(str::to_string),
            stage,
            outcome,
            warnings: vec![],
            outputs: vec![],
            duration_secs: 1.5,
        }
    }

    fn failed(cause: FailureCause, diagnostic: &str) -> Outcome {
        Outcome::Failed {
            cause,
            diagnostic: diagnostic.to_string(),
        }
    }

    fn context() -> ReportContext {
        let now = Local::now();
        ReportContext {
            input_root: PathBuf::from("/in"),
            output_root: PathBuf::from("/out"),
            rules_file: None,
            started: now,
            finished: now,
        }
    }

    #[test]
    fn test_aggregate_counts() {
        let mut ok = record("subject-001/session-01", Stage::Conversion, Outcome::Succeeded);
        ok.outputs = vec![
            PathBuf::from("/out/subject-001/session-01/anat/a.nii.gz"),
            PathBuf::from("/out/subject-001/session-01/func/b.nii.gz"),
            PathBuf::from("/out/subject-001/session-01/func/c.nii.gz"),
        ];
        ok.warnings = vec!["odd slice".to_string()];
        let records = vec![
            ok,
            record("subject-002", Stage::Conversion, failed(FailureCause::Timeout, "")),
            record("subject-003", Stage::Conversion, Outcome::Cancelled),
            record("subject-001", Stage::Preprocessing, Outcome::Succeeded),
        ];

        let report = Report::aggregate(records, vec!["batch warning".to_string()]);
        assert_eq!(report.conversion.total, 3);
        assert_eq!(report.conversion.succeeded, 1);
        assert_eq!(report.conversion.failed, 1);
        assert_eq!(report.conversion.cancelled, 1);
        assert_eq!(report.preprocessing.succeeded, 1);
        assert_eq!(report.failures_by_cause.get(&FailureCause::Timeout), Some(&1));
        assert_eq!(report.outputs_by_category.get("func"), Some(&2));
        assert_eq!(report.warning_count, 2);
        assert_eq!(report.warnings[1], "subject-001/session-01: odd slice");
        assert!(!report.is_success());
    }

    #[test]
    fn test_empty_report() {
        let report = Report::aggregate(vec![], vec![]);
        assert!(report.is_success());
        assert_eq!(report.conversion.success_rate(), None);
        assert!(report.render_text(&context()).contains("NO DATA PROCESSED"));
    }

    #[test]
    fn test_text_lists_failures_with_plain_cause_and_raw_diagnostic() {
        let long = "x".repeat(500);
        let records = vec![
            record("subject-001", Stage::Conversion, Outcome::Succeeded),
            record(
                "subject-002",
                Stage::Conversion,
                failed(FailureCause::ConverterFailure, "open: Permission denied"),
            ),
            record("subject-003", Stage::Conversion, failed(FailureCause::ConverterFailure, &long)),
        ];
        let text = Report::aggregate(records, vec![]).render_text(&context());

        assert!(text.contains("PARTIAL SUCCESS"));
        assert!(text.contains("[FAILED] subject-002"));
        assert!(text.contains("doesn't have permission"));
        assert!(text.contains("open: Permission denied"));
        assert!(text.contains(&format!("{}... (500 chars total)", "x".repeat(300))));
        assert!(!text.contains(&"x".repeat(301)));
        assert!(text.contains("Success rate:                 33%"));
    }

    #[test]
    fn test_json_has_one_record_per_task() {
        let records = vec![
            record("subject-001", Stage::Conversion, Outcome::Succeeded),
            record("subject-002", Stage::Conversion, failed(FailureCause::MissingOutput, "gone")),
        ];
        let json = Report::aggregate(records, vec![]).to_json(&context()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["records"].as_array().unwrap().len(), 2);
        assert_eq!(value["records"][1]["outcome"]["status"], "failed");
        assert_eq!(value["records"][1]["outcome"]["cause"], "missing_output");
        assert_eq!(value["success"], false);
        assert_eq!(value["conversion"]["failed"], 1);
    }

    #[test]
    fn test_cause_from_error() {
        use std::time::Duration;
        assert_eq!(
            FailureCause::from_error(&Error::Timeout(Duration::from_secs(1)), Stage::Conversion),
            FailureCause::Timeout
        );
        let spawn = Error::Spawn {
            program: "fmriprep-docker".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "nope"),
        };
        assert_eq!(
            FailureCause::from_error(&spawn, Stage::Preprocessing),
            FailureCause::Preprocessing
        );
        assert_eq!(
            FailureCause::from_error(&spawn, Stage::Conversion),
            FailureCause::ConverterFailure
        );
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(12.34), "12.3 seconds");
        assert_eq!(format_duration(125.0), "2 min 5 sec");
        assert_eq!(format_duration(3720.0), "1 hr 2 min");
    }
}
