//! Canonical subject and session labels.
//!
//! Subjects always get a label: the raw folder name is stripped of common
//! prefixes and non-alphanumerics. Sessions are optional: a folder no
//! recognizer accepts simply has no session label.

use crate::error::Error;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;

pub const SUBJECT_PREFIX: &str = "subject-";
pub const SESSION_PREFIX: &str = "session-";

/// Canonical subject label, e.g. `subject-001`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct SubjectLabel(String);

/// Canonical session label, e.g. `session-01`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionLabel(String);

impl SubjectLabel {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The label without its prefix (`001`).
    pub fn id(&self) -> &str {
        &self.0[SUBJECT_PREFIX.len()..]
    }
}

impl SessionLabel {
    pub fn from_index(index: &str) -> Self {
        SessionLabel(format!("{}{}", SESSION_PREFIX, pad_index(index)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn id(&self) -> &str {
        &self.0[SESSION_PREFIX.len()..]
    }
}

impl fmt::Display for SubjectLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for SessionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Subject plus optional session: the identity one task converts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionIdentity {
    pub subject: SubjectLabel,
    pub session: Option<SessionLabel>,
}

impl SessionIdentity {
    pub fn new(subject: SubjectLabel, session: Option<SessionLabel>) -> Self {
        Self { subject, session }
    }

    /// `subject-001/session-01`, or just `subject-001` without a session.
    pub fn task_id(&self) -> String {
        match &self.session {
            Some(session) => format!("{}/{}", self.subject, session),
            None => self.subject.to_string(),
        }
    }

    /// Leading part of every canonical file name: `subject-001_session-01`.
    pub fn stem_prefix(&self) -> String {
        match &self.session {
            Some(session) => format!("{}_{}", self.subject, session),
            None => self.subject.to_string(),
        }
    }
}

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.task_id())
    }
}

static NON_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9]").unwrap());

/// Zero-pad a digit string to two places. Leading zeros beyond that are dropped.
fn pad_index(digits: &str) -> String {
    let trimmed = digits.trim_start_matches('0');
    format!("{:0>2}", trimmed)
}

enum SessionRecognizer {
    /// Pattern whose first capture group is the session index.
    Indexed(Regex),
    /// Fixed names mapped to one index.
    Synonyms(&'static [&'static str], &'static str),
}

impl SessionRecognizer {
    fn recognize(&self, lower: &str) -> Option<SessionLabel> {
        match self {
            SessionRecognizer::Indexed(re) => re
                .captures(lower)
                .and_then(|c| c.get(1))
                .map(|m| SessionLabel::from_index(m.as_str())),
            SessionRecognizer::Synonyms(names, index) => names
                .contains(&lower)
                .then(|| SessionLabel::from_index(index)),
        }
    }
}

/// Ordered recognizers; the first one that accepts a folder name wins.
pub struct Normalizer {
    session_recognizers: Vec<SessionRecognizer>,
}

impl Default for Normalizer {
    fn default() -> Self {
        let indexed = |pattern: &str| SessionRecognizer::Indexed(Regex::new(pattern).unwrap());
        Self {
            session_recognizers: vec![
                indexed(r"^(?:ses|session)-(\d+)$"),
                indexed(r"^mri[_-]?(\d+)$"),
                indexed(r"^session[_-]?(\d+)$"),
                indexed(r"^(?:timepoint|tp)[_-]?(\d+)$"),
                SessionRecognizer::Synonyms(&["baseline", "pre", "screening"], "1"),
                SessionRecognizer::Synonyms(&["followup", "post", "followup1", "post1"], "2"),
                SessionRecognizer::Synonyms(&["followup2", "post2"], "3"),
                SessionRecognizer::Synonyms(&["scans"], "1"),
            ],
        }
    }
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonical subject label for a top-level folder name.
    ///
    /// Never fails on an unusual name; only a name with no alphanumeric
    /// character left after sanitizing is `UnrecognizedName`.
    pub fn normalize_subject(&self, raw: &str) -> Result<SubjectLabel, Error> {
        let trimmed = raw.trim();
        let lower = trimmed.to_ascii_lowercase();
        let mut rest = trimmed;
        for prefix in ["subject-", "subject_", "subject", "sub-", "sub_", "sub"] {
            if lower.starts_with(prefix) && lower.len() > prefix.len() {
                rest = &trimmed[prefix.len()..];
                break;
            }
        }

        let clean = NON_ALNUM.replace_all(rest, "");
        if clean.is_empty() {
            return Err(Error::UnrecognizedName(raw.to_string()));
        }
        Ok(SubjectLabel(format!("{}{}", SUBJECT_PREFIX, clean)))
    }

    /// Canonical session label, or `None` when no recognizer accepts the name.
    pub fn normalize_session(&self, raw: &str) -> Option<SessionLabel> {
        let lower = raw.trim().to_ascii_lowercase();
        self.session_recognizers
            .iter()
            .find_map(|r| r.recognize(&lower))
    }

    /// Like [`normalize_session`](Self::normalize_session) but as an error, for
    /// callers that require a session (e.g. a CLI filter).
    pub fn require_session(&self, raw: &str) -> Result<SessionLabel, Error> {
        self.normalize_session(raw)
            .or_else(|| {
                // bare index, e.g. `--session 2`
                let t = raw.trim();
                (!t.is_empty() && t.chars().all(|c| c.is_ascii_digit()))
                    .then(|| SessionLabel::from_index(t))
            })
            .ok_or_else(|| Error::UnrecognizedName(raw.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(raw: &str) -> Option<String> {
        Normalizer::default()
            .normalize_session(raw)
            .map(|s| s.as_str().to_string())
    }

    #[test]
    fn test_mri_pattern() {
        assert_eq!(session("MRI1").as_deref(), Some("session-01"));
        assert_eq!(session("MRI2").as_deref(), Some("session-02"));
        assert_eq!(session("mri_12").as_deref(), Some("session-12"));
    }

    #[test]
    fn test_synonyms() {
        assert_eq!(session("baseline").as_deref(), Some("session-01"));
        assert_eq!(session("Pre").as_deref(), Some("session-01"));
        assert_eq!(session("followup").as_deref(), Some("session-02"));
        assert_eq!(session("POST").as_deref(), Some("session-02"));
        assert_eq!(session("followup2").as_deref(), Some("session-03"));
        assert_eq!(session("scans").as_deref(), Some("session-01"));
    }

    #[test]
    fn test_indexed_forms() {
        assert_eq!(session("ses-1").as_deref(), Some("session-01"));
        assert_eq!(session("ses-003").as_deref(), Some("session-03"));
        assert_eq!(session("session_2").as_deref(), Some("session-02"));
        assert_eq!(session("session-04").as_deref(), Some("session-04"));
        assert_eq!(session("timepoint1").as_deref(), Some("session-01"));
        assert_eq!(session("tp_2").as_deref(), Some("session-02"));
        assert_eq!(session("MRI0").as_deref(), Some("session-00"));
    }

    #[test]
    fn test_unrecognized_session_is_none() {
        assert_eq!(session("T1_MPRAGE"), None);
        assert_eq!(session("misc"), None);
        assert_eq!(session("mri"), None);
    }

    #[test]
    fn test_subject_prefixes_and_sanitizing() {
        let n = Normalizer::default();
        assert_eq!(n.normalize_subject("001").unwrap().as_str(), "subject-001");
        assert_eq!(n.normalize_subject("sub-001").unwrap().as_str(), "subject-001");
        assert_eq!(n.normalize_subject("subject_123").unwrap().as_str(), "subject-123");
        assert_eq!(n.normalize_subject("Patient-A").unwrap().as_str(), "subject-PatientA");
        assert_eq!(n.normalize_subject("Subject 7 (redo)").unwrap().id(), "7redo");
    }

    #[test]
    fn test_subject_prefix_alone_is_kept() {
        // "sub" with nothing after it is a name, not a prefix
        let n = Normalizer::default();
        assert_eq!(n.normalize_subject("sub").unwrap().as_str(), "subject-sub");
    }

    #[test]
    fn test_unrecognized_subject_never_raises_when_sanitizable() {
        let n = Normalizer::default();
        assert!(n.normalize_subject("weird!!name##42").is_ok());
        assert!(matches!(
            n.normalize_subject("___"),
            Err(Error::UnrecognizedName(_))
        ));
    }

    #[test]
    fn test_require_session_accepts_bare_index() {
        let n = Normalizer::default();
        assert_eq!(n.require_session("2").unwrap().as_str(), "session-02");
        assert_eq!(n.require_session("session-01").unwrap().as_str(), "session-01");
        assert!(n.require_session("nope").is_err());
    }

    #[test]
    fn test_identity_rendering() {
        let n = Normalizer::default();
        let id = SessionIdentity::new(
            n.normalize_subject("001").unwrap(),
            n.normalize_session("MRI1"),
        );
        assert_eq!(id.task_id(), "subject-001/session-01");
        assert_eq!(id.stem_prefix(), "subject-001_session-01");

        let no_session = SessionIdentity::new(n.normalize_subject("002").unwrap(), None);
        assert_eq!(no_session.task_id(), "subject-002");
    }
}
