use crate::error::Error;
use crate::metadata::{is_hidden, MetadataReader, RawSeries, SeriesScan};
use crate::naming::{Normalizer, SessionIdentity, SessionLabel, SubjectLabel};
use dashmap::DashMap;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// One subject folder, or one session folder inside it, with its series.
#[derive(Debug, Clone)]
pub struct SubjectSession {
    /// Folder names as found, e.g. `001/MRI1`.
    pub raw_label: String,
    pub identity: SessionIdentity,
    pub source: PathBuf,
    pub series: Vec<RawSeries>,
}

#[derive(Debug, Default)]
pub struct Discovery {
    pub sessions: Vec<SubjectSession>,
    pub warnings: Vec<String>,
}

impl Discovery {
    pub fn series_count(&self) -> usize {
        self.sessions.iter().map(|s| s.series.len()).sum()
    }
}

/// Restricts discovery to one subject and/or one session.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub subject: Option<SubjectLabel>,
    pub session: Option<SessionLabel>,
}

impl SessionFilter {
    fn accepts_subject(&self, subject: &SubjectLabel) -> bool {
        self.subject.as_ref().map_or(true, |s| s == subject)
    }

    fn accepts_session(&self, session: Option<&SessionLabel>) -> bool {
        match &self.session {
            None => true,
            Some(wanted) => session == Some(wanted),
        }
    }
}

struct Unit {
    raw_label: String,
    identity: SessionIdentity,
    source: PathBuf,
}

/// Walk `input_root` and read every subject/session folder.
///
/// Each visible top-level folder is a subject. Its child folders are sessions
/// when at least one of them is a recognized session name; otherwise the
/// subject folder itself is a single session-less unit. Naming problems are
/// collected as warnings. Only an unreadable input root is an error.
pub fn discover(
    input_root: &Path,
    normalizer: &Normalizer,
    reader: &dyn MetadataReader,
    filter: &SessionFilter,
) -> Result<Discovery, Error> {
    if !input_root.is_dir() {
        return Err(Error::filesystem(
            input_root,
            io::Error::new(io::ErrorKind::NotFound, "input folder does not exist"),
        ));
    }

    let mut warnings = Vec::new();
    let units = plan_units(input_root, normalizer, filter, &mut warnings)?;
    info!("Reading {} subject/session folders", units.len());

    // read in parallel, assemble in plan order
    let scans: DashMap<usize, Result<SeriesScan, Error>> = DashMap::new();
    units.par_iter().enumerate().for_each(|(index, unit)| {
        scans.insert(index, reader.read(&unit.source));
    });

    let mut sessions = Vec::with_capacity(units.len());
    for (index, unit) in units.into_iter().enumerate() {
        let Some((_, result)) = scans.remove(&index) else {
            continue;
        };
        match result {
            Ok(scan) => {
                warnings.extend(scan.warnings);
                debug!("{} -> {} ({} series)", unit.raw_label, unit.identity, scan.series.len());
                sessions.push(SubjectSession {
                    raw_label: unit.raw_label,
                    identity: unit.identity,
                    source: unit.source,
                    series: scan.series,
                });
            }
            Err(e) => {
                warn!("Skipping {}: {}", unit.raw_label, e);
                warnings.push(format!("Skipping {}: {}", unit.raw_label, e));
            }
        }
    }

    Ok(Discovery { sessions, warnings })
}

fn plan_units(
    input_root: &Path,
    normalizer: &Normalizer,
    filter: &SessionFilter,
    warnings: &mut Vec<String>,
) -> Result<Vec<Unit>, Error> {
    let subjects = list_dirs(input_root)?;
    let mut seen: BTreeMap<SubjectLabel, String> = BTreeMap::new();
    let mut units = Vec::new();

    for (raw_subject, subject_dir) in subjects {
        let subject = match normalizer.normalize_subject(&raw_subject) {
            Ok(label) => label,
            Err(e) => {
                warn!("Skipping subject folder: {}", e);
                warnings.push(format!("Skipping subject folder: {}", e));
                continue;
            }
        };
        if let Some(first) = seen.get(&subject) {
            let e = Error::DuplicateSubjectLabel {
                label: subject.to_string(),
                first: first.clone(),
                second: raw_subject.clone(),
            };
            warn!("Skipping subject folder: {}", e);
            warnings.push(format!("Skipping subject folder: {}", e));
            continue;
        }
        seen.insert(subject.clone(), raw_subject.clone());

        if !filter.accepts_subject(&subject) {
            continue;
        }

        match subject_units(&raw_subject, &subject_dir, subject, normalizer, warnings) {
            Ok(found) => units.extend(
                found
                    .into_iter()
                    .filter(|u| filter.accepts_session(u.identity.session.as_ref())),
            ),
            Err(e) => {
                warn!("Skipping subject {}: {}", raw_subject, e);
                warnings.push(format!("Skipping subject {}: {}", raw_subject, e));
            }
        }
    }

    Ok(units)
}

fn subject_units(
    raw_subject: &str,
    subject_dir: &Path,
    subject: SubjectLabel,
    normalizer: &Normalizer,
    warnings: &mut Vec<String>,
) -> Result<Vec<Unit>, Error> {
    let children = list_dirs(subject_dir)?;
    let recognized: Vec<(String, PathBuf, Option<SessionLabel>)> = children
        .into_iter()
        .map(|(name, path)| {
            let label = normalizer.normalize_session(&name);
            (name, path, label)
        })
        .collect();

    if recognized.iter().all(|(_, _, label)| label.is_none()) {
        return Ok(vec![Unit {
            raw_label: raw_subject.to_string(),
            identity: SessionIdentity::new(subject, None),
            source: subject_dir.to_path_buf(),
        }]);
    }

    let mut by_label: BTreeMap<SessionLabel, String> = BTreeMap::new();
    let mut units = Vec::new();
    let mut unrecognized = Vec::new();
    for (name, path, label) in recognized {
        let Some(label) = label else {
            unrecognized.push((name, path));
            continue;
        };
        if let Some(first) = by_label.get(&label) {
            return Err(Error::DuplicateSessionLabel {
                subject: subject.to_string(),
                label: label.to_string(),
                first: first.clone(),
                second: name,
            });
        }
        by_label.insert(label.clone(), name.clone());
        units.push(Unit {
            raw_label: format!("{}/{}", raw_subject, name),
            identity: SessionIdentity::new(subject.clone(), Some(label)),
            source: path,
        });
    }

    // unrecognized siblings holding data take the next free session index
    let mut next = 1;
    for (name, path) in unrecognized {
        let raw_label = format!("{}/{}", raw_subject, name);
        if !has_content(&path) {
            let e = Error::UnrecognizedName(raw_label);
            warn!("Skipping session folder: {}", e);
            warnings.push(format!("Skipping session folder: {}", e));
            continue;
        }
        let label = loop {
            let candidate = SessionLabel::from_index(&next.to_string());
            next += 1;
            if !by_label.contains_key(&candidate) {
                break candidate;
            }
        };
        warn!("Unrecognized session folder {} assigned {}", raw_label, label);
        warnings.push(format!("Unrecognized session folder {} assigned {}", raw_label, label));
        by_label.insert(label.clone(), name);
        units.push(Unit {
            raw_label,
            identity: SessionIdentity::new(subject.clone(), Some(label)),
            source: path,
        });
    }
    Ok(units)
}

/// True when `dir` holds any visible file or folder.
fn has_content(dir: &Path) -> bool {
    WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !is_hidden(&e.file_name().to_string_lossy()))
        .filter_map(Result::ok)
        .next()
        .is_some()
}

/// Visible child folders of `dir`, sorted by name.
fn list_dirs(dir: &Path) -> Result<Vec<(String, PathBuf)>, Error> {
    let entries = fs::read_dir(dir).map_err(|e| Error::filesystem(dir, e))?;
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::filesystem(dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_hidden(&name) {
            continue;
        }
        if entry.path().is_dir() {
            dirs.push((name, entry.path()));
        }
    }
    dirs.sort();
    Ok(dirs)
}
