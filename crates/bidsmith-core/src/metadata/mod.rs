pub mod command;
pub mod dicom;
pub mod sidecar;

pub use command::CommandReader;
pub use dicom::DicomReader;
pub use sidecar::SidecarReader;

use crate::error::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A single header field value. Only the shapes classification needs are kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Number(f64),
    Text(String),
    List(Vec<String>),
}

impl MetadataValue {
    /// Convert a JSON value. Objects and nulls carry nothing we can match on.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(MetadataValue::Text(s.clone())),
            Value::Number(n) => n.as_f64().map(MetadataValue::Number),
            Value::Bool(b) => Some(MetadataValue::Text(b.to_string())),
            Value::Array(items) => Some(MetadataValue::List(
                items.iter().filter_map(scalar_to_string).collect(),
            )),
            Value::Null | Value::Object(_) => None,
        }
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => n.as_f64().map(format_number),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Render a number the way a header dump would print it: `2` rather than `2.0`.
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Descriptive header fields of one series. Field lookup ignores ASCII case.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataRecord {
    fields: BTreeMap<String, MetadataValue>,
}

impl MetadataRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(value: &Value) -> Result<Self, Error> {
        let object = value.as_object().ok_or_else(|| {
            Error::Configuration("metadata document is not a JSON object".to_string())
        })?;
        let fields = object
            .iter()
            .filter_map(|(k, v)| MetadataValue::from_json(v).map(|v| (k.clone(), v)))
            .collect();
        Ok(Self { fields })
    }

    pub fn from_json_str(text: &str) -> Result<Self, Error> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_json(&value)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: MetadataValue) {
        self.fields.insert(name.into(), value);
    }

    pub fn with(mut self, name: impl Into<String>, value: MetadataValue) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&MetadataValue> {
        self.fields.get(name).or_else(|| {
            self.fields
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// SeriesDescription, falling back to ProtocolName.
    pub fn description(&self) -> Option<&str> {
        ["SeriesDescription", "ProtocolName"]
            .iter()
            .find_map(|name| match self.get(name) {
                Some(MetadataValue::Text(s)) if !s.is_empty() => Some(s.as_str()),
                _ => None,
            })
    }
}

/// One discovered series folder.
#[derive(Debug, Clone)]
pub struct RawSeries {
    pub path: PathBuf,
    pub slices: Vec<PathBuf>,
    pub metadata: MetadataRecord,
}

impl RawSeries {
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    /// Human label for warnings: the series description, else the folder path.
    pub fn describe(&self) -> String {
        match self.metadata.description() {
            Some(desc) => format!("{} ({})", desc, self.path.display()),
            None => self.path.display().to_string(),
        }
    }
}

/// Result of reading one directory: its series plus per-file warnings.
#[derive(Debug, Default)]
pub struct SeriesScan {
    pub series: Vec<RawSeries>,
    pub warnings: Vec<String>,
}

/// Extracts series and their header fields without decoding pixel data.
pub trait MetadataReader: Send + Sync {
    fn read(&self, dir: &Path) -> Result<SeriesScan, Error>;
}

pub(crate) fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

pub(crate) fn is_slice_file(name: &str, extensions: &[String]) -> bool {
    let lower = name.to_ascii_lowercase();
    extensions.iter().any(|ext| {
        if ext.is_empty() {
            !lower.contains('.')
        } else {
            lower.ends_with(&format!(".{}", ext.trim_start_matches('.')))
        }
    })
}

/// Group slice files under `dir` by their parent folder. Hidden entries are
/// skipped; slices are in file-name order so series contents are stable.
pub(crate) fn collect_series_dirs(
    dir: &Path,
    extensions: &[String],
) -> Result<BTreeMap<PathBuf, Vec<PathBuf>>, Error> {
    let mut groups: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();

    let walker = WalkDir::new(dir)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(&e.file_name().to_string_lossy()));

    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf());
            let source = e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "walk error"));
            Error::filesystem(path, source)
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !is_slice_file(&name, extensions) {
            continue;
        }
        if let Some(parent) = entry.path().parent() {
            groups
                .entry(parent.to_path_buf())
                .or_default()
                .push(entry.path().to_path_buf());
        }
    }

    Ok(groups)
}

pub(crate) fn read_json_record(path: &Path) -> Result<MetadataRecord, String> {
    let text = fs::read_to_string(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    MetadataRecord::from_json_str(&text).map_err(|e| format!("{}: {}", path.display(), e))
}
