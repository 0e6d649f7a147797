//! Classification rules: ordered, immutable, first match wins.
//!
//! Rules are read from a dcm2bids-style JSON document and checked when
//! loaded, so a malformed rule never surfaces halfway through a run.

pub mod matcher;

pub use matcher::{record_matches, Criterion, Wildcard};

use crate::error::Error;
use crate::metadata::{format_number, MetadataRecord, RawSeries};
use crate::naming::SessionIdentity;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Entity keys in the order they appear in a file name. Others follow alphabetically.
pub const ENTITY_ORDER: [&str; 8] = ["task", "acq", "ce", "rec", "dir", "run", "echo", "part"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanCategory {
    Anatomical,
    Functional,
    Diffusion,
    Fieldmap,
    Perfusion,
    Unclassified,
}

impl ScanCategory {
    /// Output folder inside a session, e.g. `anat`.
    pub fn dir_name(&self) -> &'static str {
        match self {
            ScanCategory::Anatomical => "anat",
            ScanCategory::Functional => "func",
            ScanCategory::Diffusion => "dwi",
            ScanCategory::Fieldmap => "fmap",
            ScanCategory::Perfusion => "perf",
            ScanCategory::Unclassified => "unclassified",
        }
    }

    /// Accepts the long names and the folder names, in any case.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "anatomical" | "anat" => Some(ScanCategory::Anatomical),
            "functional" | "func" => Some(ScanCategory::Functional),
            "diffusion" | "dwi" => Some(ScanCategory::Diffusion),
            "fieldmap" | "fmap" => Some(ScanCategory::Fieldmap),
            "perfusion" | "perf" => Some(ScanCategory::Perfusion),
            "unclassified" => Some(ScanCategory::Unclassified),
            _ => None,
        }
    }
}

impl fmt::Display for ScanCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScanCategory::Anatomical => "anatomical",
            ScanCategory::Functional => "functional",
            ScanCategory::Diffusion => "diffusion",
            ScanCategory::Fieldmap => "fieldmap",
            ScanCategory::Perfusion => "perfusion",
            ScanCategory::Unclassified => "unclassified",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ClassificationRule {
    pub id: String,
    pub category: ScanCategory,
    pub suffix: String,
    /// Derived naming entities, already in file-name order.
    pub entities: Vec<(String, String)>,
    pub criteria: Vec<(String, Criterion)>,
}

impl ClassificationRule {
    pub fn new(
        id: impl Into<String>,
        category: ScanCategory,
        suffix: impl Into<String>,
        entities: Vec<(String, String)>,
        criteria: Vec<(String, Criterion)>,
    ) -> Result<Self, Error> {
        let id = id.into();
        let suffix = suffix.into();
        if criteria.is_empty() {
            return Err(Error::Configuration(format!("rule '{}' has no criteria", id)));
        }
        if !is_label(&suffix) {
            return Err(Error::Configuration(format!(
                "rule '{}' has an invalid suffix '{}'",
                id, suffix
            )));
        }
        for (key, value) in &entities {
            if !is_label(key) || !is_label(value) {
                return Err(Error::Configuration(format!(
                    "rule '{}' has an invalid entity '{}-{}'",
                    id, key, value
                )));
            }
        }
        Ok(Self {
            id,
            category,
            suffix,
            entities: order_entities(entities),
            criteria,
        })
    }

    pub fn matches(&self, record: &MetadataRecord) -> bool {
        record_matches(&self.criteria, record)
    }
}

fn is_label(text: &str) -> bool {
    !text.is_empty() && text.chars().all(|c| c.is_ascii_alphanumeric())
}

fn entity_rank(key: &str) -> usize {
    ENTITY_ORDER
        .iter()
        .position(|k| *k == key)
        .unwrap_or(ENTITY_ORDER.len())
}

/// Sort entities into file-name order. A repeated key keeps its last value.
pub fn order_entities(entities: Vec<(String, String)>) -> Vec<(String, String)> {
    let unique: BTreeMap<String, String> = entities.into_iter().collect();
    let mut ordered: Vec<(String, String)> = unique.into_iter().collect();
    ordered.sort_by(|(a, _), (b, _)| entity_rank(a).cmp(&entity_rank(b)).then_with(|| a.cmp(b)));
    ordered
}

/// `<subject>[_<session>][_key-value…]_<suffix>`
pub fn canonical_stem(identity: &SessionIdentity, entities: &[(String, String)], suffix: &str) -> String {
    let mut stem = identity.stem_prefix();
    for (key, value) in entities {
        stem.push('_');
        stem.push_str(key);
        stem.push('-');
        stem.push_str(value);
    }
    stem.push('_');
    stem.push_str(suffix);
    stem
}

/// A series bound to the rule that matched it, if any.
#[derive(Debug, Clone)]
pub struct ClassifiedScan {
    pub series: RawSeries,
    pub rule: Option<Arc<ClassificationRule>>,
    pub entities: Vec<(String, String)>,
    /// Absent for unclassified series.
    pub stem: Option<String>,
}

impl ClassifiedScan {
    pub fn category(&self) -> ScanCategory {
        self.rule
            .as_ref()
            .map(|r| r.category)
            .unwrap_or(ScanCategory::Unclassified)
    }

    /// True when the scan belongs in the canonical tree.
    pub fn is_classified(&self) -> bool {
        self.stem.is_some()
    }

    /// The stem this scan would have with `key` set to `value`.
    pub fn stem_with(&self, key: &str, value: &str, identity: &SessionIdentity) -> Option<String> {
        let rule = self.rule.as_ref().filter(|_| self.stem.is_some())?;
        Some(canonical_stem(identity, &self.entities_with(key, value), &rule.suffix))
    }

    /// Set (or replace) one entity and re-render the stem.
    pub fn set_entity(&mut self, key: &str, value: &str, identity: &SessionIdentity) {
        let Some(stem) = self.stem_with(key, value, identity) else {
            return;
        };
        self.entities = self.entities_with(key, value);
        self.stem = Some(stem);
    }

    fn entities_with(&self, key: &str, value: &str) -> Vec<(String, String)> {
        let mut entities = self.entities.clone();
        entities.retain(|(k, _)| k != key);
        entities.push((key.to_string(), value.to_string()));
        order_entities(entities)
    }
}

#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<Arc<ClassificationRule>>,
    converter_options: Option<String>,
}

impl RuleSet {
    /// Rejects an empty list and duplicate ids.
    pub fn new(rules: Vec<ClassificationRule>) -> Result<Self, Error> {
        if rules.is_empty() {
            return Err(Error::Configuration("rule set is empty".to_string()));
        }
        let mut seen = HashSet::new();
        for rule in &rules {
            if !seen.insert(rule.id.as_str()) {
                return Err(Error::Configuration(format!("duplicate rule id '{}'", rule.id)));
            }
        }
        Ok(Self {
            rules: rules.into_iter().map(Arc::new).collect(),
            converter_options: None,
        })
    }

    pub fn with_converter_options(mut self, options: Option<String>) -> Self {
        self.converter_options = options;
        self
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path).map_err(|e| Error::filesystem(path, e))?;
        let rules = Self::from_json_str(&text)?;
        info!("Loaded {} classification rules from {}", rules.len(), path.display());
        Ok(rules)
    }

    pub fn from_json_str(text: &str) -> Result<Self, Error> {
        let document: RuleDocument = serde_json::from_str(text)
            .map_err(|e| Error::Configuration(format!("malformed rule document: {}", e)))?;

        let rules = document
            .descriptions
            .into_iter()
            .enumerate()
            .map(|(index, raw)| raw.into_rule(index))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::new(rules)?.with_converter_options(document.converter_options))
    }

    pub fn rules(&self) -> &[Arc<ClassificationRule>] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Converter options declared by the rule document, overriding the config.
    pub fn converter_options(&self) -> Option<&str> {
        self.converter_options.as_deref()
    }

    /// First rule, in declared order, whose criteria all hold.
    pub fn find_match(&self, record: &MetadataRecord) -> Option<&Arc<ClassificationRule>> {
        self.rules.iter().find(|rule| rule.matches(record))
    }

    pub fn classify(&self, series: RawSeries, identity: &SessionIdentity) -> ClassifiedScan {
        let rule = self.find_match(&series.metadata).cloned();
        let (entities, stem) = match &rule {
            Some(r) if r.category != ScanCategory::Unclassified => {
                let stem = canonical_stem(identity, &r.entities, &r.suffix);
                (r.entities.clone(), Some(stem))
            }
            _ => (Vec::new(), None),
        };
        debug!(
            "{} -> {}",
            series.describe(),
            rule.as_ref().map(|r| r.id.as_str()).unwrap_or("no rule")
        );
        ClassifiedScan {
            series,
            rule,
            entities,
            stem,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RuleDocument {
    descriptions: Vec<RawRule>,
    #[serde(default, rename = "dcm2niixOptions", alias = "converter_options")]
    converter_options: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    #[serde(default)]
    id: Option<String>,
    #[serde(alias = "dataType", alias = "category")]
    datatype: String,
    #[serde(alias = "modalityLabel")]
    suffix: String,
    #[serde(default, alias = "customLabels", alias = "customEntities")]
    custom_entities: Option<RawEntities>,
    #[serde(default)]
    criteria: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEntities {
    Map(BTreeMap<String, String>),
    /// `task-rest_acq-highres`
    Text(String),
}

impl RawRule {
    fn into_rule(self, index: usize) -> Result<ClassificationRule, Error> {
        let id = self.id.unwrap_or_else(|| format!("rule-{}", index + 1));
        let category = ScanCategory::parse(&self.datatype).ok_or_else(|| {
            Error::Configuration(format!("rule '{}' has unknown category '{}'", id, self.datatype))
        })?;

        let entities = match self.custom_entities {
            None => Vec::new(),
            Some(RawEntities::Map(map)) => map.into_iter().collect(),
            Some(RawEntities::Text(text)) => parse_entity_text(&id, &text)?,
        };

        let criteria = self
            .criteria
            .iter()
            .map(|(field, value)| Ok((field.clone(), parse_criterion(&id, field, value)?)))
            .collect::<Result<Vec<_>, Error>>()?;

        ClassificationRule::new(id, category, self.suffix, entities, criteria)
    }
}

fn parse_entity_text(id: &str, text: &str) -> Result<Vec<(String, String)>, Error> {
    text.split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.split_once('-')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| {
                    Error::Configuration(format!("rule '{}' has a malformed entity '{}'", id, part))
                })
        })
        .collect()
}

fn parse_criterion(id: &str, field: &str, value: &Value) -> Result<Criterion, Error> {
    match value {
        Value::String(s) => Ok(Criterion::Glob(Wildcard::new(s)?)),
        Value::Number(n) => n.as_f64().map(Criterion::Number).ok_or_else(|| {
            Error::Configuration(format!("rule '{}': '{}' is not a usable number", id, field))
        }),
        Value::Bool(b) => Ok(Criterion::Glob(Wildcard::new(&b.to_string())?)),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Wildcard::new(s),
                Value::Number(n) => Wildcard::new(&n.as_f64().map(format_number).unwrap_or_default()),
                _ => Err(Error::Configuration(format!(
                    "rule '{}': list for '{}' may only hold strings and numbers",
                    id, field
                ))),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Criterion::Sequence),
        Value::Null | Value::Object(_) => Err(Error::Configuration(format!(
            "rule '{}': unsupported criterion for '{}'",
            id, field
        ))),
    }
}
