use crate::error::Error;
use crate::metadata::{format_number, MetadataRecord, MetadataValue};
use glob::{MatchOptions, Pattern};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// One compiled wildcard pattern. `*`, `?` and `[...]` as in shell globs,
/// compared without regard to case.
#[derive(Debug, Clone)]
pub struct Wildcard {
    source: String,
    pattern: Pattern,
}

impl Wildcard {
    pub fn new(source: &str) -> Result<Self, Error> {
        let pattern = Pattern::new(source).map_err(|e| {
            Error::Configuration(format!("invalid pattern '{}': {}", source, e.msg))
        })?;
        Ok(Self {
            source: source.to_string(),
            pattern,
        })
    }

    pub fn matches(&self, text: &str) -> bool {
        self.pattern.matches_with(text, MATCH_OPTIONS)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn is_any(&self) -> bool {
        self.source == "*"
    }
}

/// What one field of a record must look like for a rule to match.
#[derive(Debug, Clone)]
pub enum Criterion {
    Glob(Wildcard),
    Number(f64),
    /// Positional match against a list field. A trailing `*` accepts any remainder.
    Sequence(Vec<Wildcard>),
}

impl Criterion {
    pub fn matches(&self, value: &MetadataValue) -> bool {
        match (self, value) {
            (Criterion::Glob(p), MetadataValue::Text(s)) => p.matches(s),
            (Criterion::Glob(p), MetadataValue::Number(n)) => p.matches(&format_number(*n)),
            (Criterion::Glob(p), MetadataValue::List(items)) => items.iter().any(|i| p.matches(i)),

            (Criterion::Number(want), MetadataValue::Number(n)) => numbers_equal(*want, *n),
            (Criterion::Number(want), MetadataValue::Text(s)) => parses_to(s, *want),
            (Criterion::Number(want), MetadataValue::List(items)) => {
                items.iter().any(|i| parses_to(i, *want))
            }

            (Criterion::Sequence(patterns), MetadataValue::List(items)) => {
                sequence_matches(patterns, items)
            }
            (Criterion::Sequence(_), _) => false,
        }
    }
}

fn numbers_equal(a: f64, b: f64) -> bool {
    (a - b).abs() <= f64::EPSILON * a.abs().max(b.abs()).max(1.0)
}

fn parses_to(text: &str, want: f64) -> bool {
    text.trim()
        .parse::<f64>()
        .map(|n| numbers_equal(n, want))
        .unwrap_or(false)
}

fn sequence_matches(patterns: &[Wildcard], items: &[String]) -> bool {
    let (fixed, open_ended) = match patterns.split_last() {
        Some((last, head)) if last.is_any() => (head, true),
        _ => (patterns, false),
    };

    if open_ended {
        if items.len() < fixed.len() {
            return false;
        }
    } else if items.len() != fixed.len() {
        return false;
    }

    fixed.iter().zip(items).all(|(p, item)| p.matches(item))
}

/// True when every field criterion holds. A missing field fails its pair.
pub fn record_matches(criteria: &[(String, Criterion)], record: &MetadataRecord) -> bool {
    criteria.iter().all(|(field, criterion)| {
        record
            .get(field)
            .map(|value| criterion.matches(value))
            .unwrap_or(false)
    })
}
