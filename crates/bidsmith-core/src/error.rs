use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Filesystem error at {}: {source}", .path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid rule set: {0}")]
    Configuration(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unrecognized name '{0}'")]
    UnrecognizedName(String),

    #[error("Duplicate session label '{label}' in {subject}: '{first}' and '{second}'")]
    DuplicateSessionLabel {
        subject: String,
        label: String,
        first: String,
        second: String,
    },

    #[error("Duplicate subject label '{label}': '{first}' and '{second}'")]
    DuplicateSubjectLabel {
        label: String,
        first: String,
        second: String,
    },

    #[error("No classification rule matched series '{0}'")]
    NoRuleMatched(String),

    #[error("Could not start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Converter exited with {status}: {diagnostic}")]
    ConverterFailure { status: String, diagnostic: String },

    #[error("Preprocessing exited with {status}: {diagnostic}")]
    PreprocessingFailure { status: String, diagnostic: String },

    #[error("Timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Expected output missing: {}", .0.display())]
    MissingOutput(PathBuf),

    #[error("Task panicked: {0}")]
    Panic(String),

    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Filesystem {
            path: path.into(),
            source,
        }
    }
}
