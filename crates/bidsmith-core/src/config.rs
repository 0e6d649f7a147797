use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Requested conversion worker count. Capped at [`crate::executor::MAX_WORKERS`].
    pub workers: Option<usize>,
    pub task_timeout_secs: Option<u64>,
    pub dataset_name: String,
    pub converter: ConverterConfig,
    pub reader: ReaderConfig,
    pub preprocessor: PreprocessorConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    pub program: String,
    /// Passed to the converter before the output arguments. A rule set may override it.
    pub options: String,
    /// Extension of the volumetric file the converter must leave next to `<stem>`.
    pub expected_extension: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Lower-case file name suffixes that mark a per-slice file.
    pub slice_extensions: Vec<String>,
    pub sidecar_name: String,
    /// Header dump tool, program first. When set, metadata comes from its stdout.
    pub header_tool: Option<Vec<String>>,
    pub header_tool_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreprocessorConfig {
    pub program: String,
    /// Supports `{bids_dir}`, `{derivatives_dir}`, `{participant}` and `{subject}`.
    pub args: Vec<String>,
    pub workers: usize,
    pub timeout_secs: Option<u64>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workers: None,
            task_timeout_secs: Some(1800),
            dataset_name: "bidsmith output".to_string(),
            converter: ConverterConfig::default(),
            reader: ReaderConfig::default(),
            preprocessor: PreprocessorConfig::default(),
        }
    }
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            program: "dcm2niix".to_string(),
            options: "-z y -b y -ba y".to_string(),
            expected_extension: "nii.gz".to_string(),
        }
    }
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            slice_extensions: vec!["dcm".to_string(), "ima".to_string(), "dcm.gz".to_string()],
            sidecar_name: "series.json".to_string(),
            header_tool: None,
            header_tool_timeout_secs: 60,
        }
    }
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            program: "fmriprep-docker".to_string(),
            args: vec![
                "{bids_dir}".to_string(),
                "{derivatives_dir}".to_string(),
                "participant".to_string(),
                "--participant-label".to_string(),
                "{participant}".to_string(),
            ],
            workers: 1,
            timeout_secs: None,
        }
    }
}

impl AppConfig {
    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.filter(|s| *s > 0).map(Duration::from_secs)
    }
}

/// Load settings from `Bidsmith.toml` in the working directory (or `path` when
/// given), then `BIDSMITH_*` environment overrides, e.g. `BIDSMITH_CONVERTER__PROGRAM`.
pub fn load_configuration(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let file_source = match path {
        Some(p) => ConfigFile::from(p).required(true),
        None => ConfigFile::with_name("Bidsmith").required(false),
    };
    let builder = Config::builder()
        .add_source(file_source)
        .add_source(
            Environment::with_prefix("BIDSMITH")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    builder.try_deserialize::<AppConfig>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_when_file_is_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Bidsmith.toml");
        fs::write(&path, "").unwrap();

        let config = load_configuration(Some(&path)).unwrap();
        assert_eq!(config.converter.program, "dcm2niix");
        assert_eq!(config.reader.sidecar_name, "series.json");
        assert_eq!(config.preprocessor.workers, 1);
        assert_eq!(config.task_timeout(), Some(Duration::from_secs(1800)));
    }

    #[test]
    fn test_file_values_override_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(
            &path,
            r#"
workers = 3
task_timeout_secs = 0

[converter]
program = "my-converter"
"#,
        )
        .unwrap();

        let config = load_configuration(Some(&path)).unwrap();
        assert_eq!(config.workers, Some(3));
        assert_eq!(config.task_timeout(), None);
        assert_eq!(config.converter.program, "my-converter");
        // untouched keys in the same table keep their defaults
        assert_eq!(config.converter.expected_extension, "nii.gz");
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempdir().unwrap();
        let result = load_configuration(Some(&dir.path().join("nope.toml")));
        assert!(result.is_err());
    }
}
