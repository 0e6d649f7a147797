use super::{collect_series_dirs, MetadataReader, MetadataRecord, RawSeries, SeriesScan};
use crate::config::ReaderConfig;
use crate::error::Error;
use crate::process::run_captured;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, warn};

/// Reads header fields by running a dump tool on one slice of each series.
///
/// The tool is invoked as `<program> <args…> <slice>` and must print a JSON
/// object on stdout. A slice the tool cannot read is a warning and the next
/// slice is tried.
pub struct CommandReader {
    program: String,
    args: Vec<String>,
    slice_extensions: Vec<String>,
    timeout: Duration,
}

impl CommandReader {
    /// Returns `None` when the config names no header tool.
    pub fn from_config(config: &ReaderConfig) -> Option<Self> {
        let tool = config.header_tool.as_ref()?;
        let (program, args) = tool.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            slice_extensions: config.slice_extensions.clone(),
            timeout: Duration::from_secs(config.header_tool_timeout_secs.max(1)),
        })
    }

    fn dump(&self, slice: &Path) -> Result<MetadataRecord, String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).arg(slice);
        let output = run_captured(&mut cmd, Some(self.timeout))
            .map_err(|e| format!("{}: {}", slice.display(), e))?;
        if !output.success() {
            return Err(format!(
                "{}: header tool {} ({})",
                slice.display(),
                output.status_text(),
                output.diagnostic()
            ));
        }
        MetadataRecord::from_json_str(&output.stdout).map_err(|e| format!("{}: {}", slice.display(), e))
    }
}

impl MetadataReader for CommandReader {
    fn read(&self, dir: &Path) -> Result<SeriesScan, Error> {
        let groups = collect_series_dirs(dir, &self.slice_extensions)?;
        let mut scan = SeriesScan::default();

        for (series_dir, slices) in groups {
            let mut metadata = None;
            for slice in &slices {
                match self.dump(slice) {
                    Ok(record) => {
                        metadata = Some(record);
                        break;
                    }
                    Err(e) => {
                        warn!("Unreadable slice header {}", e);
                        scan.warnings.push(format!("Unreadable slice header {}", e));
                    }
                }
            }
            if metadata.is_none() {
                scan.warnings
                    .push(format!("No metadata found for series {}", series_dir.display()));
            }
            debug!("Series {} with {} slices", series_dir.display(), slices.len());
            scan.series.push(RawSeries {
                path: series_dir,
                slices,
                metadata: metadata.unwrap_or_default(),
            });
        }

        Ok(scan)
    }
}
