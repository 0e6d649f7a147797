use super::{collect_series_dirs, read_json_record, MetadataReader, MetadataRecord, RawSeries, SeriesScan};
use crate::config::ReaderConfig;
use crate::error::Error;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Reads header fields from JSON dumps stored next to the slices.
///
/// A series is any folder holding slice files. Its record comes from the
/// folder's sidecar (`series.json` by default); without one, the first
/// `<slice>.json` that parses is used. Each unreadable dump is a warning.
pub struct SidecarReader {
    slice_extensions: Vec<String>,
    sidecar_name: String,
}

impl SidecarReader {
    pub fn new(config: &ReaderConfig) -> Self {
        Self {
            slice_extensions: config.slice_extensions.clone(),
            sidecar_name: config.sidecar_name.clone(),
        }
    }

    fn read_record(&self, series_dir: &Path, slices: &[PathBuf], warnings: &mut Vec<String>) -> MetadataRecord {
        if let Some(record) = self.find_dump(series_dir, slices, warnings) {
            return record;
        }
        warnings.push(format!("No metadata found for series {}", series_dir.display()));
        MetadataRecord::new()
    }

    /// The first JSON dump of the series that parses, if any.
    pub(crate) fn find_dump(
        &self,
        series_dir: &Path,
        slices: &[PathBuf],
        warnings: &mut Vec<String>,
    ) -> Option<MetadataRecord> {
        let sidecar = series_dir.join(&self.sidecar_name);
        if sidecar.is_file() {
            match read_json_record(&sidecar) {
                Ok(record) => return Some(record),
                Err(e) => {
                    warn!("Unreadable series metadata {}", e);
                    warnings.push(format!("Unreadable series metadata {}", e));
                }
            }
        }

        for slice in slices {
            let mut name: OsString = slice.as_os_str().to_owned();
            name.push(".json");
            let dump = PathBuf::from(name);
            if !dump.is_file() {
                continue;
            }
            match read_json_record(&dump) {
                Ok(record) => return Some(record),
                Err(e) => {
                    warn!("Unreadable slice metadata {}", e);
                    warnings.push(format!("Unreadable slice metadata {}", e));
                }
            }
        }

        None
    }
}

impl MetadataReader for SidecarReader {
    fn read(&self, dir: &Path) -> Result<SeriesScan, Error> {
        let groups = collect_series_dirs(dir, &self.slice_extensions)?;
        let mut scan = SeriesScan::default();

        for (series_dir, slices) in groups {
            let metadata = self.read_record(&series_dir, &slices, &mut scan.warnings);
            debug!(
                "Series {} with {} slices",
                series_dir.display(),
                slices.len()
            );
            scan.series.push(RawSeries {
                path: series_dir,
                slices,
                metadata,
            });
        }

        Ok(scan)
    }
}
