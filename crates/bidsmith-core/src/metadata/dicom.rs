use super::{collect_series_dirs, MetadataReader, MetadataRecord, MetadataValue, RawSeries, SeriesScan, SidecarReader};
use crate::config::ReaderConfig;
use crate::error::Error;
use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_object::mem::InMemElement;
use dicom_object::OpenFileOptions;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
enum FieldKind {
    Text,
    List,
    Number,
    /// Stored in milliseconds, reported in seconds like a converter sidecar.
    Millis,
}

/// Header attributes copied into a series record, under their sidecar names.
const HEADER_FIELDS: &[(&str, Tag, FieldKind)] = &[
    ("SeriesDescription", tags::SERIES_DESCRIPTION, FieldKind::Text),
    ("ProtocolName", tags::PROTOCOL_NAME, FieldKind::Text),
    ("SequenceName", tags::SEQUENCE_NAME, FieldKind::Text),
    ("ScanningSequence", tags::SCANNING_SEQUENCE, FieldKind::Text),
    ("Modality", tags::MODALITY, FieldKind::Text),
    ("Manufacturer", tags::MANUFACTURER, FieldKind::Text),
    ("ImageType", tags::IMAGE_TYPE, FieldKind::List),
    ("SeriesNumber", tags::SERIES_NUMBER, FieldKind::Number),
    ("EchoNumber", tags::ECHO_NUMBERS, FieldKind::Number),
    ("FlipAngle", tags::FLIP_ANGLE, FieldKind::Number),
    ("MagneticFieldStrength", tags::MAGNETIC_FIELD_STRENGTH, FieldKind::Number),
    ("EchoTime", tags::ECHO_TIME, FieldKind::Millis),
    ("RepetitionTime", tags::REPETITION_TIME, FieldKind::Millis),
    ("InversionTime", tags::INVERSION_TIME, FieldKind::Millis),
];

fn clean(text: &str) -> &str {
    text.trim_matches(|c: char| c == '\0' || c.is_whitespace())
}

impl FieldKind {
    fn convert(self, element: &InMemElement) -> Option<MetadataValue> {
        match self {
            FieldKind::Text => {
                let text = element.to_str().ok()?;
                let text = clean(&text);
                (!text.is_empty()).then(|| MetadataValue::Text(text.to_string()))
            }
            FieldKind::List => {
                let values = element.to_multi_str().ok()?;
                let items: Vec<String> = values
                    .iter()
                    .flat_map(|v| v.split('\\'))
                    .map(clean)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
                    .collect();
                (!items.is_empty()).then_some(MetadataValue::List(items))
            }
            FieldKind::Number => element.to_float64().ok().map(MetadataValue::Number),
            FieldKind::Millis => element
                .to_float64()
                .ok()
                .map(|ms| MetadataValue::Number(ms / 1000.0)),
        }
    }
}

/// Parse the header of one slice file. Reading stops at the pixel data.
pub fn read_header(path: &Path) -> Result<MetadataRecord, String> {
    let object = OpenFileOptions::new()
        .read_until(tags::PIXEL_DATA)
        .open_file(path)
        .map_err(|e| format!("{}: {}", path.display(), e))?;

    let mut record = MetadataRecord::new();
    for (name, tag, kind) in HEADER_FIELDS {
        let Ok(element) = object.element(*tag) else {
            continue;
        };
        if let Some(value) = kind.convert(element) {
            record.insert(*name, value);
        }
    }
    Ok(record)
}

/// Reads header fields straight from the slice files.
///
/// A JSON dump next to the slices still wins when present, so hand-edited
/// metadata overrides the scanner's. Otherwise slices are tried in name
/// order until one parses as DICOM.
pub struct DicomReader {
    slice_extensions: Vec<String>,
    dumps: SidecarReader,
}

impl DicomReader {
    pub fn new(config: &ReaderConfig) -> Self {
        Self {
            slice_extensions: config.slice_extensions.clone(),
            dumps: SidecarReader::new(config),
        }
    }

    fn read_record(&self, series_dir: &Path, slices: &[PathBuf], warnings: &mut Vec<String>) -> MetadataRecord {
        if let Some(record) = self.dumps.find_dump(series_dir, slices, warnings) {
            return record;
        }

        let mut last_error = None;
        for slice in slices {
            match read_header(slice) {
                Ok(record) if !record.is_empty() => return record,
                Ok(_) => debug!("No descriptive fields in {}", slice.display()),
                Err(e) => {
                    debug!("Unreadable header {}", e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => {
                warn!("No readable header for series {}: {}", series_dir.display(), e);
                warnings.push(format!(
                    "No metadata found for series {} (last error: {})",
                    series_dir.display(),
                    e
                ));
            }
            None => warnings.push(format!("No metadata found for series {}", series_dir.display())),
        }
        MetadataRecord::new()
    }
}

impl MetadataReader for DicomReader {
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

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{DataElement, PrimitiveValue, VR};
    use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
    use std::fs;
    use tempfile::tempdir;

    const MR_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4";
    const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

    /// Write a slice holding only header attributes, no pixel data.
    fn write_header_only(path: &Path, description: &str, instance: &str) {
        let mut obj = InMemDicomObject::new_empty();
        let mut put = |tag, vr, value: &str| obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
        put(tags::SOP_CLASS_UID, VR::UI, MR_IMAGE_STORAGE);
        put(tags::SOP_INSTANCE_UID, VR::UI, instance);
        put(tags::MODALITY, VR::CS, "MR");
        put(tags::SERIES_DESCRIPTION, VR::LO, description);
        put(tags::PROTOCOL_NAME, VR::LO, "t1_mprage_sag_p2");
        put(tags::IMAGE_TYPE, VR::CS, "ORIGINAL\\PRIMARY\\M\\ND");
        put(tags::SERIES_NUMBER, VR::IS, "3");
        put(tags::ECHO_NUMBERS, VR::IS, "1");
        put(tags::ECHO_TIME, VR::DS, "2.98");
        put(tags::REPETITION_TIME, VR::DS, "2300");

        let file = obj
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax(EXPLICIT_VR_LE)
                    .media_storage_sop_class_uid(MR_IMAGE_STORAGE)
                    .media_storage_sop_instance_uid(instance),
            )
            .unwrap();
        file.write_to_file(path).unwrap();
    }

    #[test]
    fn test_reads_descriptive_fields_from_header() {
        let tmp = tempdir().unwrap();
        let slice = tmp.path().join("IM0001.dcm");
        write_header_only(&slice, "T1_MPRAGE_SAG", "1.2.826.0.1.1");

        let record = read_header(&slice).unwrap();
        assert_eq!(record.description(), Some("T1_MPRAGE_SAG"));
        assert_eq!(
            record.get("ProtocolName"),
            Some(&MetadataValue::Text("t1_mprage_sag_p2".to_string()))
        );
        assert_eq!(
            record.get("ImageType"),
            Some(&MetadataValue::List(vec![
                "ORIGINAL".to_string(),
                "PRIMARY".to_string(),
                "M".to_string(),
                "ND".to_string()
            ]))
        );
        assert_eq!(record.get("SeriesNumber"), Some(&MetadataValue::Number(3.0)));
        assert_eq!(record.get("EchoNumber"), Some(&MetadataValue::Number(1.0)));
        match record.get("EchoTime") {
            Some(MetadataValue::Number(te)) => assert!((te - 0.00298).abs() < 1e-9),
            other => panic!("unexpected EchoTime {:?}", other),
        }
        assert_eq!(record.get("RepetitionTime"), Some(&MetadataValue::Number(2.3)));
        assert!(record.get("InversionTime").is_none());
    }

    #[test]
    fn test_reader_skips_unparsable_slices() {
        let tmp = tempdir().unwrap();
        let series = tmp.path().join("t1");
        fs::create_dir_all(&series).unwrap();
        fs::write(series.join("IM0001.dcm"), b"not a dicom file").unwrap();
        write_header_only(&series.join("IM0002.dcm"), "T1_MPRAGE_SAG", "1.2.826.0.1.2");

        let scan = DicomReader::new(&ReaderConfig::default()).read(tmp.path()).unwrap();
        assert_eq!(scan.series.len(), 1);
        assert_eq!(scan.series[0].slices.len(), 2);
        assert_eq!(scan.series[0].metadata.description(), Some("T1_MPRAGE_SAG"));
        assert!(scan.warnings.is_empty());
    }

    #[test]
    fn test_json_dump_overrides_header() {
        let tmp = tempdir().unwrap();
        write_header_only(&tmp.path().join("IM0001.dcm"), "T1_MPRAGE_SAG", "1.2.826.0.1.3");
        fs::write(tmp.path().join("series.json"), r#"{"SeriesDescription": "renamed"}"#).unwrap();

        let scan = DicomReader::new(&ReaderConfig::default()).read(tmp.path()).unwrap();
        assert_eq!(scan.series[0].metadata.description(), Some("renamed"));
    }

    #[test]
    fn test_series_without_any_header_is_kept_with_warning() {
        let tmp = tempdir().unwrap();
        fs::write(tmp.path().join("IM0001.ima"), b"garbage").unwrap();

        let scan = DicomReader::new(&ReaderConfig::default()).read(tmp.path()).unwrap();
        assert_eq!(scan.series.len(), 1);
        assert!(scan.series[0].metadata.is_empty());
        assert_eq!(scan.warnings.len(), 1);
        assert!(scan.warnings[0].starts_with("No metadata found for series"));
    }
}
