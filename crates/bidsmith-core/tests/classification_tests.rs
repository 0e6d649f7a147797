use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

use bidsmith_core::config::ReaderConfig;
use bidsmith_core::metadata::SidecarReader;
use bidsmith_core::{
    build_tasks, discover, Error, MetadataRecord, MetadataValue, Normalizer, RawSeries, RuleSet, ScanCategory,
    SessionFilter, SessionIdentity,
};

const RULES: &str = r#"{
    "dcm2niixOptions": "-z y -b y -ba n",
    "descriptions": [
        {
            "id": "t1-derived",
            "datatype": "anat",
            "suffix": "T1w",
            "custom_entities": "rec-derived",
            "criteria": {
                "SeriesDescription": "*T1*",
                "ImageType": ["DERIVED", "*"]
            }
        },
        {
            "id": "t1",
            "datatype": "anat",
            "suffix": "T1w",
            "criteria": { "SeriesDescription": "*T1*" }
        },
        {
            "id": "fmap-phase",
            "datatype": "fmap",
            "suffix": "phasediff",
            "criteria": { "SeriesDescription": "*field_map*", "EchoNumber": 2 }
        },
        {
            "id": "fmap-mag",
            "datatype": "fmap",
            "suffix": "magnitude1",
            "criteria": { "SeriesDescription": "*field_map*", "EchoNumber": 1 }
        },
        {
            "id": "dwi",
            "datatype": "dwi",
            "suffix": "dwi",
            "custom_entities": "dir-AP_acq-64dir",
            "criteria": { "SeriesDescription": "DTI*" }
        },
        {
            "id": "asl",
            "datatype": "perf",
            "suffix": "asl",
            "criteria": { "ProtocolName": "*pcasl*" }
        }
    ]
}"#;

fn identity() -> SessionIdentity {
    let n = Normalizer::default();
    SessionIdentity::new(n.normalize_subject("sub-07").unwrap(), n.normalize_session("baseline"))
}

fn series(fields: &[(&str, MetadataValue)]) -> RawSeries {
    let mut metadata = MetadataRecord::new();
    for (k, v) in fields {
        metadata.insert(*k, v.clone());
    }
    RawSeries {
        path: PathBuf::from("/in/series"),
        slices: vec![],
        metadata,
    }
}

fn text(s: &str) -> MetadataValue {
    MetadataValue::Text(s.to_string())
}

fn list(items: &[&str]) -> MetadataValue {
    MetadataValue::List(items.iter().map(|s| s.to_string()).collect())
}

#[test]
fn test_load_rules_from_file() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("rules.json");
    fs::write(&path, RULES).unwrap();

    let rules = RuleSet::load(&path).unwrap();
    assert_eq!(rules.len(), 6);
    assert_eq!(rules.converter_options(), Some("-z y -b y -ba n"));

    let missing = RuleSet::load(&tmp.path().join("nope.json"));
    assert!(matches!(missing, Err(Error::Filesystem { .. })));
}

#[test]
fn test_specific_rule_listed_first_wins() {
    let rules = RuleSet::from_json_str(RULES).unwrap();

    let derived = rules.classify(
        series(&[
            ("SeriesDescription", text("T1_MPRAGE_SAG")),
            ("ImageType", list(&["DERIVED", "SECONDARY", "MPR"])),
        ]),
        &identity(),
    );
    assert_eq!(derived.rule.as_ref().unwrap().id, "t1-derived");
    assert_eq!(derived.stem.as_deref(), Some("subject-07_session-01_rec-derived_T1w"));

    let original = rules.classify(
        series(&[
            ("SeriesDescription", text("T1_MPRAGE_SAG")),
            ("ImageType", list(&["ORIGINAL", "PRIMARY", "M", "ND"])),
        ]),
        &identity(),
    );
    assert_eq!(original.rule.as_ref().unwrap().id, "t1");
    assert_eq!(original.stem.as_deref(), Some("subject-07_session-01_T1w"));
}

#[test]
fn test_numeric_criteria_pick_the_echo() {
    let rules = RuleSet::from_json_str(RULES).unwrap();
    let echo = |n: f64| {
        rules
            .classify(
                series(&[
                    ("SeriesDescription", text("gre_field_mapping")),
                    ("EchoNumber", MetadataValue::Number(n)),
                ]),
                &identity(),
            )
            .rule
            .map(|r| r.suffix.clone())
    };
    assert_eq!(echo(1.0).as_deref(), Some("magnitude1"));
    assert_eq!(echo(2.0).as_deref(), Some("phasediff"));
    assert_eq!(echo(3.0), None);
}

#[test]
fn test_entities_follow_file_name_order() {
    let rules = RuleSet::from_json_str(RULES).unwrap();
    let scan = rules.classify(series(&[("SeriesDescription", text("DTI_64dir_AP"))]), &identity());
    assert_eq!(scan.category(), ScanCategory::Diffusion);
    assert_eq!(
        scan.stem.as_deref(),
        Some("subject-07_session-01_acq-64dir_dir-AP_dwi")
    );
}

#[test]
fn test_field_names_ignore_case_and_missing_fields_fail() {
    let rules = RuleSet::from_json_str(RULES).unwrap();
    let asl = rules.classify(series(&[("protocolname", text("ep2d_PCASL_3mm"))]), &identity());
    assert_eq!(asl.category(), ScanCategory::Perfusion);

    let nothing = rules.classify(series(&[("ProtocolName", text("localizer"))]), &identity());
    assert!(nothing.rule.is_none());
    assert_eq!(nothing.category(), ScanCategory::Unclassified);
}

#[test]
fn test_classification_is_deterministic_over_many_records() {
    let rules = RuleSet::from_json_str(RULES).unwrap();
    let descriptions = [
        "T1_MPRAGE_SAG", "t1_se_tra", "rest_fMRI", "DTI_64dir", "gre_field_mapping", "localizer", "",
    ];
    for description in descriptions {
        for echo in [1.0, 2.0] {
            let make = || {
                series(&[
                    ("SeriesDescription", text(description)),
                    ("EchoNumber", MetadataValue::Number(echo)),
                    ("ImageType", list(&["ORIGINAL", "PRIMARY"])),
                ])
            };
            let a = rules.classify(make(), &identity());
            let b = rules.classify(make(), &identity());
            assert_eq!(a.category(), b.category());
            assert_eq!(a.stem, b.stem);
            assert_eq!(a.entities, b.entities);
        }
    }
}

fn add_series(root: &Path, rel: &str, description: &str) {
    let dir = root.join(rel);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("IM0001.dcm"), b"x").unwrap();
    fs::write(
        dir.join("series.json"),
        format!(r#"{{"SeriesDescription": "{}"}}"#, description),
    )
    .unwrap();
}

#[test]
fn test_messy_tree_to_plan() {
    let tmp = tempdir().unwrap();
    let input = tmp.path().join("input");
    add_series(&input, "Subject 12/Pre/T1", "T1_MPRAGE");
    add_series(&input, "Subject 12/Post/T1", "T1_MPRAGE");
    add_series(&input, "Subject 12/Post/DTI", "DTI_64dir");
    add_series(&input, "sub_13/scans/notes", "phantom");

    let reader = SidecarReader::new(&ReaderConfig::default());
    let found = discover(&input, &Normalizer::default(), &reader, &SessionFilter::default()).unwrap();
    let rules = RuleSet::from_json_str(RULES).unwrap();
    let plan = build_tasks(found.sessions, &rules, Path::new("/out"));

    let ids: Vec<&str> = plan.tasks.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["subject-12/session-01", "subject-12/session-02"]);
    assert_eq!(plan.tasks[1].scans.len(), 2);
    assert_eq!(plan.tasks[1].scans[0].category(), ScanCategory::Anatomical);
    assert_eq!(plan.tasks[1].scans[1].category(), ScanCategory::Diffusion);

    // sub_13 has only a phantom series: warned twice and skipped
    assert_eq!(plan.unclassified.len(), 1);
    assert!(plan.warnings.iter().any(|w| w.contains("phantom")));
    assert!(plan
        .warnings
        .iter()
        .any(|w| w.contains("No classified scans for subject-13/session-01")));
}
