use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use assert_matches::assert_matches;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use quorem::artifact::{ArtifactScraper, IMPORT_STEP};
use quorem::data_types::{Datum, TypeRegistry};
use quorem::database::Database;
use quorem::domain::EntityKind;
use quorem::entity::EntityUpdate;
use quorem::error::QuoremError;
use quorem::ingest::{self, IngestContext, IngestStatus};
use quorem::parameters::ParameterSource;

const ROOT: &str = "8c0b2f7e-6a8e-4f0c-9d1e-3b6a1c2d4e5f";
const IMPORT: &str = "1f7d3c2b-5a4e-4d3c-8b2a-0e9f8d7c6b5a";
const CLASSIFY_STEP: &str = "feature-classifier__classify_sklearn";

fn root_action() -> String {
    format!(
        "execution:
  uuid: 0a1b2c3d-0000-4000-8000-000000000001
  runtime:
    start: 2019-06-04T10:00:00.000000-07:00
    end: 2019-06-04T10:02:51.342787-07:00
    duration: 2 minutes, 51 seconds, and 342787 microseconds
action:
  type: method
  plugin: !ref 'environment:plugins:feature-classifier'
  action: classify_sklearn
  inputs:
  - reads: {IMPORT}
  - classifier: null
  parameters:
  - confidence: 0.7
  - n_jobs: 1
  - read_orientation: null
environment:
  platform: linux-x86_64
  framework:
    version: 2019.4.0
    website: https://qiime2.org
  plugins:
    feature-classifier:
      version: 2019.4.0
      website: https://github.com/qiime2/q2-feature-classifier
  python-packages:
    numpy: 1.16.2
    scikit-learn: '0.20'
"
    )
}

const IMPORT_ACTION: &str = "execution:
  uuid: 0a1b2c3d-0000-4000-8000-000000000002
action:
  type: import
  format: CasavaOneEightSingleLanePerSampleDirFmt
  manifest:
  - name: S1_S0_L001_R1_001.fastq.gz
    md5sum: 7a2c9e
  - name: S1_S0_L001_R2_001.fastq.gz
    md5sum: 5d1f0b
environment:
  framework: 2019.4.0
";

const TAXONOMY: &str = "Feature ID\tTaxon\tConfidence\nF1\tk__Bacteria; p__Firmicutes\t0.99\nF2\tk__Archaea\t0.81\n";

fn metadata(uuid: &str, kind: &str, format: &str) -> String {
    format!("uuid: {uuid}\ntype: {kind}\nformat: {format}\n")
}

fn write_zip(dir: &Path, name: &str, entries: &[(String, Vec<u8>)]) -> PathBuf {
    let path = dir.join(name);
    let mut zip = ZipWriter::new(File::create(&path).unwrap());
    let options = SimpleFileOptions::default();
    for (entry, content) in entries {
        zip.start_file(entry.as_str(), options).unwrap();
        zip.write_all(content).unwrap();
    }
    zip.finish().unwrap();
    path
}

fn taxonomy_artifact(dir: &Path) -> PathBuf {
    let entries = vec![
        (
            format!("{ROOT}/metadata.yaml"),
            metadata(ROOT, "FeatureData[Taxonomy]", "TSVTaxonomyDirectoryFormat").into_bytes(),
        ),
        (format!("{ROOT}/data/taxonomy.tsv"), TAXONOMY.as_bytes().to_vec()),
        (format!("{ROOT}/provenance/action/action.yaml"), root_action().into_bytes()),
        (
            format!("{ROOT}/provenance/artifacts/{IMPORT}/metadata.yaml"),
            metadata(
                IMPORT,
                "SampleData[PairedEndSequencesWithQuality]",
                "SingleLanePerSamplePairedEndFastqDirFmt",
            )
            .into_bytes(),
        ),
        (
            format!("{ROOT}/provenance/artifacts/{IMPORT}/action/action.yaml"),
            IMPORT_ACTION.as_bytes().to_vec(),
        ),
    ];
    write_zip(dir, "taxonomy.qza", &entries)
}

fn seeded() -> Database {
    let mut db = Database::new();
    let (process, _) = db
        .get_or_create_entity(EntityKind::Process, "P", &EntityUpdate::new())
        .unwrap();
    db.get_or_create_entity(
        EntityKind::Analysis,
        "A",
        &EntityUpdate::new().with_reference("process", process),
    )
    .unwrap();
    db
}

fn value_names(db: &Database, kind: EntityKind, identity: &str) -> Vec<String> {
    let id = db.find_entity(kind, identity).unwrap();
    let mut names = db
        .values_of(id)
        .unwrap()
        .into_iter()
        .map(|value| db.value_name(value.id).unwrap().to_string())
        .collect::<Vec<_>>();
    names.sort();
    names
}

#[test]
fn registers_provenance_and_payload() {
    let temp = tempfile::tempdir().unwrap();
    let path = taxonomy_artifact(temp.path());
    let mut db = seeded();
    let registry = TypeRegistry::default();

    let mut scraper = ArtifactScraper::open(&path, "A", true).unwrap();
    let report = ingest::run(
        &mut db,
        &registry,
        &mut scraper,
        &mut IngestContext::default(),
        "taxonomy.qza",
    )
    .unwrap();
    assert_eq!(report.status, IngestStatus::Succeeded, "{:?}", report.errors);

    let root = db.entity_by_identity(EntityKind::Result, ROOT).unwrap();
    let import = db.find_entity(EntityKind::Result, IMPORT).unwrap();
    assert!(root.closure.upstream.contains(&import));
    assert_eq!(root.text("type"), Some("FeatureData[Taxonomy]"));
    assert_eq!(root.linked("features").count(), 2);

    let classify = db.find_entity(EntityKind::Step, CLASSIFY_STEP).unwrap();
    let import_step = db.find_entity(EntityKind::Step, IMPORT_STEP).unwrap();
    assert_eq!(root.reference("source_step"), Some(classify));
    assert!(db.entity(classify).unwrap().closure.upstream.contains(&import_step));

    let sample = db.entity_by_identity(EntityKind::Sample, "S1").unwrap();
    assert_eq!(sample.reference("source_step"), Some(import_step));
    assert_eq!(
        value_names(&db, EntityKind::Sample, "S1"),
        vec![
            "forward_file_md5sum",
            "forward_filename",
            "reverse_file_md5sum",
            "reverse_filename"
        ]
    );

    let names = value_names(&db, EntityKind::Result, ROOT);
    for expected in [
        "confidence",
        "end",
        "n_jobs",
        "numpy",
        "q2-feature-classifier",
        "qiime2",
        "qiime2_format",
        "qiime2_type",
        "runtime",
        "scikit-learn",
        "start",
        "taxonomic_classification",
    ] {
        assert!(names.iter().any(|name| name == expected), "missing {expected} in {names:?}");
    }

    let parameters = db.get_parameters(root.id, None).unwrap();
    let confidence = &parameters[&classify]["confidence"];
    assert_eq!(confidence.data, "0.7");
    assert_eq!(confidence.source, ParameterSource::Result);
    assert!(!parameters[&classify].contains_key("read_orientation"));

    db.verify_closure().unwrap();
}

#[test]
fn feature_measures_link_result_and_feature() {
    let temp = tempfile::tempdir().unwrap();
    let path = taxonomy_artifact(temp.path());
    let mut db = seeded();
    let registry = TypeRegistry::default();
    let mut scraper = ArtifactScraper::open(&path, "A", false).unwrap();
    ingest::run(&mut db, &registry, &mut scraper, &mut IngestContext::default(), "taxonomy.qza").unwrap();

    let feature = db.find_entity(EntityKind::Feature, "F1").unwrap();
    let values = db.values_of(feature).unwrap();
    let confidence = values
        .iter()
        .find(|value| db.value_name(value.id).unwrap() == "confidence")
        .unwrap();
    assert_eq!(db.datum(confidence.id).unwrap(), Datum::Float(0.99));
    let root = db.find_entity(EntityKind::Result, ROOT).unwrap();
    assert_eq!(confidence.linked(EntityKind::Result).collect::<Vec<_>>(), vec![root]);
}

#[test]
fn provenance_off_reads_root_only() {
    let temp = tempfile::tempdir().unwrap();
    let path = taxonomy_artifact(temp.path());
    let mut db = seeded();
    let registry = TypeRegistry::default();

    let mut scraper = ArtifactScraper::open(&path, "A", false).unwrap();
    let report = ingest::run(&mut db, &registry, &mut scraper, &mut IngestContext::default(), "taxonomy.qza")
        .unwrap();
    assert_eq!(report.status, IngestStatus::Succeeded, "{:?}", report.errors);
    assert!(db.find_entity(EntityKind::Result, IMPORT).is_none());
    assert!(db.find_entity(EntityKind::Sample, "S1").is_none());
    assert_eq!(db.stats().entities[&EntityKind::Result], 1);
}

#[test]
fn rerun_is_idempotent() {
    let temp = tempfile::tempdir().unwrap();
    let path = taxonomy_artifact(temp.path());
    let mut db = seeded();
    let registry = TypeRegistry::default();

    for _ in 0..2 {
        let mut scraper = ArtifactScraper::open(&path, "A", true).unwrap();
        ingest::run(&mut db, &registry, &mut scraper, &mut IngestContext::default(), "taxonomy.qza")
            .unwrap();
    }
    let stats = db.stats();
    let mut scraper = ArtifactScraper::open(&path, "A", true).unwrap();
    let report = ingest::run(&mut db, &registry, &mut scraper, &mut IngestContext::default(), "taxonomy.qza")
        .unwrap();
    assert_eq!(report.entities_created, 0);
    assert_eq!(report.values_created, 0);
    assert_eq!(db.stats(), stats);
}

#[test]
fn root_must_be_a_uuid() {
    let temp = tempfile::tempdir().unwrap();
    let path = write_zip(
        temp.path(),
        "bad.qza",
        &[("artifact/metadata.yaml".to_string(), b"uuid: x\n".to_vec())],
    );
    assert_matches!(
        ArtifactScraper::open(&path, "A", true).err(),
        Some(QuoremError::UnrecognizedRoot(root)) if root == "artifact"
    );
}

#[test]
fn missing_action_is_structural() {
    let temp = tempfile::tempdir().unwrap();
    let path = write_zip(
        temp.path(),
        "partial.qza",
        &[(
            format!("{ROOT}/metadata.yaml"),
            metadata(ROOT, "FeatureData[Taxonomy]", "TSVTaxonomyDirectoryFormat").into_bytes(),
        )],
    );
    let err = ArtifactScraper::open(&path, "A", true).err().unwrap();
    assert!(err.is_structural());
}

#[test]
fn hdf5_feature_table_is_reported() {
    let temp = tempfile::tempdir().unwrap();
    let action = root_action().replace(
        &format!("  - reads: {IMPORT}\n  - classifier: null\n"),
        "  - table: null\n",
    );
    let path = write_zip(
        temp.path(),
        "table.qza",
        &[
            (
                format!("{ROOT}/metadata.yaml"),
                metadata(ROOT, "FeatureTable[Frequency]", "BIOMV210DirFmt").into_bytes(),
            ),
            (format!("{ROOT}/data/feature-table.biom"), b"\x89HDF\r\n\x1a\n".to_vec()),
            (format!("{ROOT}/provenance/action/action.yaml"), action.into_bytes()),
        ],
    );
    let mut db = seeded();
    let mut scraper = ArtifactScraper::open(&path, "A", true).unwrap();
    let report = ingest::run(
        &mut db,
        &TypeRegistry::default(),
        &mut scraper,
        &mut IngestContext::default(),
        "table.qza",
    )
    .unwrap();
    assert_eq!(report.status, IngestStatus::CompletedWithErrors);
    assert_eq!(report.errors.len(), 1);
    assert!(db.find_entity(EntityKind::Result, ROOT).is_some());
}

fn feature_table_artifact(dir: &Path, biom: &str) -> PathBuf {
    let action = root_action().replace(
        &format!("  - reads: {IMPORT}\n  - classifier: null\n"),
        "  - table: null\n",
    );
    write_zip(
        dir,
        "table.qza",
        &[
            (
                format!("{ROOT}/metadata.yaml"),
                metadata(ROOT, "FeatureTable[Frequency]", "BIOMV210DirFmt").into_bytes(),
            ),
            (format!("{ROOT}/data/feature-table.biom"), biom.as_bytes().to_vec()),
            (format!("{ROOT}/provenance/action/action.yaml"), action.into_bytes()),
        ],
    )
}

#[test]
fn feature_table_ids_must_cover_its_shape() {
    let temp = tempfile::tempdir().unwrap();
    for biom in [
        r#"{"shape":[1,1],"rows":[],"columns":[],"matrix_type":"sparse","data":[[0,0,5.0]]}"#,
        r#"{"shape":[1,2],"rows":[{"id":"F1"}],"columns":[{"id":"S1"}],"matrix_type":"sparse","data":[[0,1,5.0]]}"#,
        r#"{"shape":[1,1],"rows":[{"id":"F1"}],"columns":[{"id":"S1"}],"matrix_type":"sparse","data":[[4,0,5.0]]}"#,
    ] {
        let path = feature_table_artifact(temp.path(), biom);
        assert_matches!(
            ArtifactScraper::open(&path, "A", true).err(),
            Some(QuoremError::Archive(_)),
            "{biom}"
        );
    }
}

#[test]
fn json_feature_table_links_features_to_samples() {
    let temp = tempfile::tempdir().unwrap();
    let path = feature_table_artifact(
        temp.path(),
        r#"{"shape":[2,2],"rows":[{"id":"F1"},{"id":"F2"}],"columns":[{"id":"S1"},{"id":"S2"}],
            "matrix_type":"sparse","data":[[0,0,5.0],[1,1,3.0]]}"#,
    );
    let mut db = seeded();
    let mut scraper = ArtifactScraper::open(&path, "A", true).unwrap();
    let report = ingest::run(
        &mut db,
        &TypeRegistry::default(),
        &mut scraper,
        &mut IngestContext::default(),
        "table.qza",
    )
    .unwrap();
    assert_eq!(report.status, IngestStatus::Succeeded, "{:?}", report.errors);
    let f1 = db.entity_by_identity(EntityKind::Feature, "F1").unwrap();
    let s1 = db.find_entity(EntityKind::Sample, "S1").unwrap();
    assert_eq!(f1.linked("samples").collect::<Vec<_>>(), vec![s1]);
}
