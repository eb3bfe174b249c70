use std::fs;

use assert_matches::assert_matches;

use quorem::data_types::{DataKind, Datum, TypeRegistry};
use quorem::database::Database;
use quorem::domain::{EntityKind, ValueKind};
use quorem::entity::EntityUpdate;
use quorem::error::QuoremError;
use quorem::ingest::{self, IngestContext, IngestStatus, METADATA_FORMAT, ScraperOptions};
use quorem::signature::LinkCount;
use quorem::spreadsheet::Table;
use quorem::validator::resolve_table;

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

const SHEET: &str = "sample_id,analysis_id,step_id,ph\nS1,A,step1,7.2\nS2,A,step1,7.4\n";

#[test]
fn sample_sheet_end_to_end() {
    let mut db = seeded();
    let registry = TypeRegistry::default();
    let rows = Table::parse(SHEET).unwrap().rows();

    let report = resolve_table(&mut db, &registry, &mut IngestContext::default(), &rows);
    assert!(report.errors.is_empty(), "{:?}", report.errors);

    let stats = db.stats();
    assert_eq!(stats.entities[&EntityKind::Sample], 2);
    assert_eq!(stats.entities[&EntityKind::Step], 1);
    assert_eq!(stats.signatures, 1);
    assert_eq!(stats.values, 2);
    assert_eq!(stats.data, 2);

    let signature = &db.signatures()[0];
    assert_eq!(signature.name, "ph");
    assert_eq!(signature.value_kind, ValueKind::Value);
    assert_eq!(signature.shape.get(EntityKind::Sample), LinkCount::Exactly(1));
    assert!(signature.data_kinds.contains(&DataKind::Float));

    let s1 = db.find_entity(EntityKind::Sample, "S1").unwrap();
    let values = db.values_of(s1).unwrap();
    assert_eq!(values.len(), 1);
    assert_eq!(db.datum(values[0].id).unwrap(), Datum::Float(7.2));

    let again = resolve_table(&mut db, &registry, &mut IngestContext::default(), &rows);
    assert!(again.errors.is_empty(), "{:?}", again.errors);
    assert_eq!(again.entities_created, 0);
    assert_eq!(again.values_created, 0);
    assert_eq!(db.stats(), stats);
}

#[test]
fn unknown_analysis_rejects_rows() {
    let mut db = Database::new();
    let registry = TypeRegistry::default();
    let rows = Table::parse("sample_id,analysis_id,ph\nS1,missing,7.2\n")
        .unwrap()
        .rows();
    let report = resolve_table(&mut db, &registry, &mut IngestContext::default(), &rows);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(db.stats().values, 0);
}

#[test]
fn metadata_file_through_registered_scraper() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("metadata.tsv");
    fs::write(
        &path,
        "sample-id\tph\tsite\n#q2:types\tnumeric\tcategorical\nS1\t7\tNorth\nS2\t6.5\tSouth\n",
    )
    .unwrap();

    let mut db = Database::new();
    let registry = TypeRegistry::default();
    let mut scraper = ingest::for_format(METADATA_FORMAT, &path, &ScraperOptions::default()).unwrap();
    let source = path.display().to_string();
    let report = ingest::run(
        &mut db,
        &registry,
        scraper.as_mut(),
        &mut IngestContext::default(),
        &source,
    )
    .unwrap();

    assert_eq!(report.status, IngestStatus::Succeeded, "{:?}", report.errors);
    assert_eq!(report.entities_created, 2);
    assert_eq!(report.values_created, 4);

    let s1 = db.find_entity(EntityKind::Sample, "S1").unwrap();
    let ph = db
        .values_of(s1)
        .unwrap()
        .into_iter()
        .find(|value| db.value_name(value.id).unwrap() == "ph")
        .unwrap()
        .id;
    assert_eq!(db.datum(ph).unwrap(), Datum::Float(7.0));
}

#[test]
fn unknown_format_tag() {
    let err = ingest::for_format("fasta", std::path::Path::new("x"), &ScraperOptions::default())
        .err()
        .unwrap();
    assert_matches!(err, QuoremError::UnknownFormat(_));
}
