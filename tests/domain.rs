use assert_matches::assert_matches;

use quorem::data_types::TypeRegistry;
use quorem::database::Database;
use quorem::domain::{EntityKind, ValueKind};
use quorem::entity::EntityUpdate;
use quorem::error::QuoremError;
use quorem::value::NewValue;

#[test]
fn closure_does_not_depend_on_edge_order() {
    let build = |edges: &[(&str, &str)]| {
        let mut db = Database::new();
        for name in ["S1", "S2", "S3", "S4"] {
            db.get_or_create_entity(EntityKind::Sample, name, &EntityUpdate::new())
                .unwrap();
        }
        for (downstream, upstream) in edges {
            let downstream = db.find_entity(EntityKind::Sample, downstream).unwrap();
            let upstream = db.find_entity(EntityKind::Sample, upstream).unwrap();
            db.add_upstream(downstream, upstream).unwrap();
        }
        db.verify_closure().unwrap();
        let s4 = db.entity_by_identity(EntityKind::Sample, "S4").unwrap();
        let mut upstream = s4
            .closure
            .all_upstream
            .iter()
            .map(|id| db.entity(*id).unwrap().identity.clone())
            .collect::<Vec<_>>();
        upstream.sort();
        upstream
    };
    let forward = build(&[("S2", "S1"), ("S3", "S2"), ("S4", "S3")]);
    let backward = build(&[("S4", "S3"), ("S3", "S2"), ("S2", "S1")]);
    assert_eq!(forward, vec!["S1", "S2", "S3"]);
    assert_eq!(forward, backward);
}

#[test]
fn cycles_are_refused() {
    let mut db = Database::new();
    let (a, _) = db
        .get_or_create_entity(EntityKind::Sample, "A", &EntityUpdate::new())
        .unwrap();
    let (b, _) = db
        .get_or_create_entity(EntityKind::Sample, "B", &EntityUpdate::new())
        .unwrap();
    db.add_upstream(b, a).unwrap();
    assert_matches!(db.add_upstream(a, b), Err(QuoremError::CycleDetected { .. }));
    db.verify_closure().unwrap();
}

#[test]
fn parameters_cannot_link_samples() {
    let mut db = Database::new();
    let registry = TypeRegistry::default();
    let (sample, _) = db
        .get_or_create_entity(EntityKind::Sample, "S1", &EntityUpdate::new())
        .unwrap();
    let value = NewValue::new("min_length", ValueKind::Parameter, "150").link(EntityKind::Sample, sample);
    assert_matches!(
        db.get_or_create_value(&registry, &value),
        Err(QuoremError::NotLinkable { .. })
    );
}

#[test]
fn measures_require_a_result() {
    let mut db = Database::new();
    let registry = TypeRegistry::default();
    let (sample, _) = db
        .get_or_create_entity(EntityKind::Sample, "S1", &EntityUpdate::new())
        .unwrap();
    let value = NewValue::new("shannon", ValueKind::Measure, "3.2").link(EntityKind::Sample, sample);
    assert_matches!(
        db.get_or_create_value(&registry, &value),
        Err(QuoremError::MissingRequiredLink { .. })
    );
}

#[test]
fn category_belongs_to_one_kind() {
    let mut db = Database::new();
    let (step, _) = db
        .get_or_create_entity(EntityKind::Step, "trim", &EntityUpdate::new())
        .unwrap();
    let soil = db.get_or_create_category("soil", EntityKind::Sample).unwrap();
    assert_matches!(
        db.assign_category(step, soil),
        Err(QuoremError::CategoryMismatch { .. })
    );
}

#[test]
fn same_name_and_links_share_a_signature() {
    let mut db = Database::new();
    let registry = TypeRegistry::default();
    for name in ["S1", "S2"] {
        let (sample, _) = db
            .get_or_create_entity(EntityKind::Sample, name, &EntityUpdate::new())
            .unwrap();
        let value = NewValue::new("depth", ValueKind::Value, "12").link(EntityKind::Sample, sample);
        db.get_or_create_value(&registry, &value).unwrap();
    }
    assert_eq!(db.signatures().len(), 1);
    assert_eq!(db.stats().values, 2);
}
