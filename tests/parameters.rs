use quorem::data_types::TypeRegistry;
use quorem::database::{Database, EntityId};
use quorem::domain::EntityKind;
use quorem::entity::EntityUpdate;
use quorem::parameters::{ParameterInput, ParameterLevel, ParameterSource};

struct Fixture {
    db: Database,
    step: EntityId,
    process: EntityId,
    analysis: EntityId,
    plain_analysis: EntityId,
    result: EntityId,
}

fn fixture() -> Fixture {
    let mut db = Database::new();
    let (process, _) = db
        .get_or_create_entity(EntityKind::Process, "P", &EntityUpdate::new())
        .unwrap();
    let (step, _) = db
        .get_or_create_entity(
            EntityKind::Step,
            "denoise",
            &EntityUpdate::new().with_link("processes", process),
        )
        .unwrap();
    let (analysis, _) = db
        .get_or_create_entity(
            EntityKind::Analysis,
            "A",
            &EntityUpdate::new().with_reference("process", process),
        )
        .unwrap();
    let (plain_analysis, _) = db
        .get_or_create_entity(
            EntityKind::Analysis,
            "B",
            &EntityUpdate::new().with_reference("process", process),
        )
        .unwrap();
    let (result, _) = db
        .get_or_create_entity(
            EntityKind::Result,
            "4f2d3b8e-29c5-4a1b-9d8e-123456789abc",
            &EntityUpdate::new()
                .with_reference("analysis", analysis)
                .with_reference("source_step", step),
        )
        .unwrap();
    Fixture {
        db,
        step,
        process,
        analysis,
        plain_analysis,
        result,
    }
}

#[test]
fn most_specific_level_wins() {
    let Fixture {
        mut db,
        step,
        process,
        analysis,
        plain_analysis,
        result,
    } = fixture();
    let registry = TypeRegistry::default();
    for (raw, level) in [
        (20, ParameterLevel::Step),
        (25, ParameterLevel::Process(process)),
        (30, ParameterLevel::Analysis(analysis)),
    ] {
        db.get_or_create_parameter(&registry, &ParameterInput::new("trunc_len", raw as i64, step, level))
            .unwrap();
    }

    let expect = |entity: EntityId, data: &str, source: ParameterSource| {
        let parameters = db.get_parameters(entity, None).unwrap();
        let resolved = &parameters[&step]["trunc_len"];
        assert_eq!(resolved.data, data);
        assert_eq!(resolved.source, source);
    };
    expect(step, "20", ParameterSource::Step);
    expect(process, "25", ParameterSource::Process);
    expect(plain_analysis, "25", ParameterSource::Process);
    expect(analysis, "30", ParameterSource::Analysis);
    expect(result, "30", ParameterSource::Analysis);
}

#[test]
fn result_level_overrides_analysis() {
    let Fixture {
        mut db,
        step,
        analysis,
        result,
        ..
    } = fixture();
    let registry = TypeRegistry::default();
    db.get_or_create_parameter(
        &registry,
        &ParameterInput::new("trunc_len", 30i64, step, ParameterLevel::Analysis(analysis)),
    )
    .unwrap();
    db.get_or_create_parameter(
        &registry,
        &ParameterInput::new("trunc_len", 35i64, step, ParameterLevel::Result(result)),
    )
    .unwrap();

    let parameters = db.get_parameters(result, None).unwrap();
    assert_eq!(parameters[&step]["trunc_len"].data, "35");
    assert_eq!(parameters[&step]["trunc_len"].source, ParameterSource::Result);

    let parameters = db.get_parameters(analysis, None).unwrap();
    assert_eq!(parameters[&step]["trunc_len"].data, "30");
}

#[test]
fn recording_the_same_parameter_twice_reuses_it() {
    let Fixture { mut db, step, .. } = fixture();
    let registry = TypeRegistry::default();
    let input = ParameterInput::new("trim_left", "0", step, ParameterLevel::Step);
    let (first, created) = db.get_or_create_parameter(&registry, &input).unwrap();
    assert!(created);
    let (second, created) = db.get_or_create_parameter(&registry, &input).unwrap();
    assert!(!created);
    assert_eq!(first, second);
}
