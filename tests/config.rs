use std::fs;

use assert_matches::assert_matches;

use quorem::config::{Config, ConfigLoader, DatetimeFormats};
use quorem::data_types::DEFAULT_DATETIME_FORMATS;
use quorem::domain::ValueKind;
use quorem::error::QuoremError;

#[test]
fn defaults_without_fields() {
    let resolved = ConfigLoader::resolve_config(Config::default()).unwrap();
    assert_eq!(resolved.schema_version, 1);
    assert!(resolved.register_provenance);
    assert_eq!(resolved.default_value_kind, ValueKind::Value);
    assert_eq!(resolved.datetime_formats.len(), DEFAULT_DATETIME_FORMATS.len());
    assert!(resolved.store_path.is_none());
}

#[test]
fn explicit_file_is_read() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("quorem.json");
    fs::write(
        &path,
        r#"{
            "schema_version": 1,
            "store_path": "/srv/quorem",
            "datetime_formats": ["%d.%m.%Y", "%Y-%m-%d"],
            "register_provenance": false
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(Some(&path)).unwrap();
    assert_eq!(resolved.store_path.as_deref().map(|p| p.as_str()), Some("/srv/quorem"));
    assert_eq!(resolved.datetime_formats, vec!["%d.%m.%Y", "%Y-%m-%d"]);
    assert!(!resolved.register_provenance);
    assert_eq!(resolved.source.as_deref(), Some(path.as_path()));

    let registry = resolved.type_registry();
    assert!(registry.parse_datetime("04.06.2019").is_some());
}

#[test]
fn unreadable_explicit_file() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("absent.json");
    assert_matches!(
        ConfigLoader::resolve(Some(&path)),
        Err(QuoremError::ConfigRead(missing)) if missing == path
    );
}

#[test]
fn malformed_file() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("quorem.json");
    fs::write(&path, "{").unwrap();
    assert_matches!(ConfigLoader::resolve(Some(&path)), Err(QuoremError::ConfigParse(_)));
}

#[test]
fn single_datetime_format() {
    let config = Config {
        datetime_formats: Some(DatetimeFormats::Single("%d/%m/%y".to_string())),
        ..Config::default()
    };
    let resolved = ConfigLoader::resolve_config(config).unwrap();
    assert_eq!(resolved.datetime_formats, vec!["%d/%m/%y"]);
}
