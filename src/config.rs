use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data_types::{DEFAULT_DATETIME_FORMATS, TypeRegistry};
use crate::domain::ValueKind;
use crate::error::QuoremError;
use crate::store::LockPolicy;

pub const CONFIG_FILE: &str = "quorem.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub store_path: Option<String>,
    #[serde(default)]
    pub datetime_formats: Option<DatetimeFormats>,
    #[serde(default)]
    pub register_provenance: Option<bool>,
    #[serde(default)]
    pub value_defaults: Option<ValueDefaults>,
    /// Seconds a command waits for the database lock.
    #[serde(default)]
    pub lock_wait_secs: Option<u64>,
    /// Age in seconds after which an ownerless lock file is taken over.
    #[serde(default)]
    pub stale_lock_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum DatetimeFormats {
    Single(String),
    Many(Vec<String>),
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ValueDefaults {
    #[serde(default)]
    pub value_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub store_path: Option<Utf8PathBuf>,
    pub datetime_formats: Vec<String>,
    pub register_provenance: bool,
    pub default_value_kind: ValueKind,
    pub lock_policy: LockPolicy,
    pub source: Option<PathBuf>,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            store_path: None,
            datetime_formats: DEFAULT_DATETIME_FORMATS.iter().map(|fmt| fmt.to_string()).collect(),
            register_provenance: true,
            default_value_kind: ValueKind::Value,
            lock_policy: LockPolicy::default(),
            source: None,
        }
    }
}

impl ResolvedConfig {
    pub fn type_registry(&self) -> TypeRegistry {
        TypeRegistry::new(self.datetime_formats.clone())
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads `path` when given, else the first `quorem.json` found in the
    /// working directory or the user config directory, else defaults.
    pub fn resolve(path: Option<&Path>) -> Result<ResolvedConfig, QuoremError> {
        let config_path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_paths().into_iter().find(|candidate| candidate.exists()),
        };
        let Some(config_path) = config_path else {
            debug!("no config file, using defaults");
            return Ok(ResolvedConfig::default());
        };

        let content =
            fs::read_to_string(&config_path).map_err(|_| QuoremError::ConfigRead(config_path.clone()))?;
        let config: Config =
            serde_json::from_str(&content).map_err(|err| QuoremError::ConfigParse(err.to_string()))?;
        debug!(path = %config_path.display(), "loaded config");

        let mut resolved = Self::resolve_config(config)?;
        resolved.source = Some(config_path);
        Ok(resolved)
    }

    pub fn default_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(CONFIG_FILE)];
        if let Some(dirs) = BaseDirs::new() {
            paths.push(dirs.config_dir().join("quorem").join(CONFIG_FILE));
        }
        paths
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, QuoremError> {
        let defaults = ResolvedConfig::default();
        let datetime_formats = match config.datetime_formats {
            None => defaults.datetime_formats,
            Some(DatetimeFormats::Single(format)) => vec![format],
            Some(DatetimeFormats::Many(formats)) if formats.is_empty() => defaults.datetime_formats,
            Some(DatetimeFormats::Many(formats)) => formats,
        };
        let default_value_kind = match config.value_defaults.and_then(|defaults| defaults.value_type) {
            Some(name) => name
                .parse()
                .map_err(|_| QuoremError::ConfigParse(format!("unknown value_type {name}")))?,
            None => defaults.default_value_kind,
        };

        Ok(ResolvedConfig {
            schema_version: config.schema_version.unwrap_or(1),
            store_path: config.store_path.map(Utf8PathBuf::from),
            datetime_formats,
            register_provenance: config.register_provenance.unwrap_or(true),
            default_value_kind,
            lock_policy: LockPolicy {
                wait: config
                    .lock_wait_secs
                    .map_or(defaults.lock_policy.wait, Duration::from_secs),
                stale_after: config
                    .stale_lock_secs
                    .map_or(defaults.lock_policy.stale_after, Duration::from_secs),
            },
            source: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_config_shorthand() {
        let config: Config = serde_json::from_str(
            r#"{"datetime_formats": "%d/%m/%Y", "value_defaults": {"value_type": "measure"}}"#,
        )
        .unwrap();
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.datetime_formats, vec!["%d/%m/%Y"]);
        assert_eq!(resolved.default_value_kind, ValueKind::Measure);
        assert!(resolved.register_provenance);
        assert_eq!(resolved.lock_policy, LockPolicy::default());
    }

    #[test]
    fn lock_timings_in_seconds() {
        let config: Config =
            serde_json::from_str(r#"{"lock_wait_secs": 5, "stale_lock_secs": 600}"#).unwrap();
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.lock_policy.wait, Duration::from_secs(5));
        assert_eq!(resolved.lock_policy.stale_after, Duration::from_secs(600));
    }

    #[test]
    fn unknown_value_type_is_rejected() {
        let config: Config =
            serde_json::from_str(r#"{"value_defaults": {"value_type": "blob"}}"#).unwrap();
        assert_matches!(
            ConfigLoader::resolve_config(config),
            Err(QuoremError::ConfigParse(_))
        );
    }
}
