//! Format-independent ingestion driver.
//!
//! A [`Scraper`] yields object records twice (a skeleton pass without update
//! fields, then an update pass) and value records once. The driver creates
//! every entity before it applies any update, and applies every object
//! record before it writes any value.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::artifact::ArtifactScraper;
use crate::data_types::{RawValue, TypeRegistry};
use crate::database::{Database, EntityId};
use crate::domain::{EntityKind, ValueKind};
use crate::entity::EntityUpdate;
use crate::error::QuoremError;
use crate::parameters::{ParameterInput, parameter_target};
use crate::spreadsheet::MetadataScraper;
use crate::validator::ValidatorCache;
use crate::value::{Links, NewValue};

pub type Records<'a, T> = Box<dyn Iterator<Item = Result<T, QuoremError>> + 'a>;

pub type EntityRef = (EntityKind, String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldAssignment {
    Text { field: String, value: String },
    Reference { field: String, target: EntityRef },
    Link { field: String, target: EntityRef },
    Upstream(String),
    Category(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRecord {
    pub kind: EntityKind,
    pub identity: String,
    pub create: Vec<FieldAssignment>,
    pub update: Vec<FieldAssignment>,
}

impl ObjectRecord {
    pub fn new(kind: EntityKind, identity: impl Into<String>) -> Self {
        Self {
            kind,
            identity: identity.into(),
            create: Vec::new(),
            update: Vec::new(),
        }
    }

    pub fn on_create(mut self, field: FieldAssignment) -> Self {
        self.create.push(field);
        self
    }

    pub fn on_update(mut self, field: FieldAssignment) -> Self {
        self.update.push(field);
        self
    }

    fn label(&self) -> String {
        format!("{} {}", self.kind, self.identity)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValueRecord {
    pub name: String,
    pub kind: ValueKind,
    pub raw: RawValue,
    pub data_kind: Option<String>,
    pub targets: Vec<EntityRef>,
}

impl ValueRecord {
    pub fn new(name: impl Into<String>, kind: ValueKind, raw: impl Into<RawValue>) -> Self {
        Self {
            name: name.into(),
            kind,
            raw: raw.into(),
            data_kind: None,
            targets: Vec::new(),
        }
    }

    pub fn data_kind(mut self, data_kind: impl Into<String>) -> Self {
        self.data_kind = Some(data_kind.into());
        self
    }

    pub fn target(mut self, kind: EntityKind, identity: impl Into<String>) -> Self {
        self.targets.push((kind, identity.into()));
        self
    }

    fn label(&self) -> String {
        let targets = self
            .targets
            .iter()
            .map(|(kind, identity)| format!("{kind} {identity}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{} {} [{targets}]", self.kind, self.name)
    }
}

pub trait Scraper {
    fn format(&self) -> &str;
    fn iter_objects(&mut self, update: bool) -> Result<Records<'_, ObjectRecord>, QuoremError>;
    fn iter_values(&mut self) -> Result<Records<'_, ValueRecord>, QuoremError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScraperOptions {
    pub analysis: Option<String>,
    pub register_provenance: bool,
    pub result: Option<String>,
}

pub const ARTIFACT_FORMAT: &str = "qiime2-artifact";
pub const METADATA_FORMAT: &str = "qiime2-metadata";

/// The scraper registered for `format`.
pub fn for_format(
    format: &str,
    path: &Path,
    options: &ScraperOptions,
) -> Result<Box<dyn Scraper>, QuoremError> {
    match format {
        ARTIFACT_FORMAT => {
            let analysis = options.analysis.clone().ok_or_else(|| QuoremError::MissingColumn {
                kind: "artifact".to_string(),
                columns: vec!["analysis".to_string()],
            })?;
            Ok(Box::new(ArtifactScraper::open(
                path,
                &analysis,
                options.register_provenance,
            )?))
        }
        METADATA_FORMAT => Ok(Box::new(MetadataScraper::open(path, options.result.clone())?)),
        other => Err(QuoremError::UnknownFormat(other.to_string())),
    }
}

/// State that lives for one ingestion run.
#[derive(Debug)]
pub struct IngestContext {
    pub cache: ValidatorCache,
    pub default_value_kind: ValueKind,
}

impl Default for IngestContext {
    fn default() -> Self {
        Self::new(ValueKind::Value)
    }
}

impl IngestContext {
    pub fn new(default_value_kind: ValueKind) -> Self {
        Self {
            cache: ValidatorCache::new(),
            default_value_kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Succeeded,
    CompletedWithErrors,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordError {
    pub record: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub format: String,
    pub source: String,
    pub status: IngestStatus,
    pub entities_created: usize,
    pub entities_updated: usize,
    pub values_created: usize,
    pub values_reused: usize,
    #[serde(default)]
    pub values_replaced: usize,
    pub errors: Vec<RecordError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl IngestReport {
    pub fn new(format: &str, source: &str) -> Self {
        let now = Utc::now();
        Self {
            format: format.to_string(),
            source: source.to_string(),
            status: IngestStatus::Succeeded,
            entities_created: 0,
            entities_updated: 0,
            values_created: 0,
            values_reused: 0,
            values_replaced: 0,
            errors: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    pub fn record_error(&mut self, record: impl Into<String>, err: &QuoremError) {
        let record = record.into();
        warn!(record = %record, error = %err, "record rejected");
        self.errors.push(RecordError {
            record,
            message: err.to_string(),
        });
    }

    pub fn fail(&mut self, err: &QuoremError) {
        self.errors.push(RecordError {
            record: self.source.clone(),
            message: err.to_string(),
        });
        self.status = IngestStatus::Failed;
        self.finished_at = Utc::now();
    }

    pub fn finish(&mut self) {
        if self.status != IngestStatus::Failed {
            self.status = if self.errors.is_empty() {
                IngestStatus::Succeeded
            } else {
                IngestStatus::CompletedWithErrors
            };
        }
        self.finished_at = Utc::now();
    }
}

fn resolve(db: &Database, ctx: &IngestContext, target: &EntityRef) -> Result<EntityId, QuoremError> {
    let (kind, identity) = target;
    ctx.cache
        .get(*kind, identity)
        .or_else(|| db.find_entity(*kind, identity))
        .ok_or_else(|| QuoremError::not_found(kind, identity))
}

fn build_update(
    db: &mut Database,
    ctx: &IngestContext,
    kind: EntityKind,
    fields: &[FieldAssignment],
) -> Result<EntityUpdate, QuoremError> {
    let mut update = EntityUpdate::new();
    for field in fields {
        update = match field {
            FieldAssignment::Text { field, value } => update.with_text(field, value.clone()),
            FieldAssignment::Reference { field, target } => {
                update.with_reference(field, resolve(db, ctx, target)?)
            }
            FieldAssignment::Link { field, target } => {
                update.with_link(field, resolve(db, ctx, target)?)
            }
            FieldAssignment::Upstream(identity) => {
                update.with_upstream(resolve(db, ctx, &(kind, identity.clone()))?)
            }
            FieldAssignment::Category(name) => {
                update.with_category(db.get_or_create_category(name, kind)?)
            }
        };
    }
    Ok(update)
}

/// Aborts on structural errors, otherwise records them against `label`.
fn absorb(report: &mut IngestReport, label: impl Into<String>, err: QuoremError) -> Result<(), QuoremError> {
    if err.is_structural() {
        return Err(err);
    }
    report.record_error(label, &err);
    Ok(())
}

fn create_pass(
    db: &mut Database,
    scraper: &mut dyn Scraper,
    ctx: &mut IngestContext,
    report: &mut IngestReport,
) -> Result<(), QuoremError> {
    for record in scraper.iter_objects(false)? {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                absorb(report, "object record", err)?;
                continue;
            }
        };
        if ctx.cache.get(record.kind, &record.identity).is_some() {
            debug!(kind = %record.kind, identity = %record.identity, "already resolved this run");
            continue;
        }
        if let Some(id) = db.find_entity(record.kind, &record.identity) {
            ctx.cache.insert(record.kind, &record.identity, id);
            continue;
        }
        let created = build_update(db, ctx, record.kind, &record.create)
            .and_then(|update| db.get_or_create_entity(record.kind, &record.identity, &update));
        match created {
            Ok((id, created)) => {
                ctx.cache.insert(record.kind, &record.identity, id);
                if created {
                    report.entities_created += 1;
                }
            }
            Err(err) => absorb(report, record.label(), err)?,
        }
    }
    Ok(())
}

fn update_pass(
    db: &mut Database,
    scraper: &mut dyn Scraper,
    ctx: &mut IngestContext,
    report: &mut IngestReport,
) -> Result<(), QuoremError> {
    for record in scraper.iter_objects(true)? {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                absorb(report, "object record", err)?;
                continue;
            }
        };
        if record.update.is_empty() {
            continue;
        }
        let applied = resolve(db, ctx, &(record.kind, record.identity.clone())).and_then(|id| {
            let update = build_update(db, ctx, record.kind, &record.update)?;
            db.update_entity(id, &update)
        });
        match applied {
            Ok(()) => report.entities_updated += 1,
            Err(err) => absorb(report, record.label(), err)?,
        }
    }
    Ok(())
}

fn write_value(
    db: &mut Database,
    registry: &TypeRegistry,
    ctx: &IngestContext,
    record: &ValueRecord,
) -> Result<bool, QuoremError> {
    let mut links = Links::new();
    for target in &record.targets {
        links.entry(target.0).or_default().insert(resolve(db, ctx, target)?);
    }
    if record.kind == ValueKind::Parameter {
        let (step, level) = parameter_target(&links)?;
        let mut input = ParameterInput::new(record.name.clone(), record.raw.clone(), step, level);
        input.data_kind = record.data_kind.clone();
        return Ok(db.get_or_create_parameter(registry, &input)?.1);
    }
    let mut value = NewValue::new(record.name.clone(), record.kind, record.raw.clone()).with_links(links);
    value.data_kind = record.data_kind.clone();
    Ok(db.get_or_create_value(registry, &value)?.1)
}

fn value_pass(
    db: &mut Database,
    registry: &TypeRegistry,
    scraper: &mut dyn Scraper,
    ctx: &mut IngestContext,
    report: &mut IngestReport,
) -> Result<(), QuoremError> {
    for record in scraper.iter_values()? {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                absorb(report, "value record", err)?;
                continue;
            }
        };
        match write_value(db, registry, ctx, &record) {
            Ok(true) => report.values_created += 1,
            Ok(false) => report.values_reused += 1,
            Err(err) => absorb(report, record.label(), err)?,
        }
    }
    Ok(())
}

/// Runs the three passes of `scraper` against `db`. Per-record failures are
/// collected in the report; structural failures abort with an error.
pub fn run(
    db: &mut Database,
    registry: &TypeRegistry,
    scraper: &mut dyn Scraper,
    ctx: &mut IngestContext,
    source: &str,
) -> Result<IngestReport, QuoremError> {
    let mut report = IngestReport::new(scraper.format(), source);
    info!(format = scraper.format(), source, "phase=Objects; creating entities");
    create_pass(db, scraper, ctx, &mut report)?;
    info!(created = report.entities_created, "phase=Updates; applying update fields");
    update_pass(db, scraper, ctx, &mut report)?;

    let results = ctx.cache.cached_of(EntityKind::Result);
    let inferred = db.infer_step_upstream(&results)?;
    debug!(inferred, "inferred step upstream edges");

    info!(updated = report.entities_updated, "phase=Values; writing values");
    value_pass(db, registry, scraper, ctx, &mut report)?;
    db.verify_closure()?;

    report.finish();
    info!(
        status = ?report.status,
        entities_created = report.entities_created,
        values_created = report.values_created,
        values_reused = report.values_reused,
        errors = report.errors.len(),
        "ingestion finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    struct FixedScraper {
        objects: Vec<ObjectRecord>,
        values: Vec<ValueRecord>,
    }

    impl Scraper for FixedScraper {
        fn format(&self) -> &str {
            "fixed"
        }

        fn iter_objects(&mut self, _update: bool) -> Result<Records<'_, ObjectRecord>, QuoremError> {
            Ok(Box::new(self.objects.iter().cloned().map(Ok)))
        }

        fn iter_values(&mut self) -> Result<Records<'_, ValueRecord>, QuoremError> {
            Ok(Box::new(self.values.iter().cloned().map(Ok)))
        }
    }

    fn scraper() -> FixedScraper {
        FixedScraper {
            objects: vec![
                ObjectRecord::new(EntityKind::Sample, "S1"),
                ObjectRecord::new(EntityKind::Sample, "S2")
                    .on_update(FieldAssignment::Upstream("S1".to_string())),
                ObjectRecord::new(EntityKind::Sample, "S2"),
            ],
            values: vec![
                ValueRecord::new("depth", ValueKind::Value, "10 cm").target(EntityKind::Sample, "S1"),
                ValueRecord::new("depth", ValueKind::Value, "5").target(EntityKind::Sample, "S9"),
            ],
        }
    }

    #[test]
    fn three_passes_and_record_errors() {
        let mut db = Database::new();
        let registry = TypeRegistry::default();
        let mut ctx = IngestContext::default();
        let report = run(&mut db, &registry, &mut scraper(), &mut ctx, "fixed").unwrap();
        assert_eq!(report.entities_created, 2);
        assert_eq!(report.values_created, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.status, IngestStatus::CompletedWithErrors);
        let s2 = db.entity_by_identity(EntityKind::Sample, "S2").unwrap();
        assert_eq!(s2.closure.upstream.len(), 1);
    }

    #[test]
    fn rerun_is_idempotent() {
        let mut db = Database::new();
        let registry = TypeRegistry::default();
        run(&mut db, &registry, &mut scraper(), &mut IngestContext::default(), "fixed").unwrap();
        let before = db.stats();
        let report = run(&mut db, &registry, &mut scraper(), &mut IngestContext::default(), "fixed").unwrap();
        assert_eq!(report.entities_created, 0);
        assert_eq!(report.values_created, 0);
        assert_eq!(report.values_reused, 1);
        assert_eq!(db.stats(), before);
    }

    #[test]
    fn unknown_format_is_rejected() {
        let err = for_format("fasta", Path::new("x"), &ScraperOptions::default()).err().unwrap();
        assert_matches!(err, QuoremError::UnknownFormat(_));
    }
}
