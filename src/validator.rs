//! Validation and commit of loosely typed spreadsheet rows.
//!
//! A row is owned by the first entity kind whose identity column it carries,
//! in [`EntityKind::ROW_PRECEDENCE`] order. Every other column that is not
//! reserved becomes a value attached to the owner (or to the kinds named in
//! `value_target`).

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::data_types::TypeRegistry;
use crate::database::{Database, EntityId};
use crate::domain::{EntityKind, FieldKind, ValueKind};
use crate::entity::EntityUpdate;
use crate::error::QuoremError;
use crate::ingest::{IngestContext, RecordError};
use crate::parameters::{ParameterInput, parameter_target};
use crate::value::{Links, NewValue, ValueOutcome};

const MISSING: &[&str] = &["", "NA", "N/A", "na", "nan", "NaN", "None"];

pub const VALUE_TYPE_COLUMN: &str = "value_type";
pub const VALUE_TARGET_COLUMN: &str = "value_target";
pub const DATA_TYPE_COLUMN: &str = "data_type";
pub const FORCE_OVERWRITE_COLUMN: &str = "force_overwrite";

pub fn is_missing(cell: &str) -> bool {
    MISSING.contains(&cell.trim())
}

/// Base column name: duplicated headers `ph.1`, `ph.2` all read as `ph`.
pub fn base_column(header: &str) -> &str {
    header.split('.').next().unwrap_or(header).trim()
}

/// Columns that describe entities rather than carry values.
pub fn is_reserved(column: &str) -> bool {
    if matches!(
        column,
        VALUE_TYPE_COLUMN | VALUE_TARGET_COLUMN | DATA_TYPE_COLUMN | FORCE_OVERWRITE_COLUMN
    ) {
        return true;
    }
    EntityKind::ALL.into_iter().any(|kind| {
        column == kind.id_column()
            || column == kind.category_column()
            || column == kind.upstream_column()
            || kind
                .fields()
                .iter()
                .any(|field| field.kind == FieldKind::Text && field.column(kind) == column)
    })
}

/// One spreadsheet row with duplicate headers merged by base name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    cells: Vec<(String, String)>,
}

impl Row {
    pub fn new<I, K, V>(cells: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        Self {
            cells: cells
                .into_iter()
                .map(|(header, value)| (base_column(header.as_ref()).to_string(), value.into()))
                .collect(),
        }
    }

    /// First non-missing cell for `column`.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.all(column).into_iter().next()
    }

    /// Every non-missing cell for `column`, duplicates included once.
    pub fn all(&self, column: &str) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.cells
            .iter()
            .filter(|(name, value)| name == column && !is_missing(value))
            .map(|(_, value)| value.trim())
            .filter(|value| seen.insert(*value))
            .collect()
    }

    pub fn has(&self, column: &str) -> bool {
        self.get(column).is_some()
    }

    /// Distinct column names, in header order.
    pub fn columns(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.cells
            .iter()
            .map(|(name, _)| name.as_str())
            .filter(|name| seen.insert(*name))
            .collect()
    }

    /// Copy of the row with `column` replaced by a single `identity` cell.
    pub fn with_override(&self, column: &str, identity: &str) -> Row {
        let mut cells = self
            .cells
            .iter()
            .filter(|(name, _)| name != column)
            .cloned()
            .collect::<Vec<_>>();
        cells.push((column.to_string(), identity.to_string()));
        Row { cells }
    }

    pub fn single(column: &str, identity: &str) -> Row {
        Row {
            cells: vec![(column.to_string(), identity.to_string())],
        }
    }
}

/// A value queued by row resolution, committed in bulk by [`save_values`].
#[derive(Debug, Clone, PartialEq)]
pub struct PendingValue {
    pub row: usize,
    pub value: NewValue,
    pub force_overwrite: bool,
}

/// Entities resolved during one run, keyed by kind and identity, plus the
/// values waiting to be committed.
#[derive(Debug, Default)]
pub struct ValidatorCache {
    entities: HashMap<(EntityKind, String), EntityId>,
    pending: Vec<PendingValue>,
}

impl ValidatorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: EntityKind, identity: &str) -> Option<EntityId> {
        self.entities.get(&(kind, identity.trim().to_string())).copied()
    }

    pub fn insert(&mut self, kind: EntityKind, identity: &str, id: EntityId) {
        self.entities.insert((kind, identity.trim().to_string()), id);
    }

    pub fn cached_of(&self, kind: EntityKind) -> Vec<EntityId> {
        let mut ids = self
            .entities
            .iter()
            .filter(|((cached, _), _)| *cached == kind)
            .map(|(_, id)| *id)
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub fn queue(&mut self, pending: PendingValue) {
        self.pending.push(pending);
    }

    pub fn pending(&self) -> &[PendingValue] {
        &self.pending
    }

    fn take_pending(&mut self) -> Vec<PendingValue> {
        std::mem::take(&mut self.pending)
    }
}

/// Validates and commits the columns of one entity kind in a row.
#[derive(Debug, Clone, Copy)]
pub struct Validator<'r> {
    pub kind: EntityKind,
    pub row: &'r Row,
}

impl<'r> Validator<'r> {
    pub fn new(kind: EntityKind, row: &'r Row) -> Self {
        Self { kind, row }
    }

    pub fn identity(&self) -> Result<&'r str, QuoremError> {
        self.row
            .get(&self.kind.id_column())
            .ok_or_else(|| QuoremError::MissingColumn {
                kind: self.kind.to_string(),
                columns: vec![self.kind.id_column()],
            })
    }

    pub fn in_db(&self, db: &Database, cache: &ValidatorCache) -> Result<Option<EntityId>, QuoremError> {
        let identity = self.identity()?;
        Ok(cache
            .get(self.kind, identity)
            .or_else(|| db.find_entity(self.kind, identity)))
    }

    pub fn validate(&self, db: &Database, cache: &ValidatorCache) -> Result<(), QuoremError> {
        let identity = self.identity()?;
        self.kind.validate_identity(identity)?;

        let Some(id) = self.in_db(db, cache)? else {
            let missing = self
                .kind
                .fields()
                .iter()
                .filter(|field| field.required_if_new)
                .map(|field| field.column(self.kind))
                .filter(|column| !self.row.has(column))
                .collect::<Vec<_>>();
            if !missing.is_empty() {
                return Err(QuoremError::MissingColumn {
                    kind: self.kind.to_string(),
                    columns: missing,
                });
            }
            return Ok(());
        };

        let entity = db.entity(id)?;
        for field in self.kind.fields() {
            let column = field.column(self.kind);
            let Some(found) = self.row.get(&column) else {
                continue;
            };
            let expected = match field.kind {
                FieldKind::Text => entity.text(field.name).map(str::to_string),
                FieldKind::Reference(_) => match entity.reference(field.name) {
                    Some(target) => Some(db.entity(target)?.identity.clone()),
                    None => None,
                },
                FieldKind::Many(_) => None,
            };
            if let Some(expected) = expected {
                if expected != found {
                    return Err(QuoremError::InconsistentWithDatabase {
                        kind: self.kind.to_string(),
                        identity: identity.to_string(),
                        column,
                        expected,
                        found: found.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Resolves the entity named in `column` through a nested validator on
    /// `row`, creating it when the row carries what a new record needs.
    fn resolve_nested(
        db: &mut Database,
        cache: &mut ValidatorCache,
        kind: EntityKind,
        row: &Row,
    ) -> Result<EntityId, QuoremError> {
        let nested = Validator::new(kind, row);
        match nested.in_db(db, cache)? {
            Some(id) => {
                cache.insert(kind, nested.identity()?, id);
                Ok(id)
            }
            None => Ok(nested.save(db, cache)?.0),
        }
    }

    /// Base fields of the row: text columns and single references.
    pub fn fetch(&self, db: &mut Database, cache: &mut ValidatorCache) -> Result<EntityUpdate, QuoremError> {
        let mut update = EntityUpdate::new();
        for field in self.kind.fields() {
            let column = field.column(self.kind);
            match field.kind {
                FieldKind::Text => {
                    if let Some(text) = self.row.get(&column) {
                        update = update.with_text(field.name, text);
                    }
                }
                FieldKind::Reference(target) => {
                    if let Some(identity) = self.row.get(&column) {
                        let nested_row = self.row.with_override(&column, identity);
                        let id = Self::resolve_nested(db, cache, target, &nested_row)?;
                        update = update.with_reference(field.name, id);
                    }
                }
                FieldKind::Many(_) => {}
            }
        }
        Ok(update)
    }

    /// Creates the record, or fills its blank fields when it exists.
    pub fn save(&self, db: &mut Database, cache: &mut ValidatorCache) -> Result<(EntityId, bool), QuoremError> {
        self.validate(db, cache)?;
        let identity = self.identity()?;
        let update = self.fetch(db, cache)?;
        let saved = match self.in_db(db, cache)? {
            Some(id) => {
                db.fill_entity(id, &update)?;
                (id, false)
            }
            None => db.get_or_create_entity(self.kind, identity, &update)?,
        };
        cache.insert(self.kind, identity, saved.0);
        Ok(saved)
    }

    /// Commits many-references, upstream edges and categories.
    pub fn save_links(&self, db: &mut Database, cache: &mut ValidatorCache) -> Result<(), QuoremError> {
        let identity = self.identity()?;
        let id = match self.in_db(db, cache)? {
            Some(id) => id,
            None => return Err(QuoremError::not_found(self.kind, identity)),
        };

        let mut update = EntityUpdate::new();
        for field in self.kind.fields() {
            let FieldKind::Many(target) = field.kind else {
                continue;
            };
            let column = field.column(self.kind);
            for linked in self.row.all(&column) {
                let nested_row = self.row.with_override(&column, linked);
                let target_id = Self::resolve_nested(db, cache, target, &nested_row)?;
                update = update.with_link(field.name, target_id);
            }
        }
        if self.kind.has_upstream() {
            for upstream in self.row.all(&self.kind.upstream_column()) {
                let nested_row = Row::single(&self.kind.id_column(), upstream);
                let upstream_id = Self::resolve_nested(db, cache, self.kind, &nested_row)?;
                update = update.with_upstream(upstream_id);
            }
        }
        for category in self.row.all(&self.kind.category_column()) {
            update = update.with_category(db.get_or_create_category(category, self.kind)?);
        }
        if !update.is_empty() {
            db.update_entity(id, &update)?;
        }
        Ok(())
    }
}

/// The kind that owns `row`.
pub fn owner_kind(row: &Row) -> Result<EntityKind, QuoremError> {
    EntityKind::ROW_PRECEDENCE
        .into_iter()
        .find(|kind| row.has(&kind.id_column()))
        .ok_or_else(|| QuoremError::MissingColumn {
            kind: "row".to_string(),
            columns: EntityKind::ROW_PRECEDENCE
                .into_iter()
                .map(EntityKind::id_column)
                .collect(),
        })
}

fn present_kinds(row: &Row) -> Vec<EntityKind> {
    EntityKind::DEPENDENCY_ORDER
        .into_iter()
        .filter(|kind| row.has(&kind.id_column()))
        .collect()
}

fn truthy(cell: &str) -> bool {
    matches!(
        cell.trim().to_lowercase().as_str(),
        "true" | "t" | "yes" | "y" | "1"
    )
}

/// Data kind for a cell with no explicit `data_type`.
pub fn infer_cell_kind(registry: &TypeRegistry, cell: &str) -> &'static str {
    let cell = cell.trim();
    if NaiveDate::parse_from_str(cell, "%Y-%m-%d").is_ok() || registry.parse_datetime(cell).is_some() {
        "datetime"
    } else if Uuid::parse_str(cell).is_ok() {
        "result"
    } else if cell.parse::<i64>().is_ok() {
        "int"
    } else if cell.parse::<f64>().is_ok_and(f64::is_finite) {
        "float"
    } else {
        "str"
    }
}

fn value_kind_and_hint(
    row: &Row,
    default: ValueKind,
) -> Result<(ValueKind, Option<String>), QuoremError> {
    let Some(value_type) = row.get(VALUE_TYPE_COLUMN) else {
        return Ok((default, None));
    };
    if let Ok(kind) = value_type.parse::<ValueKind>() {
        return Ok((kind, None));
    }
    match value_type.parse::<crate::data_types::DataKind>() {
        Ok(_) => Ok((default, Some(value_type.to_string()))),
        Err(_) => Err(QuoremError::UnknownValueKind(value_type.to_string())),
    }
}

fn value_links(row: &Row, owner: EntityKind, cache: &ValidatorCache) -> Result<Links, QuoremError> {
    let mut targets = row
        .all(VALUE_TARGET_COLUMN)
        .into_iter()
        .flat_map(|cell| cell.split([',', ';']))
        .map(str::trim)
        .filter(|target| !target.is_empty())
        .map(str::parse::<EntityKind>)
        .collect::<Result<Vec<_>, _>>()?;
    if targets.is_empty() {
        targets.push(owner);
    }

    let mut links = Links::new();
    for kind in targets {
        let identities = row.all(&kind.id_column());
        if identities.is_empty() {
            return Err(QuoremError::MissingColumn {
                kind: kind.to_string(),
                columns: vec![kind.id_column()],
            });
        }
        for identity in identities {
            let id = cache
                .get(kind, identity)
                .ok_or_else(|| QuoremError::not_found(kind, identity))?;
            links.entry(kind).or_default().insert(id);
        }
    }
    Ok(links)
}

/// Validates and saves every entity named in `row`, commits its links and
/// queues its value columns. Values are committed by [`save_values`].
pub fn resolve_input_row(
    db: &mut Database,
    registry: &TypeRegistry,
    ctx: &mut IngestContext,
    index: usize,
    row: &Row,
) -> Result<EntityId, QuoremError> {
    let owner = save_row_entities(db, &mut ctx.cache, row)?;
    save_row_links(db, &mut ctx.cache, row)?;
    queue_row_values(registry, ctx, index, row)?;
    Ok(owner)
}

fn save_row_entities(db: &mut Database, cache: &mut ValidatorCache, row: &Row) -> Result<EntityId, QuoremError> {
    let owner = owner_kind(row)?;
    let mut owner_id = None;
    for kind in present_kinds(row) {
        let (id, created) = Validator::new(kind, row).save(db, cache)?;
        if created {
            debug!(%kind, id = %id, "row created entity");
        }
        if kind == owner {
            owner_id = Some(id);
        }
    }
    owner_id.ok_or_else(|| QuoremError::CorruptState(format!("row owner {owner} was not saved")))
}

fn save_row_links(db: &mut Database, cache: &mut ValidatorCache, row: &Row) -> Result<(), QuoremError> {
    for kind in present_kinds(row) {
        Validator::new(kind, row).save_links(db, cache)?;
    }
    Ok(())
}

fn queue_row_values(
    registry: &TypeRegistry,
    ctx: &mut IngestContext,
    index: usize,
    row: &Row,
) -> Result<(), QuoremError> {
    let owner = owner_kind(row)?;
    let columns = row
        .columns()
        .into_iter()
        .filter(|column| !is_reserved(column) && row.has(column))
        .collect::<Vec<_>>();
    if columns.is_empty() {
        return Ok(());
    }

    let (kind, hint) = value_kind_and_hint(row, ctx.default_value_kind)?;
    let links = value_links(row, owner, &ctx.cache)?;
    let forced = row.get(DATA_TYPE_COLUMN).map(str::to_string).or(hint);
    let force_overwrite = row.get(FORCE_OVERWRITE_COLUMN).is_some_and(truthy);

    for column in columns {
        for cell in row.all(column) {
            let data_kind = forced
                .clone()
                .unwrap_or_else(|| infer_cell_kind(registry, cell).to_string());
            let value = NewValue::new(column, kind, cell)
                .with_data_kind(data_kind)
                .with_links(links.clone());
            ctx.cache.queue(PendingValue {
                row: index,
                value,
                force_overwrite,
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableReport {
    pub rows: usize,
    pub entities_created: usize,
    pub values_created: usize,
    pub values_reused: usize,
    pub values_replaced: usize,
    pub errors: Vec<RecordError>,
}

fn row_label(index: usize) -> String {
    format!("row {}", index + 1)
}

/// Commits every queued value. Failures are reported per row.
pub fn save_values(
    db: &mut Database,
    registry: &TypeRegistry,
    cache: &mut ValidatorCache,
    report: &mut TableReport,
) {
    for pending in cache.take_pending() {
        let outcome = if pending.value.kind == ValueKind::Parameter {
            parameter_target(&pending.value.links).and_then(|(step, level)| {
                let mut input = ParameterInput::new(
                    pending.value.name.clone(),
                    pending.value.raw.clone(),
                    step,
                    level,
                );
                input.data_kind = pending.value.data_kind.clone();
                db.get_or_create_parameter(registry, &input)
                    .map(|(_, created)| if created { ValueOutcome::Created } else { ValueOutcome::Reused })
            })
        } else {
            db.upsert_value(registry, &pending.value, pending.force_overwrite)
                .map(|(_, outcome)| outcome)
        };
        match outcome {
            Ok(ValueOutcome::Created) => report.values_created += 1,
            Ok(ValueOutcome::Reused) => report.values_reused += 1,
            Ok(ValueOutcome::Replaced) => report.values_replaced += 1,
            Err(err) => {
                warn!(row = pending.row + 1, value = %pending.value.name, error = %err, "value rejected");
                report.errors.push(RecordError {
                    record: format!("{} value {}", row_label(pending.row), pending.value.name),
                    message: err.to_string(),
                });
            }
        }
    }
}

/// Resolves a whole table: owners in dependency order, then links, then
/// values. Failing rows are reported and skipped.
pub fn resolve_table(
    db: &mut Database,
    registry: &TypeRegistry,
    ctx: &mut IngestContext,
    rows: &[Row],
) -> TableReport {
    let before = db.entities.len();
    let mut report = TableReport {
        rows: rows.len(),
        ..TableReport::default()
    };
    let fail = |report: &mut TableReport, index: usize, err: QuoremError| {
        warn!(row = index + 1, error = %err, "row rejected");
        report.errors.push(RecordError {
            record: row_label(index),
            message: err.to_string(),
        });
    };

    let mut order = Vec::new();
    for (index, row) in rows.iter().enumerate() {
        match owner_kind(row) {
            Ok(owner) => order.push((index, owner)),
            Err(err) => fail(&mut report, index, err),
        }
    }
    let rank = |kind: EntityKind| {
        EntityKind::DEPENDENCY_ORDER
            .iter()
            .position(|candidate| *candidate == kind)
            .unwrap_or(EntityKind::DEPENDENCY_ORDER.len())
    };
    order.sort_by_key(|(index, owner)| (rank(*owner), *index));

    let mut saved = BTreeMap::new();
    for (index, _) in &order {
        match save_row_entities(db, &mut ctx.cache, &rows[*index]) {
            Ok(owner) => {
                saved.insert(*index, owner);
            }
            Err(err) => fail(&mut report, *index, err),
        }
    }
    info!(rows = rows.len(), saved = saved.len(), "phase=Entities; rows resolved");

    let mut linked = Vec::new();
    for index in saved.keys() {
        match save_row_links(db, &mut ctx.cache, &rows[*index]) {
            Ok(()) => linked.push(*index),
            Err(err) => fail(&mut report, *index, err),
        }
    }

    for index in linked {
        if let Err(err) = queue_row_values(registry, ctx, index, &rows[index]) {
            fail(&mut report, index, err);
        }
    }
    let queued = ctx.cache.pending().len();
    save_values(db, registry, &mut ctx.cache, &mut report);
    report.entities_created = db.entities.len() - before;
    info!(
        queued,
        created = report.values_created,
        reused = report.values_reused,
        replaced = report.values_replaced,
        errors = report.errors.len(),
        "phase=Values; values committed"
    );
    report
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::data_types::Datum;

    fn row(cells: &[(&str, &str)]) -> Row {
        Row::new(cells.iter().map(|(k, v)| (*k, *v)))
    }

    #[test]
    fn duplicate_headers_merge() {
        let row = row(&[("ph", "7"), ("ph.1", "NA"), ("ph.2", "8")]);
        assert_eq!(row.all("ph"), vec!["7", "8"]);
        assert_eq!(row.columns(), vec!["ph"]);
    }

    #[test]
    fn reserved_columns() {
        assert!(is_reserved("sample_id"));
        assert!(is_reserved("upstream_step"));
        assert!(is_reserved("investigation_description"));
        assert!(is_reserved("force_overwrite"));
        assert!(!is_reserved("ph"));
    }

    #[test]
    fn owner_follows_precedence() {
        let r = row(&[("step_id", "trim"), ("sample_id", "S1")]);
        assert_eq!(owner_kind(&r).unwrap(), EntityKind::Sample);
        let err = owner_kind(&row(&[("ph", "7")])).unwrap_err();
        assert_matches!(err, QuoremError::MissingColumn { .. });
    }

    #[test]
    fn numeric_identity_is_rejected() {
        let db = Database::new();
        let cache = ValidatorCache::new();
        let r = row(&[("sample_id", "12")]);
        let err = Validator::new(EntityKind::Sample, &r).validate(&db, &cache).unwrap_err();
        assert_matches!(err, QuoremError::InvalidName { .. });
    }

    #[test]
    fn new_investigation_requires_description() {
        let db = Database::new();
        let cache = ValidatorCache::new();
        let r = row(&[("investigation_id", "Soil")]);
        let err = Validator::new(EntityKind::Investigation, &r)
            .validate(&db, &cache)
            .unwrap_err();
        assert_matches!(err, QuoremError::MissingColumn { columns, .. } if columns == vec!["investigation_description".to_string()]);
    }

    #[test]
    fn inconsistent_text_is_rejected() {
        let mut db = Database::new();
        let mut cache = ValidatorCache::new();
        let first = row(&[("process_id", "P1"), ("process_citation", "doi:1")]);
        Validator::new(EntityKind::Process, &first)
            .save(&mut db, &mut cache)
            .unwrap();
        let second = row(&[("process_id", "P1"), ("process_citation", "doi:2")]);
        let err = Validator::new(EntityKind::Process, &second)
            .validate(&db, &cache)
            .unwrap_err();
        assert_matches!(err, QuoremError::InconsistentWithDatabase { column, .. } if column == "process_citation");
    }

    #[test]
    fn nested_reference_is_created() {
        let mut db = Database::new();
        let mut cache = ValidatorCache::new();
        let r = row(&[("analysis_id", "A1"), ("process_id", "P1")]);
        let (analysis, created) = Validator::new(EntityKind::Analysis, &r)
            .save(&mut db, &mut cache)
            .unwrap();
        assert!(created);
        let process = db.entity(analysis).unwrap().reference("process").unwrap();
        assert_eq!(db.entity(process).unwrap().identity, "P1");
        assert_eq!(cache.get(EntityKind::Process, "P1"), Some(process));
    }

    #[test]
    fn cell_kind_inference() {
        let registry = TypeRegistry::default();
        assert_eq!(infer_cell_kind(&registry, "2023-02-01"), "datetime");
        assert_eq!(
            infer_cell_kind(&registry, "4f2d3b8e-29c5-4a1b-9d8e-123456789abc"),
            "result"
        );
        assert_eq!(infer_cell_kind(&registry, "7"), "int");
        assert_eq!(infer_cell_kind(&registry, "7.2"), "float");
        assert_eq!(infer_cell_kind(&registry, "acidic"), "str");
    }

    #[test]
    fn table_links_upstream_and_categories() {
        let mut db = Database::new();
        let registry = TypeRegistry::default();
        let mut ctx = IngestContext::default();
        let rows = vec![
            row(&[("sample_id", "S2"), ("upstream_sample", "S1"), ("sample_category", "soil")]),
            row(&[("sample_id", "S3"), ("upstream_sample", "S2"), ("sample_category", "soil")]),
        ];
        let report = resolve_table(&mut db, &registry, &mut ctx, &rows);
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        let s3 = db.entity_by_identity(EntityKind::Sample, "S3").unwrap();
        assert_eq!(s3.closure.all_upstream.len(), 2);
        assert_eq!(s3.categories.len(), 1);
        db.verify_closure().unwrap();
    }

    #[test]
    fn forced_overwrite_replaces_value() {
        let mut db = Database::new();
        let registry = TypeRegistry::default();
        let rows = vec![row(&[("sample_id", "S1"), ("ph", "7.2")])];
        resolve_table(&mut db, &registry, &mut IngestContext::default(), &rows);

        let conflicting = vec![row(&[("sample_id", "S1"), ("ph", "7.9")])];
        let report = resolve_table(&mut db, &registry, &mut IngestContext::default(), &conflicting);
        assert_eq!(report.errors.len(), 1);

        let forced = vec![row(&[("sample_id", "S1"), ("ph", "7.9"), ("force_overwrite", "true")])];
        let report = resolve_table(&mut db, &registry, &mut IngestContext::default(), &forced);
        assert_eq!(report.values_replaced, 1);
        let sample = db.find_entity(EntityKind::Sample, "S1").unwrap();
        let values = db.values_of(sample).unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(db.datum(values[0].id).unwrap(), Datum::Float(7.9));
    }

    #[test]
    fn parameter_rows_use_step_level() {
        let mut db = Database::new();
        let registry = TypeRegistry::default();
        let rows = vec![row(&[
            ("step_id", "trim"),
            ("value_type", "parameter"),
            ("min_length", "150"),
        ])];
        let report = resolve_table(&mut db, &registry, &mut IngestContext::default(), &rows);
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        let step = db.find_entity(EntityKind::Step, "trim").unwrap();
        let parameters = db.get_parameters(step, None).unwrap();
        assert_eq!(parameters[&step]["min_length"].data, "150");
    }
}
