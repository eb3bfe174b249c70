use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::artifact::{IMPORT_STEP, yaml_to_raw};
use crate::config::ResolvedConfig;
use crate::data_types::TypeRegistry;
use crate::database::{Database, DatabaseStats, EntityId};
use crate::domain::{EntityKind, FieldKind, ValueKind};
use crate::entity::EntityUpdate;
use crate::error::QuoremError;
use crate::fs_util;
use crate::ingest::{self, ARTIFACT_FORMAT, IngestContext, IngestReport, ScraperOptions};
use crate::parameters::{ParameterInput, ParameterLevel, ResolvedParameter};
use crate::spreadsheet::{MetadataScraper, SpreadsheetKind, Table, infer_spreadsheet_kind};
use crate::store::{Store, StoreLock};
use crate::validator::{self, TableReport};
use crate::value::{NewValue, ValueView};

pub const SPREADSHEET_FORMAT: &str = "quorem-spreadsheet";

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

fn progress(sink: &dyn ProgressSink, message: String, started: Option<Instant>) {
    sink.event(ProgressEvent {
        message,
        elapsed: started.map(|started| started.elapsed()),
    });
}

/// A bulk ingestion request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IngestJob {
    Artifact {
        path: PathBuf,
        analysis: String,
        register_provenance: bool,
    },
    Spreadsheet {
        path: PathBuf,
        result: Option<String>,
    },
}

impl IngestJob {
    pub fn source(&self) -> &Path {
        match self {
            IngestJob::Artifact { path, .. } | IngestJob::Spreadsheet { path, .. } => path,
        }
    }

    fn format(&self) -> &'static str {
        match self {
            IngestJob::Artifact { .. } => ARTIFACT_FORMAT,
            IngestJob::Spreadsheet { .. } => SPREADSHEET_FORMAT,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobTicket {
    pub id: Uuid,
    pub report: Option<IngestReport>,
}

pub trait JobRunner {
    fn run_job(&self, id: Uuid, job: &IngestJob, sink: &dyn ProgressSink) -> Result<IngestReport, QuoremError>;
}

/// Accepts ingestion jobs. A queue may run the job later; the ticket then
/// carries no report.
pub trait JobQueue {
    fn submit(
        &self,
        job: IngestJob,
        runner: &dyn JobRunner,
        sink: &dyn ProgressSink,
    ) -> Result<JobTicket, QuoremError>;
}

/// Runs each job on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineJobQueue;

impl JobQueue for InlineJobQueue {
    fn submit(
        &self,
        job: IngestJob,
        runner: &dyn JobRunner,
        sink: &dyn ProgressSink,
    ) -> Result<JobTicket, QuoremError> {
        let id = Uuid::new_v4();
        let report = runner.run_job(id, &job, sink)?;
        Ok(JobTicket {
            id,
            report: Some(report),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InfoResult {
    pub kind: EntityKind,
    pub identity: String,
    pub text: BTreeMap<String, String>,
    pub references: BTreeMap<String, String>,
    pub links: BTreeMap<String, Vec<String>>,
    pub upstream: Vec<String>,
    pub downstream: Vec<String>,
    pub categories: Vec<String>,
    pub values: Vec<ValueView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListEntry {
    pub identity: String,
    pub values: usize,
    pub upstream: usize,
    pub downstream: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResult {
    pub kind: EntityKind,
    pub entities: Vec<ListEntry>,
    pub stats: DatabaseStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParametersResult {
    pub kind: EntityKind,
    pub identity: String,
    pub steps: BTreeMap<String, BTreeMap<String, ResolvedParameter>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InitializeResult {
    pub steps_created: usize,
    pub steps: usize,
    pub versions: usize,
    pub parameters: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateResult {
    pub created: bool,
    pub entity: InfoResult,
}

/// Plugin manifest read by [`App::initialize`].
#[derive(Debug, Deserialize)]
pub struct PluginManifest {
    #[serde(default)]
    pub plugins: Vec<PluginEntry>,
}

#[derive(Debug, Deserialize)]
pub struct PluginEntry {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub actions: Vec<ActionEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ActionEntry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ParameterEntry {
    pub name: String,
    #[serde(default)]
    pub default: Option<serde_yaml::Value>,
}

impl PluginManifest {
    pub fn read(path: &Path) -> Result<Self, QuoremError> {
        let text = fs_util::read_text(path)?;
        let yaml = |err: String| QuoremError::Yaml {
            path: path.display().to_string(),
            message: err,
        };
        if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&text).map_err(|err| yaml(err.to_string()))
        } else {
            serde_yaml::from_str(&text).map_err(|err| yaml(err.to_string()))
        }
    }
}

fn table_report(source: &str, table: TableReport) -> IngestReport {
    let mut report = IngestReport::new(SPREADSHEET_FORMAT, source);
    report.entities_created = table.entities_created;
    report.values_created = table.values_created;
    report.values_reused = table.values_reused;
    report.values_replaced = table.values_replaced;
    report.errors = table.errors;
    report.finish();
    report
}

pub struct App<Q: JobQueue> {
    store: Store,
    config: ResolvedConfig,
    registry: TypeRegistry,
    queue: Q,
}

impl<Q: JobQueue> App<Q> {
    pub fn new(store: Store, config: ResolvedConfig, queue: Q) -> Self {
        let registry = config.type_registry();
        Self {
            store,
            config,
            registry,
            queue,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn submit(&self, job: IngestJob, sink: &dyn ProgressSink) -> Result<JobTicket, QuoremError> {
        self.queue.submit(job, self, sink)
    }

    pub fn ingest_artifact(
        &self,
        path: &Path,
        analysis: &str,
        register_provenance: Option<bool>,
        sink: &dyn ProgressSink,
    ) -> Result<JobTicket, QuoremError> {
        self.submit(
            IngestJob::Artifact {
                path: path.to_path_buf(),
                analysis: analysis.to_string(),
                register_provenance: register_provenance.unwrap_or(self.config.register_provenance),
            },
            sink,
        )
    }

    pub fn ingest_spreadsheet(
        &self,
        path: &Path,
        result: Option<&str>,
        sink: &dyn ProgressSink,
    ) -> Result<JobTicket, QuoremError> {
        self.submit(
            IngestJob::Spreadsheet {
                path: path.to_path_buf(),
                result: result.map(str::to_string),
            },
            sink,
        )
    }

    fn ingest(
        &self,
        db: &mut Database,
        job: &IngestJob,
        sink: &dyn ProgressSink,
    ) -> Result<IngestReport, QuoremError> {
        let source = job.source().display().to_string();
        let mut ctx = IngestContext::new(self.config.default_value_kind);
        match job {
            IngestJob::Artifact {
                path,
                analysis,
                register_provenance,
            } => {
                progress(sink, format!("phase=Validate; checking {source}"), None);
                fs_util::validate_zip(path)?;
                db.entity_by_identity(EntityKind::Analysis, analysis)?;
                let options = ScraperOptions {
                    analysis: Some(analysis.clone()),
                    register_provenance: *register_provenance,
                    result: None,
                };
                let mut scraper = ingest::for_format(ARTIFACT_FORMAT, path, &options)?;
                progress(sink, "phase=Ingest; reading artifact records".to_string(), None);
                ingest::run(db, &self.registry, scraper.as_mut(), &mut ctx, &source)
            }
            IngestJob::Spreadsheet { path, result } => {
                let table = Table::read(path)?;
                let kind = infer_spreadsheet_kind(&table)?;
                progress(sink, format!("phase=Ingest; {} rows as {kind:?}", table.rows.len()), None);
                match kind {
                    SpreadsheetKind::Quorem => {
                        if result.is_some() {
                            warn!(source = %source, "target result ignored for identity-column spreadsheets");
                        }
                        let rows = table.rows();
                        let report = validator::resolve_table(db, &self.registry, &mut ctx, &rows);
                        Ok(table_report(&source, report))
                    }
                    SpreadsheetKind::Qiime2Metadata => {
                        let mut scraper = MetadataScraper::from_table(table, result.clone())?;
                        ingest::run(db, &self.registry, &mut scraper, &mut ctx, &source)
                    }
                }
            }
        }
    }

    fn load(&self) -> Result<Database, QuoremError> {
        self.store.ensure_root()?;
        self.store.load_database()
    }

    fn lock_database(&self) -> Result<StoreLock, QuoremError> {
        self.store.ensure_root()?;
        self.store.lock_database()
    }

    pub fn initialize(&self, manifest: &Path, sink: &dyn ProgressSink) -> Result<InitializeResult, QuoremError> {
        let started = Instant::now();
        let manifest = PluginManifest::read(manifest)?;
        let _lock = self.lock_database()?;
        let mut db = self.load()?;
        let mut result = InitializeResult::default();

        let (_, created) = db.get_or_create_entity(
            EntityKind::Step,
            IMPORT_STEP,
            &EntityUpdate::new().with_text("description", "Import of data into QIIME2"),
        )?;
        result.steps += 1;
        result.steps_created += usize::from(created);

        for plugin in &manifest.plugins {
            progress(sink, format!("phase=Initialize; plugin {}", plugin.name), Some(started));
            for action in &plugin.actions {
                let name = format!("{}__{}", plugin.name, action.id);
                let description = action
                    .description
                    .clone()
                    .or_else(|| action.name.clone())
                    .unwrap_or_default();
                let (step, created) = db.get_or_create_entity(
                    EntityKind::Step,
                    &name,
                    &EntityUpdate::new().with_text("description", description),
                )?;
                result.steps += 1;
                result.steps_created += usize::from(created);

                let version = NewValue::new(format!("q2-{}", plugin.name), ValueKind::Version, plugin.version.as_str())
                    .with_data_kind("version")
                    .link(EntityKind::Step, step);
                let (_, created) = db.get_or_create_value(&self.registry, &version)?;
                result.versions += usize::from(created);

                for parameter in &action.parameters {
                    let Some(raw) = parameter.default.as_ref().and_then(yaml_to_raw) else {
                        continue;
                    };
                    let input = ParameterInput::new(parameter.name.clone(), raw, step, ParameterLevel::Step);
                    let (_, created) = db.get_or_create_parameter(&self.registry, &input)?;
                    result.parameters += usize::from(created);
                }
            }
        }

        db.verify_closure()?;
        self.store.save_database(&db)?;
        info!(
            steps = result.steps,
            created = result.steps_created,
            parameters = result.parameters,
            "initialized steps"
        );
        Ok(result)
    }

    /// Creates an entity from `key=value` fields. Many-references take a
    /// comma separated list; `upstream` and `category` are also accepted.
    pub fn create(
        &self,
        kind: EntityKind,
        identity: &str,
        fields: &[(String, String)],
        sink: &dyn ProgressSink,
    ) -> Result<CreateResult, QuoremError> {
        let _lock = self.lock_database()?;
        let mut db = self.load()?;
        let mut update = EntityUpdate::new();
        for (key, value) in fields {
            let value = value.trim();
            if *key == kind.upstream_column() || key == "upstream" {
                for name in value.split(',').map(str::trim).filter(|name| !name.is_empty()) {
                    update = update.with_upstream(db.entity_by_identity(kind, name)?.id);
                }
                continue;
            }
            if key == "category" || *key == kind.category_column() {
                let category = db.get_or_create_category(value, kind)?;
                update = update.with_category(category);
                continue;
            }
            let field = kind.field(key)?;
            update = match field.kind {
                FieldKind::Text => update.with_text(field.name, value),
                FieldKind::Reference(target) => {
                    update.with_reference(field.name, db.entity_by_identity(target, value)?.id)
                }
                FieldKind::Many(target) => {
                    for name in value.split(',').map(str::trim).filter(|name| !name.is_empty()) {
                        update = update.with_link(field.name, db.entity_by_identity(target, name)?.id);
                    }
                    update
                }
            };
        }

        let (id, created) = db.get_or_create_entity(kind, identity, &update)?;
        if !created && !update.is_empty() {
            db.update_entity(id, &update)?;
        }
        db.verify_closure()?;
        self.store.save_database(&db)?;
        progress(
            sink,
            format!("phase=Done; {} {kind} {identity}", if created { "created" } else { "updated" }),
            None,
        );
        Ok(CreateResult {
            created,
            entity: describe(&db, kind, identity)?,
        })
    }

    pub fn info(&self, kind: EntityKind, identity: &str, sink: &dyn ProgressSink) -> Result<InfoResult, QuoremError> {
        progress(sink, format!("phase=Resolve; looking up {kind} {identity}"), None);
        let db = self.load()?;
        describe(&db, kind, identity)
    }

    pub fn list(&self, kind: EntityKind, sink: &dyn ProgressSink) -> Result<ListResult, QuoremError> {
        progress(sink, format!("phase=Resolve; scanning {}", kind.plural_name()), None);
        let db = self.load()?;
        let mut entities = db
            .entities_of(kind)
            .map(|entity| ListEntry {
                identity: entity.identity.clone(),
                values: entity.values.len(),
                upstream: entity.closure.upstream.len(),
                downstream: entity.closure.downstream.len(),
            })
            .collect::<Vec<_>>();
        entities.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(ListResult {
            kind,
            entities,
            stats: db.stats(),
        })
    }

    pub fn parameters(
        &self,
        kind: EntityKind,
        identity: &str,
        sink: &dyn ProgressSink,
    ) -> Result<ParametersResult, QuoremError> {
        progress(sink, format!("phase=Resolve; parameters of {kind} {identity}"), None);
        let db = self.load()?;
        let entity = db.entity_by_identity(kind, identity)?.id;
        let mut steps = BTreeMap::new();
        for (step, parameters) in db.get_parameters(entity, None)? {
            steps.insert(db.entity(step)?.identity.clone(), parameters);
        }
        Ok(ParametersResult {
            kind,
            identity: identity.to_string(),
            steps,
        })
    }
}

impl<Q: JobQueue> JobRunner for App<Q> {
    /// Holds the upload lock for the whole run and the database lock from
    /// load to save. A failed run writes its report but leaves the saved
    /// snapshot untouched.
    fn run_job(&self, id: Uuid, job: &IngestJob, sink: &dyn ProgressSink) -> Result<IngestReport, QuoremError> {
        let started = Instant::now();
        let job_id = id.to_string();
        let _upload = self.store.lock_upload(job.source())?;
        let _database = self.lock_database()?;
        let mut db = self.load()?;
        info!(job = %job_id, source = %job.source().display(), "phase=Start; ingestion job");

        match self.ingest(&mut db, job, sink) {
            Ok(report) => {
                self.store.save_database(&db)?;
                self.store.write_report(&job_id, &report)?;
                progress(
                    sink,
                    format!(
                        "phase=Done; {} entities, {} values created, {} errors",
                        report.entities_created,
                        report.values_created,
                        report.errors.len()
                    ),
                    Some(started),
                );
                Ok(report)
            }
            Err(err) => {
                let mut report = IngestReport::new(job.format(), &job.source().display().to_string());
                report.fail(&err);
                self.store.write_report(&job_id, &report)?;
                warn!(job = %job_id, error = %err, "ingestion job failed");
                Err(err)
            }
        }
    }
}

fn identities(db: &Database, ids: impl IntoIterator<Item = EntityId>) -> Result<Vec<String>, QuoremError> {
    ids.into_iter()
        .map(|id| db.entity(id).map(|entity| entity.identity.clone()))
        .collect()
}

fn describe(db: &Database, kind: EntityKind, identity: &str) -> Result<InfoResult, QuoremError> {
    let entity = db.entity_by_identity(kind, identity)?;
    let mut references = BTreeMap::new();
    for (field, target) in &entity.references {
        references.insert(field.clone(), db.entity(*target)?.identity.clone());
    }
    let mut links = BTreeMap::new();
    for (field, targets) in &entity.many {
        links.insert(field.clone(), identities(db, targets.iter().copied())?);
    }
    let categories = entity
        .categories
        .iter()
        .map(|id| db.category(*id).map(|category| category.name.clone()))
        .collect::<Result<Vec<_>, _>>()?;
    let values = entity
        .values
        .iter()
        .map(|id| db.describe_value(*id))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(InfoResult {
        kind,
        identity: entity.identity.clone(),
        text: entity.text.clone(),
        references,
        links,
        upstream: identities(db, entity.closure.upstream.iter().copied())?,
        downstream: identities(db, entity.closure.downstream.iter().copied())?,
        categories,
        values,
    })
}

/// Reads a `key=value` pair as given on the command line.
pub fn parse_field(input: &str) -> Result<(String, String), QuoremError> {
    let (key, value) = input
        .split_once('=')
        .ok_or_else(|| QuoremError::AmbiguousInput(format!("expected key=value, got {input}")))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(QuoremError::AmbiguousInput(format!("empty field name in {input}")));
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;

    use super::*;
    use crate::output::JsonOutput;

    #[test]
    fn parse_field_requires_equals() {
        assert_eq!(
            parse_field("process=P1").unwrap(),
            ("process".to_string(), "P1".to_string())
        );
        assert_matches!(parse_field("process"), Err(QuoremError::AmbiguousInput(_)));
    }

    #[test]
    fn create_then_info() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().join("store")).unwrap();
        let app = App::new(Store::new_with_root(root), ResolvedConfig::default(), InlineJobQueue);

        app.create(EntityKind::Process, "P", &[], &JsonOutput).unwrap();
        let created = app
            .create(
                EntityKind::Analysis,
                "A",
                &[("process".to_string(), "P".to_string())],
                &JsonOutput,
            )
            .unwrap();
        assert!(created.created);
        assert_eq!(created.entity.references["process"], "P");

        let info = app.info(EntityKind::Analysis, "A", &JsonOutput).unwrap();
        assert_eq!(info.identity, "A");
        assert_matches!(
            app.info(EntityKind::Analysis, "B", &JsonOutput),
            Err(QuoremError::EntityNotFound { .. })
        );
    }
}
