//! QIIME2 artifact archives.
//!
//! An artifact is a zip whose single top-level directory is the artifact
//! uuid. The root carries `metadata.yaml` and `provenance/action/action.yaml`;
//! every upstream artifact contributes the same pair under
//! `provenance/artifacts/<uuid>/`. Each artifact becomes a result produced by
//! a step of the target analysis; the payload under `data/` is read for the
//! formats listed in [`Payload`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_yaml::Value as Yaml;
use tracing::{debug, info};
use uuid::Uuid;

use crate::data_types::{RawValue, SparseMatrix};
use crate::domain::{EntityKind, ValueKind};
use crate::error::QuoremError;
use crate::fs_util::{self, Archive};
use crate::ingest::{ARTIFACT_FORMAT, FieldAssignment, ObjectRecord, Records, Scraper, ValueRecord};
use crate::spreadsheet::Table;
use crate::validator::is_missing;

pub const IMPORT_STEP: &str = "qiime2_import";

static NESTED_METADATA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^/]+/provenance/artifacts/(?P<uuid>[0-9a-fA-F-]{36})/metadata\.yaml$").unwrap()
});

static PAIRED_READ: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<sample>.+?)_S[^_]*_L001_R(?P<read>[12])_001\.fastq\.gz$").unwrap()
});

const HDF5_MAGIC: &[u8] = b"\x89HDF";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActionKind {
    Method,
    Pipeline,
    Visualizer,
    Import,
}

#[derive(Debug, Clone, PartialEq)]
struct ManifestEntry {
    sample: String,
    direction: &'static str,
    filename: String,
    md5sum: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
struct ProvenanceNode {
    uuid: String,
    result_type: String,
    format: String,
    kind: ActionKind,
    step: String,
    inputs: Vec<String>,
    parameters: Vec<(String, RawValue)>,
    manifest: Vec<ManifestEntry>,
    duration: Option<String>,
    start: Option<String>,
    end: Option<String>,
    framework: Option<String>,
    plugins: Vec<(String, String)>,
    packages: Vec<(String, String)>,
}

/// Payload records for the formats with a reader.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Taxonomy(Vec<TaxonomyRow>),
    Tree { newick: String, leaves: Vec<String> },
    DistanceMatrix(SparseMatrix),
    AlphaDiversity { metric: String, rows: Vec<(String, String)> },
    Stats { columns: Vec<String>, rows: Vec<Vec<String>> },
    FeatureTable(SparseMatrix),
    Unsupported(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaxonomyRow {
    pub feature: String,
    pub taxon: String,
    pub confidence: Option<String>,
}

fn untag(value: Yaml) -> Yaml {
    match value {
        Yaml::Tagged(tagged) => untag(tagged.value),
        Yaml::Sequence(items) => Yaml::Sequence(items.into_iter().map(untag).collect()),
        Yaml::Mapping(map) => Yaml::Mapping(
            map.into_iter()
                .map(|(key, value)| (untag(key), untag(value)))
                .collect(),
        ),
        other => other,
    }
}

fn load_yaml(archive: &mut Archive, name: &str) -> Result<Yaml, QuoremError> {
    let text = fs_util::read_entry_string(archive, name)?;
    let value: Yaml = serde_yaml::from_str(&text).map_err(|err| QuoremError::Yaml {
        path: name.to_string(),
        message: err.to_string(),
    })?;
    Ok(untag(value))
}

fn scalar(value: &Yaml) -> Option<String> {
    match value {
        Yaml::String(text) => Some(text.clone()),
        Yaml::Number(number) => Some(number.to_string()),
        Yaml::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn field(value: &Yaml, path: &[&str]) -> Option<String> {
    let mut current = value;
    for key in path {
        current = current.get(*key)?;
    }
    scalar(current)
}

/// Converts a YAML parameter to a raw value. Nulls are dropped.
pub fn yaml_to_raw(value: &Yaml) -> Option<RawValue> {
    match value {
        Yaml::Null => None,
        Yaml::Bool(flag) => Some(RawValue::Text(flag.to_string())),
        Yaml::Number(number) => number
            .as_i64()
            .map(RawValue::Int)
            .or_else(|| number.as_f64().map(RawValue::Float)),
        Yaml::String(text) => Some(RawValue::Text(text.clone())),
        Yaml::Sequence(_) | Yaml::Mapping(_) => serde_json::to_string(value).ok().map(RawValue::Text),
        Yaml::Tagged(tagged) => yaml_to_raw(&tagged.value),
    }
}

/// Single-key maps in a YAML list, as QIIME2 writes inputs and parameters.
fn pairs(value: Option<&Yaml>) -> Vec<(String, Yaml)> {
    value
        .and_then(Yaml::as_sequence)
        .into_iter()
        .flatten()
        .filter_map(Yaml::as_mapping)
        .flat_map(|map| map.iter())
        .filter_map(|(key, value)| scalar(key).map(|key| (key, value.clone())))
        .collect()
}

fn mapping_pairs(value: Option<&Yaml>, version_key: bool) -> Vec<(String, String)> {
    value
        .and_then(Yaml::as_mapping)
        .into_iter()
        .flatten()
        .filter_map(|(key, value)| {
            let version = if version_key {
                value.get("version").and_then(scalar).or_else(|| scalar(value))
            } else {
                scalar(value)
            };
            Some((scalar(key)?, version?))
        })
        .collect()
}

fn parse_manifest(action: &Yaml) -> Vec<ManifestEntry> {
    action
        .get("manifest")
        .and_then(Yaml::as_sequence)
        .into_iter()
        .flatten()
        .filter_map(|item| {
            let filename = field(item, &["name"])?;
            let captures = PAIRED_READ.captures(&filename)?;
            let direction = if &captures["read"] == "1" { "forward" } else { "reverse" };
            Some(ManifestEntry {
                sample: captures["sample"].to_string(),
                direction,
                filename: filename.clone(),
                md5sum: field(item, &["md5sum"]),
            })
        })
        .collect()
}

fn parse_node(uuid: &str, metadata: &Yaml, action_yaml: &Yaml) -> Result<ProvenanceNode, QuoremError> {
    let action = action_yaml
        .get("action")
        .ok_or_else(|| QuoremError::Archive(format!("{uuid}: action.yaml has no action section")))?;
    let kind = match field(action, &["type"]).as_deref() {
        Some("method") => ActionKind::Method,
        Some("pipeline") => ActionKind::Pipeline,
        Some("visualizer") => ActionKind::Visualizer,
        Some("import") => ActionKind::Import,
        other => {
            return Err(QuoremError::Archive(format!(
                "{uuid}: unknown action type {}",
                other.unwrap_or("<missing>")
            )));
        }
    };

    let step = match kind {
        ActionKind::Import => IMPORT_STEP.to_string(),
        _ => {
            let plugin = field(action, &["plugin"])
                .ok_or_else(|| QuoremError::Archive(format!("{uuid}: action has no plugin")))?;
            let name = field(action, &["action"])
                .ok_or_else(|| QuoremError::Archive(format!("{uuid}: action has no name")))?;
            let plugin = plugin.rsplit(':').next().unwrap_or(&plugin).to_string();
            format!("{plugin}__{name}")
        }
    };

    let inputs = pairs(action.get("inputs"))
        .into_iter()
        .filter_map(|(_, value)| scalar(&value))
        .collect();
    let parameters = pairs(action.get("parameters"))
        .into_iter()
        .filter_map(|(name, value)| yaml_to_raw(&value).map(|raw| (name, raw)))
        .collect();
    let manifest = if kind == ActionKind::Import {
        parse_manifest(action)
    } else {
        Vec::new()
    };

    let environment = action_yaml.get("environment");
    Ok(ProvenanceNode {
        uuid: uuid.to_string(),
        result_type: field(metadata, &["type"]).unwrap_or_default(),
        format: field(metadata, &["format"]).unwrap_or_default(),
        kind,
        step,
        inputs,
        parameters,
        manifest,
        duration: field(action_yaml, &["execution", "runtime", "duration"]),
        start: field(action_yaml, &["execution", "runtime", "start"]),
        end: field(action_yaml, &["execution", "runtime", "end"]),
        framework: environment.and_then(|env| {
            field(env, &["framework", "version"]).or_else(|| field(env, &["framework"]))
        }),
        plugins: mapping_pairs(environment.and_then(|env| env.get("plugins")), true),
        packages: mapping_pairs(environment.and_then(|env| env.get("python-packages")), false),
    })
}

fn newick_leaves(newick: &str) -> Vec<String> {
    let mut leaves = Vec::new();
    let mut expecting_leaf = true;
    let mut label = String::new();
    let mut quoted = false;
    let mut in_label = false;
    let mut after_close = false;
    for ch in newick.chars() {
        if quoted {
            if ch == '\'' {
                quoted = false;
            } else {
                label.push(ch);
            }
            continue;
        }
        match ch {
            '\'' => {
                quoted = true;
                in_label = true;
            }
            '(' | ',' | ')' | ':' | ';' => {
                if in_label && expecting_leaf && !after_close && !label.trim().is_empty() {
                    leaves.push(label.trim().to_string());
                }
                label.clear();
                in_label = false;
                match ch {
                    '(' | ',' => {
                        expecting_leaf = true;
                        after_close = false;
                    }
                    ')' => {
                        expecting_leaf = true;
                        after_close = true;
                    }
                    _ => expecting_leaf = false,
                }
            }
            ch if ch.is_whitespace() && !in_label => {}
            ch => {
                label.push(ch);
                in_label = true;
            }
        }
    }
    leaves
}

#[derive(Debug, Deserialize)]
struct BiomAxis {
    id: String,
}

#[derive(Debug, Deserialize)]
struct BiomJson {
    shape: (usize, usize),
    rows: Vec<BiomAxis>,
    columns: Vec<BiomAxis>,
    #[serde(default)]
    matrix_type: Option<String>,
    data: serde_json::Value,
}

/// Payload matrices must name every row and column of their shape.
fn checked_matrix(matrix: SparseMatrix, what: &str) -> Result<SparseMatrix, QuoremError> {
    matrix
        .validate()
        .map_err(|err| QuoremError::Archive(format!("{what}: {err}")))?;
    if matrix.row_ids.len() != matrix.shape.0 || matrix.column_ids.len() != matrix.shape.1 {
        return Err(QuoremError::Archive(format!(
            "{what}: {} row and {} column ids for shape {}x{}",
            matrix.row_ids.len(),
            matrix.column_ids.len(),
            matrix.shape.0,
            matrix.shape.1
        )));
    }
    Ok(matrix)
}

fn parse_biom(content: &[u8]) -> Result<Payload, QuoremError> {
    if content.starts_with(HDF5_MAGIC) {
        return Ok(Payload::Unsupported(
            "BIOM 2.1 tables stored as HDF5 cannot be read".to_string(),
        ));
    }
    let biom: BiomJson =
        serde_json::from_slice(content).map_err(|err| QuoremError::Archive(format!("feature table: {err}")))?;
    let mut matrix = SparseMatrix {
        values: Vec::new(),
        rows: Vec::new(),
        columns: Vec::new(),
        shape: biom.shape,
        row_kind: Some(EntityKind::Feature),
        column_kind: Some(EntityKind::Sample),
        row_ids: biom.rows.into_iter().map(|axis| axis.id).collect(),
        column_ids: biom.columns.into_iter().map(|axis| axis.id).collect(),
    };
    let bad = || QuoremError::Archive("feature table data is malformed".to_string());
    if biom.matrix_type.as_deref() == Some("dense") {
        let rows: Vec<Vec<f64>> = serde_json::from_value(biom.data).map_err(|_| bad())?;
        for (row, cells) in rows.into_iter().enumerate() {
            for (column, value) in cells.into_iter().enumerate() {
                if value != 0.0 {
                    matrix.values.push(value);
                    matrix.rows.push(row);
                    matrix.columns.push(column);
                }
            }
        }
    } else {
        let entries: Vec<(usize, usize, f64)> = serde_json::from_value(biom.data).map_err(|_| bad())?;
        for (row, column, value) in entries {
            matrix.values.push(value);
            matrix.rows.push(row);
            matrix.columns.push(column);
        }
    }
    Ok(Payload::FeatureTable(checked_matrix(matrix, "feature table")?))
}

fn parse_distance_matrix(text: &str) -> Result<Payload, QuoremError> {
    let table = Table::parse(text)?;
    let ids = table.headers.iter().skip(1).cloned().collect::<Vec<_>>();
    let n = ids.len();
    let mut matrix = SparseMatrix {
        values: Vec::new(),
        rows: Vec::new(),
        columns: Vec::new(),
        shape: (n, n),
        row_kind: Some(EntityKind::Sample),
        column_kind: Some(EntityKind::Sample),
        row_ids: Vec::new(),
        column_ids: ids,
    };
    for (row, cells) in table.rows.iter().enumerate() {
        matrix.row_ids.push(cells.first().cloned().unwrap_or_default());
        for (column, cell) in cells.iter().skip(1).enumerate() {
            let value: f64 = cell
                .trim()
                .parse()
                .map_err(|_| QuoremError::Archive(format!("distance matrix cell {cell:?} is not a number")))?;
            if value != 0.0 {
                matrix.values.push(value);
                matrix.rows.push(row);
                matrix.columns.push(column);
            }
        }
    }
    Ok(Payload::DistanceMatrix(checked_matrix(matrix, "distance matrix")?))
}

fn data_rows(table: Table) -> Vec<Vec<String>> {
    table
        .rows
        .into_iter()
        .filter(|row| row.first().is_some_and(|cell| !cell.trim().starts_with('#') && !is_missing(cell)))
        .collect()
}

fn read_payload(archive: &mut Archive, root: &str, format: &str) -> Result<Option<Payload>, QuoremError> {
    let mut text = |file: &str| fs_util::read_entry_string(archive, &format!("{root}/data/{file}"));
    let payload = match format {
        "TSVTaxonomyDirectoryFormat" => {
            let table = Table::parse(&text("taxonomy.tsv")?)?;
            let position = |name: &str| table.headers.iter().position(|header| header.eq_ignore_ascii_case(name));
            let (Some(feature), Some(taxon)) = (position("Feature ID"), position("Taxon")) else {
                return Err(QuoremError::Archive("taxonomy.tsv lacks Feature ID or Taxon".to_string()));
            };
            let confidence = position("Confidence");
            let rows = data_rows(table.clone())
                .into_iter()
                .map(|row| TaxonomyRow {
                    feature: row[feature].trim().to_string(),
                    taxon: row[taxon].trim().to_string(),
                    confidence: confidence
                        .map(|index| row[index].trim().to_string())
                        .filter(|cell| !is_missing(cell)),
                })
                .collect();
            Payload::Taxonomy(rows)
        }
        "NewickDirectoryFormat" => {
            let newick = text("tree.nwk")?.trim().to_string();
            let leaves = newick_leaves(&newick);
            Payload::Tree { newick, leaves }
        }
        "DistanceMatrixDirectoryFormat" => parse_distance_matrix(&text("distance-matrix.tsv")?)?,
        "AlphaDiversityDirectoryFormat" => {
            let table = Table::parse(&text("alpha-diversity.tsv")?)?;
            let metric = table
                .headers
                .get(1)
                .cloned()
                .ok_or_else(|| QuoremError::Archive("alpha-diversity.tsv has no metric column".to_string()))?;
            let rows = data_rows(table)
                .into_iter()
                .filter_map(|row| Some((row.first()?.trim().to_string(), row.get(1)?.trim().to_string())))
                .filter(|(_, value)| !is_missing(value))
                .collect();
            Payload::AlphaDiversity { metric, rows }
        }
        "DADA2StatsDirFmt" | "QualityFilterStatsDirFmt" => {
            let file = if format == "DADA2StatsDirFmt" { "stats.tsv" } else { "stats.csv" };
            let table = Table::parse(&text(file)?)?;
            let columns = table.headers.clone();
            Payload::Stats {
                columns,
                rows: data_rows(table),
            }
        }
        "BIOMV210DirFmt" => {
            let content = fs_util::read_entry(archive, &format!("{root}/data/feature-table.biom"))?;
            parse_biom(&content)?
        }
        _ => return Ok(None),
    };
    Ok(Some(payload))
}

impl Payload {
    /// Entities named by the payload, and the result field that links them.
    fn entities(&self) -> Vec<(EntityKind, String)> {
        match self {
            Payload::Taxonomy(rows) => tagged(EntityKind::Feature, rows.iter().map(|row| &row.feature)),
            Payload::Tree { leaves, .. } => tagged(EntityKind::Feature, leaves),
            Payload::DistanceMatrix(matrix) => tagged(EntityKind::Sample, &matrix.row_ids),
            Payload::AlphaDiversity { rows, .. } => {
                tagged(EntityKind::Sample, rows.iter().map(|(sample, _)| sample))
            }
            Payload::Stats { rows, .. } => tagged(EntityKind::Sample, rows.iter().filter_map(|row| row.first())),
            Payload::FeatureTable(matrix) => {
                let mut entities = tagged(EntityKind::Feature, &matrix.row_ids);
                entities.extend(tagged(EntityKind::Sample, &matrix.column_ids));
                entities
            }
            Payload::Unsupported(_) => Vec::new(),
        }
    }

    fn objects(&self, root: &str, update: bool) -> Vec<ObjectRecord> {
        let entities = self.entities();
        let mut records = entities
            .iter()
            .map(|(kind, identity)| ObjectRecord::new(*kind, identity.trim()))
            .collect::<Vec<_>>();

        if let Payload::FeatureTable(matrix) = self {
            let mut present: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
            for (row, column) in matrix.rows.iter().zip(&matrix.columns) {
                present.entry(*row).or_default().insert(*column);
            }
            for (row, columns) in present {
                let mut record = ObjectRecord::new(EntityKind::Feature, matrix.row_ids[row].clone());
                for column in columns {
                    record = record.on_update(FieldAssignment::Link {
                        field: "samples".to_string(),
                        target: (EntityKind::Sample, matrix.column_ids[column].clone()),
                    });
                }
                records.push(record);
            }
        }

        let mut result = ObjectRecord::new(EntityKind::Result, root);
        for (kind, identity) in entities {
            result = result.on_update(FieldAssignment::Link {
                field: kind.plural_name().to_string(),
                target: (kind, identity.trim().to_string()),
            });
        }
        records.push(result);
        records
            .into_iter()
            .map(|record| skeleton(record, update))
            .collect()
    }

    fn values(&self, root: &str) -> Vec<Result<ValueRecord, QuoremError>> {
        let measure = |name: &str, raw: &str| {
            ValueRecord::new(name, ValueKind::Measure, raw.trim()).target(EntityKind::Result, root)
        };
        match self {
            Payload::Taxonomy(rows) => rows
                .iter()
                .flat_map(|row| {
                    let mut records = vec![Ok(measure("taxonomic_classification", &row.taxon)
                        .data_kind("str")
                        .target(EntityKind::Feature, row.feature.clone()))];
                    if let Some(confidence) = &row.confidence {
                        records.push(Ok(measure("confidence", confidence)
                            .data_kind("float")
                            .target(EntityKind::Feature, row.feature.clone())));
                    }
                    records
                })
                .collect(),
            Payload::Tree { newick, leaves } => vec![
                Ok(ValueRecord::new("newick", ValueKind::Value, newick.as_str())
                    .data_kind("str")
                    .target(EntityKind::Result, root)),
                Ok(measure("leaf_count", &leaves.len().to_string()).data_kind("int")),
            ],
            Payload::DistanceMatrix(matrix) => vec![Ok(ValueRecord::new(
                "distance_matrix",
                ValueKind::Matrix,
                RawValue::Matrix(matrix.clone()),
            )
            .data_kind("matrix")
            .target(EntityKind::Result, root))],
            Payload::AlphaDiversity { metric, rows } => rows
                .iter()
                .map(|(sample, value)| {
                    Ok(measure(metric, value)
                        .data_kind("float")
                        .target(EntityKind::Sample, sample.clone()))
                })
                .collect(),
            Payload::Stats { columns, rows } => rows
                .iter()
                .flat_map(|row| {
                    let sample = row.first().map(|cell| cell.trim().to_string()).unwrap_or_default();
                    columns
                        .iter()
                        .zip(row.iter())
                        .skip(1)
                        .filter(|(_, cell)| !is_missing(cell))
                        .map(|(column, cell)| {
                            Ok::<_, QuoremError>(measure(column, cell).target(EntityKind::Sample, sample.clone()))
                        })
                        .collect::<Vec<_>>()
                })
                .collect(),
            Payload::FeatureTable(matrix) => vec![Ok(ValueRecord::new(
                "feature_table",
                ValueKind::Matrix,
                RawValue::Matrix(matrix.clone()),
            )
            .data_kind("matrix")
            .target(EntityKind::Result, root))],
            Payload::Unsupported(reason) => vec![Err(QuoremError::UnsupportedPayload(reason.clone()))],
        }
    }
}

fn tagged<'a>(kind: EntityKind, ids: impl IntoIterator<Item = &'a String>) -> Vec<(EntityKind, String)> {
    ids.into_iter().map(|id| (kind, id.trim().to_string())).collect()
}

fn skeleton(mut record: ObjectRecord, update: bool) -> ObjectRecord {
    if !update {
        record.update.clear();
    }
    record
}

pub struct ArtifactScraper {
    root: String,
    analysis: String,
    nodes: Vec<ProvenanceNode>,
    payload: Option<Payload>,
}

impl ArtifactScraper {
    /// Reads provenance for the root artifact, and for every upstream
    /// artifact when `register_provenance` is set.
    pub fn open(path: &Path, analysis: &str, register_provenance: bool) -> Result<Self, QuoremError> {
        let mut archive = fs_util::open_archive(path)?;
        let entries = fs_util::archive_entries(&mut archive)?;
        let root = entries
            .first()
            .and_then(|entry| entry.split('/').next())
            .ok_or_else(|| QuoremError::Archive(format!("{} is empty", path.display())))?
            .to_string();
        if Uuid::parse_str(&root).is_err() {
            return Err(QuoremError::UnrecognizedRoot(root));
        }
        if let Some(stray) = entries.iter().find(|entry| !entry.starts_with(&format!("{root}/"))) {
            return Err(QuoremError::Archive(format!("entry {stray} is outside {root}/")));
        }

        let metadata = load_yaml(&mut archive, &format!("{root}/metadata.yaml"))?;
        let action = load_yaml(&mut archive, &format!("{root}/provenance/action/action.yaml"))?;
        let root_node = parse_node(&root, &metadata, &action)?;
        let format = root_node.format.clone();
        let mut nodes = vec![root_node];

        if register_provenance {
            let nested = entries
                .iter()
                .filter_map(|entry| NESTED_METADATA.captures(entry))
                .map(|captures| captures["uuid"].to_string())
                .filter(|uuid| *uuid != root)
                .collect::<BTreeSet<_>>();
            for uuid in nested {
                let base = format!("{root}/provenance/artifacts/{uuid}");
                let metadata = load_yaml(&mut archive, &format!("{base}/metadata.yaml"))?;
                let action = load_yaml(&mut archive, &format!("{base}/action/action.yaml"))?;
                nodes.push(parse_node(&uuid, &metadata, &action)?);
            }
        }

        let payload = read_payload(&mut archive, &root, &format)?;
        info!(
            root = %root,
            format = %format,
            provenance = nodes.len(),
            payload = payload.is_some(),
            "opened artifact"
        );
        Ok(Self {
            root,
            analysis: analysis.to_string(),
            nodes,
            payload,
        })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    fn node_objects(&self, node: &ProvenanceNode, known: &BTreeSet<&str>, update: bool) -> Vec<ObjectRecord> {
        let mut records = vec![ObjectRecord::new(EntityKind::Step, node.step.clone())];
        let mut result = ObjectRecord::new(EntityKind::Result, node.uuid.clone())
            .on_create(FieldAssignment::Reference {
                field: "analysis".to_string(),
                target: (EntityKind::Analysis, self.analysis.clone()),
            })
            .on_create(FieldAssignment::Reference {
                field: "source_step".to_string(),
                target: (EntityKind::Step, node.step.clone()),
            });
        if !node.result_type.is_empty() {
            result = result.on_create(FieldAssignment::Text {
                field: "type".to_string(),
                value: node.result_type.clone(),
            });
        }
        for input in &node.inputs {
            if known.contains(input.as_str()) {
                result = result.on_update(FieldAssignment::Upstream(input.clone()));
            } else {
                debug!(result = %node.uuid, input = %input, "input artifact not registered");
            }
        }
        let samples = node
            .manifest
            .iter()
            .map(|entry| entry.sample.clone())
            .collect::<BTreeSet<_>>();
        for sample in samples {
            records.push(ObjectRecord::new(EntityKind::Sample, sample.clone()).on_create(
                FieldAssignment::Reference {
                    field: "source_step".to_string(),
                    target: (EntityKind::Step, node.step.clone()),
                },
            ));
            result = result.on_update(FieldAssignment::Link {
                field: "samples".to_string(),
                target: (EntityKind::Sample, sample),
            });
        }
        records.push(result);
        records
            .into_iter()
            .map(|record| skeleton(record, update))
            .collect()
    }

    fn node_values(node: &ProvenanceNode) -> Vec<Result<ValueRecord, QuoremError>> {
        let uuid = node.uuid.as_str();
        let on_result = |name: &str, kind: ValueKind, raw: &str, data_kind: &str| {
            Ok(ValueRecord::new(name, kind, raw)
                .data_kind(data_kind)
                .target(EntityKind::Result, uuid))
        };
        let mut records = Vec::new();
        if !node.result_type.is_empty() {
            records.push(on_result("qiime2_type", ValueKind::Value, &node.result_type, "str"));
        }
        if !node.format.is_empty() {
            records.push(on_result("qiime2_format", ValueKind::Value, &node.format, "str"));
        }
        if node.kind != ActionKind::Import {
            for (name, raw) in &node.parameters {
                records.push(Ok(ValueRecord::new(name.clone(), ValueKind::Parameter, raw.clone())
                    .target(EntityKind::Step, node.step.clone())
                    .target(EntityKind::Result, uuid)));
            }
        }
        for entry in &node.manifest {
            records.push(Ok(ValueRecord::new(
                format!("{}_filename", entry.direction),
                ValueKind::File,
                entry.filename.as_str(),
            )
            .data_kind("file")
            .target(EntityKind::Sample, entry.sample.clone())));
            if let Some(md5sum) = &entry.md5sum {
                records.push(Ok(ValueRecord::new(
                    format!("{}_file_md5sum", entry.direction),
                    ValueKind::Value,
                    md5sum.as_str(),
                )
                .data_kind("str")
                .target(EntityKind::Sample, entry.sample.clone())));
            }
        }
        if let Some(duration) = &node.duration {
            records.push(on_result("runtime", ValueKind::Measure, duration, "time"));
        }
        if let Some(start) = &node.start {
            records.push(on_result("start", ValueKind::Date, start, "datetime"));
        }
        if let Some(end) = &node.end {
            records.push(on_result("end", ValueKind::Date, end, "datetime"));
        }
        if let Some(framework) = &node.framework {
            records.push(on_result("qiime2", ValueKind::Version, framework, "version"));
        }
        for (plugin, version) in &node.plugins {
            records.push(on_result(&format!("q2-{plugin}"), ValueKind::Version, version, "version"));
        }
        for (package, version) in &node.packages {
            let data_kind = if version.matches('.').count() == 2 { "version" } else { "str" };
            records.push(on_result(package, ValueKind::Version, version, data_kind));
        }
        records
    }
}

impl Scraper for ArtifactScraper {
    fn format(&self) -> &str {
        ARTIFACT_FORMAT
    }

    fn iter_objects(&mut self, update: bool) -> Result<Records<'_, ObjectRecord>, QuoremError> {
        let this: &Self = self;
        let known = this.nodes.iter().map(|node| node.uuid.as_str()).collect::<BTreeSet<_>>();
        let nodes = this
            .nodes
            .iter()
            .flat_map(move |node| this.node_objects(node, &known, update));
        let payload = this
            .payload
            .iter()
            .flat_map(move |payload| payload.objects(&this.root, update));
        Ok(Box::new(nodes.chain(payload).map(Ok)))
    }

    fn iter_values(&mut self) -> Result<Records<'_, ValueRecord>, QuoremError> {
        let this: &Self = self;
        let nodes = this.nodes.iter().flat_map(Self::node_values);
        let payload = this
            .payload
            .iter()
            .flat_map(move |payload| payload.values(&this.root));
        Ok(Box::new(nodes.chain(payload)))
    }
}
