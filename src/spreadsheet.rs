use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{EntityKind, ValueKind};
use crate::error::QuoremError;
use crate::fs_util;
use crate::ingest::{
    FieldAssignment, METADATA_FORMAT, ObjectRecord, Records, Scraper, ValueRecord,
};
use crate::validator::{Row, is_missing};

const TYPES_DIRECTIVE: &str = "#q2:types";

const SAMPLE_ID_HEADERS: &[&str] = &[
    "id",
    "sampleid",
    "sample id",
    "sample-id",
    "#sampleid",
    "#sample id",
    "sample_name",
];

const FEATURE_ID_HEADERS: &[&str] = &[
    "featureid",
    "feature id",
    "feature-id",
    "#featureid",
    "#feature id",
    "#otuid",
    "#otu id",
];

/// A delimited text table with a header row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

fn split_line(line: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ch if ch == delimiter && !quoted => fields.push(std::mem::take(&mut current)),
            ch => current.push(ch),
        }
    }
    fields.push(current);
    fields
}

fn dedupe_headers(headers: Vec<String>) -> Vec<String> {
    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    headers
        .into_iter()
        .map(|header| {
            let header = header.trim().to_string();
            let count = seen.entry(header.clone()).or_insert(0);
            let name = if *count == 0 {
                header
            } else {
                format!("{header}.{count}")
            };
            *count += 1;
            name
        })
        .collect()
}

impl Table {
    pub fn read(path: &Path) -> Result<Self, QuoremError> {
        Self::parse(&fs_util::read_text(path)?)
    }

    /// Parses comma or tab separated text, whichever splits the header into
    /// more columns. Only the header is consulted and tab wins a tie, so a
    /// single-column file is always read as tab separated.
    pub fn parse(text: &str) -> Result<Self, QuoremError> {
        let mut lines = text
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty());
        let Some((_, header_line)) = lines.next() else {
            return Err(QuoremError::Table("table has no header row".to_string()));
        };
        let delimiter = if split_line(header_line, '\t').len() >= split_line(header_line, ',').len() {
            '\t'
        } else {
            ','
        };
        let headers = dedupe_headers(split_line(header_line, delimiter));

        let mut rows = Vec::new();
        for (number, line) in lines {
            let mut cells = split_line(line, delimiter);
            if cells.len() > headers.len() {
                return Err(QuoremError::Table(format!(
                    "line {} has {} cells but the header has {}",
                    number + 1,
                    cells.len(),
                    headers.len()
                )));
            }
            cells.resize(headers.len(), String::new());
            rows.push(cells);
        }
        Ok(Self { headers, rows })
    }

    pub fn rows(&self) -> Vec<Row> {
        self.rows
            .iter()
            .map(|cells| Row::new(self.headers.iter().zip(cells.iter().cloned())))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpreadsheetKind {
    /// Identity columns such as `sample_id`, resolved row by row.
    Quorem,
    /// QIIME2 sample or feature metadata.
    Qiime2Metadata,
}

fn metadata_id_kind(header: &str) -> Option<EntityKind> {
    let normalized = header.trim().to_lowercase();
    if SAMPLE_ID_HEADERS.contains(&normalized.as_str()) {
        Some(EntityKind::Sample)
    } else if FEATURE_ID_HEADERS.contains(&normalized.as_str()) {
        Some(EntityKind::Feature)
    } else {
        None
    }
}

pub fn infer_spreadsheet_kind(table: &Table) -> Result<SpreadsheetKind, QuoremError> {
    let has_identity_column = table.headers.iter().any(|header| {
        EntityKind::ALL
            .into_iter()
            .any(|kind| crate::validator::base_column(header) == kind.id_column())
    });
    if has_identity_column {
        return Ok(SpreadsheetKind::Quorem);
    }
    if table
        .headers
        .first()
        .and_then(|header| metadata_id_kind(header))
        .is_some()
    {
        return Ok(SpreadsheetKind::Qiime2Metadata);
    }
    Err(QuoremError::UnknownFormat(format!(
        "no identity column among headers: {}",
        table.headers.join(", ")
    )))
}

/// QIIME2 metadata: the first column names samples or features, every other
/// column is a value. An optional `#q2:types` row gives the column types.
#[derive(Debug, Clone)]
pub struct MetadataScraper {
    table: Table,
    id_kind: EntityKind,
    hints: BTreeMap<String, String>,
    result: Option<String>,
}

impl MetadataScraper {
    pub fn open(path: &Path, result: Option<String>) -> Result<Self, QuoremError> {
        Self::from_table(Table::read(path)?, result)
    }

    pub fn from_table(mut table: Table, result: Option<String>) -> Result<Self, QuoremError> {
        let id_header = table
            .headers
            .first()
            .ok_or_else(|| QuoremError::Table("table has no columns".to_string()))?;
        let id_kind = metadata_id_kind(id_header)
            .ok_or_else(|| QuoremError::UnknownFormat(format!("not a metadata id column: {id_header}")))?;

        let mut hints = BTreeMap::new();
        let directive = table
            .rows
            .first()
            .and_then(|row| row.first())
            .is_some_and(|cell| cell.trim().eq_ignore_ascii_case(TYPES_DIRECTIVE));
        if directive {
            let types = table.rows.remove(0);
            for (header, kind) in table.headers.iter().zip(types).skip(1) {
                let hint = match kind.trim().to_lowercase().as_str() {
                    "numeric" => "float",
                    "categorical" => "str",
                    _ => continue,
                };
                hints.insert(header.clone(), hint.to_string());
            }
        }
        table.rows.retain(|row| {
            row.first()
                .is_some_and(|cell| !cell.trim().starts_with('#') && !is_missing(cell))
        });
        debug!(kind = %id_kind, rows = table.rows.len(), "parsed metadata table");
        Ok(Self {
            table,
            id_kind,
            hints,
            result,
        })
    }

    fn link_field(&self) -> &'static str {
        match self.id_kind {
            EntityKind::Feature => "features",
            _ => "samples",
        }
    }

    fn identities(&self) -> impl Iterator<Item = &str> + '_ {
        self.table
            .rows
            .iter()
            .filter_map(|row| row.first())
            .map(|cell| cell.trim())
    }
}

impl Scraper for MetadataScraper {
    fn format(&self) -> &str {
        METADATA_FORMAT
    }

    fn iter_objects(&mut self, update: bool) -> Result<Records<'_, ObjectRecord>, QuoremError> {
        let kind = self.id_kind;
        let objects = self
            .identities()
            .map(move |identity| Ok::<_, QuoremError>(ObjectRecord::new(kind, identity)));
        let Some(result) = self.result.clone() else {
            return Ok(Box::new(objects));
        };
        let field = self.link_field();
        let result_records = self.identities().map(move |identity| {
            let record = ObjectRecord::new(EntityKind::Result, result.clone());
            Ok::<_, QuoremError>(if update {
                record.on_update(FieldAssignment::Link {
                    field: field.to_string(),
                    target: (kind, identity.to_string()),
                })
            } else {
                record
            })
        });
        Ok(Box::new(objects.chain(result_records)))
    }

    fn iter_values(&mut self) -> Result<Records<'_, ValueRecord>, QuoremError> {
        let kind = self.id_kind;
        let result = self.result.clone();
        let headers = &self.table.headers;
        let hints = &self.hints;
        let records = self.table.rows.iter().flat_map(move |row| {
            let identity = row.first().map(|cell| cell.trim().to_string()).unwrap_or_default();
            let result = result.clone();
            headers
                .iter()
                .zip(row.iter())
                .skip(1)
                .filter(|(_, cell)| !is_missing(cell))
                .map(move |(header, cell)| {
                    let mut record = ValueRecord::new(header.clone(), ValueKind::Value, cell.trim())
                        .target(kind, identity.clone());
                    if let Some(hint) = hints.get(header) {
                        record = record.data_kind(hint.clone());
                    }
                    if let Some(result) = &result {
                        record = record.target(EntityKind::Result, result.clone());
                    }
                    Ok::<_, QuoremError>(record)
                })
        });
        Ok(Box::new(records))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn picks_delimiter_and_dedupes_headers() {
        let table = Table::parse("sample_id,ph,ph\nS1,7.2,7.3\n\nS2,\"6,5\"\n").unwrap();
        assert_eq!(table.headers, vec!["sample_id", "ph", "ph.1"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[1], vec!["S2", "6,5", ""]);

        let tsv = Table::parse("sample_id\tnote\nS1\ta, b\n").unwrap();
        assert_eq!(tsv.rows[0][1], "a, b");
    }

    #[test]
    fn single_column_reads_as_tab_separated() {
        let table = Table::parse("sample_id\nS1\n").unwrap();
        assert_eq!(table.headers, vec!["sample_id"]);
        assert_eq!(table.rows, vec![vec!["S1".to_string()]]);

        let comma_row = Table::parse("sample_id\nS1,7.2\n").unwrap();
        assert_eq!(comma_row.rows[0], vec!["S1,7.2".to_string()]);
    }

    #[test]
    fn long_rows_are_rejected() {
        let err = Table::parse("a,b\n1,2,3\n").unwrap_err();
        assert_matches!(err, QuoremError::Table(_));
    }

    #[test]
    fn infers_kind() {
        let quorem = Table::parse("sample_id,ph\nS1,7\n").unwrap();
        assert_eq!(infer_spreadsheet_kind(&quorem).unwrap(), SpreadsheetKind::Quorem);
        let metadata = Table::parse("sample-id\tph\nS1\t7\n").unwrap();
        assert_eq!(
            infer_spreadsheet_kind(&metadata).unwrap(),
            SpreadsheetKind::Qiime2Metadata
        );
        let unknown = Table::parse("name,ph\nS1,7\n").unwrap();
        assert_matches!(
            infer_spreadsheet_kind(&unknown),
            Err(QuoremError::UnknownFormat(_))
        );
    }

    #[test]
    fn metadata_types_row_sets_hints() {
        let table = Table::parse(
            "sample-id\tph\tsite\n#q2:types\tnumeric\tcategorical\nS1\t7\tNorth\nS2\tNA\tSouth\n",
        )
        .unwrap();
        let mut scraper = MetadataScraper::from_table(table, None).unwrap();
        let values = scraper
            .iter_values()
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values[0].data_kind.as_deref(), Some("float"));
        assert_eq!(values[1].data_kind.as_deref(), Some("str"));
        assert_eq!(values[0].targets, vec![(EntityKind::Sample, "S1".to_string())]);
    }

    #[test]
    fn metadata_links_result_on_update() {
        let uuid = "4f2d3b8e-29c5-4a1b-9d8e-123456789abc";
        let table = Table::parse("feature id\tconfidence\nF1\t0.9\n").unwrap();
        let mut scraper = MetadataScraper::from_table(table, Some(uuid.to_string())).unwrap();
        let skeleton = scraper
            .iter_objects(false)
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert!(skeleton.iter().all(|record| record.update.is_empty()));
        let updates = scraper
            .iter_objects(true)
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(updates[1].kind, EntityKind::Result);
        assert_eq!(
            updates[1].update,
            vec![FieldAssignment::Link {
                field: "features".to_string(),
                target: (EntityKind::Feature, "F1".to_string()),
            }]
        );
    }
}
