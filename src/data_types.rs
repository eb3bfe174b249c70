//! The closed set of Data kinds: native representations, cast functions,
//! storable encodings and type inference.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::EntityKind;
use crate::error::QuoremError;
use crate::units::{self, Quantity, QuantityKind};

pub const DEFAULT_DATETIME_FORMATS: &[&str] = &[
    "%d/%m/%Y",
    "%Y-%m-%d",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
];

static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*://\S+$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum DataKind {
    Str,
    Int,
    Float,
    Datetime,
    Version,
    Coordinate,
    Quantity(QuantityKind),
    Matrix,
    Sequence,
    Link,
    File,
    User,
    Entity(EntityKind),
}

impl DataKind {
    /// Kinds tried, in order, when a textual value carries no type information.
    pub fn inference_order() -> Vec<DataKind> {
        let mut order = vec![
            DataKind::Int,
            DataKind::Float,
            DataKind::Datetime,
            DataKind::Coordinate,
            DataKind::Version,
        ];
        order.extend(QuantityKind::ALL.into_iter().map(DataKind::Quantity));
        order
    }

    pub fn all() -> Vec<DataKind> {
        let mut kinds = vec![DataKind::Str];
        kinds.extend(Self::inference_order());
        kinds.extend([
            DataKind::Matrix,
            DataKind::Sequence,
            DataKind::Link,
            DataKind::File,
            DataKind::User,
        ]);
        kinds.extend(EntityKind::ALL.into_iter().map(DataKind::Entity));
        kinds
    }

    pub fn name(self) -> &'static str {
        match self {
            DataKind::Str => "str",
            DataKind::Int => "int",
            DataKind::Float => "float",
            DataKind::Datetime => "datetime",
            DataKind::Version => "version",
            DataKind::Coordinate => "coordinate",
            DataKind::Quantity(kind) => kind.as_str(),
            DataKind::Matrix => "matrix",
            DataKind::Sequence => "sequence",
            DataKind::Link => "link",
            DataKind::File => "file",
            DataKind::User => "user",
            DataKind::Entity(kind) => kind.base_name(),
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for DataKind {
    type Err = QuoremError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        let alias = match normalized.as_str() {
            "string" | "text" | "categorical" => "str",
            "integer" => "int",
            "numeric" | "number" | "double" => "float",
            "date" => "datetime",
            other => other,
        };
        DataKind::all()
            .into_iter()
            .find(|kind| kind.name() == alias)
            .ok_or_else(|| QuoremError::UnknownDataKind(value.to_string()))
    }
}

impl From<DataKind> for String {
    fn from(kind: DataKind) -> Self {
        kind.name().to_string()
    }
}

impl TryFrom<String> for DataKind {
    type Error = QuoremError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// `major.minor.build`, each component below 10000.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub build: u16,
}

impl Version {
    const LIMIT: u16 = 10_000;

    pub fn packed(&self) -> i64 {
        i64::from(self.major) * 100_000_000 + i64::from(self.minor) * 10_000 + i64::from(self.build)
    }

    pub fn from_packed(packed: i64) -> Result<Self, QuoremError> {
        let limit = i64::from(Self::LIMIT);
        if !(0..limit * limit * limit).contains(&packed) {
            return Err(QuoremError::cast("version", packed, "packed version out of range"));
        }
        let component = |value: i64| u16::try_from(value % limit).unwrap_or_default();
        Ok(Self {
            major: component(packed / (limit * limit)),
            minor: component(packed / limit),
            build: component(packed),
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

impl FromStr for Version {
    type Err = QuoremError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let body = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        let parts = body.split('.').collect::<Vec<_>>();
        if !(2..=3).contains(&parts.len()) {
            return Err(QuoremError::cast("version", value, "expected major.minor[.build]"));
        }
        let mut numbers = [0u16; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            if part.is_empty() || !part.chars().all(|ch| ch.is_ascii_digit()) {
                return Err(QuoremError::cast("version", value, "non-numeric component"));
            }
            let number: u16 = part
                .parse()
                .map_err(|_| QuoremError::cast("version", value, "component too large"))?;
            if number >= Self::LIMIT {
                return Err(QuoremError::cast("version", value, "component too large"));
            }
            *slot = number;
        }
        Ok(Self {
            major: numbers[0],
            minor: numbers[1],
            build: numbers[2],
        })
    }
}

/// Latitude and longitude in decimal degrees, altitude in kilometres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}, {}", self.latitude, self.longitude, self.altitude)
    }
}

impl FromStr for Coordinate {
    type Err = QuoremError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let fail = |reason: &str| QuoremError::cast("coordinate", value, reason);
        let parts = if value.contains(',') {
            value.split(',').map(str::trim).collect::<Vec<_>>()
        } else {
            value.split_whitespace().collect::<Vec<_>>()
        };
        if !(2..=3).contains(&parts.len()) {
            return Err(fail("expected latitude, longitude[, altitude]"));
        }
        let latitude = parse_degrees(parts[0], 'N', 'S').ok_or_else(|| fail("bad latitude"))?;
        let longitude = parse_degrees(parts[1], 'E', 'W').ok_or_else(|| fail("bad longitude"))?;
        let altitude = match parts.get(2) {
            Some(text) => text
                .trim_end_matches("km")
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|alt| alt.is_finite())
                .ok_or_else(|| fail("bad altitude"))?,
            None => 0.0,
        };
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(fail("latitude out of range"));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(fail("longitude out of range"));
        }
        Ok(Self {
            latitude,
            longitude,
            altitude,
        })
    }
}

fn parse_degrees(text: &str, positive: char, negative: char) -> Option<f64> {
    let text = text.trim().trim_end_matches('°');
    let (number, sign) = match text.chars().last()? {
        ch if ch.eq_ignore_ascii_case(&positive) => (&text[..text.len() - 1], 1.0),
        ch if ch.eq_ignore_ascii_case(&negative) => (&text[..text.len() - 1], -1.0),
        _ => (text, 1.0),
    };
    let degrees: f64 = number.trim().trim_end_matches('°').parse().ok()?;
    degrees.is_finite().then_some(degrees * sign)
}

/// Sparse matrix in coordinate form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseMatrix {
    pub values: Vec<f64>,
    pub rows: Vec<usize>,
    pub columns: Vec<usize>,
    pub shape: (usize, usize),
    #[serde(default)]
    pub row_kind: Option<EntityKind>,
    #[serde(default)]
    pub column_kind: Option<EntityKind>,
    #[serde(default)]
    pub row_ids: Vec<String>,
    #[serde(default)]
    pub column_ids: Vec<String>,
}

impl SparseMatrix {
    pub fn validate(&self) -> Result<(), QuoremError> {
        let fail = |reason: &str| QuoremError::cast("matrix", self.summary(), reason);
        if self.values.len() != self.rows.len() || self.values.len() != self.columns.len() {
            return Err(fail("value, row and column arrays differ in length"));
        }
        if self.rows.iter().any(|row| *row >= self.shape.0)
            || self.columns.iter().any(|col| *col >= self.shape.1)
        {
            return Err(fail("index outside of shape"));
        }
        if (!self.row_ids.is_empty() && self.row_ids.len() != self.shape.0)
            || (!self.column_ids.is_empty() && self.column_ids.len() != self.shape.1)
        {
            return Err(fail("identifier list does not match shape"));
        }
        Ok(())
    }

    pub fn summary(&self) -> String {
        format!(
            "{}x{} matrix with {} entries",
            self.shape.0,
            self.shape.1,
            self.values.len()
        )
    }
}

/// A value as it arrives from a scraper or a spreadsheet cell.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Text(String),
    Int(i64),
    Float(f64),
    Datetime(DateTime<FixedOffset>),
    Version(Version),
    Coordinate(Coordinate),
    Quantity(Quantity),
    Matrix(SparseMatrix),
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Text(text) => write!(f, "{text}"),
            RawValue::Int(value) => write!(f, "{value}"),
            RawValue::Float(value) => write!(f, "{value}"),
            RawValue::Datetime(value) => write!(f, "{}", value.to_rfc3339()),
            RawValue::Version(value) => write!(f, "{value}"),
            RawValue::Coordinate(value) => write!(f, "{value}"),
            RawValue::Quantity(value) => write!(f, "{} (si {})", value.magnitude, value.to_si()),
            RawValue::Matrix(value) => write!(f, "{}", value.summary()),
        }
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::Text(value.to_string())
    }
}

impl From<String> for RawValue {
    fn from(value: String) -> Self {
        RawValue::Text(value)
    }
}

impl From<i64> for RawValue {
    fn from(value: i64) -> Self {
        RawValue::Int(value)
    }
}

impl From<f64> for RawValue {
    fn from(value: f64) -> Self {
        RawValue::Float(value)
    }
}

/// Native representation of a cast value.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Str(String),
    Int(i64),
    Float(f64),
    Datetime(DateTime<FixedOffset>),
    Version(Version),
    Coordinate(Coordinate),
    Quantity { kind: QuantityKind, magnitude: f64 },
    Matrix(SparseMatrix),
    Sequence(String),
    Link(String),
    File(String),
    User(String),
    Entity { kind: EntityKind, identity: String },
}

impl Datum {
    pub fn kind(&self) -> DataKind {
        match self {
            Datum::Str(_) => DataKind::Str,
            Datum::Int(_) => DataKind::Int,
            Datum::Float(_) => DataKind::Float,
            Datum::Datetime(_) => DataKind::Datetime,
            Datum::Version(_) => DataKind::Version,
            Datum::Coordinate(_) => DataKind::Coordinate,
            Datum::Quantity { kind, .. } => DataKind::Quantity(*kind),
            Datum::Matrix(_) => DataKind::Matrix,
            Datum::Sequence(_) => DataKind::Sequence,
            Datum::Link(_) => DataKind::Link,
            Datum::File(_) => DataKind::File,
            Datum::User(_) => DataKind::User,
            Datum::Entity { kind, .. } => DataKind::Entity(*kind),
        }
    }

    pub fn encode(&self) -> StoredDatum {
        match self {
            Datum::Str(text)
            | Datum::Sequence(text)
            | Datum::Link(text)
            | Datum::File(text)
            | Datum::User(text) => StoredDatum::Text(text.clone()),
            Datum::Entity { identity, .. } => StoredDatum::Text(identity.clone()),
            Datum::Int(value) => StoredDatum::Integer(*value),
            Datum::Version(version) => StoredDatum::Integer(version.packed()),
            Datum::Float(value) => StoredDatum::Real(*value),
            Datum::Quantity { magnitude, .. } => StoredDatum::Real(*magnitude),
            Datum::Datetime(value) => StoredDatum::Text(value.to_rfc3339()),
            Datum::Coordinate(point) => {
                StoredDatum::Point([point.latitude, point.longitude, point.altitude])
            }
            Datum::Matrix(matrix) => StoredDatum::Matrix(matrix.clone()),
        }
    }

    pub fn decode(kind: DataKind, stored: &StoredDatum) -> Result<Datum, QuoremError> {
        let mismatch =
            || QuoremError::CorruptState(format!("{kind} data stored as {}", stored.label()));
        Ok(match (kind, stored) {
            (DataKind::Str, StoredDatum::Text(text)) => Datum::Str(text.clone()),
            (DataKind::Sequence, StoredDatum::Text(text)) => Datum::Sequence(text.clone()),
            (DataKind::Link, StoredDatum::Text(text)) => Datum::Link(text.clone()),
            (DataKind::File, StoredDatum::Text(text)) => Datum::File(text.clone()),
            (DataKind::User, StoredDatum::Text(text)) => Datum::User(text.clone()),
            (DataKind::Entity(kind), StoredDatum::Text(identity)) => Datum::Entity {
                kind,
                identity: identity.clone(),
            },
            (DataKind::Int, StoredDatum::Integer(value)) => Datum::Int(*value),
            (DataKind::Version, StoredDatum::Integer(value)) => {
                Datum::Version(Version::from_packed(*value)?)
            }
            (DataKind::Float, StoredDatum::Real(value)) => Datum::Float(*value),
            (DataKind::Quantity(kind), StoredDatum::Real(magnitude)) => Datum::Quantity {
                kind,
                magnitude: *magnitude,
            },
            (DataKind::Datetime, StoredDatum::Text(text)) => Datum::Datetime(
                DateTime::parse_from_rfc3339(text).map_err(|err| {
                    QuoremError::CorruptState(format!("stored datetime {text:?}: {err}"))
                })?,
            ),
            (DataKind::Coordinate, StoredDatum::Point([latitude, longitude, altitude])) => {
                Datum::Coordinate(Coordinate {
                    latitude: *latitude,
                    longitude: *longitude,
                    altitude: *altitude,
                })
            }
            (DataKind::Matrix, StoredDatum::Matrix(matrix)) => Datum::Matrix(matrix.clone()),
            _ => return Err(mismatch()),
        })
    }

    /// The value handed back to cast functions when comparing across kinds.
    pub fn as_raw(&self) -> RawValue {
        match self {
            Datum::Int(value) => RawValue::Int(*value),
            Datum::Float(value) => RawValue::Float(*value),
            Datum::Datetime(value) => RawValue::Datetime(*value),
            Datum::Version(value) => RawValue::Version(*value),
            Datum::Coordinate(value) => RawValue::Coordinate(*value),
            Datum::Matrix(value) => RawValue::Matrix(value.clone()),
            other => RawValue::Text(other.to_string()),
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Str(text)
            | Datum::Sequence(text)
            | Datum::Link(text)
            | Datum::File(text)
            | Datum::User(text) => write!(f, "{text}"),
            Datum::Entity { identity, .. } => write!(f, "{identity}"),
            Datum::Int(value) => write!(f, "{value}"),
            Datum::Float(value) => write!(f, "{value}"),
            Datum::Datetime(value) => write!(f, "{}", value.to_rfc3339()),
            Datum::Version(value) => write!(f, "{value}"),
            Datum::Coordinate(value) => write!(f, "{value}"),
            Datum::Quantity { kind, magnitude } => {
                write!(f, "{magnitude} {}", kind.default_unit_name())
            }
            Datum::Matrix(matrix) => write!(f, "{}", matrix.summary()),
        }
    }
}

/// Storable encoding of a datum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoredDatum {
    Text(String),
    Integer(i64),
    Real(f64),
    Point([f64; 3]),
    Matrix(SparseMatrix),
}

impl StoredDatum {
    /// Equality key used to deduplicate data rows. Matrices are never shared.
    pub fn dedup_key(&self) -> Option<String> {
        match self {
            StoredDatum::Text(text) => Some(format!("t:{text}")),
            StoredDatum::Integer(value) => Some(format!("i:{value}")),
            StoredDatum::Real(value) => Some(format!("r:{:016x}", value.to_bits())),
            StoredDatum::Point(point) => Some(format!(
                "p:{:016x}:{:016x}:{:016x}",
                point[0].to_bits(),
                point[1].to_bits(),
                point[2].to_bits()
            )),
            StoredDatum::Matrix(_) => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            StoredDatum::Text(_) => "text",
            StoredDatum::Integer(_) => "integer",
            StoredDatum::Real(_) => "real",
            StoredDatum::Point(_) => "point",
            StoredDatum::Matrix(_) => "matrix",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TypeRegistry {
    datetime_formats: Vec<String>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_DATETIME_FORMATS.iter().map(|fmt| fmt.to_string()).collect())
    }
}

impl TypeRegistry {
    pub fn new(datetime_formats: Vec<String>) -> Self {
        Self { datetime_formats }
    }

    pub fn datetime_formats(&self) -> &[String] {
        &self.datetime_formats
    }

    pub fn lookup(&self, name: &str) -> Result<DataKind, QuoremError> {
        name.parse()
    }

    pub fn parse_datetime(&self, text: &str) -> Option<DateTime<FixedOffset>> {
        let text = text.trim();
        if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
            return Some(parsed);
        }
        for format in &self.datetime_formats {
            if let Ok(parsed) = NaiveDateTime::parse_from_str(text, format) {
                return Some(parsed.and_utc().fixed_offset());
            }
            if let Ok(parsed) = NaiveDate::parse_from_str(text, format) {
                return parsed
                    .and_hms_opt(0, 0, 0)
                    .map(|midnight| midnight.and_utc().fixed_offset());
            }
        }
        None
    }

    pub fn cast(&self, kind: DataKind, raw: &RawValue) -> Result<Datum, QuoremError> {
        match (kind, raw) {
            (DataKind::Int, RawValue::Int(value)) => Ok(Datum::Int(*value)),
            (DataKind::Float, RawValue::Float(value)) if value.is_finite() => {
                Ok(Datum::Float(*value))
            }
            (DataKind::Datetime, RawValue::Datetime(value)) => Ok(Datum::Datetime(*value)),
            (DataKind::Version, RawValue::Version(value)) => Ok(Datum::Version(*value)),
            (DataKind::Coordinate, RawValue::Coordinate(value)) => Ok(Datum::Coordinate(*value)),
            (DataKind::Quantity(quantity_kind), RawValue::Quantity(quantity)) => {
                Ok(Datum::Quantity {
                    kind: quantity_kind,
                    magnitude: quantity_kind.normalize(quantity)?,
                })
            }
            (DataKind::Matrix, RawValue::Matrix(matrix)) => {
                matrix.validate()?;
                Ok(Datum::Matrix(matrix.clone()))
            }
            (kind, raw) => self.cast_text(kind, &raw.to_string()),
        }
    }

    fn cast_text(&self, kind: DataKind, text: &str) -> Result<Datum, QuoremError> {
        let fail = |reason: &str| QuoremError::cast(kind, text, reason);
        let trimmed = text.trim();
        match kind {
            DataKind::Str => Ok(Datum::Str(text.to_string())),
            DataKind::Int => trimmed
                .parse::<i64>()
                .map(Datum::Int)
                .map_err(|err| fail(&err.to_string())),
            DataKind::Float => trimmed
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
                .map(Datum::Float)
                .ok_or_else(|| fail("not a finite number")),
            DataKind::Datetime => self
                .parse_datetime(trimmed)
                .map(Datum::Datetime)
                .ok_or_else(|| fail("no configured date pattern matches")),
            DataKind::Version => trimmed.parse().map(Datum::Version),
            DataKind::Coordinate => trimmed.parse().map(Datum::Coordinate),
            DataKind::Quantity(quantity_kind) => {
                let quantity = units::parse_quantity(trimmed)?;
                Ok(Datum::Quantity {
                    kind: quantity_kind,
                    magnitude: quantity_kind.normalize(&quantity)?,
                })
            }
            DataKind::Matrix => {
                let matrix: SparseMatrix =
                    serde_json::from_str(trimmed).map_err(|err| fail(&err.to_string()))?;
                matrix.validate()?;
                Ok(Datum::Matrix(matrix))
            }
            DataKind::Sequence => {
                let sequence = trimmed
                    .chars()
                    .filter(|ch| !ch.is_whitespace())
                    .collect::<String>()
                    .to_uppercase();
                let valid = !sequence.is_empty()
                    && sequence
                        .chars()
                        .all(|ch| ch.is_ascii_alphabetic() || matches!(ch, '-' | '*' | '.'));
                valid
                    .then_some(Datum::Sequence(sequence))
                    .ok_or_else(|| fail("not a biological sequence"))
            }
            DataKind::Link => URL
                .is_match(trimmed)
                .then(|| Datum::Link(trimmed.to_string()))
                .ok_or_else(|| fail("not a URL")),
            DataKind::File => (!trimmed.is_empty())
                .then(|| Datum::File(trimmed.to_string()))
                .ok_or_else(|| fail("empty path")),
            DataKind::User => (!trimmed.is_empty() && !trimmed.contains(char::is_whitespace))
                .then(|| Datum::User(trimmed.to_string()))
                .ok_or_else(|| fail("not a user name")),
            DataKind::Entity(entity_kind) => {
                entity_kind.validate_identity(trimmed)?;
                Ok(Datum::Entity {
                    kind: entity_kind,
                    identity: trimmed.to_string(),
                })
            }
        }
    }

    /// Every inferable kind `text` casts to, in inference order.
    pub fn castable_kinds(&self, text: &str) -> Vec<DataKind> {
        DataKind::inference_order()
            .into_iter()
            .filter(|kind| self.cast_text(*kind, text).is_ok())
            .collect()
    }

    pub fn infer_type(&self, raw: &RawValue, hint: Option<&str>) -> Result<DataKind, QuoremError> {
        if let Some(hint) = hint {
            match self.lookup(hint) {
                Ok(kind) => return Ok(kind),
                Err(_) => warn!(hint, "unregistered data kind hint, inferring instead"),
            }
        }

        match raw {
            RawValue::Int(_) => Ok(DataKind::Int),
            RawValue::Float(_) => Ok(DataKind::Float),
            RawValue::Datetime(_) => Ok(DataKind::Datetime),
            RawValue::Version(_) => Ok(DataKind::Version),
            RawValue::Coordinate(_) => Ok(DataKind::Coordinate),
            RawValue::Matrix(_) => Ok(DataKind::Matrix),
            RawValue::Quantity(quantity) => {
                match QuantityKind::matching(quantity.unit.dimension).as_slice() {
                    [kind] => Ok(DataKind::Quantity(*kind)),
                    [] => Err(QuoremError::cast(
                        "quantity",
                        raw,
                        "no registered quantity kind has this dimensionality",
                    )),
                    many => Err(QuoremError::AmbiguousInput(format!(
                        "quantity matches several kinds: {}",
                        join_names(many.iter().map(|kind| kind.as_str()))
                    ))),
                }
            }
            RawValue::Text(text) => {
                let matches = self.castable_kinds(text);
                match matches.as_slice() {
                    [] => Ok(DataKind::Str),
                    [kind] => Ok(*kind),
                    [first, ..] => {
                        warn!(
                            value = %text,
                            candidates = %join_names(matches.iter().map(|kind| kind.name())),
                            chosen = %first,
                            "value casts to several data kinds"
                        );
                        Ok(*first)
                    }
                }
            }
        }
    }
}

fn join_names<'a>(names: impl Iterator<Item = &'a str>) -> String {
    names.collect::<Vec<_>>().join(", ")
}
