use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data_types::DataKind;
use crate::database::{Database, EntityId, SignatureId};
use crate::domain::{EntityKind, ValueKind};
use crate::error::QuoremError;

/// Link count recorded per entity kind on a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum LinkCount {
    #[default]
    None,
    Exactly(u32),
    Any,
    AnyPositive,
}

impl LinkCount {
    pub fn code(self) -> i32 {
        match self {
            LinkCount::None => 0,
            LinkCount::Exactly(count) => i32::try_from(count).unwrap_or(i32::MAX),
            LinkCount::Any => -1,
            LinkCount::AnyPositive => -2,
        }
    }

    /// Pattern match of a query count against a stored count.
    pub fn matches(self, stored: LinkCount) -> bool {
        match (self, stored) {
            (LinkCount::Any, _) | (_, LinkCount::Any) => true,
            (LinkCount::AnyPositive, other) | (other, LinkCount::AnyPositive) => {
                !matches!(other, LinkCount::None)
            }
            (query, stored) => query == stored,
        }
    }
}

impl From<LinkCount> for i32 {
    fn from(count: LinkCount) -> Self {
        count.code()
    }
}

impl TryFrom<i32> for LinkCount {
    type Error = QuoremError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(LinkCount::None),
            -1 => Ok(LinkCount::Any),
            -2 => Ok(LinkCount::AnyPositive),
            count if count > 0 => Ok(LinkCount::Exactly(count.unsigned_abs())),
            other => Err(QuoremError::AmbiguousInput(format!(
                "link count {other} is below -2"
            ))),
        }
    }
}

impl fmt::Display for LinkCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// How a caller describes the links of a value for one entity kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSpec {
    Entities(Vec<EntityId>),
    Flag(bool),
    Count(i32),
}

impl LinkSpec {
    fn count(&self) -> Result<LinkCount, QuoremError> {
        match self {
            LinkSpec::Entities(ids) => {
                let distinct = ids.iter().collect::<BTreeSet<_>>().len();
                Ok(match u32::try_from(distinct) {
                    Ok(0) => LinkCount::None,
                    Ok(count) => LinkCount::Exactly(count),
                    Err(_) => LinkCount::AnyPositive,
                })
            }
            LinkSpec::Flag(true) => Ok(LinkCount::AnyPositive),
            LinkSpec::Flag(false) => Ok(LinkCount::None),
            LinkSpec::Count(code) => LinkCount::try_from(*code),
        }
    }
}

/// Per-entity-kind link counts, indexed by [`EntityKind::index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LinkShape([LinkCount; 7]);

impl LinkShape {
    pub fn get(&self, kind: EntityKind) -> LinkCount {
        self.0[kind.index()]
    }

    pub fn with(mut self, kind: EntityKind, count: LinkCount) -> Self {
        self.0[kind.index()] = count;
        self
    }

    pub fn from_specs(specs: &BTreeMap<EntityKind, LinkSpec>) -> Result<Self, QuoremError> {
        let mut shape = LinkShape::default();
        for (kind, spec) in specs {
            shape.0[kind.index()] = spec.count()?;
        }
        Ok(shape)
    }

    pub fn from_links(links: &BTreeMap<EntityKind, BTreeSet<EntityId>>) -> Self {
        let mut shape = LinkShape::default();
        for (kind, ids) in links {
            shape.0[kind.index()] = match u32::try_from(ids.len()) {
                Ok(0) => LinkCount::None,
                Ok(count) => LinkCount::Exactly(count),
                Err(_) => LinkCount::AnyPositive,
            };
        }
        shape
    }

    pub fn matches(&self, stored: &LinkShape) -> bool {
        self.0
            .iter()
            .zip(stored.0.iter())
            .all(|(query, stored)| query.matches(*stored))
    }

    pub fn codes(&self) -> BTreeMap<EntityKind, i32> {
        EntityKind::ALL
            .into_iter()
            .map(|kind| (kind, self.get(kind).code()))
            .filter(|(_, code)| *code != 0)
            .collect()
    }
}

impl fmt::Display for LinkShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self
            .codes()
            .into_iter()
            .map(|(kind, code)| format!("{kind}={code}"))
            .collect::<Vec<_>>();
        if parts.is_empty() {
            write!(f, "unlinked")
        } else {
            write!(f, "{}", parts.join(","))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSignature {
    pub id: SignatureId,
    pub name: String,
    pub value_kind: ValueKind,
    pub shape: LinkShape,
    #[serde(default)]
    pub data_kinds: BTreeSet<DataKind>,
    #[serde(default)]
    pub description: String,
}

impl DataSignature {
    pub(crate) fn key(&self) -> (String, ValueKind, LinkShape) {
        (self.name.clone(), self.value_kind, self.shape)
    }
}

impl Database {
    pub fn signature(&self, id: SignatureId) -> Result<&DataSignature, QuoremError> {
        self.signatures
            .get(id.0)
            .ok_or_else(|| QuoremError::CorruptState(format!("no signature with id {id}")))
    }

    pub fn signatures(&self) -> &[DataSignature] {
        &self.signatures
    }

    pub fn get_or_create_signature(
        &mut self,
        name: &str,
        value_kind: ValueKind,
        shape: LinkShape,
    ) -> Result<SignatureId, QuoremError> {
        let key = (name.to_string(), value_kind, shape);
        if let Some(existing) = self.index.signatures.get(&key) {
            return match existing.as_slice() {
                [id] => Ok(*id),
                _ => Err(QuoremError::CorruptState(format!(
                    "{} signatures recorded for {name} ({value_kind}, {shape})",
                    existing.len()
                ))),
            };
        }
        let id = SignatureId(self.signatures.len());
        self.signatures.push(DataSignature {
            id,
            name: name.to_string(),
            value_kind,
            shape,
            data_kinds: BTreeSet::new(),
            description: String::new(),
        });
        self.index.signatures.insert(key, vec![id]);
        debug!(name, %value_kind, %shape, "created signature");
        Ok(id)
    }

    /// Read-side lookup with pattern matching on the counts.
    pub fn find_signature(
        &self,
        name: &str,
        value_kind: Option<ValueKind>,
        query: &LinkShape,
    ) -> Result<Option<SignatureId>, QuoremError> {
        let matches = self
            .signatures
            .iter()
            .filter(|signature| signature.name == name)
            .filter(|signature| value_kind.is_none_or(|kind| signature.value_kind == kind))
            .filter(|signature| query.matches(&signature.shape))
            .collect::<Vec<_>>();
        match matches.as_slice() {
            [] => Ok(None),
            [signature] => Ok(Some(signature.id)),
            many => Err(QuoremError::AmbiguousInput(format!(
                "{name} matches {} signatures: {}",
                many.len(),
                many.iter()
                    .map(|signature| format!("{} ({})", signature.value_kind, signature.shape))
                    .collect::<Vec<_>>()
                    .join("; ")
            ))),
        }
    }

    pub fn record_data_kind(&mut self, id: SignatureId, kind: DataKind) -> Result<(), QuoremError> {
        self.signatures
            .get_mut(id.0)
            .ok_or_else(|| QuoremError::CorruptState(format!("no signature with id {id}")))?
            .data_kinds
            .insert(kind);
        Ok(())
    }

    pub fn describe_signature(&mut self, id: SignatureId, description: &str) -> Result<(), QuoremError> {
        let signature = self
            .signatures
            .get_mut(id.0)
            .ok_or_else(|| QuoremError::CorruptState(format!("no signature with id {id}")))?;
        if signature.description.is_empty() {
            signature.description = description.to_string();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn specs(entries: &[(EntityKind, LinkSpec)]) -> BTreeMap<EntityKind, LinkSpec> {
        entries.iter().cloned().collect()
    }

    #[test]
    fn shape_from_specs() {
        let shape = LinkShape::from_specs(&specs(&[
            (EntityKind::Sample, LinkSpec::Entities(vec![EntityId(1), EntityId(2)])),
            (EntityKind::Result, LinkSpec::Flag(true)),
            (EntityKind::Step, LinkSpec::Flag(false)),
        ]))
        .unwrap();
        assert_eq!(shape.get(EntityKind::Sample), LinkCount::Exactly(2));
        assert_eq!(shape.get(EntityKind::Result), LinkCount::AnyPositive);
        assert_eq!(shape.get(EntityKind::Step), LinkCount::None);
        assert_eq!(shape.get(EntityKind::Feature), LinkCount::None);
    }

    #[test]
    fn count_below_minus_two_is_rejected() {
        let err = LinkShape::from_specs(&specs(&[(EntityKind::Sample, LinkSpec::Count(-3))]))
            .unwrap_err();
        assert_matches!(err, QuoremError::AmbiguousInput(_));
    }

    #[test]
    fn pattern_matching() {
        assert!(LinkCount::Any.matches(LinkCount::None));
        assert!(LinkCount::AnyPositive.matches(LinkCount::Exactly(3)));
        assert!(!LinkCount::AnyPositive.matches(LinkCount::None));
        assert!(LinkCount::Exactly(1).matches(LinkCount::AnyPositive));
        assert!(!LinkCount::Exactly(1).matches(LinkCount::Exactly(2)));
    }

    #[test]
    fn get_or_create_is_unique_per_key() {
        let mut db = Database::new();
        let shape = LinkShape::default().with(EntityKind::Sample, LinkCount::Exactly(1));
        let first = db
            .get_or_create_signature("ph", ValueKind::Value, shape)
            .unwrap();
        let second = db
            .get_or_create_signature("ph", ValueKind::Value, shape)
            .unwrap();
        let other = db
            .get_or_create_signature("ph", ValueKind::Measure, shape)
            .unwrap();
        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(db.signatures().len(), 2);
    }

    #[test]
    fn find_reports_ambiguity() {
        let mut db = Database::new();
        let one = LinkShape::default().with(EntityKind::Sample, LinkCount::Exactly(1));
        let two = LinkShape::default().with(EntityKind::Sample, LinkCount::Exactly(2));
        db.get_or_create_signature("ph", ValueKind::Value, one).unwrap();
        db.get_or_create_signature("ph", ValueKind::Value, two).unwrap();

        let any = LinkShape::default().with(EntityKind::Sample, LinkCount::AnyPositive);
        let err = db.find_signature("ph", None, &any).unwrap_err();
        assert_matches!(err, QuoremError::AmbiguousInput(_));

        let found = db.find_signature("ph", None, &two).unwrap();
        assert!(found.is_some());
        assert_eq!(db.find_signature("temp", None, &any).unwrap(), None);
    }

    #[test]
    fn link_count_serializes_as_code() {
        let shape = LinkShape::default()
            .with(EntityKind::Sample, LinkCount::AnyPositive)
            .with(EntityKind::Result, LinkCount::Exactly(1));
        let json = serde_json::to_string(&shape).unwrap();
        assert_eq!(json, "[0,-2,0,0,0,0,1]");
        let parsed: LinkShape = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, shape);
    }
}
