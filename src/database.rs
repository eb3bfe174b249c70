use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::data_types::DataKind;
use crate::domain::{EntityKind, ValueKind};
use crate::entity::{Category, Entity};
use crate::error::QuoremError;
use crate::signature::{DataSignature, LinkShape};
use crate::value::{DataRecord, Value};

macro_rules! row_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub usize);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

row_id!(EntityId);
row_id!(CategoryId);
row_id!(SignatureId);
row_id!(ValueId);
row_id!(DataId);

pub(crate) type SignatureKey = (String, ValueKind, LinkShape);

/// In-memory relational snapshot of every table, persisted whole by the store.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Database {
    #[serde(default)]
    pub(crate) entities: Vec<Entity>,
    #[serde(default)]
    pub(crate) categories: Vec<Category>,
    #[serde(default)]
    pub(crate) signatures: Vec<DataSignature>,
    #[serde(default)]
    pub(crate) values: BTreeMap<ValueId, Value>,
    #[serde(default)]
    pub(crate) next_value_id: usize,
    #[serde(default)]
    pub(crate) data: Vec<DataRecord>,
    #[serde(skip)]
    pub(crate) index: Index,
}

#[derive(Debug, Default)]
pub(crate) struct Index {
    pub(crate) entities: HashMap<(EntityKind, String), EntityId>,
    pub(crate) categories: HashMap<(EntityKind, String), CategoryId>,
    pub(crate) signatures: HashMap<SignatureKey, Vec<SignatureId>>,
    pub(crate) data: HashMap<(DataKind, String), Vec<DataId>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub entities: BTreeMap<EntityKind, usize>,
    pub categories: usize,
    pub signatures: usize,
    pub values: usize,
    pub data: usize,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds lookup indices after deserialization. Duplicate identities are
    /// reported rather than silently merged.
    pub fn reindex(&mut self) -> Result<(), QuoremError> {
        let mut index = Index::default();
        for (position, entity) in self.entities.iter().enumerate() {
            if entity.id.0 != position {
                return Err(QuoremError::CorruptState(format!(
                    "entity row {position} carries id {}",
                    entity.id
                )));
            }
            let key = (entity.kind, entity.identity.clone());
            if index.entities.insert(key, entity.id).is_some() {
                return Err(QuoremError::CorruptState(format!(
                    "duplicate {} {}",
                    entity.kind, entity.identity
                )));
            }
        }
        for category in &self.categories {
            index
                .categories
                .insert((category.category_of, category.name.clone()), category.id);
        }
        for signature in &self.signatures {
            index
                .signatures
                .entry(signature.key())
                .or_default()
                .push(signature.id);
        }
        for record in &self.data {
            if let Some(key) = record.stored.dedup_key() {
                index.data.entry((record.kind, key)).or_default().push(record.id);
            }
        }
        self.next_value_id = self
            .values
            .keys()
            .next_back()
            .map(|id| id.0 + 1)
            .unwrap_or(0)
            .max(self.next_value_id);
        self.index = index;
        Ok(())
    }

    pub fn stats(&self) -> DatabaseStats {
        let mut entities = BTreeMap::new();
        for entity in &self.entities {
            *entities.entry(entity.kind).or_insert(0) += 1;
        }
        DatabaseStats {
            entities,
            categories: self.categories.len(),
            signatures: self.signatures.len(),
            values: self.values.len(),
            data: self.data.len(),
        }
    }
}
