use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data_types::{DataKind, Datum, RawValue, StoredDatum, TypeRegistry};
use crate::database::{DataId, Database, EntityId, SignatureId, ValueId};
use crate::domain::{Cardinality, EntityKind, ValueKind};
use crate::error::QuoremError;
use crate::signature::LinkShape;

pub type Links = BTreeMap<EntityKind, BTreeSet<EntityId>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Value {
    pub id: ValueId,
    pub kind: ValueKind,
    pub signature: SignatureId,
    pub data: DataId,
    #[serde(default)]
    pub links: Links,
}

impl Value {
    pub fn linked(&self, kind: EntityKind) -> impl Iterator<Item = EntityId> + '_ {
        self.links.get(&kind).into_iter().flatten().copied()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataRecord {
    pub id: DataId,
    pub kind: DataKind,
    pub stored: StoredDatum,
}

/// A value to be written: name, kind, raw payload and the entities it links.
#[derive(Debug, Clone, PartialEq)]
pub struct NewValue {
    pub name: String,
    pub kind: ValueKind,
    pub raw: RawValue,
    /// Explicit data kind name; `auto` asks for inference even when the
    /// signature already has a recorded kind.
    pub data_kind: Option<String>,
    pub links: Links,
}

impl NewValue {
    pub fn new(name: impl Into<String>, kind: ValueKind, raw: impl Into<RawValue>) -> Self {
        Self {
            name: name.into(),
            kind,
            raw: raw.into(),
            data_kind: None,
            links: Links::new(),
        }
    }

    pub fn with_data_kind(mut self, data_kind: impl Into<String>) -> Self {
        self.data_kind = Some(data_kind.into());
        self
    }

    pub fn link(mut self, kind: EntityKind, id: EntityId) -> Self {
        self.links.entry(kind).or_default().insert(id);
        self
    }

    pub fn with_links(mut self, links: Links) -> Self {
        for (kind, ids) in links {
            self.links.entry(kind).or_default().extend(ids);
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueOutcome {
    Created,
    Reused,
    Replaced,
}

/// Value as presented to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueView {
    pub id: ValueId,
    pub name: String,
    pub kind: ValueKind,
    pub data_kind: DataKind,
    pub data: String,
    pub links: BTreeMap<EntityKind, Vec<String>>,
}

struct Prepared {
    signature: Option<SignatureId>,
    shape: LinkShape,
    datum: Datum,
}

fn normalized(links: &Links) -> Links {
    links
        .iter()
        .filter(|(_, ids)| !ids.is_empty())
        .map(|(kind, ids)| (*kind, ids.clone()))
        .collect()
}

/// Checks `links` against the link policy of `kind`.
pub fn check_links(kind: ValueKind, links: &Links) -> Result<(), QuoremError> {
    for (entity_kind, ids) in links.iter().filter(|(_, ids)| !ids.is_empty()) {
        let rule = kind.link_rule(*entity_kind);
        if !rule.allowed {
            return Err(QuoremError::NotLinkable {
                value_kind: kind.to_string(),
                entity_kind: entity_kind.to_string(),
            });
        }
        if rule.cardinality == Cardinality::AtMostOne && ids.len() > 1 {
            return Err(QuoremError::TooManyLinks {
                value_kind: kind.to_string(),
                entity_kind: entity_kind.to_string(),
                count: ids.len(),
            });
        }
    }
    for required in kind.required_objects() {
        if links.get(&required).is_none_or(BTreeSet::is_empty) {
            let requirement = match kind.link_rule(required).cardinality {
                Cardinality::AtMostOne => "exactly one",
                Cardinality::Many => "at least one",
            };
            return Err(QuoremError::MissingRequiredLink {
                value_kind: kind.to_string(),
                entity_kind: required.to_string(),
                requirement: requirement.to_string(),
            });
        }
    }
    Ok(())
}

impl Database {
    pub fn value(&self, id: ValueId) -> Result<&Value, QuoremError> {
        self.values
            .get(&id)
            .ok_or_else(|| QuoremError::CorruptState(format!("no value with id {id}")))
    }

    pub fn data_record(&self, id: DataId) -> Result<&DataRecord, QuoremError> {
        self.data
            .get(id.0)
            .ok_or_else(|| QuoremError::CorruptState(format!("no data with id {id}")))
    }

    pub fn datum(&self, id: ValueId) -> Result<Datum, QuoremError> {
        let record = self.data_record(self.value(id)?.data)?;
        Datum::decode(record.kind, &record.stored)
    }

    pub fn value_name(&self, id: ValueId) -> Result<&str, QuoremError> {
        Ok(&self.signature(self.value(id)?.signature)?.name)
    }

    pub fn values_of(&self, entity: EntityId) -> Result<Vec<&Value>, QuoremError> {
        self.entity(entity)?
            .values
            .iter()
            .map(|id| self.value(*id))
            .collect()
    }

    pub fn values_with_signature(&self, signature: SignatureId) -> impl Iterator<Item = &Value> {
        self.values
            .values()
            .filter(move |value| value.signature == signature)
    }

    pub fn describe_value(&self, id: ValueId) -> Result<ValueView, QuoremError> {
        let value = self.value(id)?;
        let record = self.data_record(value.data)?;
        let datum = Datum::decode(record.kind, &record.stored)?;
        let mut links = BTreeMap::new();
        for (kind, ids) in &value.links {
            let identities = ids
                .iter()
                .map(|id| self.entity(*id).map(|entity| entity.identity.clone()))
                .collect::<Result<Vec<_>, _>>()?;
            links.insert(*kind, identities);
        }
        Ok(ValueView {
            id,
            name: self.signature(value.signature)?.name.clone(),
            kind: value.kind,
            data_kind: record.kind,
            data: datum.to_string(),
            links,
        })
    }

    /// Returns the deduplicated payload for `datum`. Matrices are always new.
    pub fn get_or_create_data(&mut self, datum: &Datum) -> Result<DataId, QuoremError> {
        if let Datum::Entity { kind, identity } = datum {
            if self.find_entity(*kind, identity).is_none() {
                return Err(QuoremError::not_found(kind, identity));
            }
        }
        let kind = datum.kind();
        let stored = datum.encode();
        let key = stored.dedup_key();
        if let Some(key) = &key {
            if let Some(id) = self
                .index
                .data
                .get(&(kind, key.clone()))
                .and_then(|ids| ids.first())
            {
                return Ok(*id);
            }
        }
        let id = DataId(self.data.len());
        self.data.push(DataRecord { id, kind, stored });
        if let Some(key) = key {
            self.index.data.entry((kind, key)).or_default().push(id);
        }
        Ok(id)
    }

    fn check_link_targets(&self, links: &Links) -> Result<(), QuoremError> {
        for (kind, ids) in links {
            for id in ids {
                let entity = self.entity(*id)?;
                if entity.kind != *kind {
                    return Err(QuoremError::CorruptState(format!(
                        "{} {} listed as a {kind} link",
                        entity.kind, entity.identity
                    )));
                }
            }
        }
        Ok(())
    }

    fn exact_signature(&self, name: &str, kind: ValueKind, shape: LinkShape) -> Result<Option<SignatureId>, QuoremError> {
        match self.index.signatures.get(&(name.to_string(), kind, shape)) {
            None => Ok(None),
            Some(ids) => match ids.as_slice() {
                [id] => Ok(Some(*id)),
                _ => Err(QuoremError::CorruptState(format!(
                    "{} signatures recorded for {name} ({kind}, {shape})",
                    ids.len()
                ))),
            },
        }
    }

    fn choose_data_kind(
        &self,
        registry: &TypeRegistry,
        signature: Option<SignatureId>,
        new: &NewValue,
    ) -> Result<DataKind, QuoremError> {
        match new.data_kind.as_deref().map(str::trim) {
            Some("auto") => return registry.infer_type(&new.raw, None),
            Some(name) if !name.is_empty() => return registry.lookup(name),
            _ => {}
        }
        if let Some(signature) = signature {
            let recorded = &self.signature(signature)?.data_kinds;
            match recorded.len() {
                0 => {}
                1 => {
                    if let Some(kind) = recorded.first() {
                        return Ok(*kind);
                    }
                }
                _ => {
                    return Err(QuoremError::DuplicateType {
                        name: new.name.clone(),
                        kinds: recorded.iter().map(ToString::to_string).collect(),
                    });
                }
            }
        }
        registry.infer_type(&new.raw, None)
    }

    fn prepare(&self, registry: &TypeRegistry, new: &NewValue) -> Result<Prepared, QuoremError> {
        let links = normalized(&new.links);
        check_links(new.kind, &links)?;
        self.check_link_targets(&links)?;
        let shape = LinkShape::from_links(&links);
        let signature = self.exact_signature(&new.name, new.kind, shape)?;
        let data_kind = self.choose_data_kind(registry, signature, new)?;
        let datum = registry.cast(data_kind, &new.raw)?;
        Ok(Prepared {
            signature,
            shape,
            datum,
        })
    }

    fn insert_value(&mut self, new: &NewValue, prepared: Prepared) -> Result<ValueId, QuoremError> {
        let signature = match prepared.signature {
            Some(id) => id,
            None => self.get_or_create_signature(&new.name, new.kind, prepared.shape)?,
        };
        let data = self.get_or_create_data(&prepared.datum)?;
        self.record_data_kind(signature, prepared.datum.kind())?;

        let id = ValueId(self.next_value_id);
        self.next_value_id += 1;
        let links = normalized(&new.links);
        for entity in links.values().flatten() {
            self.entities[entity.0].values.insert(id);
        }
        self.values.insert(
            id,
            Value {
                id,
                kind: new.kind,
                signature,
                data,
                links,
            },
        );
        debug!(name = %new.name, kind = %new.kind, value = %id, "created value");
        Ok(id)
    }

    /// Always creates a new value, reusing the payload when an equal one exists.
    pub fn create_value(&mut self, registry: &TypeRegistry, new: &NewValue) -> Result<ValueId, QuoremError> {
        let prepared = self.prepare(registry, new)?;
        self.insert_value(new, prepared)
    }

    fn same_links(&self, signature: SignatureId, links: &Links) -> Vec<ValueId> {
        self.values_with_signature(signature)
            .filter(|value| &value.links == links)
            .map(|value| value.id)
            .collect()
    }

    fn holds(&self, value: ValueId, datum: &Datum) -> Result<bool, QuoremError> {
        let record = self.data_record(self.value(value)?.data)?;
        Ok(record.kind == datum.kind() && record.stored == datum.encode())
    }

    /// Returns an existing value with the same signature, links and data, or
    /// creates one.
    pub fn get_or_create_value(
        &mut self,
        registry: &TypeRegistry,
        new: &NewValue,
    ) -> Result<(ValueId, bool), QuoremError> {
        let prepared = self.prepare(registry, new)?;
        if let Some(signature) = prepared.signature {
            for candidate in self.same_links(signature, &normalized(&new.links)) {
                if self.holds(candidate, &prepared.datum)? {
                    return Ok((candidate, false));
                }
            }
        }
        Ok((self.insert_value(new, prepared)?, true))
    }

    /// Like [`Database::get_or_create_value`], but a differing value under the
    /// same signature and links is a conflict unless `overwrite` is set, in
    /// which case it is replaced.
    pub fn upsert_value(
        &mut self,
        registry: &TypeRegistry,
        new: &NewValue,
        overwrite: bool,
    ) -> Result<(ValueId, ValueOutcome), QuoremError> {
        let prepared = self.prepare(registry, new)?;
        let mut conflicting = Vec::new();
        if let Some(signature) = prepared.signature {
            for candidate in self.same_links(signature, &normalized(&new.links)) {
                if self.holds(candidate, &prepared.datum)? {
                    return Ok((candidate, ValueOutcome::Reused));
                }
                conflicting.push(candidate);
            }
        }
        if conflicting.is_empty() {
            return Ok((self.insert_value(new, prepared)?, ValueOutcome::Created));
        }
        if !overwrite {
            let existing = self.datum(conflicting[0])?;
            let owners = normalized(&new.links)
                .iter()
                .flat_map(|(_, ids)| ids.iter())
                .map(|id| self.entity(*id).map(|entity| entity.identity.clone()))
                .collect::<Result<Vec<_>, _>>()?;
            return Err(QuoremError::InconsistentWithDatabase {
                kind: new.kind.to_string(),
                identity: owners.join(","),
                column: new.name.clone(),
                expected: existing.to_string(),
                found: prepared.datum.to_string(),
            });
        }
        for old in conflicting {
            self.remove_value(old)?;
        }
        Ok((self.insert_value(new, prepared)?, ValueOutcome::Replaced))
    }

    /// Values named `name` linked to exactly `links`.
    pub fn find_values(
        &self,
        name: &str,
        kind: Option<ValueKind>,
        links: &Links,
    ) -> Result<Vec<ValueId>, QuoremError> {
        let links = normalized(links);
        let shape = LinkShape::from_links(&links);
        Ok(match self.find_signature(name, kind, &shape)? {
            Some(signature) => self.same_links(signature, &links),
            None => Vec::new(),
        })
    }

    /// Unlinks and removes a value. Its payload is kept.
    pub fn remove_value(&mut self, id: ValueId) -> Result<(), QuoremError> {
        let value = self
            .values
            .remove(&id)
            .ok_or_else(|| QuoremError::CorruptState(format!("no value with id {id}")))?;
        for entity in value.links.values().flatten() {
            if let Some(entity) = self.entities.get_mut(entity.0) {
                entity.values.remove(&id);
            }
        }
        debug!(value = %id, "removed value");
        Ok(())
    }
}
