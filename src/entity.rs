use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::closure::{self, Closure};
use crate::database::{CategoryId, Database, EntityId, ValueId};
use crate::domain::{EntityKind, FieldKind};
use crate::error::QuoremError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub identity: String,
    #[serde(default)]
    pub text: BTreeMap<String, String>,
    #[serde(default)]
    pub references: BTreeMap<String, EntityId>,
    #[serde(default)]
    pub many: BTreeMap<String, BTreeSet<EntityId>>,
    #[serde(default)]
    pub closure: Closure,
    #[serde(default)]
    pub categories: BTreeSet<CategoryId>,
    #[serde(default)]
    pub values: BTreeSet<ValueId>,
}

impl Entity {
    pub fn text(&self, field: &str) -> Option<&str> {
        self.text
            .get(field)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    pub fn reference(&self, field: &str) -> Option<EntityId> {
        self.references.get(field).copied()
    }

    pub fn linked(&self, field: &str) -> impl Iterator<Item = EntityId> + '_ {
        self.many.get(field).into_iter().flatten().copied()
    }
}

/// A label that applies to exactly one entity kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: CategoryId,
    pub name: String,
    pub category_of: EntityKind,
}

/// Field changes for one entity. Text and single references overwrite; the
/// remaining collections are appended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityUpdate {
    pub text: BTreeMap<String, String>,
    pub references: BTreeMap<String, EntityId>,
    pub many: BTreeMap<String, BTreeSet<EntityId>>,
    pub upstream: BTreeSet<EntityId>,
    pub categories: BTreeSet<CategoryId>,
}

impl EntityUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(mut self, field: &str, value: impl Into<String>) -> Self {
        self.text.insert(field.to_string(), value.into());
        self
    }

    pub fn with_reference(mut self, field: &str, target: EntityId) -> Self {
        self.references.insert(field.to_string(), target);
        self
    }

    pub fn with_link(mut self, field: &str, target: EntityId) -> Self {
        self.many.entry(field.to_string()).or_default().insert(target);
        self
    }

    pub fn with_upstream(mut self, target: EntityId) -> Self {
        self.upstream.insert(target);
        self
    }

    pub fn with_category(mut self, category: CategoryId) -> Self {
        self.categories.insert(category);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
            && self.references.is_empty()
            && self.many.is_empty()
            && self.upstream.is_empty()
            && self.categories.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    Overwrite,
    FillBlank,
}

impl Database {
    pub fn find_entity(&self, kind: EntityKind, identity: &str) -> Option<EntityId> {
        self.index
            .entities
            .get(&(kind, identity.trim().to_string()))
            .copied()
    }

    pub fn entity(&self, id: EntityId) -> Result<&Entity, QuoremError> {
        self.entities
            .get(id.0)
            .ok_or_else(|| QuoremError::CorruptState(format!("no entity with id {id}")))
    }

    pub fn entity_by_identity(
        &self,
        kind: EntityKind,
        identity: &str,
    ) -> Result<&Entity, QuoremError> {
        let id = self
            .find_entity(kind, identity)
            .ok_or_else(|| QuoremError::not_found(kind, identity))?;
        self.entity(id)
    }

    pub fn entities_of(&self, kind: EntityKind) -> impl Iterator<Item = &Entity> {
        self.entities.iter().filter(move |entity| entity.kind == kind)
    }

    /// Returns the existing record for `identity`, or creates one from
    /// `fields`. The boolean is true when a record was created.
    pub fn get_or_create_entity(
        &mut self,
        kind: EntityKind,
        identity: &str,
        fields: &EntityUpdate,
    ) -> Result<(EntityId, bool), QuoremError> {
        if let Some(id) = self.find_entity(kind, identity) {
            return Ok((id, false));
        }
        kind.validate_identity(identity)?;

        let missing = kind
            .fields()
            .iter()
            .filter(|field| field.required_if_new)
            .filter(|field| match field.kind {
                FieldKind::Text => fields
                    .text
                    .get(field.name)
                    .is_none_or(|value| value.trim().is_empty()),
                FieldKind::Reference(_) => !fields.references.contains_key(field.name),
                FieldKind::Many(_) => fields.many.get(field.name).is_none_or(BTreeSet::is_empty),
            })
            .map(|field| field.column(kind))
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(QuoremError::MissingColumn {
                kind: kind.to_string(),
                columns: missing,
            });
        }
        self.check_update(kind, fields)?;

        let id = EntityId(self.entities.len());
        let identity = identity.trim().to_string();
        self.entities.push(Entity {
            id,
            kind,
            identity: identity.clone(),
            text: BTreeMap::new(),
            references: BTreeMap::new(),
            many: BTreeMap::new(),
            closure: Closure::default(),
            categories: BTreeSet::new(),
            values: BTreeSet::new(),
        });
        self.index.entities.insert((kind, identity.clone()), id);
        debug!(%kind, identity = %identity, "created entity");
        self.apply_update(id, fields, UpdateMode::Overwrite)?;
        Ok((id, true))
    }

    pub fn update_entity(&mut self, id: EntityId, update: &EntityUpdate) -> Result<(), QuoremError> {
        self.apply_update(id, update, UpdateMode::Overwrite)
    }

    /// Like [`Database::update_entity`], but text and single references are
    /// only written where the record has no value yet.
    pub fn fill_entity(&mut self, id: EntityId, update: &EntityUpdate) -> Result<(), QuoremError> {
        self.apply_update(id, update, UpdateMode::FillBlank)
    }

    fn check_update(&self, kind: EntityKind, update: &EntityUpdate) -> Result<(), QuoremError> {
        for field in update.text.keys() {
            if kind.field(field)?.kind != FieldKind::Text {
                return Err(QuoremError::UnknownField {
                    kind: kind.to_string(),
                    field: field.clone(),
                });
            }
        }
        for (field, target) in &update.references {
            match kind.field(field)?.kind {
                FieldKind::Reference(expected) => self.expect_kind(*target, expected)?,
                _ => {
                    return Err(QuoremError::UnknownField {
                        kind: kind.to_string(),
                        field: field.clone(),
                    });
                }
            }
        }
        for (field, targets) in &update.many {
            match kind.field(field)?.kind {
                FieldKind::Many(expected) => {
                    for target in targets {
                        self.expect_kind(*target, expected)?;
                    }
                }
                _ => {
                    return Err(QuoremError::UnknownField {
                        kind: kind.to_string(),
                        field: field.clone(),
                    });
                }
            }
        }
        for target in &update.upstream {
            self.expect_kind(*target, kind)?;
        }
        Ok(())
    }

    fn expect_kind(&self, id: EntityId, expected: EntityKind) -> Result<(), QuoremError> {
        let entity = self.entity(id)?;
        if entity.kind != expected {
            return Err(QuoremError::CorruptState(format!(
                "{} {} used where a {expected} is required",
                entity.kind, entity.identity
            )));
        }
        Ok(())
    }

    fn apply_update(
        &mut self,
        id: EntityId,
        update: &EntityUpdate,
        mode: UpdateMode,
    ) -> Result<(), QuoremError> {
        let kind = self.entity(id)?.kind;
        self.check_update(kind, update)?;

        let entity = &mut self.entities[id.0];
        for (field, value) in &update.text {
            let blank = entity.text(field).is_none();
            if mode == UpdateMode::Overwrite || blank {
                entity.text.insert(field.clone(), value.clone());
            }
        }
        for (field, target) in &update.references {
            if mode == UpdateMode::Overwrite || !entity.references.contains_key(field) {
                entity.references.insert(field.clone(), *target);
            }
        }
        for (field, targets) in &update.many {
            entity
                .many
                .entry(field.clone())
                .or_default()
                .extend(targets.iter().copied());
        }
        for category in &update.categories {
            self.assign_category(id, *category)?;
        }
        for upstream in &update.upstream {
            closure::add_edge(&mut self.entities, id, *upstream)?;
        }
        Ok(())
    }

    pub fn add_upstream(&mut self, id: EntityId, upstream: EntityId) -> Result<bool, QuoremError> {
        closure::add_edge(&mut self.entities, id, upstream)
    }

    pub fn verify_closure(&self) -> Result<(), QuoremError> {
        closure::verify(&self.entities)
    }

    pub fn get_or_create_category(
        &mut self,
        name: &str,
        category_of: EntityKind,
    ) -> Result<CategoryId, QuoremError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(QuoremError::InvalidName {
                kind: "category".to_string(),
                identity: name.to_string(),
                reason: "category names cannot be blank".to_string(),
            });
        }
        if let Some(id) = self.index.categories.get(&(category_of, name.to_string())) {
            return Ok(*id);
        }
        let id = CategoryId(self.categories.len());
        self.categories.push(Category {
            id,
            name: name.to_string(),
            category_of,
        });
        self.index
            .categories
            .insert((category_of, name.to_string()), id);
        Ok(id)
    }

    pub fn category(&self, id: CategoryId) -> Result<&Category, QuoremError> {
        self.categories
            .get(id.0)
            .ok_or_else(|| QuoremError::CorruptState(format!("no category with id {id}")))
    }

    pub fn assign_category(&mut self, id: EntityId, category: CategoryId) -> Result<(), QuoremError> {
        let label = self.category(category)?;
        let entity = self.entity(id)?;
        if label.category_of != entity.kind {
            return Err(QuoremError::CategoryMismatch {
                category: label.name.clone(),
                expected: label.category_of.to_string(),
                found: entity.kind.to_string(),
            });
        }
        self.entities[id.0].categories.insert(category);
        Ok(())
    }

    /// Ids linked from `id` through a declared reference or many-reference.
    pub fn related(&self, id: EntityId, field: &str) -> Result<Vec<EntityId>, QuoremError> {
        let entity = self.entity(id)?;
        Ok(match entity.kind.field(field)?.kind {
            FieldKind::Reference(_) => entity.reference(field).into_iter().collect(),
            FieldKind::Many(_) => entity.linked(field).collect(),
            FieldKind::Text => Vec::new(),
        })
    }

    /// Steps whose parameters apply to `id`.
    pub fn owning_steps(&self, id: EntityId) -> Result<Vec<EntityId>, QuoremError> {
        let entity = self.entity(id)?;
        let steps = match entity.kind {
            EntityKind::Step => vec![id],
            EntityKind::Process => self
                .entities_of(EntityKind::Step)
                .filter(|step| step.linked("processes").any(|process| process == id))
                .map(|step| step.id)
                .collect(),
            EntityKind::Analysis => {
                let mut steps = match entity.reference("process") {
                    Some(process) => self.owning_steps(process)?,
                    None => Vec::new(),
                };
                for extra in entity.linked("extra_steps") {
                    if !steps.contains(&extra) {
                        steps.push(extra);
                    }
                }
                steps
            }
            EntityKind::Result => entity.reference("source_step").into_iter().collect(),
            _ => Vec::new(),
        };
        Ok(steps)
    }

    /// Adds the source steps of each result's upstream results as upstream of
    /// the result's own source step. Returns the number of edges added.
    pub fn infer_step_upstream(&mut self, results: &[EntityId]) -> Result<usize, QuoremError> {
        let mut edges = Vec::new();
        for id in results {
            let result = self.entity(*id)?;
            let Some(step) = result.reference("source_step") else {
                continue;
            };
            for upstream in &result.closure.upstream {
                if let Some(upstream_step) = self.entity(*upstream)?.reference("source_step") {
                    if upstream_step != step {
                        edges.push((step, upstream_step));
                    }
                }
            }
        }

        let mut added = 0;
        for (step, upstream_step) in edges {
            match closure::add_edge(&mut self.entities, step, upstream_step) {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(QuoremError::CycleDetected { downstream, upstream, .. }) => {
                    debug!(
                        downstream = %downstream,
                        upstream = %upstream,
                        "skipping step edge that would form a cycle"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(added)
    }
}
