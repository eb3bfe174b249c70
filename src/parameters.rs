//! Parameter values and their precedence.
//!
//! A parameter is always linked to exactly one step. Its level is given by
//! the most specific of its other links: a result, an analysis or a process.
//! The effective value of a parameter for a step walks the levels from the
//! step default to the most specific override; within one level the newest
//! value wins.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data_types::{DataKind, Datum, RawValue, TypeRegistry};
use crate::database::{Database, EntityId, ValueId};
use crate::domain::{EntityKind, ValueKind};
use crate::error::QuoremError;
use crate::value::{Links, NewValue, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterLevel {
    Step,
    Process(EntityId),
    Analysis(EntityId),
    Result(EntityId),
}

impl ParameterLevel {
    pub fn source(self) -> ParameterSource {
        match self {
            ParameterLevel::Step => ParameterSource::Step,
            ParameterLevel::Process(_) => ParameterSource::Process,
            ParameterLevel::Analysis(_) => ParameterSource::Analysis,
            ParameterLevel::Result(_) => ParameterSource::Result,
        }
    }

    fn link(self) -> Option<(EntityKind, EntityId)> {
        match self {
            ParameterLevel::Step => None,
            ParameterLevel::Process(id) => Some((EntityKind::Process, id)),
            ParameterLevel::Analysis(id) => Some((EntityKind::Analysis, id)),
            ParameterLevel::Result(id) => Some((EntityKind::Result, id)),
        }
    }

    fn contains(self, value: &Value) -> bool {
        let only = |kind: EntityKind, id: EntityId| {
            value.links.get(&kind).is_some_and(|ids| ids.len() == 1 && ids.contains(&id))
        };
        let none = |kind: EntityKind| value.links.get(&kind).is_none_or(BTreeSet::is_empty);
        match self {
            ParameterLevel::Step => {
                none(EntityKind::Process) && none(EntityKind::Analysis) && none(EntityKind::Result)
            }
            ParameterLevel::Process(id) => {
                only(EntityKind::Process, id)
                    && none(EntityKind::Analysis)
                    && none(EntityKind::Result)
            }
            ParameterLevel::Analysis(id) => only(EntityKind::Analysis, id) && none(EntityKind::Result),
            ParameterLevel::Result(id) => only(EntityKind::Result, id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterSource {
    Step,
    Process,
    Analysis,
    Result,
}

impl fmt::Display for ParameterSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParameterSource::Step => "step",
            ParameterSource::Process => "process",
            ParameterSource::Analysis => "analysis",
            ParameterSource::Result => "result",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedParameter {
    pub value: ValueId,
    pub data: String,
    pub source: ParameterSource,
}

/// Effective parameters per owning step, keyed by parameter name.
pub type ParameterMap = BTreeMap<EntityId, BTreeMap<String, ResolvedParameter>>;

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterInput {
    pub name: String,
    pub raw: RawValue,
    pub data_kind: Option<String>,
    pub step: EntityId,
    pub level: ParameterLevel,
}

impl ParameterInput {
    pub fn new(name: impl Into<String>, raw: impl Into<RawValue>, step: EntityId, level: ParameterLevel) -> Self {
        Self {
            name: name.into(),
            raw: raw.into(),
            data_kind: None,
            step,
            level,
        }
    }

    pub fn with_data_kind(mut self, data_kind: impl Into<String>) -> Self {
        self.data_kind = Some(data_kind.into());
        self
    }
}

/// Splits parameter links into the owning step and the most specific level.
pub fn parameter_target(links: &Links) -> Result<(EntityId, ParameterLevel), QuoremError> {
    for (kind, ids) in links.iter().filter(|(_, ids)| !ids.is_empty()) {
        if !ValueKind::Parameter.linkable(*kind) {
            return Err(QuoremError::NotLinkable {
                value_kind: ValueKind::Parameter.to_string(),
                entity_kind: kind.to_string(),
            });
        }
        if ids.len() > 1 {
            return Err(QuoremError::TooManyLinks {
                value_kind: ValueKind::Parameter.to_string(),
                entity_kind: kind.to_string(),
                count: ids.len(),
            });
        }
    }
    let single = |kind: EntityKind| links.get(&kind).and_then(|ids| ids.first()).copied();
    let step = single(EntityKind::Step).ok_or_else(|| QuoremError::MissingRequiredLink {
        value_kind: ValueKind::Parameter.to_string(),
        entity_kind: EntityKind::Step.to_string(),
        requirement: "exactly one".to_string(),
    })?;
    let level = if let Some(result) = single(EntityKind::Result) {
        ParameterLevel::Result(result)
    } else if let Some(analysis) = single(EntityKind::Analysis) {
        ParameterLevel::Analysis(analysis)
    } else if let Some(process) = single(EntityKind::Process) {
        ParameterLevel::Process(process)
    } else {
        ParameterLevel::Step
    };
    Ok((step, level))
}

impl Database {
    /// Levels that apply at `level`, least specific first.
    fn level_chain(&self, level: ParameterLevel) -> Result<Vec<ParameterLevel>, QuoremError> {
        let mut chain = vec![ParameterLevel::Step];
        match level {
            ParameterLevel::Step => {}
            ParameterLevel::Process(_) => chain.push(level),
            ParameterLevel::Analysis(analysis) => {
                if let Some(process) = self.entity(analysis)?.reference("process") {
                    chain.push(ParameterLevel::Process(process));
                }
                chain.push(level);
            }
            ParameterLevel::Result(result) => {
                if let Some(analysis) = self.entity(result)?.reference("analysis") {
                    if let Some(process) = self.entity(analysis)?.reference("process") {
                        chain.push(ParameterLevel::Process(process));
                    }
                    chain.push(ParameterLevel::Analysis(analysis));
                }
                chain.push(level);
            }
        }
        Ok(chain)
    }

    fn level_for(&self, entity: EntityId) -> Result<ParameterLevel, QuoremError> {
        let kind = self.entity(entity)?.kind;
        Ok(match kind {
            EntityKind::Process => ParameterLevel::Process(entity),
            EntityKind::Analysis => ParameterLevel::Analysis(entity),
            EntityKind::Result => ParameterLevel::Result(entity),
            _ => ParameterLevel::Step,
        })
    }

    fn step_parameters(&self, step: EntityId) -> Result<Vec<(&str, &Value)>, QuoremError> {
        let mut parameters = Vec::new();
        for value in self.values_of(step)? {
            if value.kind == ValueKind::Parameter {
                parameters.push((self.signature(value.signature)?.name.as_str(), value));
            }
        }
        Ok(parameters)
    }

    /// The parameter value in effect for `name` on `step` at `level`.
    pub fn effective_parameter(
        &self,
        name: &str,
        step: EntityId,
        level: ParameterLevel,
    ) -> Result<Option<ValueId>, QuoremError> {
        let parameters = self.step_parameters(step)?;
        for candidate in self.level_chain(level)?.into_iter().rev() {
            let newest = parameters
                .iter()
                .filter(|(parameter, value)| *parameter == name && candidate.contains(value))
                .map(|(_, value)| value.id)
                .max();
            if newest.is_some() {
                return Ok(newest);
            }
        }
        Ok(None)
    }

    fn parameter_kinds(&self, name: &str) -> BTreeSet<DataKind> {
        self.signatures
            .iter()
            .filter(|signature| signature.name == name && signature.value_kind == ValueKind::Parameter)
            .flat_map(|signature| signature.data_kinds.iter().copied())
            .collect()
    }

    fn parameter_equals(
        &self,
        registry: &TypeRegistry,
        existing: ValueId,
        input: &ParameterInput,
    ) -> Result<bool, QuoremError> {
        let current = self.datum(existing)?;
        if let Ok(candidate) = registry.cast(current.kind(), &input.raw) {
            if candidate == current {
                return Ok(true);
            }
        }
        if current.to_string() == input.raw.to_string() {
            return Ok(true);
        }
        let current_raw = current.as_raw();
        for kind in self.parameter_kinds(&input.name) {
            let left = registry.cast(kind, &current_raw);
            let right = registry.cast(kind, &input.raw);
            if let (Ok(left), Ok(right)) = (left, right) {
                if left == right {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Returns the parameter value already in effect when it equals the
    /// input, otherwise records a new value at the requested level.
    pub fn get_or_create_parameter(
        &mut self,
        registry: &TypeRegistry,
        input: &ParameterInput,
    ) -> Result<(ValueId, bool), QuoremError> {
        let step = self.entity(input.step)?;
        if step.kind != EntityKind::Step {
            return Err(QuoremError::CorruptState(format!(
                "parameter {} attached to {} {}",
                input.name, step.kind, step.identity
            )));
        }
        if let Some(existing) = self.effective_parameter(&input.name, input.step, input.level)? {
            if self.parameter_equals(registry, existing, input)? {
                debug!(name = %input.name, value = %existing, "parameter unchanged");
                return Ok((existing, false));
            }
        }

        let mut new = NewValue::new(&input.name, ValueKind::Parameter, input.raw.clone())
            .link(EntityKind::Step, input.step);
        if let Some((kind, id)) = input.level.link() {
            new = new.link(kind, id);
        }
        new.data_kind = input.data_kind.clone();
        let id = self.create_value(registry, &new)?;
        Ok((id, true))
    }

    /// Effective parameters of `entity` for each of its owning steps, or for
    /// `steps` when given.
    pub fn get_parameters(
        &self,
        entity: EntityId,
        steps: Option<&[EntityId]>,
    ) -> Result<ParameterMap, QuoremError> {
        let steps = match steps {
            Some(steps) => steps.to_vec(),
            None => self.owning_steps(entity)?,
        };
        let chain = self.level_chain(self.level_for(entity)?)?;

        let mut resolved = ParameterMap::new();
        for step in steps {
            let mut parameters = self.step_parameters(step)?;
            parameters.sort_by_key(|(_, value)| value.id);
            let entry = resolved.entry(step).or_default();
            for level in &chain {
                for (name, value) in parameters.iter().filter(|(_, value)| level.contains(value)) {
                    let datum: Datum = self.datum(value.id)?;
                    entry.insert(
                        name.to_string(),
                        ResolvedParameter {
                            value: value.id,
                            data: datum.to_string(),
                            source: level.source(),
                        },
                    );
                }
            }
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::entity::EntityUpdate;

    #[test]
    fn target_prefers_most_specific_link() {
        let links = Links::from([
            (EntityKind::Step, BTreeSet::from([EntityId(0)])),
            (EntityKind::Process, BTreeSet::from([EntityId(1)])),
            (EntityKind::Analysis, BTreeSet::from([EntityId(2)])),
        ]);
        let (step, level) = parameter_target(&links).unwrap();
        assert_eq!(step, EntityId(0));
        assert_eq!(level, ParameterLevel::Analysis(EntityId(2)));
    }

    #[test]
    fn target_requires_step() {
        let links = Links::from([(EntityKind::Process, BTreeSet::from([EntityId(1)]))]);
        let err = parameter_target(&links).unwrap_err();
        assert_matches!(err, QuoremError::MissingRequiredLink { .. });
    }

    #[test]
    fn unchanged_default_is_reused() {
        let mut db = Database::new();
        let registry = TypeRegistry::default();
        let (step, _) = db
            .get_or_create_entity(EntityKind::Step, "trim", &EntityUpdate::new())
            .unwrap();
        let input = ParameterInput::new("length", "150", step, ParameterLevel::Step);
        let (first, created) = db.get_or_create_parameter(&registry, &input).unwrap();
        let (second, created_again) = db.get_or_create_parameter(&registry, &input).unwrap();
        assert!(created);
        assert!(!created_again);
        assert_eq!(first, second);
    }

    #[test]
    fn equal_text_matches_across_raw_types() {
        let mut db = Database::new();
        let registry = TypeRegistry::default();
        let (step, _) = db
            .get_or_create_entity(EntityKind::Step, "trim", &EntityUpdate::new())
            .unwrap();
        let (first, _) = db
            .get_or_create_parameter(
                &registry,
                &ParameterInput::new("length", "150", step, ParameterLevel::Step)
                    .with_data_kind("str"),
            )
            .unwrap();
        let (second, created) = db
            .get_or_create_parameter(
                &registry,
                &ParameterInput::new("length", RawValue::Int(150), step, ParameterLevel::Step),
            )
            .unwrap();
        assert!(!created);
        assert_eq!(first, second);
    }
}
