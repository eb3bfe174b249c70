use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QuoremError;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Investigation,
    Sample,
    Feature,
    Step,
    Process,
    Analysis,
    Result,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Investigation,
        EntityKind::Sample,
        EntityKind::Feature,
        EntityKind::Step,
        EntityKind::Process,
        EntityKind::Analysis,
        EntityKind::Result,
    ];

    /// Order in which a tabular row picks the kind that owns it.
    pub const ROW_PRECEDENCE: [EntityKind; 7] = [
        EntityKind::Result,
        EntityKind::Sample,
        EntityKind::Step,
        EntityKind::Analysis,
        EntityKind::Process,
        EntityKind::Investigation,
        EntityKind::Feature,
    ];

    /// Commit order: every kind comes after the kinds it references.
    pub const DEPENDENCY_ORDER: [EntityKind; 7] = [
        EntityKind::Investigation,
        EntityKind::Process,
        EntityKind::Step,
        EntityKind::Analysis,
        EntityKind::Feature,
        EntityKind::Sample,
        EntityKind::Result,
    ];

    pub fn index(self) -> usize {
        match self {
            EntityKind::Investigation => 0,
            EntityKind::Sample => 1,
            EntityKind::Feature => 2,
            EntityKind::Step => 3,
            EntityKind::Process => 4,
            EntityKind::Analysis => 5,
            EntityKind::Result => 6,
        }
    }

    pub fn base_name(self) -> &'static str {
        match self {
            EntityKind::Investigation => "investigation",
            EntityKind::Sample => "sample",
            EntityKind::Feature => "feature",
            EntityKind::Step => "step",
            EntityKind::Process => "process",
            EntityKind::Analysis => "analysis",
            EntityKind::Result => "result",
        }
    }

    pub fn plural_name(self) -> &'static str {
        match self {
            EntityKind::Investigation => "investigations",
            EntityKind::Sample => "samples",
            EntityKind::Feature => "features",
            EntityKind::Step => "steps",
            EntityKind::Process => "processes",
            EntityKind::Analysis => "analyses",
            EntityKind::Result => "results",
        }
    }

    pub fn identity_field(self) -> &'static str {
        match self {
            EntityKind::Result => "uuid",
            _ => "name",
        }
    }

    pub fn has_upstream(self) -> bool {
        matches!(
            self,
            EntityKind::Sample | EntityKind::Step | EntityKind::Process | EntityKind::Result
        )
    }

    pub fn id_column(self) -> String {
        format!("{}_id", self.base_name())
    }

    pub fn category_column(self) -> String {
        format!("{}_category", self.base_name())
    }

    pub fn upstream_column(self) -> String {
        format!("upstream_{}", self.base_name())
    }

    pub fn fields(self) -> &'static [FieldSpec] {
        match self {
            EntityKind::Investigation => INVESTIGATION_FIELDS,
            EntityKind::Sample => SAMPLE_FIELDS,
            EntityKind::Feature => FEATURE_FIELDS,
            EntityKind::Step => STEP_FIELDS,
            EntityKind::Process => PROCESS_FIELDS,
            EntityKind::Analysis => ANALYSIS_FIELDS,
            EntityKind::Result => RESULT_FIELDS,
        }
    }

    pub fn field(self, name: &str) -> Result<&'static FieldSpec, QuoremError> {
        self.fields()
            .iter()
            .find(|field| field.name == name)
            .ok_or_else(|| QuoremError::UnknownField {
                kind: self.to_string(),
                field: name.to_string(),
            })
    }

    /// Rejects identities that cannot name a record of this kind.
    pub fn validate_identity(self, identity: &str) -> Result<(), QuoremError> {
        let invalid = |reason: &str| QuoremError::InvalidName {
            kind: self.to_string(),
            identity: identity.to_string(),
            reason: reason.to_string(),
        };
        let trimmed = identity.trim();
        if trimmed.is_empty() {
            return Err(invalid("identifier is blank"));
        }
        if trimmed.chars().all(|ch| ch.is_ascii_digit()) {
            return Err(invalid("purely numeric identifiers are reserved for row ids"));
        }
        if self == EntityKind::Result && Uuid::parse_str(trimmed).is_err() {
            return Err(invalid("result identifiers must be UUIDs"));
        }
        Ok(())
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base_name())
    }
}

impl FromStr for EntityKind {
    type Err = QuoremError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.base_name() == normalized || kind.plural_name() == normalized)
            .ok_or_else(|| QuoremError::UnknownEntityKind(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Reference(EntityKind),
    Many(EntityKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required_if_new: bool,
}

impl FieldSpec {
    const fn text(name: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::Text,
            required_if_new: false,
        }
    }

    const fn reference(name: &'static str, target: EntityKind) -> Self {
        Self {
            name,
            kind: FieldKind::Reference(target),
            required_if_new: false,
        }
    }

    const fn many(name: &'static str, target: EntityKind) -> Self {
        Self {
            name,
            kind: FieldKind::Many(target),
            required_if_new: false,
        }
    }

    const fn required(self) -> Self {
        Self {
            required_if_new: true,
            ..self
        }
    }

    /// The spreadsheet column that carries this field for rows owned by `owner`.
    pub fn column(&self, owner: EntityKind) -> String {
        match self.kind {
            FieldKind::Text => format!("{}_{}", owner.base_name(), self.name),
            FieldKind::Reference(target) | FieldKind::Many(target) => target.id_column(),
        }
    }
}

const INVESTIGATION_FIELDS: &[FieldSpec] = &[
    FieldSpec::text("description").required(),
    FieldSpec::text("institution"),
];

const SAMPLE_FIELDS: &[FieldSpec] = &[
    FieldSpec::reference("source_step", EntityKind::Step),
    FieldSpec::many("investigations", EntityKind::Investigation),
];

const FEATURE_FIELDS: &[FieldSpec] = &[FieldSpec::many("samples", EntityKind::Sample)];

const STEP_FIELDS: &[FieldSpec] = &[
    FieldSpec::text("description"),
    FieldSpec::many("processes", EntityKind::Process),
];

const PROCESS_FIELDS: &[FieldSpec] = &[
    FieldSpec::text("description"),
    FieldSpec::text("citation"),
];

const ANALYSIS_FIELDS: &[FieldSpec] = &[
    FieldSpec::reference("process", EntityKind::Process).required(),
    FieldSpec::text("date"),
    FieldSpec::text("location"),
    FieldSpec::many("extra_steps", EntityKind::Step),
];

const RESULT_FIELDS: &[FieldSpec] = &[
    FieldSpec::reference("analysis", EntityKind::Analysis).required(),
    FieldSpec::reference("source_step", EntityKind::Step).required(),
    FieldSpec::text("type"),
    FieldSpec::many("samples", EntityKind::Sample),
    FieldSpec::many("features", EntityKind::Feature),
];

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Value,
    Parameter,
    Measure,
    File,
    Category,
    State,
    Description,
    Date,
    Location,
    Version,
    Reference,
    Image,
    Role,
    Permission,
    Group,
    Matrix,
    Partition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    AtMostOne,
    Many,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkRule {
    pub allowed: bool,
    pub required: bool,
    pub cardinality: Cardinality,
}

impl LinkRule {
    const DENIED: LinkRule = LinkRule {
        allowed: false,
        required: false,
        cardinality: Cardinality::Many,
    };
    const MANY: LinkRule = LinkRule {
        allowed: true,
        required: false,
        cardinality: Cardinality::Many,
    };
    const ONE: LinkRule = LinkRule {
        allowed: true,
        required: false,
        cardinality: Cardinality::AtMostOne,
    };

    const fn required(self) -> LinkRule {
        LinkRule {
            required: true,
            ..self
        }
    }
}

impl ValueKind {
    pub const ALL: [ValueKind; 17] = [
        ValueKind::Value,
        ValueKind::Parameter,
        ValueKind::Measure,
        ValueKind::File,
        ValueKind::Category,
        ValueKind::State,
        ValueKind::Description,
        ValueKind::Date,
        ValueKind::Location,
        ValueKind::Version,
        ValueKind::Reference,
        ValueKind::Image,
        ValueKind::Role,
        ValueKind::Permission,
        ValueKind::Group,
        ValueKind::Matrix,
        ValueKind::Partition,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ValueKind::Value => "value",
            ValueKind::Parameter => "parameter",
            ValueKind::Measure => "measure",
            ValueKind::File => "file",
            ValueKind::Category => "category",
            ValueKind::State => "state",
            ValueKind::Description => "description",
            ValueKind::Date => "date",
            ValueKind::Location => "location",
            ValueKind::Version => "version",
            ValueKind::Reference => "reference",
            ValueKind::Image => "image",
            ValueKind::Role => "role",
            ValueKind::Permission => "permission",
            ValueKind::Group => "group",
            ValueKind::Matrix => "matrix",
            ValueKind::Partition => "partition",
        }
    }

    pub fn link_rule(self, entity: EntityKind) -> LinkRule {
        use EntityKind as E;
        match (self, entity) {
            (ValueKind::Parameter, E::Step) => LinkRule::ONE.required(),
            (ValueKind::Parameter, E::Process | E::Analysis | E::Result) => LinkRule::ONE,
            (ValueKind::Parameter, _) => LinkRule::DENIED,
            (ValueKind::Measure, E::Result) => LinkRule::MANY.required(),
            (ValueKind::Matrix | ValueKind::Partition, E::Result) => LinkRule::ONE.required(),
            (ValueKind::Matrix | ValueKind::Partition, E::Sample | E::Feature) => LinkRule::MANY,
            (ValueKind::Matrix | ValueKind::Partition, _) => LinkRule::DENIED,
            (
                ValueKind::Role | ValueKind::Permission | ValueKind::Group,
                E::Investigation | E::Step | E::Process | E::Analysis,
            ) => LinkRule::MANY,
            (ValueKind::Role | ValueKind::Permission | ValueKind::Group, _) => LinkRule::DENIED,
            (ValueKind::Location, E::Investigation | E::Sample | E::Analysis) => LinkRule::MANY,
            (ValueKind::Location, _) => LinkRule::DENIED,
            _ => LinkRule::MANY,
        }
    }

    pub fn linkable(self, entity: EntityKind) -> bool {
        self.link_rule(entity).allowed
    }

    pub fn linkable_objects(self) -> Vec<EntityKind> {
        EntityKind::ALL
            .into_iter()
            .filter(|kind| self.linkable(*kind))
            .collect()
    }

    pub fn required_objects(self) -> Vec<EntityKind> {
        EntityKind::ALL
            .into_iter()
            .filter(|kind| self.link_rule(*kind).required)
            .collect()
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ValueKind {
    type Err = QuoremError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        ValueKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| QuoremError::UnknownValueKind(value.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_entity_kind_accepts_plural() {
        assert_eq!("Analyses".parse::<EntityKind>().unwrap(), EntityKind::Analysis);
        assert_eq!("sample".parse::<EntityKind>().unwrap(), EntityKind::Sample);
    }

    #[test]
    fn parse_entity_kind_invalid() {
        let err = "widget".parse::<EntityKind>().unwrap_err();
        assert_matches!(err, QuoremError::UnknownEntityKind(_));
    }

    #[test]
    fn numeric_identity_is_rejected() {
        let err = EntityKind::Sample.validate_identity("12345").unwrap_err();
        assert_matches!(err, QuoremError::InvalidName { .. });
        EntityKind::Sample.validate_identity("S12345").unwrap();
    }

    #[test]
    fn result_identity_must_be_uuid() {
        let err = EntityKind::Result.validate_identity("not-a-uuid").unwrap_err();
        assert_matches!(err, QuoremError::InvalidName { .. });
        EntityKind::Result
            .validate_identity("4f2d3b8e-29c5-4a1b-9d8e-123456789abc")
            .unwrap();
    }

    #[test]
    fn field_columns() {
        let description = EntityKind::Investigation.field("description").unwrap();
        assert_eq!(
            description.column(EntityKind::Investigation),
            "investigation_description"
        );
        let process = EntityKind::Analysis.field("process").unwrap();
        assert_eq!(process.column(EntityKind::Analysis), "process_id");
        assert!(process.required_if_new);
    }

    #[test]
    fn parameter_link_policy() {
        assert!(!ValueKind::Parameter.linkable(EntityKind::Sample));
        assert_eq!(ValueKind::Parameter.required_objects(), vec![EntityKind::Step]);
        assert_eq!(ValueKind::Value.linkable_objects().len(), 7);
    }
}
