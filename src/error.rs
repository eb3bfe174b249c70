use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum QuoremError {
    #[error("unknown entity kind: {0}")]
    UnknownEntityKind(String),

    #[error("unknown value kind: {0}")]
    UnknownValueKind(String),

    #[error("unknown data kind: {0}")]
    UnknownDataKind(String),

    #[error("unknown unit: {0}")]
    UnknownUnit(String),

    #[error("{kind} has no field named {field}")]
    UnknownField { kind: String, field: String },

    #[error("{kind} is missing required column(s): {}", columns.join(", "))]
    #[diagnostic(help("new {kind} records need these columns filled in"))]
    MissingColumn { kind: String, columns: Vec<String> },

    #[error("invalid {kind} identifier {identity:?}: {reason}")]
    InvalidName {
        kind: String,
        identity: String,
        reason: String,
    },

    #[error(
        "{kind} {identity}: column {column} is {found:?} but the database has {expected:?}"
    )]
    InconsistentWithDatabase {
        kind: String,
        identity: String,
        column: String,
        expected: String,
        found: String,
    },

    #[error("ambiguous input: {0}")]
    AmbiguousInput(String),

    #[error("value {name} has conflicting data kinds on record: {}", kinds.join(", "))]
    #[diagnostic(help("pass an explicit data kind for this value"))]
    DuplicateType { name: String, kinds: Vec<String> },

    #[error("cannot cast {raw:?} to {kind}: {reason}")]
    CastFailed {
        kind: String,
        raw: String,
        reason: String,
    },

    #[error("database state is corrupt: {0}")]
    CorruptState(String),

    #[error("{value_kind} values cannot be linked to {entity_kind}")]
    NotLinkable {
        value_kind: String,
        entity_kind: String,
    },

    #[error("{value_kind} values require {requirement} {entity_kind} link(s)")]
    MissingRequiredLink {
        value_kind: String,
        entity_kind: String,
        requirement: String,
    },

    #[error("{value_kind} values accept at most one {entity_kind} link, got {count}")]
    TooManyLinks {
        value_kind: String,
        entity_kind: String,
        count: usize,
    },

    #[error("unsupported payload: {0}")]
    UnsupportedPayload(String),

    #[error("category {category} belongs to {expected}, not {found}")]
    CategoryMismatch {
        category: String,
        expected: String,
        found: String,
    },

    #[error("adding {upstream} upstream of {downstream} would create a cycle among {kind} records")]
    CycleDetected {
        kind: String,
        downstream: String,
        upstream: String,
    },

    #[error("{kind} not found: {identity}")]
    EntityNotFound { kind: String, identity: String },

    #[error("invalid archive: {0}")]
    Archive(String),

    #[error("archive root is not a QIIME2 artifact uuid: {0}")]
    UnrecognizedRoot(String),

    #[error("unknown format: {0}")]
    UnknownFormat(String),

    #[error("unreadable table: {0}")]
    Table(String),

    #[error("failed to parse YAML document {path}: {message}")]
    Yaml { path: String, message: String },

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("upload is already being ingested: {0}")]
    UploadLocked(String),

    #[error("store at {0} is locked by another command")]
    #[diagnostic(help("wait for the other command to finish, or remove a leftover locks/database.lock"))]
    StoreBusy(String),
}

impl QuoremError {
    /// Errors that invalidate a whole ingestion job rather than one record.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            QuoremError::Archive(_)
                | QuoremError::UnrecognizedRoot(_)
                | QuoremError::UnknownFormat(_)
                | QuoremError::Table(_)
                | QuoremError::Yaml { .. }
                | QuoremError::Filesystem(_)
                | QuoremError::UploadLocked(_)
                | QuoremError::StoreBusy(_)
                | QuoremError::CorruptState(_)
        )
    }

    pub(crate) fn cast(kind: impl ToString, raw: impl ToString, reason: impl ToString) -> Self {
        QuoremError::CastFailed {
            kind: kind.to_string(),
            raw: raw.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn not_found(kind: impl ToString, identity: impl ToString) -> Self {
        QuoremError::EntityNotFound {
            kind: kind.to_string(),
            identity: identity.to_string(),
        }
    }
}
