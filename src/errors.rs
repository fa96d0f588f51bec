//! Error taxonomy for the config store.
//!
//! `DogmaError` is the single structured-result error type returned by every
//! public operation in this crate (object store, revision log, commit
//! engine, watch layer, command executor, metadata layer). Each variant
//! carries exactly the context a caller needs to decide what to do next;
//! an external HTTP/gRPC surface maps each variant to a status code via
//! [`DogmaError::status_hint`] without needing to inspect payloads.

use thiserror::Error;

use crate::metadata::role::RepositoryRole;

#[derive(Error, Debug)]
pub enum DogmaError {
    #[error("entry not found: {0}")]
    EntryNotFound(String),

    #[error("revision not found: {0}")]
    RevisionNotFound(i64),

    #[error("repository not found: {project}/{repo}")]
    RepositoryNotFound { project: String, repo: String },

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("repository already exists: {project}/{repo}")]
    RepositoryExists { project: String, repo: String },

    #[error("project already exists: {0}")]
    ProjectExists(String),

    #[error("invalid push: {0}")]
    InvalidPush(String),

    #[error("change conflict: {0}")]
    ChangeConflict(String),

    #[error("push produced no net effect")]
    RedundantChange,

    #[error("query execution failed: {0}")]
    QueryExecution(String),

    #[error("malformed change payload: {0}")]
    ChangeFormat(String),

    #[error("not authorized: needs at least {needed:?}, has {actual:?}")]
    Authorization {
        needed: RepositoryRole,
        actual: Option<RepositoryRole>,
    },

    #[error("server is read-only")]
    ReadOnly,

    #[error("write quota exceeded for {0}")]
    QuotaExceeded(String),

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object encode/decode error: {0}")]
    Codec(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DogmaError {
    /// The HTTP status code an external transport layer should report for
    /// this error, per the taxonomy in the system specification. The core
    /// never constructs an HTTP response itself (see `mirror::MirrorIo` and
    /// `metadata::identity` for the same "interface, not implementation"
    /// treatment of out-of-scope collaborators).
    pub fn status_hint(&self) -> u16 {
        match self {
            DogmaError::EntryNotFound(_)
            | DogmaError::RevisionNotFound(_)
            | DogmaError::RepositoryNotFound { .. }
            | DogmaError::ProjectNotFound(_) => 404,
            DogmaError::RepositoryExists { .. } | DogmaError::ProjectExists(_) => 409,
            DogmaError::InvalidPush(_)
            | DogmaError::ChangeFormat(_)
            | DogmaError::InvalidName(_) => 400,
            DogmaError::ChangeConflict(_) => 409,
            DogmaError::RedundantChange => 200,
            DogmaError::QueryExecution(_) => 400,
            DogmaError::Authorization { .. } => 403,
            DogmaError::ReadOnly => 503,
            DogmaError::QuotaExceeded(_) => 429,
            DogmaError::ShuttingDown => 503,
            DogmaError::Io(_) | DogmaError::Codec(_) | DogmaError::Internal(_) => 500,
        }
    }

    /// The `exception` discriminant an external transport layer puts in the
    /// error body's JSON, per the error-kind taxonomy.
    pub fn kind(&self) -> &'static str {
        match self {
            DogmaError::EntryNotFound(_) => "EntryNotFound",
            DogmaError::RevisionNotFound(_) => "RevisionNotFound",
            DogmaError::RepositoryNotFound { .. } => "RepositoryNotFound",
            DogmaError::ProjectNotFound(_) => "ProjectNotFound",
            DogmaError::RepositoryExists { .. } => "RepositoryExists",
            DogmaError::ProjectExists(_) => "ProjectExists",
            DogmaError::InvalidPush(_) => "InvalidPush",
            DogmaError::ChangeConflict(_) => "ChangeConflict",
            DogmaError::RedundantChange => "RedundantChange",
            DogmaError::QueryExecution(_) => "QueryExecution",
            DogmaError::ChangeFormat(_) => "ChangeFormat",
            DogmaError::Authorization { .. } => "Authorization",
            DogmaError::ReadOnly => "ReadOnly",
            DogmaError::QuotaExceeded(_) => "QuotaExceeded",
            DogmaError::ShuttingDown => "ShuttingDown",
            DogmaError::InvalidName(_) => "InvalidName",
            DogmaError::Io(_) => "IoError",
            DogmaError::Codec(_) => "CodecError",
            DogmaError::Internal(_) => "InternalError",
        }
    }
}
