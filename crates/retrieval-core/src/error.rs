//! Errors surfaced by the engine's public operations.
//!
//! Only a handful of conditions reach a caller as hard errors. Secondary
//! index failures, backend timeouts, stale index entries, and low-quality
//! result sets are reported through status flags and logs instead.
//!
//! Collaborator traits return [`anyhow::Result`]. A backend that needs to
//! signal a typed condition (an unknown document, for instance) returns the
//! matching [`Error`] variant wrapped in `anyhow`, and the engine recovers
//! it with [`Error::from_backend`].

/// Engine error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("document not found: {doc_id}")]
    NotFound { doc_id: String },

    #[error("primary write failed: {0:#}")]
    PrimaryWriteFailure(anyhow::Error),

    #[error("access denied: principal '{principal}' on project '{project_id}'")]
    AccessDenied {
        project_id: String,
        principal: String,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("backend error: {0:#}")]
    Backend(anyhow::Error),
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Recover a typed error carried inside an `anyhow::Error`, or wrap it
    /// as [`Error::Backend`].
    pub fn from_backend(err: anyhow::Error) -> Self {
        match err.downcast::<Error>() {
            Ok(typed) => typed,
            Err(other) => Error::Backend(other),
        }
    }

    /// Like [`Error::from_backend`], but anything untyped becomes a
    /// [`Error::PrimaryWriteFailure`].
    pub fn from_primary_write(err: anyhow::Error) -> Self {
        match err.downcast::<Error>() {
            Ok(typed) => typed,
            Err(other) => Error::PrimaryWriteFailure(other),
        }
    }

    pub fn not_found(doc_id: &str) -> Self {
        Error::NotFound {
            doc_id: doc_id.to_string(),
        }
    }
}
