//! Typed errors for the Recast client library.
//!
//! Backend transport failures come from `recast_common::BackendError` and are
//! wrapped in `RecastError::Database`. The CLI layer converts everything into
//! `anyhow::Error` with context.

use std::path::PathBuf;

use recast_common::BackendError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecastError {
    #[error("Backend request failed: {0}")]
    Database(#[from] BackendError),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Not signed in. Run 'recast login' first.")]
    NotAuthenticated,

    #[error("Invalid bundle definition: {0}")]
    InvalidBundle(String),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RecastError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}
