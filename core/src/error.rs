//! Error types for the search core.
//!
//! Index and catalog faults are classified so the planner can fall back and
//! the sync engine can retry. Analytics faults never reach the user.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    /// The index cannot serve reads right now (retryable).
    #[error("search index unavailable: {0}")]
    Unavailable(String),

    #[error("index storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("index codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("index metadata error: {0}")]
    Meta(#[from] serde_json::Error),

    /// A mutation could not be applied; the caller must retry or report it.
    #[error("failed to write document {product_id}: {message}")]
    Write { product_id: String, message: String },
}

impl IndexError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IndexError::Unavailable(_) | IndexError::Storage(_) | IndexError::Write { .. }
        )
    }

    pub(crate) fn write(product_id: &str, err: impl std::fmt::Display) -> Self {
        IndexError::Write { product_id: product_id.to_string(), message: err.to_string() }
    }
}

#[derive(Debug, Error, Clone)]
pub enum CatalogError {
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

/// Failure to apply a catalog mutation to the index.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    /// Retry budget exhausted; the index may be stale until reconciliation.
    #[error("sync fault on {subject} after {attempts} attempts: {message}")]
    Fault { subject: String, attempts: u32, message: String },

    #[error("catalog read failed during sync: {0}")]
    Catalog(String),

    #[error("sync queue closed")]
    QueueClosed,
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("search timed out after {0:?}")]
    Timeout(Duration),
}

impl SearchError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            SearchError::Validation(_) => false,
            SearchError::Index(e) => e.is_retryable(),
            SearchError::Catalog(_) | SearchError::Timeout(_) => true,
        }
    }
}

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("analytics storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("analytics codec error: {0}")]
    Codec(#[from] bincode::Error),
}
