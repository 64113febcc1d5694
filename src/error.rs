//! Error types for lemur.

use thiserror::Error;

/// Errors that can occur while building an index or running a retrieval.
///
/// Contract violations inside the dispatcher (calling a strategy through an
/// entry point it does not support) are not represented here: they panic.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RetrieveError {
    /// Empty query set provided.
    #[error("query set is empty")]
    EmptyQuery,
    /// Empty probe set (nothing to index).
    #[error("probe set is empty")]
    EmptyIndex,
    /// Invalid parameter value.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// Dimension mismatch between queries and probes.
    #[error("dimension mismatch: query has {query_dim} dimensions, probe has {doc_dim}")]
    DimensionMismatch { query_dim: usize, doc_dim: usize },
    /// The worker thread pool could not be created.
    #[error("thread pool error: {0}")]
    ThreadPool(String),
    /// Configuration could not be parsed.
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, RetrieveError>;
