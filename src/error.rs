//! Error types for a collection cycle.

use thiserror::Error;

use crate::context::ContextError;
use crate::db::BoxError;
use crate::metric::MetricError;

/// Errors that abort a collection cycle.
#[derive(Debug, Error)]
pub enum CollectError {
    /// The read failed: connectivity, missing extension, permissions, or a finished context.
    #[error("query failed: {0}")]
    Query(#[source] BoxError),

    /// A column could not be decoded into the expected type. NULLs never produce this.
    #[error("failed to scan column {column}: {source}")]
    Scan {
        column: &'static str,
        #[source]
        source: BoxError,
    },

    /// The reset statement failed. Collectors log this and keep going; it is never returned from a cycle.
    #[error("reset failed: {0}")]
    Reset(#[source] BoxError),

    #[error(transparent)]
    Metric(#[from] MetricError),

    #[error("metric channel closed by the receiver")]
    SinkClosed,
}

impl From<ContextError> for CollectError {
    fn from(err: ContextError) -> Self {
        Self::Query(Box::new(err))
    }
}

impl CollectError {
    /// Returns the context error behind a [`Query`][Self::Query] failure, if that is what caused it.
    pub fn context_error(&self) -> Option<ContextError> {
        match self {
            Self::Query(source) => source.downcast_ref::<ContextError>().copied(),
            _ => None,
        }
    }
}
