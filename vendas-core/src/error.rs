// vendas-core/src/error.rs
// Error types for the vendas query engine

use thiserror::Error;

/// Errors raised by the query engine
#[derive(Debug, Error)]
pub enum VendasError {
    /// A query could not complete: the collection was unreachable or a
    /// document did not have the expected shape. Always terminal.
    #[error("Query execution error: {0}")]
    QueryExecution(String),

    /// Malformed pipeline definition
    #[error("Aggregation error: {0}")]
    AggregationError(String),

    /// Malformed console query script
    #[error("Script error: {0}")]
    ScriptError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, VendasError>;
