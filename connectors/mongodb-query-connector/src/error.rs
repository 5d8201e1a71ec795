use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Connector error taxonomy.
///
/// Backend errors pass through verbatim. Compilation errors are fatal and
/// raised synchronously while lowering an operation log; they indicate a
/// malformed builder state, never a server-side condition.
#[derive(Debug, Error)]
pub enum Error {
    #[error("compilation error: {0}")]
    Compilation(#[from] CompilationError),

    #[error(transparent)]
    Backend(#[from] mongodb::error::Error),

    /// Commit failed after the session may already have produced side
    /// effects. A best-effort rollback was attempted before this surfaced.
    #[error("transaction finalization failed: {0}")]
    TransactionFinalization(#[source] mongodb::error::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, Error)]
pub enum CompilationError {
    #[error("unknown comparison operator `{op}`")]
    UnknownOperator { op: String },

    #[error("aggregate descriptor `{descriptor}` is missing its field")]
    MissingAggregateField { descriptor: &'static str },

    #[error("projection aggregate `{op}` is not a known reduction")]
    UnknownProjectionAggregate { op: String },

    #[error("raw expression is not a document: {detail}")]
    MalformedRawExpression { detail: String },

    #[error("value is not representable in the backend document model: {detail}")]
    UnrepresentableValue { detail: String },

    #[error("operator `{op}` expects an array of values")]
    ExpectedValueList { op: String },
}

impl Error {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }
}
