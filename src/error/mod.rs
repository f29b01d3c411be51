use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Prediction error: {0}")]
    Prediction(#[from] PredictionError),

    #[error("MCP protocol error: {0}")]
    Mcp(#[from] McpError),
}

/// Prediction store errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Unique constraint violated: {message}")]
    Conflict { message: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Graph write failed: {0}")]
    Graph(#[from] GraphError),

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Canonical graph repository errors
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Tree not found: {tree_id}")]
    TreeNotFound { tree_id: String },

    #[error("Person not found: {person_id}")]
    PersonNotFound { person_id: String },

    #[error("Relationship already exists: {message}")]
    Conflict { message: String },

    #[error("Graph query failed: {message}")]
    Query { message: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Errors surfaced by the prediction lifecycle.
///
/// Each variant maps to a stable wire code via [`PredictionError::code`].
#[derive(Debug, Error)]
pub enum PredictionError {
    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    #[error("Persistence conflict: {message}")]
    PersistenceConflict { message: String },

    #[error("Rule {rule_id} failed: {message}")]
    RuleExecution { rule_id: String, message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl PredictionError {
    /// Stable snake_case code for structured results.
    pub fn code(&self) -> &'static str {
        match self {
            PredictionError::Forbidden { .. } => "forbidden",
            PredictionError::NotFound { .. } => "not_found",
            PredictionError::InvalidState { .. } => "invalid_state",
            PredictionError::PersistenceConflict { .. } => "persistence_conflict",
            PredictionError::RuleExecution { .. } => "rule_execution_error",
            PredictionError::Internal { .. } => "internal_error",
        }
    }

    /// Whether the failure is an expected outcome callers can act on.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, PredictionError::Internal { .. })
    }
}

impl From<StorageError> for PredictionError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Graph(e) => e.into(),
            StorageError::Conflict { message } => PredictionError::PersistenceConflict { message },
            other => PredictionError::Internal {
                message: other.to_string(),
            },
        }
    }
}

impl From<GraphError> for PredictionError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::TreeNotFound { tree_id } => PredictionError::NotFound {
                message: format!("tree {}", tree_id),
            },
            GraphError::PersonNotFound { person_id } => PredictionError::NotFound {
                message: format!("person {}", person_id),
            },
            GraphError::Conflict { message } => PredictionError::PersistenceConflict {
                message: format!("{} (the relationship may already exist)", message),
            },
            other => PredictionError::Internal {
                message: other.to_string(),
            },
        }
    }
}

/// MCP protocol errors
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Unknown tool: {tool_name}")]
    UnknownTool { tool_name: String },

    #[error("Invalid parameters for {tool_name}: {message}")]
    InvalidParameters { tool_name: String, message: String },

    #[error("Tool execution failed: {message}")]
    ExecutionFailed { message: String },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<AppError> for McpError {
    fn from(err: AppError) -> Self {
        McpError::ExecutionFailed {
            message: err.to_string(),
        }
    }
}

impl From<PredictionError> for McpError {
    fn from(err: PredictionError) -> Self {
        McpError::ExecutionFailed {
            message: err.to_string(),
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for graph repository operations
pub type GraphResult<T> = Result<T, GraphError>;

/// Result type alias for prediction lifecycle operations
pub type PredictionResult<T> = Result<T, PredictionError>;

/// Result type alias for MCP operations
pub type McpResult<T> = Result<T, McpError>;
