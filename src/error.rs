use thiserror::Error;

use crate::db::ErrorCategory;

/// Errors raised by the driver, the engine and the dialect compilers.
#[derive(Debug, Error)]
pub enum Error {
    /// Pool exhaustion, acquisition timeout or a lost connection.
    #[error("connection error: {0}")]
    Connectivity(String),

    /// An operator or feature the active dialect does not implement.
    /// Raised while compiling, before anything is executed.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// A statement failed on the server. `statement` carries the SQL text and
    /// parameters only when the driver runs in debug mode.
    #[error("{category}: {message}{}", describe_statement(.statement))]
    Execution {
        category: ErrorCategory,
        message: String,
        statement: Option<String>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

fn describe_statement(statement: &Option<String>) -> String {
    match statement {
        Some(s) => format!(" (statement: {})", s),
        None => String::new(),
    }
}

impl Error {
    pub fn execution(category: ErrorCategory, message: impl Into<String>) -> Self {
        Error::Execution {
            category,
            message: message.into(),
            statement: None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Error::UnsupportedOperation(message.into())
    }

    /// Attach the failing statement to an execution error.
    pub fn with_statement(self, statement: impl FnOnce() -> String) -> Self {
        match self {
            Error::Execution {
                category,
                message,
                statement: None,
            } => Error::Execution {
                category,
                message,
                statement: Some(statement()),
            },
            other => other,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Connectivity(_) => ErrorCategory::Connection,
            Error::Execution { category, .. } => category.clone(),
            Error::Transaction(_) => ErrorCategory::Transaction,
            _ => ErrorCategory::Unknown,
        }
    }
}
