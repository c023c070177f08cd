use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Method '{method}' failed with status {status:#010x}")]
    Invocation { method: String, status: i32 },

    #[error("Marshal error: {0}")]
    Marshal(String),

    #[error("Session '{0}' is closed")]
    SessionClosed(String),

    #[error("Invalid query: {0}")]
    Query(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock error: {0}")]
    Lock(String),
}

impl StoreError {
    /// Build an invocation failure for `method` carrying the provider status.
    pub fn invocation(method: &str, status: i32) -> Self {
        Self::Invocation {
            method: method.to_string(),
            status,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Provider status code, when the failure came from a remote call.
    pub fn status(&self) -> Option<i32> {
        match self {
            Self::Invocation { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}
