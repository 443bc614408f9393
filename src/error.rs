use thiserror::Error;

/// Caller-visible classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidState,
    Conflict,
    ValidationFailed,
    Unauthorized,
    NotDeployable,
    Cancelled,
    Internal,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not deployable: {0}")]
    NotDeployable(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::ValidationFailed(_) => ErrorKind::ValidationFailed,
            Error::Unauthorized(_) => ErrorKind::Unauthorized,
            Error::NotDeployable(_) => ErrorKind::NotDeployable,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::Internal(_)
            | Error::Database(_)
            | Error::Io(_)
            | Error::Http(_)
            | Error::Config(_) => ErrorKind::Internal,
        }
    }

    /// Rebuilds an error from a kind and message, e.g. after it crossed a
    /// channel as plain data.
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::NotFound => Error::NotFound(message),
            ErrorKind::AlreadyExists => Error::AlreadyExists(message),
            ErrorKind::InvalidState => Error::InvalidState(message),
            ErrorKind::Conflict => Error::Conflict(message),
            ErrorKind::ValidationFailed => Error::ValidationFailed(message),
            ErrorKind::Unauthorized => Error::Unauthorized(message),
            ErrorKind::NotDeployable => Error::NotDeployable(message),
            ErrorKind::Cancelled => Error::Cancelled(message),
            ErrorKind::Internal => Error::Internal(message),
        }
    }

    /// The message without the kind prefix added by `Display`.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Error::NotFound(m)
            | Error::AlreadyExists(m)
            | Error::InvalidState(m)
            | Error::Conflict(m)
            | Error::ValidationFailed(m)
            | Error::Unauthorized(m)
            | Error::NotDeployable(m)
            | Error::Cancelled(m)
            | Error::Internal(m)
            | Error::Config(m) => m.clone(),
            Error::Database(e) => e.to_string(),
            Error::Io(e) => e.to_string(),
            Error::Http(e) => e.to_string(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn conflict(what: impl Into<String>) -> Self {
        Error::Conflict(what.into())
    }

    pub fn invalid_state(what: impl Into<String>) -> Self {
        Error::InvalidState(what.into())
    }

    pub fn validation(what: impl Into<String>) -> Self {
        Error::ValidationFailed(what.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
