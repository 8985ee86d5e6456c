use std::fmt;

/// SQLSTATE raised when `statement_timeout` cancels a query.
const QUERY_CANCELED: &str = "57014";

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Distinguishes how a geometry store call failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Connectivity problems, malformed SQL, or any error raised by the store itself.
    Query,
    /// The store did not answer within the configured query timeout.
    Timeout,
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreErrorKind::Query => f.write_str("query"),
            StoreErrorKind::Timeout => f.write_str("timeout"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid tile coordinate: {0}")]
    InvalidCoordinate(String),

    #[error("{0}")]
    InvalidFilter(String),

    #[error("{message}")]
    Store {
        kind: StoreErrorKind,
        message: String,
    },

    #[error("Cannot {0}")]
    NotFound(String),

    #[error("Invalid layer configuration: {0}")]
    Config(String),

    #[error("Invalid YAML in layer definitions: {0}")]
    LayerSource(#[from] serde_yaml::Error),
}

impl Error {
    /// HTTP status code for this error when it reaches the dispatcher.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::InvalidCoordinate(_) | Error::InvalidFilter(_) => 400,
            Error::NotFound(_) => 404,
            Error::Store { .. } | Error::Config(_) | Error::LayerSource(_) => 500,
        }
    }

    pub fn store_kind(&self) -> Option<StoreErrorKind> {
        match self {
            Error::Store { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

fn store_error_kind(sqlstate: Option<&str>) -> StoreErrorKind {
    match sqlstate {
        Some(QUERY_CANCELED) => StoreErrorKind::Timeout,
        _ => StoreErrorKind::Query,
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        let kind = match &err {
            sqlx::Error::Database(db) => store_error_kind(db.code().as_deref()),
            _ => StoreErrorKind::Query,
        };

        Error::Store {
            kind,
            message: err.to_string(),
        }
    }
}
