use thiserror::Error;

/// Canonical result for core.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown collection '{0}'")]
    UnknownCollection(String),

    #[error("Unknown field '{field}' on collection '{collection}'")]
    UnknownField { collection: String, field: String },

    /// Raised by `unnest` on projections, sorts, and condition trees whose
    /// paths do not all share the same first segment.
    #[error("Cannot unnest: {0}")]
    Unnest(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Invalid date '{0}'")]
    InvalidDate(String),

    #[error("Invalid timezone '{0}'")]
    InvalidTimezone(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Hashing error: {0}")]
    Hash(String),

    #[error("Internal invariant failed: {0}")]
    Invariant(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Hash(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}
