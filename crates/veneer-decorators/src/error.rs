use thiserror::Error;

/// Canonical result for the decorator layers.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] veneer_core::Error),

    /// Raised synchronously while configuring a decorator.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Collection '{0}' not found")]
    UnknownCollection(String),

    #[error("Cyclic dependency detected: {0}")]
    CyclicDependency(String),

    #[error("Conflict value on the field '{field}': it received several values")]
    ConflictingWrite { field: String },

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Failure reported by a native collection.
    #[error("Native collection error: {0}")]
    Native(String),

    #[error("Internal invariant failed: {0}")]
    Invariant(String),
}
