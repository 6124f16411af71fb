use thiserror::Error;

/// Error taxonomy of the engine. Registration and constructor-like
/// operations surface these immediately; failures inside the apply-events
/// phase are fatal for the current run (see `Model::run`).
#[derive(Debug, Error)]
pub enum Error {
    /// Illegal parameter (negative prevalence, probability above one,
    /// burn-in not smaller than the sample count, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Index or id outside its valid bounds.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// Attempt to remove or mutate an entity through an agent that does
    /// not own it.
    #[error("ownership violation: {0}")]
    OwnershipViolation(String),

    /// Reference to a virus, tool or entity never registered with the
    /// model.
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    /// The model was used before `init()`.
    #[error("model not initialized")]
    Uninitialized,

    /// Edgelist or transition file missing or malformed.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn out_of_range(msg: impl Into<String>) -> Self {
        Error::OutOfRange(msg.into())
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Error::UnknownEntity(msg.into())
    }

    pub fn ownership(msg: impl Into<String>) -> Self {
        Error::OwnershipViolation(msg.into())
    }
}
