use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, GateError>;

/// Errors produced by the mediation engine itself.
///
/// Query denials and admission refusals are not errors; they are
/// structured outcomes (see `gateway::QueryOutcome`). This type covers
/// genuine failures: broken persistence, invalid admin input, and
/// illegal workflow transitions.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("unknown role: {0}")]
    UnknownRole(String),

    #[error("invalid rule: {0}")]
    InvalidRule(String),

    #[error("permission request {0} not found")]
    RequestNotFound(Uuid),

    #[error("permission request {0} was already reviewed as {1}")]
    AlreadyReviewed(Uuid, String),

    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}
