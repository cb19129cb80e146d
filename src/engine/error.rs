use ulid::Ulid;

use crate::model::ReservationStatus;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("conflict with reservation: {0}")]
    Conflict(Ulid),
    #[error("cannot {action} reservation {id} while {from}")]
    InvalidTransition {
        id: Ulid,
        from: ReservationStatus,
        action: &'static str,
    },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}
