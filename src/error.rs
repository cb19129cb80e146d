use ulid::Ulid;

use crate::engine::EngineError;
use crate::gateway::GatewayError;
use crate::model::ReservationStatus;

/// Errors surfaced to callers of the booking operations.
#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("requested time is taken: {0}")]
    Conflict(String),
    #[error("{service} unavailable: {reason}")]
    ExternalServiceDegraded {
        service: &'static str,
        reason: String,
    },
    #[error("cannot {action} reservation {id} while {from}")]
    InvalidStateTransition {
        id: Ulid,
        from: ReservationStatus,
        action: &'static str,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("payment for reservation {0} was declined")]
    PaymentDeclined(Ulid),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl BookingError {
    /// Stable machine-readable label used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            BookingError::Validation(_) => "validation",
            BookingError::Conflict(_) => "conflict",
            BookingError::ExternalServiceDegraded { .. } => "external_service_degraded",
            BookingError::InvalidStateTransition { .. } => "invalid_state_transition",
            BookingError::NotFound(_) => "not_found",
            BookingError::PaymentDeclined(_) => "payment_declined",
            BookingError::Forbidden(_) => "forbidden",
            BookingError::Storage(_) => "storage",
        }
    }

    pub fn degraded(service: &'static str, err: GatewayError) -> Self {
        BookingError::ExternalServiceDegraded {
            service,
            reason: err.to_string(),
        }
    }
}

impl From<EngineError> for BookingError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::NotFound(id) => BookingError::NotFound(id.to_string()),
            EngineError::AlreadyExists(id) => BookingError::Conflict(format!("reservation {id} already exists")),
            EngineError::Conflict(id) => BookingError::Conflict(format!("overlaps reservation {id}")),
            EngineError::InvalidTransition { id, from, action } => {
                BookingError::InvalidStateTransition { id, from, action }
            }
            EngineError::LimitExceeded(what) => BookingError::Validation(what.to_string()),
            EngineError::WalError(msg) => BookingError::Storage(msg),
        }
    }
}
