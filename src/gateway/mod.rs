pub mod calendar;
pub mod directory;
pub mod payment;

pub use calendar::{CalendarGateway, MemoryCalendar};
pub use directory::{MemberTier, MembershipDirectory, StaticDirectory};
pub use payment::{MemoryPayments, PaymentConfirmation, PaymentGateway, PaymentIntent};

use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("{call} timed out after {after:?}")]
    Timeout { call: &'static str, after: Duration },
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Run a collaborator call with a deadline; elapsed deadlines become `Timeout`.
pub async fn bounded<T, F>(limit: Duration, call: &'static str, fut: F) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    let started = std::time::Instant::now();
    let result = match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout { call, after: limit }),
    };
    metrics::histogram!(crate::observability::GATEWAY_CALL_DURATION_SECONDS, "call" => call)
        .record(started.elapsed().as_secs_f64());
    if let Err(ref e) = result {
        let kind = match e {
            GatewayError::Timeout { .. } => "timeout",
            GatewayError::Unavailable(_) => "unavailable",
            GatewayError::Rejected(_) => "rejected",
        };
        metrics::counter!(crate::observability::GATEWAY_FAILURES_TOTAL, "call" => call, "kind" => kind)
            .increment(1);
    }
    result
}
