use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;

use super::GatewayError;

/// Handed back to the client; `confirmation_handle` comes back with the
/// confirm call once the payer has authorized the charge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentIntent {
    pub client_ref: String,
    pub confirmation_handle: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentConfirmation {
    pub succeeded: bool,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// `amount` is in the smallest currency unit.
    async fn create_payment_intent(&self, amount: u64, payer_id: &str) -> Result<PaymentIntent, GatewayError>;

    async fn confirm(&self, handle: &str) -> Result<PaymentConfirmation, GatewayError>;
}

#[derive(Debug, Clone)]
struct Intent {
    amount: u64,
    payer_id: String,
    declined: bool,
    captured: bool,
}

/// Sandbox processor. Every intent succeeds unless declined via
/// [`MemoryPayments::decline`]; outages and latency are injectable.
#[derive(Default)]
pub struct MemoryPayments {
    intents: DashMap<String, Intent>,
    next_id: AtomicU64,
    latency_ms: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryPayments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decline(&self, handle: &str) {
        if let Some(mut intent) = self.intents.get_mut(handle) {
            intent.declined = true;
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn is_captured(&self, handle: &str) -> bool {
        self.intents.get(handle).is_some_and(|i| i.captured)
    }

    /// Amount and payer of an intent, for reconciliation.
    pub fn intent(&self, handle: &str) -> Option<(u64, String)> {
        self.intents
            .get(handle)
            .map(|i| (i.amount, i.payer_id.clone()))
    }

    async fn simulate(&self) -> Result<(), GatewayError> {
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(GatewayError::Unavailable("payment processor offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for MemoryPayments {
    async fn create_payment_intent(&self, amount: u64, payer_id: &str) -> Result<PaymentIntent, GatewayError> {
        self.simulate().await?;
        if amount == 0 {
            return Err(GatewayError::Rejected("amount must be positive".into()));
        }
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = format!("pi_{n:06}");
        self.intents.insert(
            handle.clone(),
            Intent {
                amount,
                payer_id: payer_id.to_string(),
                declined: false,
                captured: false,
            },
        );
        Ok(PaymentIntent {
            client_ref: format!("{handle}_secret"),
            confirmation_handle: handle,
        })
    }

    async fn confirm(&self, handle: &str) -> Result<PaymentConfirmation, GatewayError> {
        self.simulate().await?;
        let mut intent = self
            .intents
            .get_mut(handle)
            .ok_or_else(|| GatewayError::Rejected(format!("unknown payment intent {handle}")))?;
        if intent.declined {
            return Ok(PaymentConfirmation { succeeded: false });
        }
        intent.captured = true;
        Ok(PaymentConfirmation { succeeded: true })
    }
}
