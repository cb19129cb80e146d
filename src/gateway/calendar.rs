use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::model::{ExternalEvent, Span};

use super::GatewayError;

/// Third-party calendar holding a mirror of the room's bookings.
#[async_trait]
pub trait CalendarGateway: Send + Sync {
    async fn list_events(&self, calendar_id: &str, window: &Span) -> Result<Vec<ExternalEvent>, GatewayError>;

    /// Returns the calendar's id for the new event.
    async fn create_event(
        &self,
        calendar_id: &str,
        span: &Span,
        title: &str,
        notes: Option<&str>,
    ) -> Result<String, GatewayError>;

    async fn delete_event(&self, calendar_id: &str, external_id: &str) -> Result<(), GatewayError>;
}

/// In-process calendar used by the sandbox server and tests.
/// Latency and outages can be injected at runtime.
#[derive(Default)]
pub struct MemoryCalendar {
    events: DashMap<String, ExternalEvent>,
    next_id: AtomicU64,
    latency_ms: AtomicU64,
    failing: AtomicBool,
}

impl MemoryCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Add an event as if someone created it directly in the calendar.
    pub fn insert_external(&self, event: ExternalEvent) {
        self.events.insert(event.external_id.clone(), event);
    }

    pub fn get(&self, external_id: &str) -> Option<ExternalEvent> {
        self.events.get(external_id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    async fn simulate(&self) -> Result<(), GatewayError> {
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.failing.load(Ordering::Relaxed) {
            return Err(GatewayError::Unavailable("calendar offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CalendarGateway for MemoryCalendar {
    async fn list_events(&self, calendar_id: &str, window: &Span) -> Result<Vec<ExternalEvent>, GatewayError> {
        self.simulate().await?;
        let mut hits: Vec<ExternalEvent> = self
            .events
            .iter()
            .filter(|e| e.calendar_id == calendar_id && e.span().overlaps(window))
            .map(|e| e.value().clone())
            .collect();
        hits.sort_by_key(|e| e.start);
        Ok(hits)
    }

    async fn create_event(
        &self,
        calendar_id: &str,
        span: &Span,
        title: &str,
        notes: Option<&str>,
    ) -> Result<String, GatewayError> {
        self.simulate().await?;
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let external_id = format!("evt-{n}");
        let summary = match notes {
            Some(n) if !n.is_empty() => format!("{title} ({n})"),
            _ => title.to_string(),
        };
        self.events.insert(
            external_id.clone(),
            ExternalEvent {
                external_id: external_id.clone(),
                calendar_id: calendar_id.to_string(),
                summary,
                start: span.start,
                end: span.end,
            },
        );
        Ok(external_id)
    }

    async fn delete_event(&self, calendar_id: &str, external_id: &str) -> Result<(), GatewayError> {
        self.simulate().await?;
        match self.events.remove_if(external_id, |_, e| e.calendar_id == calendar_id) {
            Some(_) => Ok(()),
            None => Err(GatewayError::Rejected(format!("no event {external_id} in {calendar_id}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::*;

    #[tokio::test]
    async fn create_list_delete() {
        let cal = MemoryCalendar::new();
        let d = day(2030, 5, 6);
        let span = Span::on(d, hm(9, 0), 90);

        let id = cal.create_event("room", &span, "Booked", Some("standup")).await.unwrap();
        let listed = cal.list_events("room", &Span::on(d, hm(0, 0), 24 * 60 - 1)).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].summary, "Booked (standup)");
        assert!(cal.list_events("other", &span).await.unwrap().is_empty());

        cal.delete_event("room", &id).await.unwrap();
        assert!(cal.is_empty());
        assert!(matches!(
            cal.delete_event("room", &id).await,
            Err(GatewayError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn failing_calendar_reports_unavailable() {
        let cal = MemoryCalendar::new();
        cal.set_failing(true);
        let span = Span::on(day(2030, 5, 6), hm(9, 0), 60);
        assert!(matches!(
            cal.create_event("room", &span, "x", None).await,
            Err(GatewayError::Unavailable(_))
        ));
        assert!(cal.is_empty());
    }
}
