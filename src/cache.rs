use dashmap::DashMap;

use crate::limits::MAX_CACHED_EVENTS;
use crate::model::{ExternalEvent, Span};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("external event {0} ends before it starts")]
    InvalidSpan(String),
    #[error("external event cache is full")]
    Full,
}

/// Local, read-mostly mirror of external calendar events.
///
/// Written by the sync collaborator (push) or the polling refresher; read
/// synchronously by availability checks. Not authoritative: it lags the
/// real calendar by up to one refresh interval.
#[derive(Default)]
pub struct EventCache {
    entries: DashMap<String, ExternalEvent>,
}

impl EventCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn upsert(&self, event: ExternalEvent) -> Result<(), CacheError> {
        if event.start >= event.end {
            return Err(CacheError::InvalidSpan(event.external_id));
        }
        if self.entries.len() >= MAX_CACHED_EVENTS && !self.entries.contains_key(&event.external_id) {
            return Err(CacheError::Full);
        }
        self.entries.insert(event.external_id.clone(), event);
        Ok(())
    }

    pub fn remove(&self, external_id: &str) -> Option<ExternalEvent> {
        self.entries.remove(external_id).map(|(_, e)| e)
    }

    /// Replace everything cached for `calendar_id` within `window` by a fresh listing.
    /// Returns the number of entries stored.
    pub fn replace_window(&self, calendar_id: &str, window: &Span, fresh: Vec<ExternalEvent>) -> usize {
        self.entries
            .retain(|_, e| e.calendar_id != calendar_id || !e.span().overlaps(window));
        let mut stored = 0;
        for event in fresh {
            if event.calendar_id != calendar_id {
                continue;
            }
            match self.upsert(event) {
                Ok(()) => stored += 1,
                Err(e) => tracing::debug!("cache refresh skipped entry: {e}"),
            }
        }
        stored
    }

    /// Cached events of `calendar_id` overlapping `span`, sorted by start.
    pub fn overlapping(&self, calendar_id: &str, span: &Span) -> Vec<ExternalEvent> {
        let mut hits: Vec<ExternalEvent> = self
            .entries
            .iter()
            .filter(|e| e.calendar_id == calendar_id && e.start < span.end && e.end > span.start)
            .map(|e| e.value().clone())
            .collect();
        hits.sort_by_key(|e| e.start);
        hits
    }
}
