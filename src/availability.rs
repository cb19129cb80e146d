use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Days, NaiveDate, NaiveTime};
use serde::Serialize;
use ulid::Ulid;

use crate::cache::EventCache;
use crate::clock::Clock;
use crate::engine::{free_spans, Engine, ResourceInfo};
use crate::error::BookingError;
use crate::gateway::{bounded, CalendarGateway, GatewayError};
use crate::limits::GRID_DAYS;
use crate::model::{Minutes, Span};
use crate::observability::{AVAILABILITY_UNVERIFIED_TOTAL, GRID_BUILD_DURATION_SECONDS};

/// Busy intervals on an external calendar.
#[async_trait]
pub trait BusySource: Send + Sync {
    /// Spans overlapping `window`, in no particular order.
    async fn busy_spans(&self, calendar_id: &str, window: &Span) -> Result<Vec<Span>, GatewayError>;
}

/// Answers from the local event cache. Never fails, never awaits I/O.
pub struct CacheSource {
    cache: Arc<EventCache>,
}

impl CacheSource {
    pub fn new(cache: Arc<EventCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl BusySource for CacheSource {
    async fn busy_spans(&self, calendar_id: &str, window: &Span) -> Result<Vec<Span>, GatewayError> {
        Ok(self
            .cache
            .overlapping(calendar_id, window)
            .iter()
            .map(|e| e.span())
            .collect())
    }
}

/// Asks the calendar directly, one deadline per call.
pub struct LiveSource {
    gateway: Arc<dyn CalendarGateway>,
    timeout: Duration,
}

impl LiveSource {
    pub fn new(gateway: Arc<dyn CalendarGateway>, timeout: Duration) -> Self {
        Self { gateway, timeout }
    }
}

#[async_trait]
impl BusySource for LiveSource {
    async fn busy_spans(&self, calendar_id: &str, window: &Span) -> Result<Vec<Span>, GatewayError> {
        let events = bounded(
            self.timeout,
            "calendar.list_events",
            self.gateway.list_events(calendar_id, window),
        )
        .await?;
        Ok(events
            .iter()
            .filter(|e| e.start < e.end)
            .map(|e| e.span())
            .filter(|s| s.overlaps(window))
            .collect())
    }
}

/// Cache first, then the live calendar to catch edits the cache has not
/// seen yet. A live failure fails the whole answer.
pub struct Layered {
    cache: CacheSource,
    live: LiveSource,
}

impl Layered {
    pub fn new(cache: CacheSource, live: LiveSource) -> Self {
        Self { cache, live }
    }
}

#[async_trait]
impl BusySource for Layered {
    async fn busy_spans(&self, calendar_id: &str, window: &Span) -> Result<Vec<Span>, GatewayError> {
        let mut busy = self.cache.busy_spans(calendar_id, window).await?;
        busy.extend(self.live.busy_spans(calendar_id, window).await?);
        Ok(busy)
    }
}

/// Why a cell or interval cannot be booked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotReason {
    Past,
    OutsideHours,
    Reserved,
    ExternalEvent,
    /// The external calendar could not be consulted.
    Unverified,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GridCell {
    pub time: NaiveTime,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<SlotReason>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GridDay {
    pub date: NaiveDate,
    pub slots: Vec<GridCell>,
}

/// Seven days of hourly marks across the room's opening hours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WeeklyGrid {
    pub resource_id: Ulid,
    pub week_start: NaiveDate,
    pub min_duration_minutes: Minutes,
    pub days: Vec<GridDay>,
}

impl WeeklyGrid {
    pub fn get(&self, date: NaiveDate, time: NaiveTime) -> Option<&GridCell> {
        self.days
            .iter()
            .find(|d| d.date == date)?
            .slots
            .iter()
            .find(|c| c.time == time)
    }

    pub fn cells(&self) -> impl Iterator<Item = (NaiveDate, &GridCell)> {
        self.days
            .iter()
            .flat_map(|d| d.slots.iter().map(move |c| (d.date, c)))
    }

    pub fn available_count(&self) -> usize {
        self.cells().filter(|(_, c)| c.available).count()
    }
}

/// Combines blocking reservations in the engine with busy time from a
/// [`BusySource`]. Any source error makes the affected interval unavailable.
pub struct AvailabilityChecker {
    engine: Arc<Engine>,
    source: Arc<dyn BusySource>,
    clock: Arc<dyn Clock>,
}

impl AvailabilityChecker {
    pub fn new(engine: Arc<Engine>, source: Arc<dyn BusySource>, clock: Arc<dyn Clock>) -> Self {
        Self { engine, source, clock }
    }

    async fn resource(&self, resource_id: Ulid) -> Result<ResourceInfo, BookingError> {
        self.engine
            .resource_info(resource_id)
            .await
            .ok_or_else(|| BookingError::NotFound(format!("resource {resource_id}")))
    }

    /// Why `span` cannot be booked, or `None` if it is free. Only overlap is
    /// checked here; clock and opening-hour rules belong to the caller.
    pub async fn blocking_reason(&self, resource_id: Ulid, span: &Span) -> Result<Option<SlotReason>, BookingError> {
        let info = self.resource(resource_id).await?;
        if !self.engine.blocking_spans(resource_id, span).await?.is_empty() {
            return Ok(Some(SlotReason::Reserved));
        }
        Ok(self.external_reason(&info.calendar_id, span).await)
    }

    async fn external_reason(&self, calendar_id: &str, span: &Span) -> Option<SlotReason> {
        match self.source.busy_spans(calendar_id, span).await {
            Ok(busy) if busy.iter().any(|b| b.overlaps(span)) => Some(SlotReason::ExternalEvent),
            Ok(_) => None,
            Err(e) => {
                metrics::counter!(AVAILABILITY_UNVERIFIED_TOTAL).increment(1);
                tracing::warn!(calendar_id, start = %span.start, "availability unverified: {e}");
                Some(SlotReason::Unverified)
            }
        }
    }

    pub async fn is_interval_free(&self, resource_id: Ulid, span: &Span) -> Result<bool, BookingError> {
        Ok(self.blocking_reason(resource_id, span).await?.is_none())
    }

    /// Longest bookable run starting at `start` on `date`, in minutes: up to
    /// the next reservation, the next external event or closing time,
    /// whichever comes first. Zero when `start` itself is not bookable.
    pub async fn max_contiguous_duration(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
    ) -> Result<Minutes, BookingError> {
        let info = self.resource(resource_id).await?;
        let begin = date.and_time(start);
        if begin < self.clock.now() || start < info.hours.opens || start >= info.hours.closes {
            return Ok(0);
        }
        let window = Span::new(begin, date.and_time(info.hours.closes));

        let mut busy = self.engine.blocking_spans(resource_id, &window).await?;
        match self.source.busy_spans(&info.calendar_id, &window).await {
            Ok(external) => busy.extend(external),
            Err(e) => {
                metrics::counter!(AVAILABILITY_UNVERIFIED_TOTAL).increment(1);
                tracing::warn!(%resource_id, %begin, "max duration unverified: {e}");
                return Ok(0);
            }
        }

        let free = free_spans(&window, &busy);
        Ok(match free.first() {
            Some(first) if first.start == begin => u32::try_from(first.duration_minutes()).unwrap_or(0),
            _ => 0,
        })
    }

    /// Availability of every hourly mark in the seven days from `week_start`
    /// for a booking of at least `min_minutes`. External checks for all
    /// candidate cells run concurrently; each one fails closed on its own.
    pub async fn weekly_grid(
        &self,
        resource_id: Ulid,
        week_start: NaiveDate,
        min_minutes: Minutes,
    ) -> Result<WeeklyGrid, BookingError> {
        if min_minutes == 0 {
            return Err(BookingError::Validation("minimum duration must be positive".into()));
        }
        let started = std::time::Instant::now();
        let info = self.resource(resource_id).await?;
        let week_end = week_start
            .checked_add_days(Days::new(GRID_DAYS))
            .ok_or_else(|| BookingError::Validation("week start out of range".into()))?;
        let week = Span::new(
            week_start.and_time(NaiveTime::MIN),
            week_end.and_time(NaiveTime::MIN),
        );
        let reserved = self.engine.blocking_spans(resource_id, &week).await?;
        let now = self.clock.now();
        let marks = info.hours.hourly_marks();

        let mut days = Vec::with_capacity(GRID_DAYS as usize);
        let mut candidates = Vec::new();
        for date in week_start.iter_days().take(GRID_DAYS as usize) {
            let closes = date.and_time(info.hours.closes);
            let mut slots = Vec::with_capacity(marks.len());
            for &time in &marks {
                let cell = Span::on(date, time, min_minutes);
                let reason = if cell.start < now {
                    Some(SlotReason::Past)
                } else if cell.end > closes || cell.end.date() != date {
                    Some(SlotReason::OutsideHours)
                } else if reserved.iter().any(|r| r.overlaps(&cell)) {
                    Some(SlotReason::Reserved)
                } else {
                    candidates.push((days.len(), slots.len(), cell));
                    None
                };
                slots.push(GridCell {
                    time,
                    available: reason.is_none(),
                    reason,
                });
            }
            days.push(GridDay { date, slots });
        }

        let checks = candidates
            .iter()
            .map(|(_, _, cell)| self.external_reason(&info.calendar_id, cell));
        let verdicts = futures::future::join_all(checks).await;
        for ((d, s, _), reason) in candidates.into_iter().zip(verdicts) {
            if let Some(reason) = reason {
                let cell = &mut days[d].slots[s];
                cell.available = false;
                cell.reason = Some(reason);
            }
        }

        metrics::histogram!(GRID_BUILD_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        Ok(WeeklyGrid {
            resource_id,
            week_start,
            min_duration_minutes: min_minutes,
            days,
        })
    }
}
