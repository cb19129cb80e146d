use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Minutes are the only duration unit the engine stores.
pub type Minutes = u32;

/// Half-open interval `[start, end)` on the local wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Span {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Span of `minutes` starting at `time` on `date`.
    pub fn on(date: NaiveDate, time: NaiveTime, minutes: Minutes) -> Self {
        let start = date.and_time(time);
        Self::new(start, start + Duration::minutes(i64::from(minutes)))
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && self.end > other.start
    }

    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Daily window in which the room can be booked. `closes` is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpeningHours {
    pub opens: NaiveTime,
    pub closes: NaiveTime,
}

impl OpeningHours {
    pub fn span_on(&self, date: NaiveDate) -> Span {
        Span::new(date.and_time(self.opens), date.and_time(self.closes))
    }

    /// Hourly marks from opening up to (not including) closing.
    pub fn hourly_marks(&self) -> Vec<NaiveTime> {
        let mut marks = Vec::new();
        let mut t = self.opens;
        while t < self.closes {
            marks.push(t);
            let (next, wrapped) = t.overflowing_add_signed(Duration::hours(1));
            if wrapped != 0 {
                break;
            }
            t = next;
        }
        marks
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Reserved,
    Confirmed,
    InUse,
    Completed,
    Cancelled,
}

impl ReservationStatus {
    /// Statuses that consume room capacity.
    pub fn is_blocking(self) -> bool {
        matches!(self, Self::Reserved | Self::Confirmed | Self::InUse)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Confirmed => "confirmed",
            Self::InUse => "in_use",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Refunded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    /// Pay-per-use.
    NonMember,
    /// Member rate, no free quota.
    Standard,
    /// Member rate after a monthly free allotment.
    Quota,
}

/// Pricing inputs frozen into a reservation when it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSnapshot {
    pub kind: TierKind,
    /// Smallest currency unit per hour.
    pub hourly_rate: u64,
    pub free_minutes_per_month: Minutes,
}

impl TierSnapshot {
    pub fn is_member(&self) -> bool {
        self.kind != TierKind::NonMember
    }
}

/// Who asked for a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Member(String),
    Admin(String),
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub duration_minutes: Minutes,
    pub status: ReservationStatus,
    pub payer_id: String,
    pub booker_id: String,
    pub tier: TierSnapshot,
    pub free_minutes_consumed: Minutes,
    pub total_amount: u64,
    pub payment_status: PaymentStatus,
    pub payment_handle: Option<String>,
    pub external_calendar_event_id: Option<String>,
    pub notes: Option<String>,
    pub created_at: NaiveDateTime,
    pub cancelled_at: Option<NaiveDateTime>,
    pub cancelled_by: Option<Actor>,
}

impl Reservation {
    pub fn span(&self) -> Span {
        Span::new(self.date.and_time(self.start_time), self.date.and_time(self.end_time))
    }

    pub fn is_blocking(&self) -> bool {
        self.status.is_blocking()
    }

    pub fn duration_hours(&self) -> f64 {
        f64::from(self.duration_minutes) / 60.0
    }

    /// Year and month the reservation's free minutes are counted against.
    pub fn billing_month(&self) -> (i32, u32) {
        (self.date.year(), self.date.month())
    }
}

/// Local mirror of one event on the room's external calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalEvent {
    pub external_id: String,
    pub calendar_id: String,
    pub summary: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl ExternalEvent {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: String,
    pub calendar_id: String,
    pub hours: OpeningHours,
    /// Every reservation ever made on the resource, sorted by start.
    pub reservations: Vec<Reservation>,
}

impl ResourceState {
    pub fn new(id: Ulid, name: String, calendar_id: String, hours: OpeningHours) -> Self {
        Self {
            id,
            name,
            calendar_id,
            hours,
            reservations: Vec::new(),
        }
    }

    /// Insert reservation maintaining sort order by start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let start = reservation.span().start;
        let pos = self.reservations.partition_point(|r| r.span().start <= start);
        self.reservations.insert(pos, reservation);
    }

    pub fn get(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn get_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    /// Return reservations (any status) whose span overlaps the query window.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span().start < query.end);
        let query_start = query.start;
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span().end > query_start)
    }

    /// Overlapping reservations that still hold the room.
    pub fn blocking_overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        self.overlapping(query).filter(|r| r.is_blocking())
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        name: String,
        calendar_id: String,
        hours: OpeningHours,
    },
    /// Also used by compaction to snapshot a reservation in its current state.
    ReservationCreated {
        reservation: Reservation,
    },
    PaymentIntentAttached {
        id: Ulid,
        resource_id: Ulid,
        handle: String,
    },
    /// `Reserved`/`Pending` to `Confirmed`/`Paid` in one step.
    ReservationConfirmed {
        id: Ulid,
        resource_id: Ulid,
    },
    CalendarLinked {
        id: Ulid,
        resource_id: Ulid,
        external_id: String,
    },
    ReservationStarted {
        id: Ulid,
        resource_id: Ulid,
    },
    ReservationCompleted {
        id: Ulid,
        resource_id: Ulid,
    },
    ReservationCancelled {
        id: Ulid,
        resource_id: Ulid,
        at: NaiveDateTime,
        by: Actor,
    },
    RefundRecorded {
        id: Ulid,
        resource_id: Ulid,
    },
    /// A charge went through after the reservation had been cancelled.
    /// Marks it paid so the refund can be recorded.
    PaymentCaptured {
        id: Ulid,
        resource_id: Ulid,
    },
}

impl Event {
    pub fn resource_id(&self) -> Ulid {
        match self {
            Event::ResourceCreated { id, .. } => *id,
            Event::ReservationCreated { reservation } => reservation.resource_id,
            Event::PaymentIntentAttached { resource_id, .. }
            | Event::ReservationConfirmed { resource_id, .. }
            | Event::CalendarLinked { resource_id, .. }
            | Event::ReservationStarted { resource_id, .. }
            | Event::ReservationCompleted { resource_id, .. }
            | Event::ReservationCancelled { resource_id, .. }
            | Event::RefundRecorded { resource_id, .. }
            | Event::PaymentCaptured { resource_id, .. } => *resource_id,
        }
    }

    /// Short label for notifications and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Event::ResourceCreated { .. } => "resource_created",
            Event::ReservationCreated { .. } => "reservation_created",
            Event::PaymentIntentAttached { .. } => "payment_intent_attached",
            Event::ReservationConfirmed { .. } => "reservation_confirmed",
            Event::CalendarLinked { .. } => "calendar_linked",
            Event::ReservationStarted { .. } => "reservation_started",
            Event::ReservationCompleted { .. } => "reservation_completed",
            Event::ReservationCancelled { .. } => "reservation_cancelled",
            Event::RefundRecorded { .. } => "refund_recorded",
            Event::PaymentCaptured { .. } => "payment_captured",
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    pub fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    pub fn at(date: NaiveDate, h: u32, m: u32) -> NaiveDateTime {
        date.and_time(hm(h, m))
    }

    pub fn hours(opens: u32, closes: u32) -> OpeningHours {
        OpeningHours {
            opens: hm(opens, 0),
            closes: hm(closes, 0),
        }
    }

    pub fn member_tier() -> TierSnapshot {
        TierSnapshot {
            kind: TierKind::Standard,
            hourly_rate: 800,
            free_minutes_per_month: 0,
        }
    }

    pub fn reservation(date: NaiveDate, start: NaiveTime, minutes: Minutes) -> Reservation {
        let span = Span::on(date, start, minutes);
        Reservation {
            id: Ulid::new(),
            resource_id: Ulid::nil(),
            date,
            start_time: start,
            end_time: span.end.time(),
            duration_minutes: minutes,
            status: ReservationStatus::Reserved,
            payer_id: "payer".into(),
            booker_id: "booker".into(),
            tier: member_tier(),
            free_minutes_consumed: 0,
            total_amount: 0,
            payment_status: PaymentStatus::Pending,
            payment_handle: None,
            external_calendar_event_id: None,
            notes: None,
            created_at: at(date, 0, 0),
            cancelled_at: None,
            cancelled_by: None,
        }
    }
}
