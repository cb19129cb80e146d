use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::pricing;

use super::conflict::{check_capacity, check_no_conflict, validate_draft};
use super::{Engine, EngineError, UsageKey, WalCommand};

/// Everything needed to create a reservation except the frozen price.
#[derive(Debug, Clone)]
pub struct ReservationDraft {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub duration_minutes: Minutes,
    pub payer_id: String,
    pub booker_id: String,
    pub tier: TierSnapshot,
    pub notes: Option<String>,
}

impl ReservationDraft {
    pub fn span(&self) -> Span {
        Span::on(self.date, self.start_time, self.duration_minutes)
    }
}

/// Clock-driven step the sweeper should apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueTransition {
    Start,
    Complete,
}

impl Engine {
    /// Create the resource unless it already exists. Returns true if created.
    pub async fn ensure_resource(
        &self,
        id: Ulid,
        name: String,
        calendar_id: String,
        hours: OpeningHours,
    ) -> Result<bool, EngineError> {
        if self.state.contains_key(&id) {
            return Ok(false);
        }
        if self.state.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if name.len() > MAX_NAME_LEN || calendar_id.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("resource name too long"));
        }
        if hours.opens >= hours.closes {
            return Err(EngineError::LimitExceeded("opening hours are empty"));
        }

        let event = Event::ResourceCreated {
            id,
            name: name.clone(),
            calendar_id: calendar_id.clone(),
            hours,
        };
        self.wal_append(&event).await?;
        let rs = ResourceState::new(id, name, calendar_id, hours);
        self.state.insert(id, Arc::new(RwLock::new(rs)));
        self.notify.send(id, &event);
        Ok(true)
    }

    /// Conflict check, quota read, pricing and WAL append as one step under
    /// the resource write lock. Concurrent callers on the same resource serialize here.
    pub async fn reserve(
        &self,
        draft: ReservationDraft,
        now: NaiveDateTime,
    ) -> Result<Reservation, EngineError> {
        validate_draft(&draft)?;
        let rs = self
            .get_resource(&draft.resource_id)
            .ok_or(EngineError::NotFound(draft.resource_id))?;
        let mut guard = rs.write().await;
        check_capacity(&guard, MAX_RESERVATIONS_PER_RESOURCE)?;
        if guard.get(&draft.id).is_some() || self.get_resource_for_reservation(&draft.id).is_some() {
            return Err(EngineError::AlreadyExists(draft.id));
        }

        let span = draft.span();
        check_no_conflict(&guard, &span)?;

        let used = self.free_minutes_used(&draft.payer_id, draft.date);
        let quote = pricing::price(&draft.tier, draft.duration_minutes, used);

        let reservation = Reservation {
            id: draft.id,
            resource_id: draft.resource_id,
            date: draft.date,
            start_time: draft.start_time,
            end_time: span.end.time(),
            duration_minutes: draft.duration_minutes,
            status: ReservationStatus::Reserved,
            payer_id: draft.payer_id,
            booker_id: draft.booker_id,
            tier: draft.tier,
            free_minutes_consumed: quote.free_minutes_applied,
            total_amount: quote.amount,
            payment_status: PaymentStatus::Pending,
            payment_handle: None,
            external_calendar_event_id: None,
            notes: draft.notes,
            created_at: now,
            cancelled_at: None,
            cancelled_by: None,
        };
        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(reservation.resource_id, &mut guard, &event)
            .await?;
        Ok(reservation)
    }

    /// Guarded single-event transition; returns the reservation after the change.
    async fn transition(
        &self,
        id: Ulid,
        action: &'static str,
        allowed: impl FnOnce(&Reservation) -> bool,
        make: impl FnOnce(Ulid) -> Event,
    ) -> Result<Reservation, EngineError> {
        let (resource_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let current = guard.get(&id).ok_or(EngineError::NotFound(id))?;
        if !allowed(current) {
            return Err(EngineError::InvalidTransition {
                id,
                from: current.status,
                action,
            });
        }
        let event = make(resource_id);
        self.persist_and_apply(resource_id, &mut guard, &event).await?;
        guard.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn attach_payment_intent(&self, id: Ulid, handle: String) -> Result<Reservation, EngineError> {
        if handle.is_empty() || handle.len() > MAX_ID_LEN {
            return Err(EngineError::LimitExceeded("payment handle length"));
        }
        self.transition(
            id,
            "attach payment to",
            |r| r.status == ReservationStatus::Reserved && r.payment_status == PaymentStatus::Pending,
            |resource_id| Event::PaymentIntentAttached { id, resource_id, handle },
        )
        .await
    }

    /// `Reserved`/`Pending` to `Confirmed`/`Paid`.
    pub async fn confirm(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.transition(
            id,
            "confirm",
            |r| r.status == ReservationStatus::Reserved && r.payment_status == PaymentStatus::Pending,
            |resource_id| Event::ReservationConfirmed { id, resource_id },
        )
        .await
    }

    /// Only a reservation that still holds the room may carry a calendar event.
    pub async fn link_calendar_event(&self, id: Ulid, external_id: String) -> Result<Reservation, EngineError> {
        if external_id.is_empty() || external_id.len() > MAX_ID_LEN {
            return Err(EngineError::LimitExceeded("external id length"));
        }
        self.transition(
            id,
            "link calendar event to",
            |r| matches!(r.status, ReservationStatus::Confirmed | ReservationStatus::InUse),
            |resource_id| Event::CalendarLinked { id, resource_id, external_id },
        )
        .await
    }

    pub async fn start(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.transition(
            id,
            "check in",
            |r| r.status == ReservationStatus::Confirmed,
            |resource_id| Event::ReservationStarted { id, resource_id },
        )
        .await
    }

    pub async fn check_out(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.transition(
            id,
            "check out",
            |r| r.status == ReservationStatus::InUse,
            |resource_id| Event::ReservationCompleted { id, resource_id },
        )
        .await
    }

    /// Close out a confirmed or in-use reservation whose time is over.
    pub async fn complete(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.transition(
            id,
            "complete",
            |r| matches!(r.status, ReservationStatus::Confirmed | ReservationStatus::InUse),
            |resource_id| Event::ReservationCompleted { id, resource_id },
        )
        .await
    }

    pub async fn cancel(&self, id: Ulid, at: NaiveDateTime, by: Actor) -> Result<Reservation, EngineError> {
        self.transition(
            id,
            "cancel",
            |r| matches!(r.status, ReservationStatus::Reserved | ReservationStatus::Confirmed),
            |resource_id| Event::ReservationCancelled { id, resource_id, at, by },
        )
        .await
    }

    /// `Cancelled`/`Pending` to `Cancelled`/`Paid`, for a charge that was
    /// captured while the cancel was being committed.
    pub async fn record_late_payment(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.transition(
            id,
            "record payment for",
            |r| r.status == ReservationStatus::Cancelled && r.payment_status == PaymentStatus::Pending,
            |resource_id| Event::PaymentCaptured { id, resource_id },
        )
        .await
    }

    pub async fn record_refund(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.transition(
            id,
            "refund",
            |r| r.status == ReservationStatus::Cancelled && r.payment_status == PaymentStatus::Paid,
            |resource_id| Event::RefundRecorded { id, resource_id },
        )
        .await
    }

    /// Free minutes the payer has consumed in the month containing `date`.
    pub fn free_minutes_used(&self, payer_id: &str, date: NaiveDate) -> Minutes {
        use chrono::Datelike;
        self.index
            .free_usage
            .get(&UsageKey::new(payer_id, (date.year(), date.month())))
            .map(|e| *e.value())
            .unwrap_or(0)
    }

    pub fn collect_due_transitions(&self, now: NaiveDateTime) -> Vec<(Ulid, DueTransition)> {
        let mut due = Vec::new();
        for entry in self.state.iter() {
            let rs = entry.value().clone();
            let Ok(guard) = rs.try_read() else { continue };
            for r in &guard.reservations {
                let span = r.span();
                match r.status {
                    ReservationStatus::Confirmed | ReservationStatus::InUse if span.end <= now => {
                        due.push((r.id, DueTransition::Complete));
                    }
                    ReservationStatus::Confirmed if span.start <= now => {
                        due.push((r.id, DueTransition::Start));
                    }
                    _ => {}
                }
            }
        }
        due
    }

    /// Unpaid non-member reservations created at or before `cutoff`.
    pub fn collect_stale_pending(&self, cutoff: NaiveDateTime) -> Vec<Ulid> {
        let mut stale = Vec::new();
        for entry in self.state.iter() {
            let rs = entry.value().clone();
            let Ok(guard) = rs.try_read() else { continue };
            stale.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| {
                        r.status == ReservationStatus::Reserved
                            && r.payment_status == PaymentStatus::Pending
                            && !r.tier.is_member()
                            && r.created_at <= cutoff
                    })
                    .map(|r| r.id),
            );
        }
        stale
    }

    /// Compact the WAL by rewriting it with one snapshot event per resource and reservation.
    /// Read guards stay held until the swap so no append can land between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let resources: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut guards = Vec::with_capacity(resources.len());
        for rs in resources {
            guards.push(rs.read_owned().await);
        }

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::ResourceCreated {
                id: guard.id,
                name: guard.name.clone(),
                calendar_id: guard.calendar_id.clone(),
                hours: guard.hours,
            });
            for r in &guard.reservations {
                events.push(Event::ReservationCreated { reservation: r.clone() });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(guards);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
