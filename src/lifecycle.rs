use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::availability::{AvailabilityChecker, BusySource, SlotReason, WeeklyGrid};
use crate::cache::EventCache;
use crate::clock::Clock;
use crate::config::BookingPolicy;
use crate::engine::{Engine, EngineError, ReservationDraft, ResourceInfo};
use crate::error::BookingError;
use crate::gateway::{bounded, CalendarGateway, MembershipDirectory, PaymentGateway, PaymentIntent};
use crate::limits::MAX_NOTES_LEN;
use crate::model::*;
use crate::observability::*;
use crate::pricing::{self, Quote};

#[derive(Debug, Clone, Deserialize)]
pub struct BookingRequest {
    pub resource_id: Ulid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub duration_minutes: Minutes,
    pub payer_id: String,
    pub booker_id: String,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Side effects that did not happen. The reservation itself is unaffected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    CalendarEventNotCreated { reason: String },
    /// The reservation was cancelled before the new event could be linked, so the event was removed.
    CalendarEventDiscarded { external_id: String },
    CalendarEventNotDeleted { external_id: String, reason: String },
    PaymentIntentUnavailable { reason: String },
    /// The reservation was cancelled while its payment was confirmed. The
    /// charge is recorded on the cancelled reservation and awaits a refund.
    PaymentCapturedAfterCancel { amount: u64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct BookingQuote {
    pub tier: TierKind,
    pub hourly_rate: u64,
    pub month_free_minutes_used: Minutes,
    #[serde(flatten)]
    pub quote: Quote,
}

#[derive(Debug, Clone, Serialize)]
pub struct BookingOutcome {
    pub reservation: Reservation,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<Warning>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BookingReceipt {
    pub reservation: Reservation,
    /// Present for non-members; the client confirms payment with its handle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_intent: Option<PaymentIntent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<Warning>,
}

pub struct Collaborators {
    pub calendar: Arc<dyn CalendarGateway>,
    pub payments: Arc<dyn PaymentGateway>,
    pub directory: Arc<dyn MembershipDirectory>,
}

/// Store transitions are durable before any gateway is called. Gateway
/// failures after that point never roll the store back; they come back to
/// the caller as [`Warning`]s.
pub struct BookingService {
    engine: Arc<Engine>,
    cache: Arc<EventCache>,
    checker: AvailabilityChecker,
    calendar: Arc<dyn CalendarGateway>,
    payments: Arc<dyn PaymentGateway>,
    directory: Arc<dyn MembershipDirectory>,
    clock: Arc<dyn Clock>,
    policy: BookingPolicy,
}

impl BookingService {
    pub fn new(
        engine: Arc<Engine>,
        cache: Arc<EventCache>,
        source: Arc<dyn BusySource>,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
        policy: BookingPolicy,
    ) -> Self {
        let checker = AvailabilityChecker::new(engine.clone(), source, clock.clone());
        Self {
            engine,
            cache,
            checker,
            calendar: collaborators.calendar,
            payments: collaborators.payments,
            directory: collaborators.directory,
            clock,
            policy,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn cache(&self) -> &Arc<EventCache> {
        &self.cache
    }

    pub fn policy(&self) -> &BookingPolicy {
        &self.policy
    }

    // ── Availability ───────────────────────────────────────────────

    pub async fn weekly_grid(
        &self,
        resource_id: Ulid,
        week_start: NaiveDate,
        min_minutes: Minutes,
    ) -> Result<WeeklyGrid, BookingError> {
        if min_minutes > self.policy.max_duration_minutes {
            return Err(BookingError::Validation(format!(
                "minimum duration exceeds the {} minute maximum",
                self.policy.max_duration_minutes
            )));
        }
        self.checker.weekly_grid(resource_id, week_start, min_minutes).await
    }

    /// Capped at the policy's maximum booking length.
    pub async fn max_duration(&self, resource_id: Ulid, date: NaiveDate, start: NaiveTime) -> Result<Minutes, BookingError> {
        let free = self.checker.max_contiguous_duration(resource_id, date, start).await?;
        Ok(free.min(self.policy.max_duration_minutes))
    }

    // ── Booking ────────────────────────────────────────────────────

    async fn resource(&self, resource_id: Ulid) -> Result<ResourceInfo, BookingError> {
        self.engine
            .resource_info(resource_id)
            .await
            .ok_or_else(|| BookingError::NotFound(format!("resource {resource_id}")))
    }

    fn validate(&self, req: &BookingRequest, info: &ResourceInfo, now: NaiveDateTime) -> Result<Span, BookingError> {
        let p = &self.policy;
        let invalid = |msg: String| Err(BookingError::Validation(msg));

        if req.payer_id.trim().is_empty() || req.booker_id.trim().is_empty() {
            return invalid("payer and booker are required".into());
        }
        if req.duration_minutes == 0 || req.duration_minutes % p.slot_minutes != 0 {
            return invalid(format!("duration must be a positive multiple of {} minutes", p.slot_minutes));
        }
        if req.duration_minutes < p.min_duration_minutes || req.duration_minutes > p.max_duration_minutes {
            return invalid(format!(
                "duration must be between {} and {} minutes",
                p.min_duration_minutes, p.max_duration_minutes
            ));
        }
        let minute_of_day = req.start_time.num_seconds_from_midnight() / 60;
        if req.start_time.second() != 0 || req.start_time.nanosecond() != 0 || minute_of_day % p.slot_minutes != 0 {
            return invalid(format!("start time must fall on the {}-minute grid", p.slot_minutes));
        }
        if let Some(notes) = &req.notes
            && notes.len() > MAX_NOTES_LEN
        {
            return invalid(format!("notes exceed {MAX_NOTES_LEN} bytes"));
        }

        let span = Span::on(req.date, req.start_time, req.duration_minutes);
        if span.start < now {
            return invalid("start time is in the past".into());
        }
        if (req.date - now.date()).num_days() > p.max_lead_days {
            return invalid(format!("bookings open at most {} days ahead", p.max_lead_days));
        }
        if !info.hours.span_on(req.date).contains_span(&span) {
            return invalid(format!(
                "booking must lie within opening hours {}-{}",
                info.hours.opens.format("%H:%M"),
                info.hours.closes.format("%H:%M")
            ));
        }
        Ok(span)
    }

    async fn resolve_tier(&self, payer_id: &str) -> Result<TierSnapshot, BookingError> {
        let found = bounded(
            self.policy.gateway_timeout,
            "directory.get_active_tier",
            self.directory.get_active_tier(payer_id),
        )
        .await
        .map_err(|e| BookingError::degraded("membership directory", e))?;
        Ok(match found {
            Some(tier) if tier.kind != TierKind::NonMember => tier.snapshot(),
            _ => TierSnapshot {
                kind: TierKind::NonMember,
                hourly_rate: self.policy.non_member_hourly_rate,
                free_minutes_per_month: 0,
            },
        })
    }

    /// Price a request without reserving anything.
    pub async fn quote_booking(&self, req: &BookingRequest) -> Result<BookingQuote, BookingError> {
        let info = self.resource(req.resource_id).await?;
        self.validate(req, &info, self.clock.now())?;
        let tier = self.resolve_tier(&req.payer_id).await?;
        let used = self.engine.free_minutes_used(&req.payer_id, req.date);
        Ok(BookingQuote {
            tier: tier.kind,
            hourly_rate: tier.hourly_rate,
            month_free_minutes_used: used,
            quote: pricing::price(&tier, req.duration_minutes, used),
        })
    }

    /// Validate, check external availability, then reserve atomically.
    /// The new reservation is `Reserved`/`Pending`.
    pub async fn create(&self, req: BookingRequest) -> Result<Reservation, BookingError> {
        let now = self.clock.now();
        let info = self.resource(req.resource_id).await?;
        let span = self.validate(&req, &info, now)?;
        let tier = self.resolve_tier(&req.payer_id).await?;

        match self.checker.blocking_reason(req.resource_id, &span).await? {
            None => {}
            Some(SlotReason::Unverified) => {
                return Err(BookingError::ExternalServiceDegraded {
                    service: "calendar",
                    reason: "availability could not be verified".into(),
                });
            }
            Some(SlotReason::ExternalEvent) => {
                metrics::counter!(BOOKING_CONFLICTS_TOTAL, "source" => "calendar").increment(1);
                return Err(BookingError::Conflict("overlaps an external calendar event".into()));
            }
            Some(_) => {
                metrics::counter!(BOOKING_CONFLICTS_TOTAL, "source" => "store").increment(1);
                return Err(BookingError::Conflict("overlaps an existing reservation".into()));
            }
        }

        let draft = ReservationDraft {
            id: Ulid::new(),
            resource_id: req.resource_id,
            date: req.date,
            start_time: req.start_time,
            duration_minutes: req.duration_minutes,
            payer_id: req.payer_id,
            booker_id: req.booker_id,
            tier,
            notes: req.notes.filter(|n| !n.trim().is_empty()),
        };
        let reservation = match self.engine.reserve(draft, now).await {
            Ok(r) => r,
            Err(e @ EngineError::Conflict(_)) => {
                metrics::counter!(BOOKING_CONFLICTS_TOTAL, "source" => "store").increment(1);
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };
        metrics::counter!(BOOKINGS_CREATED_TOTAL, "tier" => tier_label(tier.kind)).increment(1);
        tracing::info!(
            id = %reservation.id,
            payer = %reservation.payer_id,
            start = %span.start,
            hours = reservation.duration_hours(),
            amount = reservation.total_amount,
            "reservation created"
        );
        Ok(reservation)
    }

    /// `create`, then the next step for the payer's tier: members are
    /// finalized on the spot, non-members get a payment intent.
    pub async fn create_booking(&self, req: BookingRequest) -> Result<BookingReceipt, BookingError> {
        let reservation = self.create(req).await?;
        let id = reservation.id;

        if reservation.tier.is_member() || reservation.total_amount == 0 {
            let outcome = self.confirm_and_publish(id).await?;
            return Ok(BookingReceipt {
                reservation: outcome.reservation,
                payment_intent: None,
                warnings: outcome.warnings,
            });
        }

        match self.begin_payment(id).await {
            Ok((reservation, intent)) => Ok(BookingReceipt {
                reservation,
                payment_intent: Some(intent),
                warnings: Vec::new(),
            }),
            Err(BookingError::ExternalServiceDegraded { reason, .. }) => Ok(BookingReceipt {
                reservation,
                payment_intent: None,
                warnings: vec![Warning::PaymentIntentUnavailable { reason }],
            }),
            Err(e) => Err(e),
        }
    }

    /// Members only: `Reserved`/`Pending` to `Confirmed`/`Paid`, then the calendar event.
    pub async fn finalize_member_booking(&self, id: Ulid) -> Result<BookingOutcome, BookingError> {
        let current = self.engine.get_reservation(id).await?;
        if !current.tier.is_member() {
            return Err(BookingError::Validation(format!("reservation {id} must be paid before it is confirmed")));
        }
        self.confirm_and_publish(id).await
    }

    async fn confirm_and_publish(&self, id: Ulid) -> Result<BookingOutcome, BookingError> {
        let confirmed = self.engine.confirm(id).await?;
        metrics::counter!(BOOKINGS_CONFIRMED_TOTAL, "tier" => tier_label(confirmed.tier.kind)).increment(1);
        tracing::info!(%id, "reservation confirmed");
        Ok(self.publish_calendar_event(confirmed).await)
    }

    /// Create and link the calendar event for a confirmed reservation.
    /// Failures become warnings; the reservation stays confirmed.
    async fn publish_calendar_event(&self, reservation: Reservation) -> BookingOutcome {
        let id = reservation.id;
        let Some(info) = self.engine.resource_info(reservation.resource_id).await else {
            return BookingOutcome { reservation, warnings: Vec::new() };
        };
        let title = format!("{} ({})", info.name, reservation.booker_id);
        let created = bounded(
            self.policy.gateway_timeout,
            "calendar.create_event",
            self.calendar.create_event(
                &info.calendar_id,
                &reservation.span(),
                &title,
                reservation.notes.as_deref(),
            ),
        )
        .await;

        let external_id = match created {
            Ok(external_id) => external_id,
            Err(e) => {
                metrics::counter!(CALENDAR_SYNC_FAILURES_TOTAL, "op" => "create").increment(1);
                tracing::warn!(%id, "calendar event not created: {e}");
                return BookingOutcome {
                    reservation,
                    warnings: vec![Warning::CalendarEventNotCreated { reason: e.to_string() }],
                };
            }
        };

        match self.engine.link_calendar_event(id, external_id.clone()).await {
            Ok(linked) => BookingOutcome {
                reservation: linked,
                warnings: Vec::new(),
            },
            Err(e) => {
                // No calendar event may outlive its reservation
                tracing::warn!(%id, external_id, "discarding calendar event: {e}");
                let mut warnings = vec![Warning::CalendarEventDiscarded {
                    external_id: external_id.clone(),
                }];
                if let Some(w) = self.delete_calendar_event(&info.calendar_id, &external_id).await {
                    warnings.push(w);
                }
                let reservation = self.engine.get_reservation(id).await.unwrap_or(reservation);
                BookingOutcome { reservation, warnings }
            }
        }
    }

    async fn delete_calendar_event(&self, calendar_id: &str, external_id: &str) -> Option<Warning> {
        let deleted = bounded(
            self.policy.gateway_timeout,
            "calendar.delete_event",
            self.calendar.delete_event(calendar_id, external_id),
        )
        .await;
        self.cache.remove(external_id);
        match deleted {
            Ok(()) => None,
            Err(e) => {
                metrics::counter!(CALENDAR_SYNC_FAILURES_TOTAL, "op" => "delete").increment(1);
                tracing::warn!(external_id, "calendar event not deleted: {e}");
                Some(Warning::CalendarEventNotDeleted {
                    external_id: external_id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    // ── Payment ────────────────────────────────────────────────────

    /// Create a payment intent for an unpaid reservation and remember its
    /// handle. Calling again replaces the handle.
    pub async fn begin_payment(&self, id: Ulid) -> Result<(Reservation, PaymentIntent), BookingError> {
        let current = self.engine.get_reservation(id).await?;
        if current.status != ReservationStatus::Reserved || current.payment_status != PaymentStatus::Pending {
            return Err(BookingError::InvalidStateTransition {
                id,
                from: current.status,
                action: "start payment for",
            });
        }
        let intent = bounded(
            self.policy.gateway_timeout,
            "payment.create_intent",
            self.payments
                .create_payment_intent(current.total_amount, &current.payer_id),
        )
        .await
        .map_err(|e| {
            tracing::warn!(%id, "payment intent not created: {e}");
            BookingError::degraded("payment", e)
        })?;
        let reservation = self
            .engine
            .attach_payment_intent(id, intent.confirmation_handle.clone())
            .await?;
        Ok((reservation, intent))
    }

    /// Confirm the payment and finalize. A declined or failed payment leaves
    /// the reservation `Reserved`/`Pending`.
    pub async fn pay_and_finalize(&self, id: Ulid, handle: &str) -> Result<BookingOutcome, BookingError> {
        let current = self.engine.get_reservation(id).await?;
        if current.status != ReservationStatus::Reserved || current.payment_status != PaymentStatus::Pending {
            return Err(BookingError::InvalidStateTransition {
                id,
                from: current.status,
                action: "confirm payment for",
            });
        }
        if current.payment_handle.as_deref() != Some(handle) {
            return Err(BookingError::Validation("payment handle does not match the reservation".into()));
        }

        let confirmation = bounded(self.policy.gateway_timeout, "payment.confirm", self.payments.confirm(handle))
            .await
            .map_err(|e| {
                tracing::warn!(%id, "payment confirmation failed: {e}");
                BookingError::degraded("payment", e)
            })?;
        if !confirmation.succeeded {
            metrics::counter!(PAYMENTS_DECLINED_TOTAL).increment(1);
            tracing::info!(%id, "payment declined");
            return Err(BookingError::PaymentDeclined(id));
        }

        match self.confirm_and_publish(id).await {
            Ok(outcome) => Ok(outcome),
            Err(BookingError::InvalidStateTransition {
                from: ReservationStatus::Cancelled,
                ..
            }) => {
                let reservation = self.engine.record_late_payment(id).await.map_err(|e| {
                    tracing::error!(%id, handle, "payment captured but not recorded: {e}");
                    BookingError::from(e)
                })?;
                tracing::warn!(%id, amount = reservation.total_amount, "payment captured after cancellation, refund due");
                let warnings = vec![Warning::PaymentCapturedAfterCancel {
                    amount: reservation.total_amount,
                }];
                Ok(BookingOutcome { reservation, warnings })
            }
            Err(e) => {
                tracing::error!(%id, handle, "payment captured but reservation not confirmed: {e}");
                Err(e)
            }
        }
    }

    // ── Cancellation and use ───────────────────────────────────────

    pub async fn cancel(&self, id: Ulid, actor: Actor) -> Result<BookingOutcome, BookingError> {
        let current = self.engine.get_reservation(id).await?;
        if let Actor::Member(member) = &actor
            && *member != current.booker_id
            && *member != current.payer_id
        {
            return Err(BookingError::Forbidden(format!("{member} may not cancel reservation {id}")));
        }

        let cancelled = self.engine.cancel(id, self.clock.now(), actor).await?;
        metrics::counter!(BOOKINGS_CANCELLED_TOTAL).increment(1);
        tracing::info!(%id, by = ?cancelled.cancelled_by, "reservation cancelled");

        let mut warnings = Vec::new();
        if let Some(external_id) = &cancelled.external_calendar_event_id
            && let Some(info) = self.engine.resource_info(cancelled.resource_id).await
            && let Some(w) = self.delete_calendar_event(&info.calendar_id, external_id).await
        {
            warnings.push(w);
        }
        Ok(BookingOutcome {
            reservation: cancelled,
            warnings,
        })
    }

    /// `Confirmed` to `InUse`. Only while the reservation's time has not ended.
    pub async fn check_in(&self, id: Ulid) -> Result<Reservation, BookingError> {
        let current = self.engine.get_reservation(id).await?;
        if self.clock.now() >= current.span().end {
            return Err(BookingError::Validation(format!("reservation {id} has already ended")));
        }
        Ok(self.engine.start(id).await?)
    }

    pub async fn check_out(&self, id: Ulid) -> Result<Reservation, BookingError> {
        Ok(self.engine.check_out(id).await?)
    }

    pub async fn record_refund(&self, id: Ulid) -> Result<Reservation, BookingError> {
        let refunded = self.engine.record_refund(id).await?;
        tracing::info!(%id, amount = refunded.total_amount, "refund recorded");
        Ok(refunded)
    }

    // ── Queries ────────────────────────────────────────────────────

    pub async fn get_booking(&self, id: Ulid) -> Result<Reservation, BookingError> {
        Ok(self.engine.get_reservation(id).await?)
    }

    pub async fn list_bookings_for_payer(&self, payer_id: &str) -> Vec<Reservation> {
        self.engine.reservations_for_payer(payer_id).await
    }
}

fn tier_label(kind: TierKind) -> &'static str {
    match kind {
        TierKind::NonMember => "non_member",
        TierKind::Standard => "standard",
        TierKind::Quota => "quota",
    }
}
