mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use availability::{free_spans, merge_overlapping, subtract_intervals};
pub use error::EngineError;
pub use mutations::{DueTransition, ReservationDraft};
pub use queries::ResourceInfo;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued,
/// then fsyncs once and answers every sender in the batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so half-written bytes don't leak into the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { response, .. } => {
            let _ = response.send(Err(io::Error::other("append routed outside a batch")));
        }
    }
}

/// Key of the free-quota ledger: one payer in one calendar month.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(super) struct UsageKey {
    payer: String,
    year: i32,
    month: u32,
}

impl UsageKey {
    pub(super) fn new(payer: &str, (year, month): (i32, u32)) -> Self {
        Self {
            payer: payer.to_string(),
            year,
            month,
        }
    }
}

/// Derived lookups rebuilt from events; never persisted on their own.
#[derive(Default)]
pub(super) struct Indexes {
    /// Reservation id to resource id.
    pub(super) reservation_to_resource: DashMap<Ulid, Ulid>,
    /// Free minutes consumed by non-cancelled reservations.
    pub(super) free_usage: DashMap<UsageKey, Minutes>,
}

impl Indexes {
    fn add_usage(&self, r: &Reservation) {
        if r.free_minutes_consumed == 0 || r.status == ReservationStatus::Cancelled {
            return;
        }
        *self
            .free_usage
            .entry(UsageKey::new(&r.payer_id, r.billing_month()))
            .or_insert(0) += r.free_minutes_consumed;
    }

    fn release_usage(&self, r: &Reservation) {
        if r.free_minutes_consumed == 0 {
            return;
        }
        if let Some(mut used) = self
            .free_usage
            .get_mut(&UsageKey::new(&r.payer_id, r.billing_month()))
        {
            *used = used.saturating_sub(r.free_minutes_consumed);
        }
    }
}

pub struct Engine {
    pub(super) state: DashMap<Ulid, SharedResourceState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) index: Indexes,
}

fn update(rs: &mut ResourceState, id: &Ulid, f: impl FnOnce(&mut Reservation)) {
    if let Some(r) = rs.get_mut(id) {
        f(r);
    }
}

/// Apply an event to a ResourceState (no locking; caller holds the lock).
fn apply_to_resource(rs: &mut ResourceState, event: &Event, index: &Indexes) {
    match event {
        Event::ReservationCreated { reservation } => {
            index
                .reservation_to_resource
                .insert(reservation.id, reservation.resource_id);
            index.add_usage(reservation);
            rs.insert_reservation(reservation.clone());
        }
        Event::PaymentIntentAttached { id, handle, .. } => {
            update(rs, id, |r| r.payment_handle = Some(handle.clone()));
        }
        Event::ReservationConfirmed { id, .. } => update(rs, id, |r| {
            r.status = ReservationStatus::Confirmed;
            r.payment_status = PaymentStatus::Paid;
        }),
        Event::CalendarLinked { id, external_id, .. } => {
            update(rs, id, |r| r.external_calendar_event_id = Some(external_id.clone()));
        }
        Event::ReservationStarted { id, .. } => update(rs, id, |r| r.status = ReservationStatus::InUse),
        Event::ReservationCompleted { id, .. } => {
            update(rs, id, |r| r.status = ReservationStatus::Completed);
        }
        Event::ReservationCancelled { id, at, by, .. } => update(rs, id, |r| {
            if r.status != ReservationStatus::Cancelled {
                index.release_usage(r);
            }
            r.status = ReservationStatus::Cancelled;
            r.cancelled_at = Some(*at);
            r.cancelled_by = Some(by.clone());
        }),
        Event::RefundRecorded { id, .. } => update(rs, id, |r| r.payment_status = PaymentStatus::Refunded),
        Event::PaymentCaptured { id, .. } => update(rs, id, |r| r.payment_status = PaymentStatus::Paid),
        // Handled at the DashMap level
        Event::ResourceCreated { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            index: Indexes::default(),
        };

        // Sole owner of these Arcs during replay: try_write never contends.
        // Never use blocking_write here, this runs inside the runtime.
        for event in &events {
            match event {
                Event::ResourceCreated { id, name, calendar_id, hours } => {
                    let rs = ResourceState::new(*id, name.clone(), calendar_id.clone(), *hours);
                    engine.state.insert(*id, Arc::new(RwLock::new(rs)));
                }
                other => {
                    let Some(rs) = engine.get_resource(&other.resource_id()) else {
                        tracing::warn!("replay: {} for unknown resource", other.label());
                        continue;
                    };
                    match rs.try_write() {
                        Ok(mut guard) => apply_to_resource(&mut guard, other, &engine.index),
                        Err(_) => tracing::warn!("replay: resource lock contended, skipping event"),
                    }
                }
            }
        }
        if !events.is_empty() {
            tracing::info!("replayed {} WAL events", events.len());
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_resource_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.index
            .reservation_to_resource
            .get(reservation_id)
            .map(|e| *e.value())
    }

    /// WAL-append, apply, notify. The store transition is durable before anyone sees it.
    pub(super) async fn persist_and_apply(
        &self,
        resource_id: Ulid,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_resource(rs, event, &self.index);
        self.notify.send(resource_id, event);
        Ok(())
    }

    /// Lookup reservation → resource, get resource, acquire write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<ResourceState>), EngineError> {
        let resource_id = self
            .get_resource_for_reservation(reservation_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.write_owned().await;
        Ok((resource_id, guard))
    }
}
