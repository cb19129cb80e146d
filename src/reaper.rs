use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDateTime, NaiveTime};
use tracing::{debug, info, warn};

use crate::cache::EventCache;
use crate::clock::Clock;
use crate::engine::{DueTransition, Engine, EngineError};
use crate::gateway::{bounded, CalendarGateway, GatewayError};
use crate::lifecycle::BookingService;
use crate::model::{Actor, Span};
use crate::observability::{CACHE_EVENTS, PENDING_RELEASED_TOTAL, SWEEPER_TRANSITIONS_TOTAL};

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Move reservations along with the clock: started ones to `InUse`, ended
/// ones to `Completed`. Returns how many transitions were applied.
pub async fn sweep_once(engine: &Engine, now: NaiveDateTime) -> usize {
    let mut applied = 0;
    for (id, step) in engine.collect_due_transitions(now) {
        let result = match step {
            DueTransition::Start => engine.start(id).await,
            DueTransition::Complete => engine.complete(id).await,
        };
        match result {
            Ok(r) => {
                applied += 1;
                metrics::counter!(SWEEPER_TRANSITIONS_TOTAL, "to" => r.status.as_str()).increment(1);
                debug!("sweeper moved {id} to {}", r.status);
            }
            // Cancelled or checked out since collection
            Err(e) => debug!("sweeper skip {id}: {e}"),
        }
    }
    applied
}

pub async fn run_sweeper(engine: Arc<Engine>, clock: Arc<dyn Clock>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let applied = sweep_once(&engine, clock.now()).await;
        if applied > 0 {
            info!("sweeper applied {applied} transitions");
        }
    }
}

/// Cancel unpaid non-member reservations created more than `ttl` before `now`.
pub async fn release_stale_once(service: &BookingService, now: NaiveDateTime, ttl: Duration) -> usize {
    let Some(cutoff) = chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_sub_signed(ttl))
    else {
        return 0;
    };
    let mut released = 0;
    for id in service.engine().collect_stale_pending(cutoff) {
        match service.cancel(id, Actor::System).await {
            Ok(_) => {
                released += 1;
                metrics::counter!(PENDING_RELEASED_TOTAL).increment(1);
                info!("released unpaid reservation {id}");
            }
            Err(e) => debug!("pending release skip {id}: {e}"),
        }
    }
    released
}

pub async fn run_pending_release(service: Arc<BookingService>, clock: Arc<dyn Clock>, ttl: Duration) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL.min(ttl));
    loop {
        interval.tick().await;
        release_stale_once(&service, clock.now(), ttl).await;
    }
}

/// Rewrite the WAL once more than `threshold` events were appended since the last compaction.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends <= threshold {
        return Ok(false);
    }
    engine.compact_wal().await?;
    info!("compacted WAL after {appends} appends");
    Ok(true)
}

pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&engine, threshold).await {
            warn!("WAL compaction failed: {e}");
        }
    }
}

/// Where and how far ahead the cache refresher looks.
pub struct RefreshTarget {
    pub calendar_id: String,
    pub horizon_days: u64,
    pub timeout: Duration,
}

/// Replace the cached events of one calendar from today's midnight to the horizon.
pub async fn refresh_cache_once(
    calendar: &dyn CalendarGateway,
    cache: &EventCache,
    target: &RefreshTarget,
    now: NaiveDateTime,
) -> Result<usize, GatewayError> {
    let from = now.date().and_time(NaiveTime::MIN);
    let Some(to) = from.checked_add_days(Days::new(target.horizon_days.max(1))) else {
        return Ok(0);
    };
    let window = Span::new(from, to);
    let events = bounded(
        target.timeout,
        "calendar.list_events",
        calendar.list_events(&target.calendar_id, &window),
    )
    .await?;
    let stored = cache.replace_window(&target.calendar_id, &window, events);
    metrics::gauge!(CACHE_EVENTS).set(cache.len() as f64);
    Ok(stored)
}

pub async fn run_cache_refresher(
    calendar: Arc<dyn CalendarGateway>,
    cache: Arc<EventCache>,
    clock: Arc<dyn Clock>,
    target: RefreshTarget,
    every: Duration,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match refresh_cache_once(calendar.as_ref(), &cache, &target, clock.now()).await {
            Ok(n) => debug!("cache refreshed: {n} events for {}", target.calendar_id),
            // Stale entries stay until the next successful refresh
            Err(e) => warn!("cache refresh failed: {e}"),
        }
    }
}
