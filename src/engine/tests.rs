use super::*;
use super::conflict::{check_capacity, check_no_conflict, validate_draft};
use crate::model::fixtures::*;
use chrono::{NaiveDate, NaiveTime};
use tokio_test::{assert_err, assert_ok};

const ROOM: Ulid = Ulid(42);

/// Helper to build a ResourceState with reservations for pure-function tests.
fn make_resource(reservations: Vec<Reservation>) -> ResourceState {
    let mut rs = ResourceState::new(ROOM, "Room".into(), "cal".into(), hours(9, 22));
    for r in reservations {
        rs.insert_reservation(r);
    }
    rs
}

fn d() -> NaiveDate {
    day(2030, 5, 6)
}

fn quota_tier() -> TierSnapshot {
    TierSnapshot {
        kind: TierKind::Quota,
        hourly_rate: 800,
        free_minutes_per_month: 240,
    }
}

fn draft(date: NaiveDate, start: NaiveTime, minutes: Minutes, payer: &str, tier: TierSnapshot) -> ReservationDraft {
    ReservationDraft {
        id: Ulid::new(),
        resource_id: ROOM,
        date,
        start_time: start,
        duration_minutes: minutes,
        payer_id: payer.into(),
        booker_id: format!("{payer}-booker"),
        tier,
        notes: None,
    }
}

// ── Pure conflict checks ─────────────────────────────────

#[test]
fn conflict_detects_overlap() {
    let existing = reservation(d(), hm(10, 0), 60);
    let existing_id = existing.id;
    let rs = make_resource(vec![existing]);

    let err = check_no_conflict(&rs, &Span::on(d(), hm(9, 30), 60)).unwrap_err();
    assert!(matches!(err, EngineError::Conflict(id) if id == existing_id));
    assert!(check_no_conflict(&rs, &Span::on(d(), hm(10, 30), 15)).is_err());
    assert!(check_no_conflict(&rs, &Span::on(d(), hm(9, 0), 180)).is_err());
}

#[test]
fn conflict_allows_back_to_back() {
    let rs = make_resource(vec![reservation(d(), hm(10, 0), 60)]);
    assert!(check_no_conflict(&rs, &Span::on(d(), hm(9, 0), 60)).is_ok());
    assert!(check_no_conflict(&rs, &Span::on(d(), hm(11, 0), 60)).is_ok());
}

#[test]
fn capacity_counts_only_blocking_reservations() {
    let mut history = Vec::new();
    for h in 9..14 {
        let mut r = reservation(d(), hm(h, 0), 60);
        r.status = if h % 2 == 0 { ReservationStatus::Cancelled } else { ReservationStatus::Completed };
        history.push(r);
    }
    history.push(reservation(d(), hm(15, 0), 60));
    let rs = make_resource(history);
    assert_eq!(rs.reservations.len(), 6);

    assert_ok!(check_capacity(&rs, 2));
    let err = check_capacity(&rs, 1).unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));
}

#[test]
fn conflict_ignores_non_blocking_statuses() {
    let mut cancelled = reservation(d(), hm(10, 0), 60);
    cancelled.status = ReservationStatus::Cancelled;
    let mut completed = reservation(d(), hm(12, 0), 60);
    completed.status = ReservationStatus::Completed;
    let rs = make_resource(vec![cancelled, completed]);
    assert!(check_no_conflict(&rs, &Span::on(d(), hm(10, 0), 180)).is_ok());
}

#[test]
fn conflict_sees_long_reservation_starting_earlier() {
    // overlapping() must not stop at the query start
    let rs = make_resource(vec![reservation(d(), hm(9, 0), 8 * 60), reservation(d(), hm(18, 0), 30)]);
    assert!(check_no_conflict(&rs, &Span::on(d(), hm(16, 0), 30)).is_err());
    assert!(check_no_conflict(&rs, &Span::on(d(), hm(17, 0), 60)).is_ok());
}

#[test]
fn validate_rejects_bad_drafts() {
    let ok = draft(d(), hm(9, 0), 60, "p", member_tier());
    assert!(validate_draft(&ok).is_ok());

    let mut zero = ok.clone();
    zero.duration_minutes = 0;
    assert!(validate_draft(&zero).is_err());

    let midnight = draft(d(), hm(23, 0), 120, "p", member_tier());
    assert!(matches!(
        validate_draft(&midnight),
        Err(EngineError::LimitExceeded("reservation crosses midnight"))
    ));

    let mut notes = ok.clone();
    notes.notes = Some("x".repeat(crate::limits::MAX_NOTES_LEN + 1));
    assert!(validate_draft(&notes).is_err());

    let mut no_payer = ok;
    no_payer.payer_id.clear();
    assert!(validate_draft(&no_payer).is_err());
}

// ── Async engine tests ───────────────────────────────────

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("roomhold_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

async fn engine_with_room(name: &str) -> (Engine, PathBuf) {
    let path = test_wal_path(name);
    let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
    assert!(engine
        .ensure_resource(ROOM, "Room".into(), "cal".into(), hours(9, 22))
        .await
        .unwrap());
    (engine, path)
}

#[tokio::test]
async fn ensure_resource_is_idempotent() {
    let (engine, _) = engine_with_room("ensure_resource.wal").await;
    assert!(!engine
        .ensure_resource(ROOM, "Other".into(), "cal".into(), hours(9, 22))
        .await
        .unwrap());
    let info = engine.resource_info(ROOM).await.unwrap();
    assert_eq!(info.name, "Room");
    assert_eq!(info.hours, hours(9, 22));
}

#[tokio::test]
async fn ensure_resource_rejects_empty_hours() {
    let path = test_wal_path("empty_hours.wal");
    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    let err = assert_err!(
        engine
            .ensure_resource(Ulid::new(), "Room".into(), "cal".into(), hours(18, 9))
            .await
    );
    assert!(matches!(err, EngineError::LimitExceeded(_)));
}

#[tokio::test]
async fn reserve_prices_and_stores() {
    let (engine, _) = engine_with_room("reserve_prices.wal").await;
    let r = assert_ok!(engine.reserve(draft(d(), hm(9, 0), 90, "p", member_tier()), at(d(), 7, 0)).await);

    assert_eq!(r.status, ReservationStatus::Reserved);
    assert_eq!(r.payment_status, PaymentStatus::Pending);
    assert_eq!(r.end_time, hm(10, 30));
    assert_eq!(r.total_amount, 1200);
    assert_eq!(r.created_at, at(d(), 7, 0));
    assert_eq!(engine.get_reservation(r.id).await.unwrap(), r);
    assert_eq!(engine.get_resource_for_reservation(&r.id), Some(ROOM));
}

#[tokio::test]
async fn reserve_rejects_overlap() {
    let (engine, _) = engine_with_room("reserve_overlap.wal").await;
    let existing = engine
        .reserve(draft(d(), hm(10, 0), 60, "a", member_tier()), at(d(), 7, 0))
        .await
        .unwrap();

    let err = assert_err!(
        engine
            .reserve(draft(d(), hm(9, 30), 60, "b", member_tier()), at(d(), 7, 0))
            .await
    );
    assert!(matches!(err, EngineError::Conflict(id) if id == existing.id));
    assert!(engine.reservations_for_payer("b").await.is_empty());

    // back-to-back on both sides
    assert_ok!(engine.reserve(draft(d(), hm(9, 0), 60, "b", member_tier()), at(d(), 7, 0)).await);
    assert_ok!(engine.reserve(draft(d(), hm(11, 0), 60, "b", member_tier()), at(d(), 7, 0)).await);
}

#[tokio::test]
async fn reserve_rejects_duplicate_id_and_unknown_resource() {
    let (engine, _) = engine_with_room("reserve_duplicate.wal").await;
    let first = draft(d(), hm(9, 0), 60, "p", member_tier());
    let mut again = first.clone();
    again.start_time = hm(14, 0);
    engine.reserve(first, at(d(), 7, 0)).await.unwrap();
    assert!(matches!(
        engine.reserve(again, at(d(), 7, 0)).await,
        Err(EngineError::AlreadyExists(_))
    ));

    let mut elsewhere = draft(d(), hm(9, 0), 60, "p", member_tier());
    elsewhere.resource_id = Ulid::new();
    assert!(matches!(
        engine.reserve(elsewhere, at(d(), 7, 0)).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn quota_sequence_within_a_month() {
    let (engine, _) = engine_with_room("quota_sequence.wal").await;
    let now = at(d(), 7, 0);

    let a = engine.reserve(draft(d(), hm(9, 0), 120, "acme", quota_tier()), now).await.unwrap();
    assert_eq!((a.free_minutes_consumed, a.total_amount), (120, 0));

    let b = engine
        .reserve(draft(d(), hm(12, 0), 90, "acme", quota_tier()), now)
        .await
        .unwrap();
    assert_eq!((b.free_minutes_consumed, b.total_amount), (90, 0));

    let c = engine
        .reserve(draft(d(), hm(15, 0), 60, "acme", quota_tier()), now)
        .await
        .unwrap();
    assert_eq!(c.free_minutes_consumed, 30);
    assert_eq!(c.total_amount, 400);
    assert_eq!(engine.free_minutes_used("acme", d()), 240);

    // A new month starts from zero
    let next_month = day(2030, 6, 3);
    assert_eq!(engine.free_minutes_used("acme", next_month), 0);
    let e = engine
        .reserve(draft(next_month, hm(9, 0), 60, "acme", quota_tier()), now)
        .await
        .unwrap();
    assert_eq!(e.free_minutes_consumed, 60);
}

#[tokio::test]
async fn cancel_frees_slot_and_quota() {
    let (engine, _) = engine_with_room("cancel_frees.wal").await;
    let now = at(d(), 7, 0);
    let r = engine
        .reserve(draft(d(), hm(10, 0), 120, "acme", quota_tier()), now)
        .await
        .unwrap();
    assert_eq!(engine.free_minutes_used("acme", d()), 120);

    let cancelled = engine.cancel(r.id, now, Actor::Member("acme".into())).await.unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);
    assert_eq!(cancelled.cancelled_at, Some(now));
    assert_eq!(engine.free_minutes_used("acme", d()), 0);

    assert_ok!(engine.reserve(draft(d(), hm(10, 0), 120, "other", member_tier()), now).await);
}

#[tokio::test]
async fn state_machine_guards() {
    let (engine, _) = engine_with_room("state_machine.wal").await;
    let now = at(d(), 7, 0);
    let r = engine.reserve(draft(d(), hm(9, 0), 60, "p", member_tier()), now).await.unwrap();

    // Only confirmed reservations can be checked in or linked
    assert_err!(engine.start(r.id).await);
    assert_err!(engine.link_calendar_event(r.id, "evt".into()).await);
    assert_err!(engine.record_refund(r.id).await);

    let confirmed = engine.confirm(r.id).await.unwrap();
    assert_eq!(confirmed.status, ReservationStatus::Confirmed);
    assert_eq!(confirmed.payment_status, PaymentStatus::Paid);
    assert!(matches!(
        engine.confirm(r.id).await,
        Err(EngineError::InvalidTransition {
            from: ReservationStatus::Confirmed,
            ..
        })
    ));

    let linked = engine.link_calendar_event(r.id, "evt-1".into()).await.unwrap();
    assert_eq!(linked.external_calendar_event_id.as_deref(), Some("evt-1"));

    assert_eq!(engine.start(r.id).await.unwrap().status, ReservationStatus::InUse);
    assert_err!(engine.cancel(r.id, now, Actor::System).await);
    assert_eq!(engine.check_out(r.id).await.unwrap().status, ReservationStatus::Completed);
    assert_err!(engine.complete(r.id).await);
    assert_err!(engine.cancel(r.id, now, Actor::System).await);
}

#[tokio::test]
async fn refund_only_after_paid_cancellation() {
    let (engine, _) = engine_with_room("refund.wal").await;
    let now = at(d(), 7, 0);
    let unpaid = engine.reserve(draft(d(), hm(9, 0), 60, "p", member_tier()), now).await.unwrap();
    engine.cancel(unpaid.id, now, Actor::System).await.unwrap();
    assert_err!(engine.record_refund(unpaid.id).await);

    let paid = engine.reserve(draft(d(), hm(11, 0), 60, "p", member_tier()), now).await.unwrap();
    engine.confirm(paid.id).await.unwrap();
    engine.cancel(paid.id, now, Actor::Admin("ops".into())).await.unwrap();
    let refunded = engine.record_refund(paid.id).await.unwrap();
    assert_eq!(refunded.payment_status, PaymentStatus::Refunded);
    assert_err!(engine.record_refund(paid.id).await);
}

#[tokio::test]
async fn payment_handle_is_attached_while_pending() {
    let (engine, _) = engine_with_room("payment_handle.wal").await;
    let now = at(d(), 7, 0);
    let r = engine
        .reserve(draft(d(), hm(9, 0), 60, "walk-in", TierSnapshot {
            kind: TierKind::NonMember,
            hourly_rate: 2000,
            free_minutes_per_month: 0,
        }), now)
        .await
        .unwrap();
    let r = engine.attach_payment_intent(r.id, "pi_1".into()).await.unwrap();
    assert_eq!(r.payment_handle.as_deref(), Some("pi_1"));
    engine.confirm(r.id).await.unwrap();
    assert_err!(engine.attach_payment_intent(r.id, "pi_2".into()).await);
}

#[tokio::test]
async fn engine_wal_replay() {
    let path = test_wal_path("replay.wal");
    let now = at(d(), 7, 0);
    let (confirmed_id, cancelled_id) = {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        engine
            .ensure_resource(ROOM, "Room".into(), "cal".into(), hours(9, 22))
            .await
            .unwrap();
        let a = engine.reserve(draft(d(), hm(9, 0), 120, "acme", quota_tier()), now).await.unwrap();
        engine.confirm(a.id).await.unwrap();
        engine.link_calendar_event(a.id, "evt-a".into()).await.unwrap();
        let b = engine.reserve(draft(d(), hm(14, 0), 60, "acme", quota_tier()), now).await.unwrap();
        engine.cancel(b.id, now, Actor::System).await.unwrap();
        (a.id, b.id)
    };

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    let a = engine.get_reservation(confirmed_id).await.unwrap();
    assert_eq!(a.status, ReservationStatus::Confirmed);
    assert_eq!(a.external_calendar_event_id.as_deref(), Some("evt-a"));
    let b = engine.get_reservation(cancelled_id).await.unwrap();
    assert_eq!(b.status, ReservationStatus::Cancelled);
    assert_eq!(b.cancelled_by, Some(Actor::System));

    // The quota ledger is rebuilt from history
    assert_eq!(engine.free_minutes_used("acme", d()), 120);
    // The replayed reservation still blocks its slot
    assert_err!(engine.reserve(draft(d(), hm(10, 0), 60, "x", member_tier()), now).await);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let now = at(d(), 7, 0);
    let ids = {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        engine
            .ensure_resource(ROOM, "Room".into(), "cal".into(), hours(9, 22))
            .await
            .unwrap();
        let mut ids = Vec::new();
        for h in [9, 11, 13] {
            let r = engine.reserve(draft(d(), hm(h, 0), 60, "acme", quota_tier()), now).await.unwrap();
            engine.confirm(r.id).await.unwrap();
            ids.push(r.id);
        }
        engine.cancel(ids[1], now, Actor::System).await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 8);

        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        // Appends after compaction land in the new file
        engine.start(ids[0]).await.unwrap();
        ids
    };

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    assert_eq!(engine.get_reservation(ids[0]).await.unwrap().status, ReservationStatus::InUse);
    assert_eq!(engine.get_reservation(ids[1]).await.unwrap().status, ReservationStatus::Cancelled);
    assert_eq!(engine.get_reservation(ids[2]).await.unwrap().status, ReservationStatus::Confirmed);
    assert_eq!(engine.free_minutes_used("acme", d()), 120);
}

#[tokio::test]
async fn concurrent_reserves_never_overlap() {
    let (engine, _) = engine_with_room("concurrent.wal").await;
    let engine = Arc::new(engine);
    let now = at(d(), 7, 0);

    // 60 contenders for 30-minute offsets of one-hour slots across the day
    let mut handles = Vec::new();
    for i in 0..60u32 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let start_minutes = 9 * 60 + (i % 24) * 30;
            let start = hm(start_minutes / 60, start_minutes % 60);
            engine
                .reserve(draft(d(), start, 60, &format!("p{i}"), member_tier()), now)
                .await
                .is_ok()
        }));
    }
    let mut won = 0;
    for h in handles {
        if h.await.unwrap() {
            won += 1;
        }
    }
    assert!(won > 0);

    let all = engine.reservations_between(ROOM, d(), d()).await.unwrap();
    assert_eq!(all.len(), won);
    for (i, a) in all.iter().enumerate() {
        for b in &all[i + 1..] {
            assert!(!a.span().overlaps(&b.span()), "{:?} overlaps {:?}", a.span(), b.span());
        }
    }
}

#[tokio::test]
async fn queries_by_range_and_payer() {
    let (engine, _) = engine_with_room("queries.wal").await;
    let now = at(d(), 7, 0);
    let tomorrow = day(2030, 5, 7);
    engine.reserve(draft(tomorrow, hm(9, 0), 60, "acme", member_tier()), now).await.unwrap();
    engine.reserve(draft(d(), hm(15, 0), 60, "acme", member_tier()), now).await.unwrap();
    engine.reserve(draft(d(), hm(9, 0), 60, "solo", member_tier()), now).await.unwrap();

    let acme = engine.reservations_for_payer("acme").await;
    assert_eq!(acme.len(), 2);
    assert_eq!(acme[0].date, d());
    assert_eq!(acme[1].date, tomorrow);

    assert_eq!(engine.reservations_between(ROOM, d(), d()).await.unwrap().len(), 2);
    assert_eq!(engine.reservations_between(ROOM, d(), tomorrow).await.unwrap().len(), 3);
    assert!(engine.reservations_between(ROOM, tomorrow, d()).await.unwrap().is_empty());
    assert_err!(engine.reservations_between(ROOM, d(), day(2032, 1, 1)).await);

    let window = Span::new(at(d(), 8, 0), at(d(), 12, 0));
    assert_eq!(engine.blocking_spans(ROOM, &window).await.unwrap(), vec![Span::on(d(), hm(9, 0), 60)]);
}

#[tokio::test]
async fn stale_pending_and_due_transitions() {
    let (engine, _) = engine_with_room("collectors.wal").await;
    let non_member = TierSnapshot {
        kind: TierKind::NonMember,
        hourly_rate: 2000,
        free_minutes_per_month: 0,
    };
    let old = engine.reserve(draft(d(), hm(9, 0), 60, "w", non_member), at(d(), 6, 0)).await.unwrap();
    engine.reserve(draft(d(), hm(11, 0), 60, "w", non_member), at(d(), 7, 30)).await.unwrap();
    let member = engine.reserve(draft(d(), hm(13, 0), 60, "m", member_tier()), at(d(), 6, 0)).await.unwrap();

    assert_eq!(engine.collect_stale_pending(at(d(), 7, 0)), vec![old.id]);

    engine.confirm(member.id).await.unwrap();
    assert!(engine.collect_due_transitions(at(d(), 12, 0)).is_empty());
    assert_eq!(
        engine.collect_due_transitions(at(d(), 13, 0)),
        vec![(member.id, DueTransition::Start)]
    );
    assert_eq!(
        engine.collect_due_transitions(at(d(), 14, 0)),
        vec![(member.id, DueTransition::Complete)]
    );
}

#[tokio::test]
async fn committed_events_are_broadcast() {
    let (engine, _) = engine_with_room("broadcast.wal").await;
    let mut rx = engine.notify.subscribe(ROOM);
    let r = engine
        .reserve(draft(d(), hm(9, 0), 60, "p", member_tier()), at(d(), 7, 0))
        .await
        .unwrap();
    engine.confirm(r.id).await.unwrap();

    match rx.recv().await.unwrap() {
        Event::ReservationCreated { reservation } => assert_eq!(reservation.id, r.id),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(
        rx.recv().await.unwrap(),
        Event::ReservationConfirmed { id: r.id, resource_id: ROOM }
    );
}
