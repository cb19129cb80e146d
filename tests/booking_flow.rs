use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use ulid::Ulid;

use roomhold::availability::{CacheSource, Layered, LiveSource};
use roomhold::cache::EventCache;
use roomhold::clock::FixedClock;
use roomhold::config::BookingPolicy;
use roomhold::engine::Engine;
use roomhold::gateway::{MemberTier, MemoryCalendar, MemoryPayments, StaticDirectory};
use roomhold::lifecycle::{BookingService, Collaborators};
use roomhold::model::{OpeningHours, TierKind};
use roomhold::notify::NotifyHub;
use roomhold::wire;

const ROOM: Ulid = Ulid(1);

// ── Test infrastructure ──────────────────────────────────────

struct TestServer {
    addr: SocketAddr,
    calendar: Arc<MemoryCalendar>,
    payments: Arc<MemoryPayments>,
}

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 5, 6).unwrap()
}

fn at(h: u32, m: u32) -> NaiveDateTime {
    date().and_hms_opt(h, m, 0).unwrap()
}

async fn start_test_server() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("roomhold_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("roomhold.wal"), Arc::new(NotifyHub::new())).unwrap());
    engine
        .ensure_resource(
            ROOM,
            "Meeting room".into(),
            "meeting-room".into(),
            OpeningHours {
                opens: at(9, 0).time(),
                closes: at(22, 0).time(),
            },
        )
        .await
        .unwrap();

    let calendar = Arc::new(MemoryCalendar::new());
    let payments = Arc::new(MemoryPayments::new());
    let directory = Arc::new(StaticDirectory::new());
    directory.insert(
        "acme",
        MemberTier {
            kind: TierKind::Standard,
            hourly_rate: 800,
            free_hours_per_month: 0,
        },
    );
    let cache = Arc::new(EventCache::new());
    let source = Layered::new(
        CacheSource::new(cache.clone()),
        LiveSource::new(calendar.clone(), Duration::from_millis(500)),
    );
    let service = Arc::new(BookingService::new(
        engine,
        cache,
        Arc::new(source),
        Collaborators {
            calendar: calendar.clone(),
            payments: payments.clone(),
            directory,
        },
        Arc::new(FixedClock::new(at(8, 0))),
        BookingPolicy {
            non_member_hourly_rate: 1000,
            gateway_timeout: Duration::from_millis(500),
            ..BookingPolicy::default()
        },
    ));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let service = service.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, service).await;
            });
        }
    });

    TestServer {
        addr,
        calendar,
        payments,
    }
}

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    notifications: Vec<Value>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let (read, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        Self {
            lines: BufReader::new(read).lines(),
            writer,
            notifications: Vec::new(),
        }
    }

    async fn send_raw(&mut self, line: &str) -> Value {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        loop {
            let value = self.read_line().await;
            if value.get("notification").is_some() {
                self.notifications.push(value);
                continue;
            }
            return value;
        }
    }

    async fn call(&mut self, request: Value) -> Value {
        self.send_raw(&request.to_string()).await
    }

    /// `data` of a successful response.
    async fn ok(&mut self, request: Value) -> Value {
        let response = self.call(request).await;
        assert_eq!(response["ok"], true, "unexpected failure: {response}");
        response["data"].clone()
    }

    /// `error.kind` of a failed response.
    async fn err(&mut self, request: Value) -> String {
        let response = self.call(request).await;
        assert_eq!(response["ok"], false, "unexpected success: {response}");
        response["error"]["kind"].as_str().unwrap().to_string()
    }

    async fn next_notification(&mut self) -> Value {
        if !self.notifications.is_empty() {
            return self.notifications.remove(0);
        }
        self.read_line().await
    }

    async fn read_line(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("timed out waiting for a line")
            .unwrap()
            .expect("server closed the connection");
        serde_json::from_str(&line).unwrap()
    }
}

fn booking(payer: &str, start: &str, minutes: u32) -> Value {
    json!({
        "op": "create_booking",
        "resource_id": ROOM,
        "date": "2030-05-06",
        "start_time": start,
        "duration_minutes": minutes,
        "payer_id": payer,
        "booker_id": payer,
    })
}

// ── Scenarios ────────────────────────────────────────────────

#[tokio::test]
async fn member_happy_path() {
    let server = start_test_server().await;
    let mut client = Client::connect(server.addr).await;

    let grid = client
        .ok(json!({"op": "weekly_grid", "resource_id": ROOM, "week_start": "2030-05-06", "min_duration_minutes": 90}))
        .await;
    let first = &grid["days"][0]["slots"][0];
    assert_eq!(first["time"], "09:00:00");
    assert_eq!(first["available"], true);

    let receipt = client.ok(booking("acme", "09:00:00", 90)).await;
    let reservation = &receipt["reservation"];
    assert_eq!(reservation["status"], "confirmed");
    assert_eq!(reservation["payment_status"], "paid");
    assert_eq!(reservation["end_time"], "10:30:00");
    assert_eq!(reservation["total_amount"], 1200);
    assert!(receipt.get("payment_intent").is_none());

    let external = reservation["external_calendar_event_id"].as_str().unwrap();
    assert!(server.calendar.get(external).is_some());

    let grid = client
        .ok(json!({"op": "weekly_grid", "resource_id": ROOM, "week_start": "2030-05-06", "min_duration_minutes": 90}))
        .await;
    let first = &grid["days"][0]["slots"][0];
    assert_eq!(first["available"], false);
    assert_eq!(first["reason"], "reserved");
}

#[tokio::test]
async fn overlapping_request_conflicts() {
    let server = start_test_server().await;
    let mut client = Client::connect(server.addr).await;

    client.ok(booking("acme", "10:00:00", 60)).await;
    assert_eq!(client.err(booking("walk-in", "09:30:00", 60)).await, "conflict");

    let listed = client
        .ok(json!({"op": "list_bookings_for_payer", "payer_id": "walk-in"}))
        .await;
    assert_eq!(listed.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn non_member_declined_payment() {
    let server = start_test_server().await;
    let mut client = Client::connect(server.addr).await;

    let receipt = client.ok(booking("walk-in", "14:00:00", 60)).await;
    let id = receipt["reservation"]["id"].as_str().unwrap().to_string();
    assert_eq!(receipt["reservation"]["status"], "reserved");
    assert_eq!(receipt["reservation"]["payment_status"], "pending");
    assert_eq!(receipt["reservation"]["total_amount"], 1000);
    let handle = receipt["payment_intent"]["confirmation_handle"]
        .as_str()
        .unwrap()
        .to_string();

    server.payments.decline(&handle);
    let kind = client
        .err(json!({"op": "confirm_payment", "id": id, "handle": handle}))
        .await;
    assert_eq!(kind, "payment_declined");

    let current = client.ok(json!({"op": "get_booking", "id": id})).await;
    assert_eq!(current["status"], "reserved");
    assert_eq!(current["payment_status"], "pending");
    assert!(server.calendar.is_empty());

    let cancelled = client
        .ok(json!({"op": "cancel_booking", "id": id, "actor": {"member": "walk-in"}}))
        .await;
    assert_eq!(cancelled["reservation"]["status"], "cancelled");
}

#[tokio::test]
async fn non_member_paid_booking() {
    let server = start_test_server().await;
    let mut client = Client::connect(server.addr).await;

    let receipt = client.ok(booking("walk-in", "16:00:00", 90)).await;
    let id = receipt["reservation"]["id"].as_str().unwrap().to_string();
    assert_eq!(receipt["reservation"]["total_amount"], 1500);
    let handle = receipt["payment_intent"]["confirmation_handle"].as_str().unwrap().to_string();

    let outcome = client
        .ok(json!({"op": "confirm_payment", "id": id, "handle": handle}))
        .await;
    assert_eq!(outcome["reservation"]["status"], "confirmed");
    assert_eq!(outcome["reservation"]["payment_status"], "paid");
    assert!(server.payments.is_captured(&handle));
    assert_eq!(server.calendar.len(), 1);
}

#[tokio::test]
async fn max_duration_stops_at_next_booking() {
    let server = start_test_server().await;
    let mut client = Client::connect(server.addr).await;

    client.ok(booking("acme", "15:00:00", 60)).await;
    let data = client
        .ok(json!({"op": "max_duration", "resource_id": ROOM, "date": "2030-05-06", "start_time": "13:00:00"}))
        .await;
    assert_eq!(data["max_duration_minutes"], 120);
}

// ── Surface behavior ─────────────────────────────────────────

#[tokio::test]
async fn external_events_block_slots() {
    let server = start_test_server().await;
    let mut client = Client::connect(server.addr).await;

    client
        .ok(json!({
            "op": "upsert_external_event",
            "external_id": "offsite-1",
            "calendar_id": "meeting-room",
            "summary": "Board offsite",
            "start": "2030-05-06T12:00:00",
            "end": "2030-05-06T13:00:00",
        }))
        .await;
    assert_eq!(client.err(booking("acme", "12:30:00", 60)).await, "conflict");

    let removed = client
        .ok(json!({"op": "remove_external_event", "external_id": "offsite-1"}))
        .await;
    assert_eq!(removed["removed"], true);
    client.ok(booking("acme", "12:30:00", 60)).await;
}

#[tokio::test]
async fn calendar_outage_fails_closed() {
    let server = start_test_server().await;
    let mut client = Client::connect(server.addr).await;
    server.calendar.set_failing(true);

    let grid = client
        .ok(json!({"op": "weekly_grid", "resource_id": ROOM, "week_start": "2030-05-06", "min_duration_minutes": 60}))
        .await;
    for day in grid["days"].as_array().unwrap() {
        for slot in day["slots"].as_array().unwrap() {
            assert_eq!(slot["available"], false);
            assert_eq!(slot["reason"], "unverified");
        }
    }
    assert_eq!(
        client.err(booking("acme", "09:00:00", 60)).await,
        "external_service_degraded"
    );
}

#[tokio::test]
async fn listen_receives_lifecycle_events() {
    let server = start_test_server().await;
    let mut watcher = Client::connect(server.addr).await;
    let mut booker = Client::connect(server.addr).await;

    watcher.ok(json!({"op": "listen", "resource_id": ROOM})).await;
    booker.ok(booking("acme", "11:00:00", 60)).await;

    let kinds: Vec<String> = {
        let mut kinds = Vec::new();
        for _ in 0..3 {
            let note = watcher.next_notification().await;
            assert_eq!(note["notification"]["resource_id"], json!(ROOM));
            kinds.push(note["notification"]["kind"].as_str().unwrap().to_string());
        }
        kinds
    };
    assert_eq!(kinds, ["reservation_created", "reservation_confirmed", "calendar_linked"]);

    let unlistened = watcher.ok(json!({"op": "unlisten", "resource_id": ROOM})).await;
    assert_eq!(unlistened["unlistened"], true);
    assert_eq!(
        watcher.err(json!({"op": "listen", "resource_id": Ulid::new()})).await,
        "not_found"
    );
}

#[tokio::test]
async fn malformed_requests_are_rejected() {
    let server = start_test_server().await;
    let mut client = Client::connect(server.addr).await;

    let response = client.send_raw("this is not json").await;
    assert_eq!(response["error"]["kind"], "bad_request");
    let response = client.send_raw(r#"{"op":"teleport"}"#).await;
    assert_eq!(response["error"]["kind"], "bad_request");

    assert_eq!(client.err(booking("acme", "09:15:00", 60)).await, "validation");
    assert_eq!(
        client.err(json!({"op": "get_booking", "id": Ulid::new()})).await,
        "not_found"
    );

    // The connection survives bad input
    client.ok(json!({"op": "list_bookings_for_payer", "payer_id": "acme"})).await;
}
