use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, NaiveTime};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use ulid::Ulid;

use crate::error::BookingError;
use crate::lifecycle::{BookingReceipt, BookingRequest, BookingService};
use crate::limits::MAX_LINE_LEN;
use crate::model::{Actor, Event, ExternalEvent, Minutes};
use crate::notify::NotifyHub;
use crate::observability::{request_label, REQUESTS_TOTAL, REQUEST_DURATION_SECONDS};

const NOTIFICATION_BUFFER: usize = 256;

/// One request line.
///
/// ```text
/// > {"op":"get_booking","id":"01J..."}
/// < {"ok":true,"data":{...}}
/// < {"ok":false,"error":{"kind":"not_found","message":"..."}}
/// < {"notification":{"resource_id":"01J...","kind":"reservation_confirmed","event":{...}}}
/// ```
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    WeeklyGrid {
        resource_id: Ulid,
        week_start: NaiveDate,
        min_duration_minutes: Minutes,
    },
    MaxDuration {
        resource_id: Ulid,
        date: NaiveDate,
        start_time: NaiveTime,
    },
    QuoteBooking(BookingRequest),
    CreateBooking(BookingRequest),
    BeginPayment {
        id: Ulid,
    },
    ConfirmPayment {
        id: Ulid,
        handle: String,
    },
    /// Admin and system actors are only accepted from loopback connections.
    CancelBooking {
        id: Ulid,
        actor: Actor,
    },
    ListBookingsForPayer {
        payer_id: String,
    },
    GetBooking {
        id: Ulid,
    },
    CheckIn {
        id: Ulid,
    },
    CheckOut {
        id: Ulid,
    },
    RecordRefund {
        id: Ulid,
    },
    /// Pushed by the calendar sync collaborator.
    UpsertExternalEvent(ExternalEvent),
    RemoveExternalEvent {
        external_id: String,
    },
    Listen {
        resource_id: Ulid,
    },
    Unlisten {
        resource_id: Ulid,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec: {0}")]
    Codec(#[from] LinesCodecError),
}

/// Per-connection LISTEN state: one forwarding task per subscribed resource.
struct Listeners {
    hub: Arc<NotifyHub>,
    tasks: HashMap<Ulid, JoinHandle<()>>,
    tx: mpsc::Sender<String>,
}

impl Listeners {
    fn listen(&mut self, resource_id: Ulid) {
        if self.tasks.contains_key(&resource_id) {
            return;
        }
        // Subscribe before replying so nothing committed after the ack is missed
        let mut rx = self.hub.subscribe(resource_id);
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            loop {
                let line = match rx.recv().await {
                    Ok(event) => notification_line(resource_id, &event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("listener on {resource_id} lagged, {skipped} events dropped");
                        json!({"notification": {"resource_id": resource_id, "kind": "lagged", "skipped": skipped}})
                            .to_string()
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
        self.tasks.insert(resource_id, task);
    }

    fn unlisten(&mut self, resource_id: &Ulid) -> bool {
        match self.tasks.remove(resource_id) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for Listeners {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

fn notification_line(resource_id: Ulid, event: &Event) -> String {
    json!({
        "notification": {
            "resource_id": resource_id,
            "kind": event.label(),
            "event": event,
        }
    })
    .to_string()
}

fn ok_line(data: Value) -> String {
    json!({"ok": true, "data": data}).to_string()
}

fn error_line(kind: &str, message: String) -> String {
    json!({"ok": false, "error": {"kind": kind, "message": message}}).to_string()
}

fn to_value<T: serde::Serialize>(data: T) -> Result<Value, BookingError> {
    serde_json::to_value(data).map_err(|e| BookingError::Storage(format!("encoding response: {e}")))
}

/// Remote peers may only cancel as members.
fn authorize_actor(actor: &Actor, local_peer: bool) -> Result<(), BookingError> {
    match actor {
        Actor::Member(_) => Ok(()),
        Actor::Admin(_) | Actor::System if local_peer => Ok(()),
        Actor::Admin(who) => Err(BookingError::Forbidden(format!(
            "admin {who} may only cancel from a local connection"
        ))),
        Actor::System => Err(BookingError::Forbidden(
            "system cancels are not accepted from remote connections".into(),
        )),
    }
}

async fn execute(
    req: Request,
    service: &BookingService,
    listeners: &mut Listeners,
    local_peer: bool,
) -> Result<Value, BookingError> {
    match req {
        Request::WeeklyGrid {
            resource_id,
            week_start,
            min_duration_minutes,
        } => to_value(
            service
                .weekly_grid(resource_id, week_start, min_duration_minutes)
                .await?,
        ),
        Request::MaxDuration {
            resource_id,
            date,
            start_time,
        } => {
            let minutes = service.max_duration(resource_id, date, start_time).await?;
            Ok(json!({ "max_duration_minutes": minutes }))
        }
        Request::QuoteBooking(req) => to_value(service.quote_booking(&req).await?),
        Request::CreateBooking(req) => {
            let receipt: BookingReceipt = service.create_booking(req).await?;
            to_value(receipt)
        }
        Request::BeginPayment { id } => {
            let (reservation, intent) = service.begin_payment(id).await?;
            Ok(json!({ "reservation": to_value(reservation)?, "payment_intent": to_value(intent)? }))
        }
        Request::ConfirmPayment { id, handle } => to_value(service.pay_and_finalize(id, &handle).await?),
        Request::CancelBooking { id, actor } => {
            authorize_actor(&actor, local_peer)?;
            to_value(service.cancel(id, actor).await?)
        }
        Request::ListBookingsForPayer { payer_id } => {
            to_value(service.list_bookings_for_payer(&payer_id).await)
        }
        Request::GetBooking { id } => to_value(service.get_booking(id).await?),
        Request::CheckIn { id } => to_value(service.check_in(id).await?),
        Request::CheckOut { id } => to_value(service.check_out(id).await?),
        Request::RecordRefund { id } => to_value(service.record_refund(id).await?),
        Request::UpsertExternalEvent(event) => {
            let external_id = event.external_id.clone();
            service
                .cache()
                .upsert(event)
                .map_err(|e| BookingError::Validation(e.to_string()))?;
            Ok(json!({ "external_id": external_id }))
        }
        Request::RemoveExternalEvent { external_id } => {
            let removed = service.cache().remove(&external_id).is_some();
            Ok(json!({ "removed": removed }))
        }
        Request::Listen { resource_id } => {
            if service.engine().get_resource(&resource_id).is_none() {
                return Err(BookingError::NotFound(format!("resource {resource_id}")));
            }
            listeners.listen(resource_id);
            Ok(json!({ "listening": resource_id }))
        }
        Request::Unlisten { resource_id } => Ok(json!({ "unlistened": listeners.unlisten(&resource_id) })),
    }
}

async fn handle_line(
    line: &str,
    service: &BookingService,
    listeners: &mut Listeners,
    local_peer: bool,
) -> String {
    let req = match serde_json::from_str::<Request>(line) {
        Ok(req) => req,
        Err(e) => {
            metrics::counter!(REQUESTS_TOTAL, "op" => "unknown", "status" => "bad_request").increment(1);
            return error_line("bad_request", e.to_string());
        }
    };
    let op = request_label(&req);
    let started = Instant::now();
    let result = execute(req, service, listeners, local_peer).await;
    metrics::histogram!(REQUEST_DURATION_SECONDS, "op" => op).record(started.elapsed().as_secs_f64());

    match result {
        Ok(data) => {
            metrics::counter!(REQUESTS_TOTAL, "op" => op, "status" => "ok").increment(1);
            ok_line(data)
        }
        Err(e) => {
            let kind = e.kind();
            metrics::counter!(REQUESTS_TOTAL, "op" => op, "status" => kind).increment(1);
            if matches!(e, BookingError::Storage(_)) {
                tracing::error!("{op} failed: {e}");
            } else {
                tracing::debug!("{op} rejected: {e}");
            }
            error_line(kind, e.to_string())
        }
    }
}

/// Serve one client until it disconnects.
pub async fn process_connection(socket: TcpStream, service: Arc<BookingService>) -> Result<(), WireError> {
    let local_peer = socket.peer_addr()?.ip().is_loopback();
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (tx, mut notifications) = mpsc::channel(NOTIFICATION_BUFFER);
    let mut listeners = Listeners {
        hub: service.engine().notify.clone(),
        tasks: HashMap::new(),
        tx,
    };

    loop {
        tokio::select! {
            incoming = framed.next() => {
                let line = match incoming {
                    None => break,
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        framed.send(error_line("bad_request", format!("line exceeds {MAX_LINE_LEN} bytes"))).await?;
                        continue;
                    }
                    Some(Err(e)) => return Err(e.into()),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = handle_line(&line, &service, &mut listeners, local_peer).await;
                framed.send(response).await?;
            }
            Some(note) = notifications.recv() => {
                framed.send(note).await?;
            }
        }
    }
    Ok(())
}
