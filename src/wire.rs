use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::FixedOffset;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use ulid::Ulid;

use crate::auth::{Role, TokenTable};
use crate::engine::{Engine, EngineError};
use crate::export::{bookings_csv, export_filename};
use crate::labels::Labels;
use crate::limits::{MAX_LINE_LEN, MAX_LISTEN_CHANNELS};
use crate::model::{BookingFilter, RealtimeEvent};
use crate::observability::{
    op_label, AUTH_FAILURES_TOTAL, BROADCAST_LAGGED_TOTAL, REQUESTS_TOTAL,
    REQUEST_DURATION_SECONDS,
};
use crate::protocol::{optional_window, parse_line, window, ProtocolError, Request, Response};

/// Everything a connection needs, shared by all connections.
pub struct AppContext {
    pub engine: Arc<Engine>,
    pub tokens: TokenTable,
    pub labels: Arc<Labels>,
    pub display_offset: FixedOffset,
}

/// Per-connection state. A listen key of `None` is the all-bays feed.
struct Session {
    role: Option<Role>,
    listeners: HashMap<Option<Ulid>, JoinHandle<()>>,
    events: mpsc::Sender<RealtimeEvent>,
}

impl Session {
    fn actor(&self) -> Option<&'static str> {
        self.role.map(Role::as_str)
    }

    fn unlisten(&mut self, key: Option<Ulid>) -> bool {
        match self.listeners.remove(&key) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for (_, task) in self.listeners.drain() {
            task.abort();
        }
    }
}

#[derive(Serialize)]
struct EventLine<'a> {
    event: &'a RealtimeEvent,
}

/// Forward one broadcast receiver into the connection's event queue.
async fn forward(mut rx: broadcast::Receiver<RealtimeEvent>, tx: mpsc::Sender<RealtimeEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Err(RecvError::Lagged(missed)) => {
                metrics::counter!(BROADCAST_LAGGED_TOTAL).increment(missed);
                tracing::debug!(missed, "listener lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Serve one client until it disconnects.
pub async fn process_connection<S>(socket: S, ctx: Arc<AppContext>) -> Result<(), LinesCodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (events_tx, mut events_rx) = mpsc::channel(crate::notify::CHANNEL_CAPACITY);
    let mut session = Session {
        role: None,
        listeners: HashMap::new(),
        events: events_tx,
    };

    loop {
        tokio::select! {
            line = framed.next() => {
                let line = match line {
                    None => break,
                    Some(Ok(line)) => line,
                    // The codec stream ends after any decode error.
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        let e = ProtocolError::BadRequest("request line too long".into());
                        send_json(&mut framed, &Response::err(None, &e)).await?;
                        break;
                    }
                    Some(Err(e)) => return Err(e),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = handle_line(&ctx, &mut session, &line).await;
                send_json(&mut framed, &response).await?;
            }
            Some(event) = events_rx.recv() => {
                send_json(&mut framed, &EventLine { event: &event }).await?;
            }
        }
    }
    Ok(())
}

async fn send_json<S, T>(framed: &mut Framed<S, LinesCodec>, value: &T) -> Result<(), LinesCodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: Serialize,
{
    let text = match serde_json::to_string(value) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(error = %e, "response serialization failed");
            json!({"ok": false, "error": {"code": "internal", "message": "serialization failed"}})
                .to_string()
        }
    };
    framed.send(text).await
}

async fn handle_line(ctx: &AppContext, session: &mut Session, line: &str) -> Response {
    let (request_id, request) = parse_line(line);
    let request = match request {
        Ok(r) => r,
        Err(e) => return Response::err(request_id, &e),
    };

    let op = op_label(&request);
    let started = Instant::now();
    let result = execute(ctx, session, request).await;
    let status = match &result {
        Ok(_) => "ok",
        Err(e) => e.code(),
    };
    metrics::counter!(REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(REQUEST_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());

    match result {
        Ok(data) => Response::ok(request_id, data),
        Err(e) => {
            tracing::debug!(op, code = e.code(), error = %e, "request failed");
            Response::err(request_id, &e)
        }
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value, ProtocolError> {
    serde_json::to_value(value).map_err(|e| ProtocolError::Internal(e.to_string()))
}

async fn execute(
    ctx: &AppContext,
    session: &mut Session,
    request: Request,
) -> Result<Value, ProtocolError> {
    if let Request::Auth { token } = &request {
        return match ctx.tokens.authenticate(token) {
            Some(role) => {
                session.role = Some(role);
                Ok(json!({ "role": role.as_str() }))
            }
            None => {
                metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
                tracing::warn!("auth failed");
                Err(ProtocolError::Unauthenticated)
            }
        };
    }

    let role = session.role.ok_or(ProtocolError::Unauthenticated)?;
    if let Some(permission) = request.permission()
        && !role.permits(permission)
    {
        return Err(ProtocolError::Forbidden(op_label(&request)));
    }

    let engine = &ctx.engine;
    let actor = session.actor();
    match request {
        Request::Auth { .. } => Ok(Value::Null),
        Request::CreateBay { key, name } => to_value(engine.create_bay(key, name).await?),
        Request::UpdateBay { id, name } => to_value(engine.update_bay(id, name).await?),
        Request::DeleteBay { id } => {
            engine.delete_bay(id).await?;
            Ok(json!({ "deleted": id }))
        }
        Request::ListBays => to_value(engine.list_bays().await),
        Request::CreateBooking(input) => {
            let bay_id = match input.bay_id.or_else(|| engine.waiting_list_bay()) {
                Some(id) => id,
                None => {
                    return Err(ProtocolError::BadRequest(
                        "bay_id is required when there is no waiting list".into(),
                    ));
                }
            };
            let draft = input.into_new_booking(bay_id, actor.map(String::from))?;
            to_value(engine.create_booking(draft).await?)
        }
        Request::UpdateBooking(input) => {
            let (id, patch) = input.into_patch()?;
            to_value(engine.update_booking(id, patch, actor).await?)
        }
        Request::CloseBooking { id } => to_value(engine.close_booking(id, actor).await?),
        Request::CancelBooking { id } => to_value(engine.cancel_booking(id, actor).await?),
        Request::DeleteBooking { id } => {
            engine.delete_booking(id, actor).await?;
            Ok(json!({ "deleted": id }))
        }
        Request::GetBooking { id } => to_value(engine.get_booking(id).await?),
        Request::ListBookings(filter) => {
            to_value(engine.list_bookings(&BookingFilter::from(filter)).await)
        }
        Request::ExportBookings(filter) => {
            let bookings = engine.list_bookings(&BookingFilter::from(filter)).await;
            let bay_names: HashMap<Ulid, String> = engine
                .list_bays()
                .await
                .into_iter()
                .map(|b| (b.id, b.name))
                .collect();
            let csv = bookings_csv(&bookings, &bay_names, &ctx.labels, &ctx.display_offset);
            Ok(json!({
                "filename": export_filename(chrono::Utc::now().timestamp_millis()),
                "content_type": "text/csv",
                "rows": bookings.len(),
                "csv": csv,
            }))
        }
        Request::Agenda { from, to } => {
            let (from, to) = window(&from, &to)?;
            to_value(engine.agenda(from, to).await?)
        }
        Request::Occupancy { at } => {
            let at = at.map(|a| a.resolve("at")).transpose()?;
            to_value(engine.occupancy(at).await)
        }
        Request::Ready { from, to } => {
            let (from, to) = window(&from, &to)?;
            to_value(engine.ready(from, to).await?)
        }
        Request::WaitingList { from, to } => {
            let range = optional_window(&from, &to)?;
            to_value(engine.waiting_list(range).await?)
        }
        Request::Summary { from, to } => {
            let (from, to) = window(&from, &to)?;
            to_value(engine.summary(from, to).await?)
        }
        Request::Listen { bay_id } => {
            // A deleted bay's channel closes and its forwarder exits.
            session.listeners.retain(|_, task| !task.is_finished());
            if session.listeners.contains_key(&bay_id) {
                return Ok(json!({ "listening": bay_id }));
            }
            if session.listeners.len() >= MAX_LISTEN_CHANNELS {
                return Err(EngineError::LimitExceeded("too many listen channels").into());
            }
            let rx = match bay_id {
                Some(id) => {
                    engine.get_bay(id).await?;
                    engine.notify.subscribe(id)
                }
                None => engine.notify.subscribe_all(),
            };
            let task = tokio::spawn(forward(rx, session.events.clone()));
            session.listeners.insert(bay_id, task);
            Ok(json!({ "listening": bay_id }))
        }
        Request::Unlisten { bay_id } => {
            let removed = session.unlisten(bay_id);
            Ok(json!({ "unlistened": removed }))
        }
        Request::GetNotifySettings => to_value(engine.notify_settings().await),
        Request::SetNotifySettings {
            token,
            chat_id,
            template,
        } => to_value(engine.set_notify_settings(token, chat_id, template).await?),
    }
}
