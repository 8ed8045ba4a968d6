//! Newline-delimited JSON protocol.
//!
//! Each request is one line: `{"request_id": .., "claims": {..}, "op": "..", ..}`.
//! Each reply is one line: `{"request_id": .., "ok": true, "data": ..}` or
//! `{"request_id": .., "ok": false, "error": {"kind": .., "message": .., "fields": ..}}`.
//! After a `listen`, committed ledger events for that provider are pushed as
//! `{"event": ..}` lines between replies.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, error, warn};
use ulid::Ulid;

use crate::engine::{BookingOwner, Engine, EngineError};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Ping,
    CreateBooking(CreateBooking),
    UpdateBooking(UpdateBooking),
    DeleteBooking {
        id: Ulid,
    },
    GetBooking {
        id: Ulid,
    },
    ListProviderBookings {
        provider_id: String,
        #[serde(flatten)]
        filter: BookingFilter,
    },
    ListClientBookings {
        client_id: String,
        #[serde(flatten)]
        filter: BookingFilter,
    },
    FindConflicts {
        provider_id: String,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    },
    DashboardStats {
        provider_id: String,
    },
    ProviderInsights {
        provider_id: String,
        #[serde(flatten)]
        range: DateRange,
    },
    ClientStats {
        client_id: String,
    },
    DashboardClients {
        provider_id: String,
    },
    Listen {
        provider_id: String,
    },
    Unlisten,
}

impl Request {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::CreateBooking(_) => "create_booking",
            Request::UpdateBooking(_) => "update_booking",
            Request::DeleteBooking { .. } => "delete_booking",
            Request::GetBooking { .. } => "get_booking",
            Request::ListProviderBookings { .. } => "list_provider_bookings",
            Request::ListClientBookings { .. } => "list_client_bookings",
            Request::FindConflicts { .. } => "find_conflicts",
            Request::DashboardStats { .. } => "dashboard_stats",
            Request::ProviderInsights { .. } => "provider_insights",
            Request::ClientStats { .. } => "client_stats",
            Request::DashboardClients { .. } => "dashboard_clients",
            Request::Listen { .. } => "listen",
            Request::Unlisten => "unlisten",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireError {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<FieldErrors>,
}

impl WireError {
    fn new(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            fields: None,
        }
    }

    fn malformed(message: impl Into<String>) -> Self {
        Self::new("malformed", message)
    }
}

impl From<EngineError> for WireError {
    fn from(e: EngineError) -> Self {
        let kind = match &e {
            EngineError::NotFound(_) => "not_found",
            EngineError::Validation(_) => "validation",
            EngineError::BadRequest(_) => "bad_request",
            EngineError::Unauthenticated => "unauthenticated",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Internal(_) => "internal",
        };
        match e {
            EngineError::Internal(detail) => {
                error!("internal error: {detail}");
                WireError::new(kind, "internal error")
            }
            EngineError::Validation(fields) => WireError {
                kind,
                message: "One or more validation errors occurred.".into(),
                fields: Some(fields),
            },
            other => WireError::new(kind, other.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct Reply {
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<Value>,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<WireError>,
}

impl Reply {
    fn new(request_id: Option<Value>, result: Result<Value, WireError>) -> Self {
        match result {
            Ok(data) => Reply {
                request_id,
                ok: true,
                data: Some(data),
                error: None,
            },
            Err(e) => Reply {
                request_id,
                ok: false,
                data: None,
                error: Some(e),
            },
        }
    }

    fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"ok":false,"error":{{"kind":"internal","message":"encode failed: {e}"}}}}"#)
        })
    }
}

fn to_data<T: Serialize>(value: T) -> Result<Value, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::Internal(format!("encode: {e}")))
}

/// The caller must be `user_id` itself.
fn require_self(claims: &Claims, user_id: &str) -> Result<(), EngineError> {
    match claims.current_user_id() {
        None => Err(EngineError::Unauthenticated),
        Some(actor) if actor == user_id => Ok(()),
        Some(_) => Err(EngineError::Forbidden(
            "You can only access your own booking feed.".into(),
        )),
    }
}

/// Run one engine operation.
pub async fn dispatch(engine: &Engine, claims: &Claims, request: Request) -> Result<Value, EngineError> {
    match request {
        Request::Ping => Ok(json!({ "pong": true })),
        Request::CreateBooking(cmd) => to_data(engine.create_booking(claims, cmd).await?),
        Request::UpdateBooking(cmd) => {
            let id = cmd.id;
            match engine.update_booking(claims, cmd).await? {
                Some(booking) => to_data(booking),
                None => Err(EngineError::not_found("booking", &id.to_string())),
            }
        }
        Request::DeleteBooking { id } => {
            let deleted = engine.delete_booking(claims, id).await?;
            Ok(json!({ "deleted": deleted }))
        }
        Request::GetBooking { id } => to_data(engine.get_booking(id).await),
        Request::ListProviderBookings {
            provider_id,
            filter,
        } => to_data(
            engine
                .list_bookings(claims, &BookingOwner::Provider(provider_id), &filter)
                .await?,
        ),
        Request::ListClientBookings { client_id, filter } => to_data(
            engine
                .list_bookings(claims, &BookingOwner::Client(client_id), &filter)
                .await?,
        ),
        Request::FindConflicts {
            provider_id,
            start_time,
            end_time,
        } => {
            require_self(claims, &provider_id)?;
            let span = Span::new(start_time, end_time);
            if span.is_empty() {
                return Err(EngineError::validation(
                    "end_time",
                    "End time must be after start time.",
                ));
            }
            to_data(engine.find_conflicts(&provider_id, &span).await)
        }
        Request::DashboardStats { provider_id } => {
            to_data(engine.dashboard_stats(claims, &provider_id).await?)
        }
        Request::ProviderInsights { provider_id, range } => {
            to_data(engine.provider_insights(claims, &provider_id, &range).await?)
        }
        Request::ClientStats { client_id } => to_data(engine.client_stats(claims, &client_id).await?),
        Request::DashboardClients { provider_id } => {
            to_data(engine.dashboard_clients(claims, &provider_id).await?)
        }
        Request::Listen { .. } | Request::Unlisten => Err(EngineError::BadRequest(
            "listen/unlisten are connection-level operations".into(),
        )),
    }
}

/// Per-connection state: the provider feed this connection listens to.
struct Session {
    engine: Arc<Engine>,
    request_timeout: Duration,
    feed: Option<broadcast::Receiver<Event>>,
}

impl Session {
    async fn handle_line(&mut self, line: &str) -> String {
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => return Reply::new(None, Err(WireError::malformed(format!("invalid JSON: {e}")))).encode(),
        };
        let request_id = value.get("request_id").cloned();
        let claims = match value.get("claims") {
            None | Some(Value::Null) => Claims::anonymous(),
            Some(raw) => match Claims::deserialize(raw) {
                Ok(c) => c,
                Err(e) => {
                    return Reply::new(request_id, Err(WireError::malformed(format!("invalid claims: {e}"))))
                        .encode();
                }
            },
        };
        let request = match Request::deserialize(&value) {
            Ok(r) => r,
            Err(e) => {
                return Reply::new(request_id, Err(WireError::malformed(format!("invalid request: {e}"))))
                    .encode();
            }
        };

        let op = request.label();
        let started = Instant::now();
        let result = self.execute(&claims, request).await;
        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind,
        };
        if let Err(e) = &result {
            debug!(op, kind = e.kind, "request rejected: {}", e.message);
        }
        metrics::counter!(crate::observability::REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);
        metrics::histogram!(crate::observability::REQUEST_DURATION_SECONDS, "op" => op)
            .record(started.elapsed().as_secs_f64());

        Reply::new(request_id, result).encode()
    }

    async fn execute(&mut self, claims: &Claims, request: Request) -> Result<Value, WireError> {
        match request {
            Request::Listen { provider_id } => {
                require_self(claims, &provider_id)?;
                self.feed = Some(self.engine.notify.subscribe(&provider_id));
                Ok(json!({ "listening": provider_id }))
            }
            Request::Unlisten => {
                self.feed = None;
                self.engine.notify.prune();
                Ok(json!({ "listening": null }))
            }
            other => {
                match tokio::time::timeout(self.request_timeout, dispatch(&self.engine, claims, other)).await {
                    Ok(result) => result.map_err(WireError::from),
                    Err(_) => Err(WireError::new("timeout", "request timed out")),
                }
            }
        }
    }
}

async fn next_event(feed: &mut Option<broadcast::Receiver<Event>>) -> Result<Event, broadcast::error::RecvError> {
    match feed {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    request_timeout: Duration,
) -> Result<(), LinesCodecError> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let mut session = Session {
        engine,
        request_timeout,
        feed: None,
    };

    loop {
        tokio::select! {
            line = framed.next() => {
                let reply = match line {
                    None => break,
                    Some(Ok(line)) if line.trim().is_empty() => continue,
                    Some(Ok(line)) => session.handle_line(&line).await,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        Reply::new(None, Err(WireError::malformed("request line too long"))).encode()
                    }
                    Some(Err(e)) => return Err(e),
                };
                framed.send(reply).await?;
            }
            event = next_event(&mut session.feed) => match event {
                Ok(event) => {
                    framed.send(json!({ "event": event }).to_string()).await?;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("booking feed lagged, {skipped} events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => session.feed = None,
            },
        }
    }

    if session.feed.take().is_some() {
        session.engine.notify.prune();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_create_with_optional_fields() {
        let raw = json!({
            "op": "create_booking",
            "service_id": "svc-1",
            "start_time": "2030-01-07T10:00:00Z"
        });
        match Request::deserialize(&raw).unwrap() {
            Request::CreateBooking(cmd) => {
                assert_eq!(cmd.service_id, "svc-1");
                assert!(cmd.end_time.is_none());
                assert!(cmd.idempotency_key.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_list_with_flattened_filter() {
        let raw = json!({
            "op": "list_provider_bookings",
            "provider_id": "p1",
            "status": "pending",
            "end_date": "2030-01-07T00:00:00Z"
        });
        match Request::deserialize(&raw).unwrap() {
            Request::ListProviderBookings { provider_id, filter } => {
                assert_eq!(provider_id, "p1");
                assert_eq!(filter.status, Some(BookingStatus::Pending));
                assert!(filter.range.start_date.is_none());
                assert!(filter.range.end_date.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_op_is_rejected() {
        assert!(Request::deserialize(&json!({ "op": "drop_table" })).is_err());
        assert!(Request::deserialize(&json!({ "service_id": "x" })).is_err());
    }

    #[test]
    fn engine_errors_map_to_kinds() {
        let cases: Vec<(EngineError, &str)> = vec![
            (EngineError::not_found("booking", "x"), "not_found"),
            (EngineError::validation("start_time", "bad"), "validation"),
            (EngineError::BadRequest("no".into()), "bad_request"),
            (EngineError::Unauthenticated, "unauthenticated"),
            (EngineError::Forbidden("no".into()), "forbidden"),
            (
                EngineError::InvalidTransition {
                    from: BookingStatus::Completed,
                    to: BookingStatus::Pending,
                },
                "invalid_transition",
            ),
            (EngineError::LimitExceeded("too many"), "limit_exceeded"),
            (EngineError::Internal("disk on fire".into()), "internal"),
        ];
        for (err, kind) in cases {
            assert_eq!(WireError::from(err).kind, kind);
        }
    }

    #[test]
    fn internal_details_are_not_leaked() {
        let e = WireError::from(EngineError::Internal("WAL error: EIO".into()));
        assert_eq!(e.message, "internal error");
    }

    #[test]
    fn validation_carries_field_map() {
        let e = WireError::from(EngineError::validation("end_time", "End time must be after start time."));
        let fields = e.fields.unwrap();
        assert_eq!(fields["end_time"], vec!["End time must be after start time.".to_string()]);
    }

    #[test]
    fn reply_shape() {
        let ok = Reply::new(Some(json!(7)), Ok(json!({ "pong": true }))).encode();
        let v: Value = serde_json::from_str(&ok).unwrap();
        assert_eq!(v["request_id"], 7);
        assert_eq!(v["ok"], true);
        assert!(v.get("error").is_none());

        let err = Reply::new(None, Err(WireError::malformed("bad"))).encode();
        let v: Value = serde_json::from_str(&err).unwrap();
        assert_eq!(v["ok"], false);
        assert_eq!(v["error"]["kind"], "malformed");
        assert!(v.get("request_id").is_none());
    }
}
