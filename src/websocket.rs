//! # WebSocket Relay Handler
//!
//! Clients connect to `/ws` (or `/`) and stream microphone audio to the relay.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: one actor and one relay session per connection
//! 2. **Audio**: every binary frame is one complete utterance payload
//! 3. **Replies**: text parts arrive as `{"type":"text","text":...}`, audio parts as
//!    raw binary frames, in the order the chunks were uploaded
//! 4. **Failures**: a chunk that cannot be relayed produces `{"type":"error",...}`
//!    and the session keeps going
//! 5. **Control**: optional JSON text frames (`ping`, `interrupt`); anything
//!    unparseable is logged and dropped
//!
//! Payloads are handed to a detached worker task so the actor keeps answering
//! heartbeats while a chunk waits out a rate limit.

use crate::error::AppError;
use crate::relay::messages::{ControlMessage, Outbound};
use crate::relay::session::{RelaySession, ReplySink};
use crate::state::{AppState, SessionPermit};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// WebSocket actor for one relay connection.
pub struct RelayWebSocket {
    session_id: String,

    /// Moved into the worker task once the actor starts
    worker: Option<(RelaySession, mpsc::UnboundedReceiver<Bytes>)>,

    /// Feeds payloads to the worker; dropped when the actor stops
    payloads: Option<mpsc::UnboundedSender<Bytes>>,

    /// Set when the connection is gone so the worker stops sending
    closed: Arc<AtomicBool>,

    last_heartbeat: Instant,
    heartbeat_interval: Duration,
    client_timeout: Duration,

    /// Released when the actor is dropped
    _permit: SessionPermit,
}

impl RelayWebSocket {
    pub fn new(
        session: RelaySession,
        heartbeat_interval: Duration,
        client_timeout: Duration,
        permit: SessionPermit,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            session_id: session.id().to_string(),
            worker: Some((session, rx)),
            payloads: Some(tx),
            closed: Arc::new(AtomicBool::new(false)),
            last_heartbeat: Instant::now(),
            heartbeat_interval,
            client_timeout,
            _permit: permit,
        }
    }

    fn handle_payload(&mut self, data: Bytes) {
        if data.is_empty() {
            debug!(session = %self.session_id, "Ignoring empty audio frame");
            return;
        }
        let Some(tx) = &self.payloads else {
            return;
        };
        if tx.send(data).is_err() {
            warn!(session = %self.session_id, "Relay worker is gone, dropping payload");
        }
    }

    fn handle_control(&mut self, text: &str) {
        match serde_json::from_str::<ControlMessage>(text) {
            Ok(ControlMessage::Ping { timestamp }) => {
                debug!(session = %self.session_id, ?timestamp, "Client ping");
            }
            Ok(ControlMessage::Interrupt) => {
                info!(session = %self.session_id, "Client interrupted playback");
            }
            Err(err) => {
                warn!(session = %self.session_id, error = %err, "Ignoring malformed text message");
            }
        }
    }
}

/// Reply delivered from the worker back through the actor's mailbox.
#[derive(Message)]
#[rtype(result = "()")]
struct Forward(Outbound);

/// The worker's view of the connection.
struct ActorSink {
    addr: Addr<RelayWebSocket>,
    closed: Arc<AtomicBool>,
}

impl ReplySink for ActorSink {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.addr.connected()
    }

    fn send(&self, message: Outbound) -> bool {
        if !self.is_open() {
            return false;
        }
        self.addr.do_send(Forward(message));
        true
    }
}

impl Actor for RelayWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session = %self.session_id, "Client is connected");

        if let Some((session, rx)) = self.worker.take() {
            let sink = ActorSink {
                addr: ctx.address(),
                closed: self.closed.clone(),
            };
            actix::spawn(session.run(rx, sink));
        }

        let client_timeout = self.client_timeout;
        ctx.run_interval(self.heartbeat_interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > client_timeout {
                warn!(session = %act.session_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.closed.store(true, Ordering::Release);
        self.payloads = None;
        info!(session = %self.session_id, "Client is disconnected");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelayWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        if msg.is_ok() {
            self.last_heartbeat = Instant::now();
        }

        match msg {
            Ok(ws::Message::Binary(data)) => self.handle_payload(data),
            Ok(ws::Message::Text(text)) => self.handle_control(&text),
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!(session = %self.session_id, ?reason, "WebSocket closed by client");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session = %self.session_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session = %self.session_id, error = %err, "WebSocket Error");
                ctx.stop();
            }
        }
    }
}

impl Handler<Forward> for RelayWebSocket {
    type Result = ();

    fn handle(&mut self, msg: Forward, ctx: &mut Self::Context) {
        match msg.0 {
            Outbound::Json(message) => match serde_json::to_string(&message) {
                Ok(json) => ctx.text(json),
                Err(err) => error!(session = %self.session_id, error = %err, "Failed to encode reply"),
            },
            Outbound::Binary(bytes) => ctx.binary(bytes),
        }
    }
}

/// HTTP → WebSocket upgrade. Refused with 503 once the session limit is reached.
pub async fn relay_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let config = state.get_config();
    let permit = state.try_open_session().ok_or_else(|| {
        warn!(
            limit = config.performance.max_concurrent_sessions,
            "Rejecting WebSocket connection, session limit reached"
        );
        AppError::ServiceUnavailable(format!(
            "Maximum concurrent sessions ({}) reached",
            config.performance.max_concurrent_sessions
        ))
    })?;

    let session_id = Uuid::new_v4().to_string();
    info!(
        session = %session_id,
        peer = ?req.connection_info().peer_addr(),
        "New WebSocket connection"
    );

    let session = RelaySession::new(
        session_id,
        state.generation.clone(),
        &config.relay,
        state.metrics.clone(),
    );
    let actor = RelayWebSocket::new(
        session,
        Duration::from_secs(config.relay.heartbeat_interval_secs),
        Duration::from_secs(config.relay.client_timeout_secs),
        permit,
    );

    // Each binary frame is a whole utterance, so the codec limit is the payload limit.
    ws::WsResponseBuilder::new(actor, &req, stream)
        .frame_size(config.relay.max_payload_bytes)
        .start()
}
