//! Client conversation state.
//!
//! [`ClientSession`] is the single owner of everything the user can see (button label,
//! status line) plus the connection state. It never performs I/O itself: each
//! [`ClientEvent`] returns the [`ClientAction`]s the driver must carry out, which keeps
//! ordering and teardown testable without sockets or devices.

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::relay::messages::ServerMessage;

pub const LABEL_START: &str = "Start Talking";
pub const LABEL_STOP: &str = "Stop Talking";

pub const STATUS_IDLE: &str = "Click the button to start the conversation.";
pub const STATUS_CONNECTING: &str = "Connecting...";
pub const STATUS_CONNECTED: &str = "Connected. Start speaking…";
pub const STATUS_CLOSED: &str = "Connection closed.";
pub const STATUS_CONNECTION_FAILED: &str = "Error: Connection failed.";
pub const STATUS_MIC_FAILED: &str = "Error: Could not access microphone.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Streaming,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiState {
    pub button_label: &'static str,
    pub status: String,
}

impl UiState {
    fn idle() -> Self {
        Self {
            button_label: LABEL_START,
            status: STATUS_IDLE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The talk button was pressed while idle
    StartRequested,
    /// The talk button was pressed while talking
    StopRequested,
    ConnectionOpened,
    ConnectionClosed,
    ConnectionFailed(String),
    BinaryReceived(Bytes),
    TextReceived(String),
    CaptureFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    Connect,
    StartCapture,
    StopCapture,
    CloseConnection,
    EnqueuePlayback(Bytes),
    FlushPlayback,
}

#[derive(Debug)]
pub struct ClientSession {
    state: ConnectionState,
    ui: UiState,
    /// Text parts of replies, in arrival order
    transcript: Vec<String>,
    /// Last session-fatal error shown to the user
    last_error: Option<String>,
}

impl Default for ClientSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientSession {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            ui: UiState::idle(),
            transcript: Vec::new(),
            last_error: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn ui(&self) -> &UiState {
        &self.ui
    }

    pub fn transcript(&self) -> &[String] {
        &self.transcript
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn handle(&mut self, event: ClientEvent) -> Vec<ClientAction> {
        use ClientEvent::*;
        use ConnectionState::*;

        match (self.state, event) {
            (Idle | Closed, StartRequested) => {
                self.state = Connecting;
                self.last_error = None;
                self.set_ui(LABEL_STOP, STATUS_CONNECTING);
                vec![ClientAction::FlushPlayback, ClientAction::Connect]
            }
            (Connecting | Streaming, StopRequested) => self.reset(None, true),

            (Connecting, ConnectionOpened) => {
                self.state = Streaming;
                self.set_ui(LABEL_STOP, STATUS_CONNECTED);
                vec![ClientAction::StartCapture]
            }

            (Streaming, BinaryReceived(audio)) => vec![ClientAction::EnqueuePlayback(audio)],
            (Connecting | Streaming, TextReceived(text)) => {
                self.handle_text(&text);
                Vec::new()
            }

            (Connecting | Streaming, ConnectionClosed) => {
                info!("{}", STATUS_CLOSED);
                self.reset(None, false)
            }
            (Connecting | Streaming, ConnectionFailed(reason)) => {
                warn!(%reason, "WebSocket Error");
                self.reset(Some(STATUS_CONNECTION_FAILED), false)
            }
            (Connecting | Streaming, CaptureFailed(reason)) => {
                warn!(%reason, "Error getting media stream");
                self.reset(Some(STATUS_MIC_FAILED), true)
            }

            (state, event) => {
                debug!(?state, ?event, "Ignoring event");
                Vec::new()
            }
        }
    }

    fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ServerMessage>(text) {
            Ok(ServerMessage::Text { text }) => {
                info!(reply = %text, "Reply text");
                self.transcript.push(text);
            }
            Ok(ServerMessage::Error { message, chunk }) => {
                warn!(%message, ?chunk, "Server error");
                self.ui.status = format!("Error: {}", message);
            }
            Err(_) => {
                info!(%text, "Received text message");
            }
        }
    }

    /// Back to a known idle state. Every teardown path goes through here.
    fn reset(&mut self, error: Option<&str>, close_connection: bool) -> Vec<ClientAction> {
        self.state = ConnectionState::Closed;
        self.ui = UiState::idle();
        if let Some(error) = error {
            self.last_error = Some(error.to_string());
        }

        let mut actions = vec![ClientAction::StopCapture];
        if close_connection {
            actions.push(ClientAction::CloseConnection);
        }
        actions.push(ClientAction::FlushPlayback);
        actions
    }

    fn set_ui(&mut self, label: &'static str, status: &str) {
        self.ui = UiState {
            button_label: label,
            status: status.to_string(),
        };
        debug!(label, status, "UI updated");
    }
}
