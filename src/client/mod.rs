//! # Headless Relay Client
//!
//! Talks to a relay the way the browser page does, with a recorded file standing in
//! for the microphone and paced WAV output standing in for the speaker.
//!
//! ## Pieces:
//! - **session**: conversation state and the user-visible labels
//! - **capture**: periodic segment emission while the connection is open
//! - **playback**: ordered reply playback with barge-in
//! - **devices**: the file/WAV implementations of the capture and output traits
//!
//! Everything runs as tasks on the caller's runtime. Tasks report back to the driver
//! loop through one event channel, so the session state only changes in one place.

pub mod capture;
pub mod devices;
pub mod playback;
pub mod session;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use capture::{CaptureController, CaptureEvent};
use devices::{FileCapture, PacedWavOutput};
use playback::{PlaybackHandle, PlaybackSequencer, PlaybackStats};
use session::{ClientAction, ClientEvent, ClientSession, ConnectionState};

/// Grace period for the close frame to go out after teardown.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Recorded audio replayed as microphone input
    pub input: PathBuf,
    /// Where reply clips are written, if anywhere
    pub output_dir: Option<PathBuf>,
    /// How long to keep listening for replies after the input runs out
    pub linger: Duration,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0}")]
    Session(String),
}

#[derive(Debug, Clone, Default)]
pub struct ClientSummary {
    pub replies: Vec<String>,
    pub playback: PlaybackStats,
}

/// Run one conversation from start to teardown.
pub async fn run(config: &ClientConfig, options: ClientOptions) -> Result<ClientSummary, ClientError> {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (state_tx, _) = watch::channel(ConnectionState::Idle);
    let (capture_events, _) = broadcast::channel(16);

    let (playback, sequencer) = PlaybackSequencer::new(
        PacedWavOutput::new(options.output_dir.clone()),
        Some(capture_events.subscribe()),
    );
    let playback_task = tokio::spawn(sequencer.run());

    let mut driver = Driver {
        config: config.clone(),
        options,
        events: events_tx,
        state: state_tx,
        capture_events,
        playback,
        outbound: None,
        connection: None,
        capture: None,
    };
    let mut session = ClientSession::new();

    let _ = driver.events.send(ClientEvent::StartRequested);
    while let Some(event) = events_rx.recv().await {
        let actions = session.handle(event);
        driver.state.send_replace(session.state());
        debug!(state = ?session.state(), status = %session.ui().status, "Client state");

        for action in actions {
            driver.execute(action);
        }
        if session.state() == ConnectionState::Closed {
            break;
        }
    }

    let Driver {
        playback,
        connection,
        ..
    } = driver;
    drop(playback);
    let stats = playback_task.await.unwrap_or_default();
    if let Some(connection) = connection {
        if tokio::time::timeout(CLOSE_GRACE, connection).await.is_err() {
            debug!("Connection task did not finish within grace period");
        }
    }

    if let Some(error) = session.last_error() {
        return Err(ClientError::Session(error.to_string()));
    }
    Ok(ClientSummary {
        replies: session.transcript().to_vec(),
        playback: stats,
    })
}

struct Driver {
    config: ClientConfig,
    options: ClientOptions,
    events: mpsc::UnboundedSender<ClientEvent>,
    state: watch::Sender<ConnectionState>,
    capture_events: broadcast::Sender<CaptureEvent>,
    playback: PlaybackHandle,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    connection: Option<JoinHandle<()>>,
    capture: Option<JoinHandle<()>>,
}

impl Driver {
    fn execute(&mut self, action: ClientAction) {
        match action {
            ClientAction::Connect => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.outbound = Some(tx);
                self.connection = Some(tokio::spawn(connection_task(
                    self.config.relay_url.clone(),
                    rx,
                    self.state.subscribe(),
                    self.events.clone(),
                )));
            }
            ClientAction::StartCapture => {
                let Some(outbound) = self.outbound.clone() else {
                    warn!("Capture requested without a connection");
                    return;
                };
                let controller = CaptureController::new(
                    FileCapture::new(&self.options.input, self.config.segment_bytes),
                    self.config.capture_interval(),
                    self.capture_events.clone(),
                    self.state.subscribe(),
                    outbound,
                );
                let events = self.events.clone();
                let linger = self.options.linger;
                self.capture = Some(tokio::spawn(async move {
                    match controller.run().await {
                        Ok(_) => {
                            info!(linger_ms = linger.as_millis() as u64, "Input finished, waiting for replies");
                            tokio::time::sleep(linger).await;
                            let _ = events.send(ClientEvent::StopRequested);
                        }
                        Err(err) => {
                            let _ = events.send(ClientEvent::CaptureFailed(err.to_string()));
                        }
                    }
                }));
            }
            ClientAction::StopCapture => {
                if let Some(capture) = self.capture.take() {
                    capture.abort();
                }
            }
            ClientAction::CloseConnection => {
                // The connection task sends the close frame once it sees the Closed state.
                self.outbound = None;
            }
            ClientAction::EnqueuePlayback(audio) => {
                if !self.playback.enqueue(audio) {
                    warn!("Playback is gone, dropping reply audio");
                }
            }
            ClientAction::FlushPlayback => self.playback.flush(),
        }
    }
}

/// Owns the socket: uploads captured segments and reports everything the relay sends.
async fn connection_task(
    url: String,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    mut state: watch::Receiver<ConnectionState>,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    info!(%url, "Connecting to relay");
    let socket = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((socket, _)) => socket,
        Err(err) => {
            let _ = events.send(ClientEvent::ConnectionFailed(err.to_string()));
            return;
        }
    };
    info!("WebSocket connection opened");
    let _ = events.send(ClientEvent::ConnectionOpened);

    let (mut write, mut read) = socket.split();
    let mut uploads_open = true;

    loop {
        tokio::select! {
            segment = outbound.recv(), if uploads_open => match segment {
                Some(segment) => {
                    if let Err(err) = write.send(Message::Binary(segment)).await {
                        let _ = events.send(ClientEvent::ConnectionFailed(err.to_string()));
                        return;
                    }
                }
                None => uploads_open = false,
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Binary(data))) => {
                    let _ = events.send(ClientEvent::BinaryReceived(Bytes::from(data)));
                }
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(ClientEvent::TextReceived(text));
                }
                Some(Ok(Message::Close(_))) | None => {
                    let _ = events.send(ClientEvent::ConnectionClosed);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    let _ = events.send(ClientEvent::ConnectionFailed(err.to_string()));
                    return;
                }
            },
            changed = state.changed() => {
                if changed.is_err() || *state.borrow() == ConnectionState::Closed {
                    if let Err(err) = write.send(Message::Close(None)).await {
                        debug!(error = %err, "Close frame not delivered");
                    }
                    info!("WebSocket connection closed");
                    return;
                }
            }
        }
    }
}
