//! Microphone capture.
//!
//! The controller owns one [`MediaCapture`] device and pulls a recorded segment from it
//! on a fixed interval. Segments go out only while the connection is streaming; the
//! rest are dropped, never buffered for later.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::session::ConnectionState;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("could not access input device: {0}")]
    Acquisition(String),

    #[error("recorder failed: {0}")]
    Recorder(#[from] std::io::Error),
}

/// Published to anything that must react to the microphone going live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    Started,
    AcquisitionFailed(String),
    Stopped,
}

/// An audio input device with an encoder attached.
#[async_trait]
pub trait MediaCapture: Send {
    /// Ask for access to the device. Resolves once access is granted or refused.
    async fn acquire(&mut self) -> Result<(), CaptureError>;

    /// Everything recorded since the previous call. `None` once the source is exhausted.
    async fn request_data(&mut self) -> Result<Option<Vec<u8>>, CaptureError>;

    fn stop(&mut self);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureSummary {
    pub segments_sent: u64,
    pub segments_dropped: u64,
}

pub struct CaptureController<M> {
    device: M,
    interval: Duration,
    events: broadcast::Sender<CaptureEvent>,
    connection: watch::Receiver<ConnectionState>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl<M: MediaCapture> CaptureController<M> {
    pub fn new(
        device: M,
        interval: Duration,
        events: broadcast::Sender<CaptureEvent>,
        connection: watch::Receiver<ConnectionState>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Self {
        Self {
            device,
            interval,
            events,
            connection,
            outbound,
        }
    }

    /// Acquire the device and emit segments until the source ends or the connection closes.
    pub async fn run(mut self) -> Result<CaptureSummary, CaptureError> {
        if let Err(err) = self.device.acquire().await {
            let _ = self.events.send(CaptureEvent::AcquisitionFailed(err.to_string()));
            return Err(err);
        }
        info!(interval_ms = self.interval.as_millis() as u64, "Capture started");
        let _ = self.events.send(CaptureEvent::Started);

        let result = self.pump().await;

        self.device.stop();
        let _ = self.events.send(CaptureEvent::Stopped);
        match &result {
            Ok(summary) => info!(
                sent = summary.segments_sent,
                dropped = summary.segments_dropped,
                "Capture stopped"
            ),
            Err(err) => warn!(error = %err, "Capture stopped on error"),
        }
        result
    }

    async fn pump(&mut self) -> Result<CaptureSummary, CaptureError> {
        let mut summary = CaptureSummary::default();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; a recorder has nothing until one interval in.
        ticker.tick().await;

        loop {
            let ticked = tokio::select! {
                _ = ticker.tick() => true,
                changed = self.connection.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    false
                }
            };

            let state = *self.connection.borrow();
            if state == ConnectionState::Closed {
                break;
            }
            if !ticked {
                continue;
            }

            let segment = match self.device.request_data().await? {
                Some(segment) => segment,
                None => {
                    info!("Capture source exhausted");
                    break;
                }
            };
            if segment.is_empty() {
                continue;
            }

            if state != ConnectionState::Streaming {
                debug!(bytes = segment.len(), ?state, "Connection not open, dropping segment");
                summary.segments_dropped += 1;
                continue;
            }
            if self.outbound.send(segment).is_err() {
                debug!("Outbound channel closed");
                break;
            }
            summary.segments_sent += 1;
        }

        Ok(summary)
    }
}
