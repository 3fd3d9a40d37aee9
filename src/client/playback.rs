//! Ordered playback of reply audio.
//!
//! Reply clips are played strictly one after another in arrival order. The sequencer
//! task is the only owner of the pending queue; everybody else talks to it through a
//! [`PlaybackHandle`]. A clip that fails to decode is logged and skipped.
//!
//! Barge-in: when capture publishes [`CaptureEvent::Started`], or a handle calls
//! [`PlaybackHandle::flush`], every clip not yet started is discarded. A clip already
//! playing runs to completion, but its completion does not pull anything else.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::capture::CaptureEvent;

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("could not decode audio: {0}")]
    Decode(String),

    #[error("audio output failed: {0}")]
    Output(String),
}

#[async_trait]
pub trait AudioOutput: Send {
    type Clip: Send;

    async fn decode(&mut self, audio: Bytes) -> Result<Self::Clip, PlaybackError>;

    /// Resolves when the clip has finished playing.
    async fn play(&mut self, clip: Self::Clip) -> Result<(), PlaybackError>;
}

#[derive(Debug)]
enum PlaybackCommand {
    Enqueue(Bytes),
    Flush,
}

#[derive(Debug, Clone)]
pub struct PlaybackHandle {
    commands: mpsc::UnboundedSender<PlaybackCommand>,
}

impl PlaybackHandle {
    /// Queue a clip. Returns false once the sequencer is gone.
    pub fn enqueue(&self, audio: Bytes) -> bool {
        self.commands.send(PlaybackCommand::Enqueue(audio)).is_ok()
    }

    /// Discard every clip that has not started yet.
    pub fn flush(&self) {
        let _ = self.commands.send(PlaybackCommand::Flush);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub played: u64,
    pub skipped: u64,
    pub flushed: u64,
}

pub struct PlaybackSequencer<O> {
    output: O,
    commands: mpsc::UnboundedReceiver<PlaybackCommand>,
    interrupts: Option<broadcast::Receiver<CaptureEvent>>,
}

enum Signal {
    Command(PlaybackCommand),
    Interrupted,
}

impl<O: AudioOutput> PlaybackSequencer<O> {
    pub fn new(
        output: O,
        interrupts: Option<broadcast::Receiver<CaptureEvent>>,
    ) -> (PlaybackHandle, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            PlaybackHandle { commands: tx },
            Self {
                output,
                commands: rx,
                interrupts,
            },
        )
    }

    /// Runs until every handle is dropped and whatever was still queued has played.
    pub async fn run(self) -> PlaybackStats {
        let Self {
            mut output,
            mut commands,
            mut interrupts,
        } = self;
        let mut queue: VecDeque<Bytes> = VecDeque::new();
        let mut stats = PlaybackStats::default();
        let mut closed = false;

        loop {
            let Some(audio) = queue.pop_front() else {
                if closed {
                    break;
                }
                match next_signal(&mut commands, &mut interrupts).await {
                    Some(signal) => apply(&mut queue, &mut stats, signal),
                    None => closed = true,
                }
                continue;
            };

            let bytes = audio.len();
            let clip = async {
                let decoded = output.decode(audio).await?;
                output.play(decoded).await
            };
            tokio::pin!(clip);

            let result = loop {
                if closed {
                    break (&mut clip).await;
                }
                tokio::select! {
                    result = &mut clip => break result,
                    signal = next_signal(&mut commands, &mut interrupts) => match signal {
                        Some(signal) => apply(&mut queue, &mut stats, signal),
                        None => closed = true,
                    },
                }
            };

            match result {
                Ok(()) => {
                    stats.played += 1;
                    debug!(bytes, pending = queue.len(), "Clip finished");
                }
                Err(err) => {
                    stats.skipped += 1;
                    warn!(bytes, error = %err, "Skipping reply clip");
                }
            }
        }

        info!(
            played = stats.played,
            skipped = stats.skipped,
            flushed = stats.flushed,
            "Playback stopped"
        );
        stats
    }
}

fn apply(queue: &mut VecDeque<Bytes>, stats: &mut PlaybackStats, signal: Signal) {
    match signal {
        Signal::Command(PlaybackCommand::Enqueue(audio)) => queue.push_back(audio),
        Signal::Command(PlaybackCommand::Flush) | Signal::Interrupted => {
            if !queue.is_empty() {
                debug!(discarded = queue.len(), "Flushing playback queue");
                stats.flushed += queue.len() as u64;
                queue.clear();
            }
        }
    }
}

/// Next command or barge-in. `None` once every handle is gone.
async fn next_signal(
    commands: &mut mpsc::UnboundedReceiver<PlaybackCommand>,
    interrupts: &mut Option<broadcast::Receiver<CaptureEvent>>,
) -> Option<Signal> {
    loop {
        let event = tokio::select! {
            command = commands.recv() => return command.map(Signal::Command),
            event = next_capture_event(&mut *interrupts) => event,
        };
        match event {
            Some(CaptureEvent::Started) => return Some(Signal::Interrupted),
            Some(_) => {}
            None => *interrupts = None,
        }
    }
}

async fn next_capture_event(
    interrupts: &mut Option<broadcast::Receiver<CaptureEvent>>,
) -> Option<CaptureEvent> {
    let Some(rx) = interrupts else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!(missed, "Capture events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
