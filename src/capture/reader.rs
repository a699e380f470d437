//! Input side: keeps a best-effort connection to the source and the frame slot fresh

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::capture::backoff::Backoff;
use crate::media::{FrameSource, FrameStream};
use crate::pipeline::FrameSlot;
use crate::MediaError;

/// Connection lifecycle of the input side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Streaming,
    /// Same behaviour as `Connecting`, entered after a stream was lost
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Published on every state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: ConnectionState,
    pub to: ConnectionState,
    /// Connect attempts issued so far
    pub attempt: u64,
}

/// Counters returned when the reader stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub connect_attempts: u64,
    pub sessions: u64,
    pub frames: u64,
}

enum SessionEnd {
    Cancelled,
    Failed { error: MediaError, frames: u64 },
}

pub struct InputReader<S: FrameSource> {
    source: S,
    slot: Arc<FrameSlot>,
    backoff: Backoff,
    events: Option<flume::Sender<StateChange>>,
    state: ConnectionState,
    stats: ReaderStats,
}

impl<S: FrameSource> InputReader<S> {
    pub fn new(source: S, slot: Arc<FrameSlot>, backoff: Backoff) -> Self {
        Self {
            source,
            slot,
            backoff,
            events: None,
            state: ConnectionState::Connecting,
            stats: ReaderStats::default(),
        }
    }

    /// Publish state changes on `events`. Sends never block; a full channel drops events.
    pub fn with_events(mut self, events: flume::Sender<StateChange>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Run until `cancel` fires. Connect and decode errors never end the loop.
    #[instrument(name = "input_reader", skip_all)]
    pub async fn run(mut self, cancel: CancellationToken) -> ReaderStats {
        info!("Input reader started");

        while !cancel.is_cancelled() {
            self.stats.connect_attempts += 1;
            metrics::counter!("holdover_connect_attempts_total").increment(1);
            debug!(attempt = self.stats.connect_attempts, state = %self.state, "Opening source");

            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                opened = self.source.open() => opened,
            };

            let error = match opened {
                Ok(stream) => {
                    self.stats.sessions += 1;
                    self.transition(ConnectionState::Streaming);

                    match self.stream_frames(stream, &cancel).await {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Failed { error, frames } if frames > 0 => {
                            // A productive session was lost: reconnect right away
                            warn!(%error, frames, "Input stream lost, reconnecting");
                            self.backoff.reset();
                            self.transition(ConnectionState::Reconnecting);
                            continue;
                        }
                        // Opened but produced nothing: as good as a failed connect
                        SessionEnd::Failed { error, .. } => error,
                    }
                }
                Err(error) => error,
            };

            let delay = self.backoff.next_delay();
            warn!(
                %error,
                attempt = self.stats.connect_attempts,
                delay_ms = delay.as_millis() as u64,
                "Failed to connect to source, retrying"
            );
            if self.state == ConnectionState::Streaming {
                self.transition(ConnectionState::Reconnecting);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(
            attempts = self.stats.connect_attempts,
            frames = self.stats.frames,
            "Input reader stopped"
        );
        self.stats
    }

    async fn stream_frames(&mut self, mut stream: S::Stream, cancel: &CancellationToken) -> SessionEnd {
        let mut frames = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    stream.close().await;
                    return SessionEnd::Cancelled;
                }
                next = stream.next_frame() => next,
            };

            match next {
                Ok(frame) => {
                    if cancel.is_cancelled() {
                        stream.close().await;
                        return SessionEnd::Cancelled;
                    }
                    self.slot.put(frame);
                    frames += 1;
                    self.stats.frames += 1;
                    metrics::counter!("holdover_frames_decoded_total").increment(1);
                }
                Err(error) => {
                    stream.close().await;
                    return SessionEnd::Failed { error, frames };
                }
            }
        }
    }

    fn transition(&mut self, to: ConnectionState) {
        if self.state == to {
            return;
        }
        let change = StateChange {
            from: self.state,
            to,
            attempt: self.stats.connect_attempts,
        };
        self.state = to;

        debug!(from = %change.from, to = %change.to, attempt = change.attempt, "Input state changed");
        if let Some(events) = &self.events {
            let _ = events.try_send(change);
        }
    }
}
