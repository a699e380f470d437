#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;

use holdover::media::{FrameSink, FrameSource, FrameStream, SinkConnector};
use holdover::output::FallbackFrameGenerator;
use holdover::{Config, Frame, MediaError};

pub const WIDTH: u32 = 16;
pub const HEIGHT: u32 = 8;
pub const FRAME_BYTES: usize = (WIDTH * HEIGHT * 3) as usize;

pub fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

pub fn config(timeout_secs: f64, fps: u32) -> Config {
    let mut config = Config::default();
    config.input.url = "test://camera".into();
    config.output.url = "test://relay".into();
    config.output.width = WIDTH;
    config.output.height = HEIGHT;
    config.output.fps = fps;
    config.output.timeout_secs = timeout_secs;
    config
}

pub fn generator() -> FallbackFrameGenerator {
    FallbackFrameGenerator::new(WIDTH, HEIGHT)
}

/// What a single `open` on [`ScriptedSource`] does
#[derive(Debug, Clone)]
pub enum Session {
    /// Fail the connect immediately
    Refuse,
    /// Never complete the connect
    Hang,
    /// Deliver frames at these offsets from the test start, then go silent
    FramesAt(Vec<Duration>),
    /// Deliver `count` frames `period` apart, then end the stream
    Periodic { period: Duration, count: u64 },
}

pub struct ScriptedSource {
    start: Instant,
    script: Mutex<VecDeque<Session>>,
    repeat: Session,
    opens: Arc<AtomicU64>,
}

impl ScriptedSource {
    /// `repeat` is used once `script` runs out
    pub fn new(start: Instant, script: Vec<Session>, repeat: Session) -> Self {
        Self {
            start,
            script: Mutex::new(script.into()),
            repeat,
            opens: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn opens(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.opens)
    }
}

enum Plan {
    At(VecDeque<Duration>),
    Periodic { period: Duration, remaining: u64 },
}

pub struct ScriptedStream {
    start: Instant,
    plan: Plan,
    /// Restarts with every session, like a real decoder
    sequence: u64,
}

#[async_trait]
impl FrameSource for ScriptedSource {
    type Stream = ScriptedStream;

    async fn open(&self) -> Result<ScriptedStream, MediaError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let session = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.repeat.clone());

        let plan = match session {
            Session::Refuse => return Err(MediaError::connect("test://camera", "connection refused")),
            Session::Hang => std::future::pending().await,
            Session::FramesAt(offsets) => Plan::At(offsets.into()),
            Session::Periodic { period, count } => Plan::Periodic {
                period,
                remaining: count,
            },
        };
        Ok(ScriptedStream {
            start: self.start,
            plan,
            sequence: 0,
        })
    }
}

#[async_trait]
impl FrameStream for ScriptedStream {
    async fn next_frame(&mut self) -> Result<Frame, MediaError> {
        match &mut self.plan {
            Plan::At(offsets) => match offsets.pop_front() {
                Some(offset) => tokio::time::sleep_until(self.start + offset).await,
                None => std::future::pending().await,
            },
            Plan::Periodic { period, remaining } => {
                if *remaining == 0 {
                    return Err(MediaError::EndOfStream);
                }
                *remaining -= 1;
                tokio::time::sleep(*period).await;
            }
        }

        self.sequence += 1;
        Ok(Frame::rgb(
            self.sequence,
            WIDTH,
            HEIGHT,
            Bytes::from(vec![self.sequence as u8; FRAME_BYTES]),
            Instant::now(),
        ))
    }
}

/// One frame as the sink saw it
#[derive(Debug, Clone)]
pub struct Written {
    pub at: Instant,
    pub sequence: u64,
    pub fallback: bool,
    pub len: usize,
}

/// Sink side double that reports every accepted frame on a channel
#[derive(Clone)]
pub struct RecordingConnector {
    tx: flume::Sender<Written>,
    opens: Arc<AtomicU64>,
    writes: Arc<AtomicU64>,
    refuse_opens: u64,
    fail_write: Option<u64>,
    hang_writes: bool,
}

impl RecordingConnector {
    pub fn new() -> (Self, flume::Receiver<Written>) {
        let (tx, rx) = flume::unbounded();
        let connector = Self {
            tx,
            opens: Arc::new(AtomicU64::new(0)),
            writes: Arc::new(AtomicU64::new(0)),
            refuse_opens: 0,
            fail_write: None,
            hang_writes: false,
        };
        (connector, rx)
    }

    /// Refuse the first `count` opens
    pub fn refusing_opens(mut self, count: u64) -> Self {
        self.refuse_opens = count;
        self
    }

    /// Fail the `nth` write attempt (1-based), counted across sinks
    pub fn failing_write(mut self, nth: u64) -> Self {
        self.fail_write = Some(nth);
        self
    }

    pub fn hanging_writes(mut self) -> Self {
        self.hang_writes = true;
        self
    }

    pub fn opens(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.opens)
    }
}

pub struct RecordingSink {
    connector: RecordingConnector,
}

#[async_trait]
impl SinkConnector for RecordingConnector {
    type Sink = RecordingSink;

    async fn open(&self) -> Result<RecordingSink, MediaError> {
        let attempt = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.refuse_opens {
            return Err(MediaError::connect("test://relay", "connection refused"));
        }
        Ok(RecordingSink {
            connector: self.clone(),
        })
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn write(&mut self, frame: &Frame) -> Result<(), MediaError> {
        if self.connector.hang_writes {
            std::future::pending::<()>().await;
        }
        let attempt = self.connector.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if self.connector.fail_write == Some(attempt) {
            return Err(MediaError::Send("broken pipe".into()));
        }

        let _ = self.connector.tx.send(Written {
            at: Instant::now(),
            sequence: frame.sequence(),
            fallback: frame.is_fallback(),
            len: frame.data.len(),
        });
        Ok(())
    }
}
