//! Output side: emits a frame on every tick regardless of input health

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::media::{FrameSink, SinkConnector};
use crate::output::FallbackFrameGenerator;
use crate::pipeline::FrameSlot;
use crate::{Frame, MediaError};

/// Tick timing and sink behaviour
#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Fixed output cadence
    pub interval: Duration,
    /// Held frames this old or older are replaced by the fallback
    pub stale_after: Duration,
    pub fallback_message: String,
    /// Minimum gap between sink open attempts
    pub sink_retry: Duration,
    /// Bound on every sink open, write and close
    pub io_timeout: Duration,
    /// Copy mode: held chunks are written once and fallback frames are skipped
    pub passthrough: bool,
}

/// Counters returned when the driver stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub ticks: u64,
    pub live: u64,
    pub fallback: u64,
    pub writes: u64,
    pub skipped: u64,
    pub sink_errors: u64,
}

pub struct OutputDriver<C: SinkConnector> {
    connector: C,
    slot: Arc<FrameSlot>,
    generator: FallbackFrameGenerator,
    settings: DriverSettings,
    stats: DriverStats,
    stale: Option<bool>,
}

impl<C: SinkConnector> OutputDriver<C> {
    pub fn new(
        connector: C,
        slot: Arc<FrameSlot>,
        generator: FallbackFrameGenerator,
        settings: DriverSettings,
    ) -> Self {
        Self {
            connector,
            slot,
            generator,
            settings,
            stats: DriverStats::default(),
            stale: None,
        }
    }

    /// Pick what to emit at `now`: the held frame while it is fresh, a newly
    /// rendered fallback when the slot is empty or the frame is stale.
    pub fn frame_for_tick(&self, now: Instant) -> Arc<Frame> {
        match self.slot.get_at(now) {
            Some(read) if read.age < self.settings.stale_after => read.frame,
            _ => Arc::new(
                self.generator
                    .generate(&self.settings.fallback_message, now),
            ),
        }
    }

    /// Tick until `cancel` fires, then close the sink
    #[instrument(name = "output_driver", skip_all)]
    pub async fn run(mut self, cancel: CancellationToken) -> DriverStats {
        info!(
            interval_ms = self.settings.interval.as_millis() as u64,
            stale_after_ms = self.settings.stale_after.as_millis() as u64,
            "Output driver started"
        );

        let mut ticker = tokio::time::interval(self.settings.interval);
        // Burst keeps the frame count in step with wall-clock for sinks that
        // timestamp by frame index
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

        let mut sink: Option<C::Sink> = None;
        let mut next_open = Instant::now();
        // Identity of the last frame handed to the sink. Sequence numbers restart
        // with every input session, so they cannot tell a new chunk from a repeat.
        let mut last_written: Option<Weak<Frame>> = None;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let now = Instant::now();
            let frame = self.frame_for_tick(now);
            self.record_tick(&frame);

            if sink.is_none() && now >= next_open {
                let opened = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    opened = tokio::time::timeout(self.settings.io_timeout, self.connector.open()) => opened,
                };
                match flatten(opened, "sink open", self.settings.io_timeout) {
                    Ok(opened) => {
                        info!("Output sink opened");
                        sink = Some(opened);
                        last_written = None;
                    }
                    Err(error) => {
                        warn!(%error, "Failed to open output sink, will retry");
                        self.stats.sink_errors += 1;
                        metrics::counter!("holdover_sink_errors_total").increment(1);
                        next_open = now + self.settings.sink_retry;
                    }
                }
            }

            let Some(active) = sink.as_mut() else {
                continue;
            };

            if self.settings.passthrough
                && (frame.is_fallback()
                    || last_written
                        .as_ref()
                        .is_some_and(|written| written.as_ptr() == Arc::as_ptr(&frame)))
            {
                self.stats.skipped += 1;
                continue;
            }

            let written = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                written = tokio::time::timeout(self.settings.io_timeout, active.write(&frame)) => written,
            };
            match flatten(written, "sink write", self.settings.io_timeout) {
                Ok(()) => {
                    self.stats.writes += 1;
                    last_written = Some(Arc::downgrade(&frame));
                }
                Err(error) => {
                    warn!(%error, "Failed to write frame to sink, reopening");
                    self.stats.sink_errors += 1;
                    metrics::counter!("holdover_sink_errors_total").increment(1);
                    if let Some(mut broken) = sink.take() {
                        let _ = tokio::time::timeout(self.settings.io_timeout, broken.close()).await;
                    }
                    next_open = now + self.settings.sink_retry;
                }
            }
        }

        if let Some(mut active) = sink.take() {
            match tokio::time::timeout(self.settings.io_timeout, active.close()).await {
                Ok(Ok(())) => debug!("Output sink closed"),
                Ok(Err(error)) => warn!(%error, "Error while closing output sink"),
                Err(_) => warn!("Timed out closing output sink"),
            }
        }

        info!(
            ticks = self.stats.ticks,
            fallback = self.stats.fallback,
            sink_errors = self.stats.sink_errors,
            "Output driver stopped"
        );
        self.stats
    }

    fn record_tick(&mut self, frame: &Frame) {
        self.stats.ticks += 1;
        metrics::counter!("holdover_ticks_total").increment(1);

        let stale = frame.is_fallback();
        if stale {
            self.stats.fallback += 1;
            metrics::counter!("holdover_fallback_ticks_total").increment(1);
        } else {
            self.stats.live += 1;
        }

        if self.stale != Some(stale) {
            if stale {
                info!("No fresh input, emitting fallback frames");
            } else {
                info!(sequence = frame.sequence(), "Input frames flowing to output");
            }
            self.stale = Some(stale);
        }
    }
}

fn flatten<T>(
    result: Result<Result<T, MediaError>, tokio::time::error::Elapsed>,
    op: &'static str,
    after: Duration,
) -> Result<T, MediaError> {
    match result {
        Ok(inner) => inner,
        Err(_) => Err(MediaError::Timeout { op, after }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;

    struct NullConnector;
    struct NullSink;

    #[async_trait]
    impl SinkConnector for NullConnector {
        type Sink = NullSink;

        async fn open(&self) -> Result<NullSink, MediaError> {
            Ok(NullSink)
        }
    }

    #[async_trait]
    impl FrameSink for NullSink {
        async fn write(&mut self, _frame: &Frame) -> Result<(), MediaError> {
            Ok(())
        }
    }

    fn driver(slot: Arc<FrameSlot>) -> OutputDriver<NullConnector> {
        OutputDriver::new(
            NullConnector,
            slot,
            FallbackFrameGenerator::new(16, 8),
            DriverSettings {
                interval: Duration::from_millis(40),
                stale_after: Duration::from_secs(2),
                fallback_message: "No frames received".into(),
                sink_retry: Duration::from_secs(1),
                io_timeout: Duration::from_secs(1),
                passthrough: false,
            },
        )
    }

    fn frame(seq: u64) -> Frame {
        Frame::rgb(seq, 16, 8, Bytes::from(vec![7; 16 * 8 * 3]), Instant::now())
    }

    #[tokio::test(start_paused = true)]
    async fn empty_slot_yields_fallback() {
        let driver = driver(Arc::new(FrameSlot::new()));
        assert!(driver.frame_for_tick(Instant::now()).is_fallback());
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_frame_is_replayed_unchanged() {
        let slot = Arc::new(FrameSlot::new());
        let driver = driver(Arc::clone(&slot));
        let start = Instant::now();
        slot.put_at(frame(1), start);

        for ms in [0u64, 500, 1000, 1999] {
            let out = driver.frame_for_tick(start + Duration::from_millis(ms));
            assert_eq!(out.sequence(), 1);
            assert_eq!(out.data, Bytes::from(vec![7; 16 * 8 * 3]));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stale_boundary_is_inclusive() {
        let slot = Arc::new(FrameSlot::new());
        let driver = driver(Arc::clone(&slot));
        let start = Instant::now();
        slot.put_at(frame(1), start);

        assert!(driver.frame_for_tick(start + Duration::from_secs(2)).is_fallback());
        slot.put_at(frame(2), start + Duration::from_secs(3));
        assert_eq!(driver.frame_for_tick(start + Duration::from_millis(3001)).sequence(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_at_fixed_cadence_without_input() {
        let driver = driver(Arc::new(FrameSlot::new()));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(driver.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(1010)).await;
        cancel.cancel();
        let stats = handle.await.unwrap();

        // Ticks at 0, 40, ..., 1000ms
        assert_eq!(stats.ticks, 26);
        assert_eq!(stats.fallback, 26);
        assert_eq!(stats.writes, 26);
    }

    /// Forwards every written payload to the test
    #[derive(Clone)]
    struct RecordingConnector(flume::Sender<Bytes>);
    struct RecordingSink(flume::Sender<Bytes>);

    #[async_trait]
    impl SinkConnector for RecordingConnector {
        type Sink = RecordingSink;

        async fn open(&self) -> Result<RecordingSink, MediaError> {
            Ok(RecordingSink(self.0.clone()))
        }
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn write(&mut self, frame: &Frame) -> Result<(), MediaError> {
            let _ = self.0.send(frame.data.clone());
            Ok(())
        }
    }

    fn passthrough_driver(slot: Arc<FrameSlot>) -> (OutputDriver<RecordingConnector>, flume::Receiver<Bytes>) {
        let (tx, rx) = flume::unbounded();
        let driver = OutputDriver::new(
            RecordingConnector(tx),
            slot,
            FallbackFrameGenerator::new(16, 8),
            DriverSettings {
                interval: Duration::from_millis(40),
                stale_after: Duration::from_secs(2),
                fallback_message: "No frames received".into(),
                sink_retry: Duration::from_secs(1),
                io_timeout: Duration::from_secs(1),
                passthrough: true,
            },
        );
        (driver, rx)
    }

    fn chunk(seq: u64, payload: &'static [u8]) -> Frame {
        Frame::packet(seq, Bytes::from_static(payload), Instant::now())
    }

    #[tokio::test(start_paused = true)]
    async fn passthrough_writes_each_chunk_once() {
        let slot = Arc::new(FrameSlot::new());
        let (driver, rx) = passthrough_driver(Arc::clone(&slot));
        slot.put(chunk(1, b"chunk-1"));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(driver.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        slot.put(chunk(2, b"chunk-2"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        let stats = handle.await.unwrap();

        let written: Vec<Bytes> = rx.drain().collect();
        assert_eq!(written, vec![Bytes::from_static(b"chunk-1"), Bytes::from_static(b"chunk-2")]);
        assert_eq!(stats.writes, 2);
        assert_eq!(stats.skipped, stats.ticks - 2);
    }

    #[tokio::test(start_paused = true)]
    async fn passthrough_skips_fallback_frames() {
        let (driver, rx) = passthrough_driver(Arc::new(FrameSlot::new()));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(driver.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        let stats = handle.await.unwrap();

        assert!(rx.is_empty());
        assert!(stats.ticks > 0);
        assert_eq!(stats.fallback, stats.ticks);
        assert_eq!(stats.skipped, stats.ticks);
        assert_eq!(stats.writes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn passthrough_writes_new_session_with_reused_sequence() {
        let slot = Arc::new(FrameSlot::new());
        let (driver, rx) = passthrough_driver(Arc::clone(&slot));
        slot.put(chunk(1, b"session1-chunk1"));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(driver.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Reconnected input restarts its numbering
        slot.put(chunk(1, b"session2-chunk1"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap();

        let written: Vec<Bytes> = rx.drain().collect();
        assert_eq!(
            written,
            vec![
                Bytes::from_static(b"session1-chunk1"),
                Bytes::from_static(b"session2-chunk1"),
            ]
        );
    }
}
