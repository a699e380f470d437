//! Composition root: wires reader, slot and driver, and owns shutdown

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::capture::{Backoff, ConnectionState, InputReader, ReaderStats, StateChange};
use crate::media::{FrameSource, SinkConnector};
use crate::output::{DriverSettings, DriverStats, FallbackFrameGenerator, OutputDriver};
use crate::pipeline::{FrameSlot, SlotStats};
use crate::{Codec, Config};

const STATE_EVENT_CAPACITY: usize = 64;

/// Outcome of a controller run
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// `None` if the reader had to be aborted or panicked
    pub reader: Option<ReaderStats>,
    pub driver: Option<DriverStats>,
    pub slot: SlotStats,
    pub state_changes: u64,
}

impl RunReport {
    /// Both activities acknowledged the stop within the grace period
    pub fn clean(&self) -> bool {
        self.reader.is_some() && self.driver.is_some()
    }
}

pub struct ContinuityController<S: FrameSource, C: SinkConnector> {
    config: Arc<Config>,
    source: S,
    connector: C,
    generator: FallbackFrameGenerator,
    slot: Arc<FrameSlot>,
    cancel: CancellationToken,
}

impl<S: FrameSource, C: SinkConnector> ContinuityController<S, C> {
    pub fn new(config: Arc<Config>, source: S, connector: C, generator: FallbackFrameGenerator) -> Self {
        Self {
            config,
            source,
            connector,
            generator,
            slot: Arc::new(FrameSlot::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shared frame slot, mostly useful for inspection in tests
    pub fn slot(&self) -> Arc<FrameSlot> {
        Arc::clone(&self.slot)
    }

    /// Token that stops the run when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn driver_settings(&self) -> DriverSettings {
        let config = &self.config;
        DriverSettings {
            interval: config.tick_interval(),
            stale_after: config.stale_timeout(),
            fallback_message: config.output.fallback_message.clone(),
            sink_retry: Duration::from_millis(config.output.sink_retry_ms),
            io_timeout: Duration::from_millis(config.output.write_timeout_ms),
            passthrough: config.encoder.codec == Codec::Copy,
        }
    }

    /// Run reader and driver until `shutdown` resolves or the shutdown token is
    /// cancelled, then stop both and wait up to the configured grace period.
    pub async fn run<F>(self, shutdown: F) -> RunReport
    where
        F: Future<Output = ()> + Send,
    {
        let settings = self.driver_settings();
        let grace = self.config.shutdown_grace();
        let Self {
            config,
            source,
            connector,
            generator,
            slot,
            cancel,
        } = self;

        info!(
            input = %config.input.url,
            output = %config.output.url,
            timeout_secs = config.output.timeout_secs,
            fps = config.output.fps,
            "Starting continuity pipeline"
        );

        let (events_tx, events_rx) = flume::bounded(STATE_EVENT_CAPACITY);
        let monitor = tokio::spawn(monitor_state(events_rx));

        let reader = InputReader::new(source, Arc::clone(&slot), Backoff::from(&config.input.backoff))
            .with_events(events_tx);
        let mut reader_handle = tokio::spawn(reader.run(cancel.child_token()));

        let driver = OutputDriver::new(connector, Arc::clone(&slot), generator, settings);
        let mut driver_handle = tokio::spawn(driver.run(cancel.child_token()));

        tokio::select! {
            _ = shutdown => info!("Shutdown requested"),
            _ = cancel.cancelled() => info!("Shutdown token cancelled"),
        }
        cancel.cancel();

        let deadline = Instant::now() + grace;
        let reader_stats = join_within(&mut reader_handle, deadline, "input reader").await;
        let driver_stats = join_within(&mut driver_handle, deadline, "output driver").await;
        let state_changes = monitor.await.unwrap_or_default();

        let report = RunReport {
            reader: reader_stats,
            driver: driver_stats,
            slot: slot.stats(),
            state_changes,
        };
        if report.clean() {
            info!(slot = ?report.slot, "Continuity pipeline stopped");
        } else {
            warn!("Continuity pipeline stopped uncleanly");
        }
        report
    }
}

async fn join_within<T>(handle: &mut JoinHandle<T>, deadline: Instant, name: &str) -> Option<T> {
    match tokio::time::timeout_at(deadline, &mut *handle).await {
        Ok(Ok(stats)) => Some(stats),
        Ok(Err(join_error)) => {
            error!(task = name, error = %join_error, "Task failed");
            None
        }
        Err(_) => {
            warn!(task = name, "Task did not stop within the grace period, aborting");
            handle.abort();
            None
        }
    }
}

/// Logs input state changes; returns how many it saw once the reader is gone
async fn monitor_state(events: flume::Receiver<StateChange>) -> u64 {
    let mut seen = 0;
    while let Ok(change) = events.recv_async().await {
        seen += 1;
        let streaming = change.to == ConnectionState::Streaming;
        metrics::gauge!("holdover_input_streaming").set(if streaming { 1.0 } else { 0.0 });
        match change.to {
            ConnectionState::Streaming => {
                info!(attempt = change.attempt, "Input connected, streaming")
            }
            ConnectionState::Reconnecting => {
                warn!(attempt = change.attempt, "Input lost, reconnecting")
            }
            ConnectionState::Connecting => info!("Input connecting"),
        }
    }
    seen
}
