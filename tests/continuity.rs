mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::time::Instant;

use common::{config, generator, ms, RecordingConnector, ScriptedSource, Session, Written, FRAME_BYTES};
use holdover::ContinuityController;

fn write_at(writes: &[Written], start: Instant, offset: u64) -> &Written {
    writes
        .iter()
        .find(|w| w.at >= start + ms(offset))
        .unwrap_or_else(|| panic!("no write at or after {offset}ms"))
}

#[tokio::test(start_paused = true)]
async fn replays_last_frame_then_falls_back_then_recovers() {
    let start = Instant::now();
    let source = ScriptedSource::new(start, vec![Session::FramesAt(vec![ms(0), ms(3000)])], Session::Hang);
    let (connector, rx) = RecordingConnector::new();

    let controller = ContinuityController::new(Arc::new(config(2.0, 10)), source, connector, generator());
    let report = controller.run(tokio::time::sleep(ms(3500))).await;
    assert!(report.clean());

    let writes: Vec<Written> = rx.drain().collect();
    for offset in [500, 1000, 1500] {
        let w = write_at(&writes, start, offset);
        assert!(!w.fallback, "tick at {offset}ms should replay the held frame");
        assert_eq!(w.sequence, 1);
    }

    assert!(write_at(&writes, start, 2000).fallback, "age equal to the timeout is stale");
    assert!(write_at(&writes, start, 2500).fallback);

    let recovered = write_at(&writes, start, 3100);
    assert!(!recovered.fallback);
    assert_eq!(recovered.sequence, 2);

    // Live and fallback frames share the output geometry
    assert!(writes.iter().all(|w| w.len == FRAME_BYTES));
}

#[tokio::test(start_paused = true)]
async fn unreachable_input_gets_fallback_from_the_first_tick() {
    let start = Instant::now();
    let source = ScriptedSource::new(start, vec![], Session::Refuse);
    let (connector, rx) = RecordingConnector::new();

    let controller = ContinuityController::new(Arc::new(config(2.0, 10)), source, connector, generator());
    let report = controller.run(tokio::time::sleep(ms(1000))).await;

    let writes: Vec<Written> = rx.drain().collect();
    assert!(writes.len() >= 10, "got {} writes", writes.len());
    assert!(writes.iter().all(|w| w.fallback));
    assert_eq!(writes[0].at, start);

    let reader = report.reader.unwrap();
    assert!(reader.connect_attempts >= 1);
    assert_eq!(reader.sessions, 0);
    assert_eq!(report.state_changes, 0);
}

#[tokio::test(start_paused = true)]
async fn keeps_reconnecting_until_input_appears() {
    let start = Instant::now();
    let failures = 20;
    let mut script = vec![Session::Refuse; failures];
    script.push(Session::Periodic {
        period: ms(100),
        count: u64::MAX,
    });
    let source = ScriptedSource::new(start, script, Session::Hang);
    let opens = source.opens();
    let (connector, rx) = RecordingConnector::new();

    let mut config = config(2.0, 10);
    config.input.backoff.initial_ms = 100;
    config.input.backoff.max_ms = 100;

    let controller = ContinuityController::new(Arc::new(config), source, connector, generator());
    let report = controller.run(tokio::time::sleep(ms(5000))).await;

    assert_eq!(opens.load(Ordering::SeqCst), failures as u64 + 1);
    let reader = report.reader.unwrap();
    assert_eq!(reader.connect_attempts, failures as u64 + 1);
    assert_eq!(reader.sessions, 1);
    assert_eq!(report.state_changes, 1);

    let writes: Vec<Written> = rx.drain().collect();
    assert!(writes.first().unwrap().fallback);
    assert!(!writes.last().unwrap().fallback);
}

#[tokio::test(start_paused = true)]
async fn output_cadence_survives_input_loss() {
    let start = Instant::now();
    let source = ScriptedSource::new(
        start,
        vec![Session::Periodic {
            period: ms(100),
            count: 5,
        }],
        Session::Refuse,
    );
    let (connector, rx) = RecordingConnector::new();

    let controller = ContinuityController::new(Arc::new(config(1.0, 10)), source, connector, generator());
    let report = controller.run(tokio::time::sleep(ms(4000))).await;
    assert!(report.clean());

    let writes: Vec<Written> = rx.drain().collect();
    for pair in writes.windows(2) {
        assert_eq!(pair[1].at - pair[0].at, ms(100), "output stalled");
    }

    assert!(!write_at(&writes, start, 600).fallback);
    // Last frame landed at 500ms, so it goes stale at 1500ms
    assert!(write_at(&writes, start, 1500).fallback);
    assert!(writes.last().unwrap().fallback);
}

#[tokio::test(start_paused = true)]
async fn shutdown_completes_within_grace_even_with_hung_io() {
    let start = Instant::now();
    let source = ScriptedSource::new(start, vec![], Session::Hang);
    let (connector, _rx) = RecordingConnector::new();
    let connector = connector.hanging_writes();

    let config = Arc::new(config(2.0, 25));
    let grace = config.shutdown_grace();
    let controller = ContinuityController::new(config, source, connector, generator());
    let report = controller.run(tokio::time::sleep(ms(1000))).await;

    assert!(report.clean());
    assert!(start.elapsed() <= ms(1000) + grace);
}

#[tokio::test(start_paused = true)]
async fn nothing_is_written_after_shutdown() {
    let start = Instant::now();
    let source = ScriptedSource::new(
        start,
        vec![Session::Periodic {
            period: ms(40),
            count: u64::MAX,
        }],
        Session::Refuse,
    );
    let (connector, rx) = RecordingConnector::new();

    let controller = ContinuityController::new(Arc::new(config(2.0, 25)), source, connector, generator());
    let slot = controller.slot();
    let report = controller.run(tokio::time::sleep(ms(1000))).await;
    assert!(report.slot.written > 0);

    // Give any stray task a chance to write
    tokio::time::sleep(ms(500)).await;

    let writes: Vec<Written> = rx.drain().collect();
    assert!(writes.iter().all(|w| w.at <= start + ms(1000)));
    assert_eq!(writes.len() as u64, report.driver.unwrap().writes);
    assert_eq!(slot.stats().written, report.slot.written);
    assert!(slot.last_updated().is_some_and(|at| at <= start + ms(1000)));
}

#[tokio::test(start_paused = true)]
async fn shutdown_token_stops_the_run() {
    let start = Instant::now();
    let source = ScriptedSource::new(start, vec![], Session::Refuse);
    let (connector, _rx) = RecordingConnector::new();

    let controller = ContinuityController::new(Arc::new(config(2.0, 10)), source, connector, generator());
    let token = controller.shutdown_token();
    tokio::spawn(async move {
        tokio::time::sleep(ms(500)).await;
        token.cancel();
    });

    let report = controller.run(std::future::pending()).await;
    assert!(report.clean());
    assert!(start.elapsed() >= ms(500) && start.elapsed() < ms(600));
}

#[tokio::test(start_paused = true)]
async fn sink_open_failures_are_retried() {
    let start = Instant::now();
    let source = ScriptedSource::new(start, vec![], Session::Refuse);
    let (connector, rx) = RecordingConnector::new();
    let connector = connector.refusing_opens(2);
    let opens = connector.opens();

    // Default sink retry is one second
    let controller = ContinuityController::new(Arc::new(config(2.0, 10)), source, connector, generator());
    let report = controller.run(tokio::time::sleep(ms(3050))).await;

    let driver = report.driver.unwrap();
    assert_eq!(driver.sink_errors, 2);
    assert_eq!(opens.load(Ordering::SeqCst), 3);
    assert_eq!(driver.ticks, 31);

    let writes: Vec<Written> = rx.drain().collect();
    assert_eq!(writes.first().unwrap().at, start + ms(2000));
    assert_eq!(writes.len(), 11);
}

#[tokio::test(start_paused = true)]
async fn failed_write_reopens_the_sink() {
    let start = Instant::now();
    let source = ScriptedSource::new(start, vec![], Session::Refuse);
    let (connector, rx) = RecordingConnector::new();
    let connector = connector.failing_write(3);
    let opens = connector.opens();

    let controller = ContinuityController::new(Arc::new(config(2.0, 10)), source, connector, generator());
    let report = controller.run(tokio::time::sleep(ms(2050))).await;

    assert_eq!(report.driver.unwrap().sink_errors, 1);
    assert_eq!(opens.load(Ordering::SeqCst), 2);

    // Writes at 0 and 100ms, the one at 200ms fails, the sink is back at 1200ms
    let writes: Vec<Written> = rx.drain().collect();
    assert_eq!(writes[1].at, start + ms(100));
    assert_eq!(writes[2].at, start + ms(1200));
}
