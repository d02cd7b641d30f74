use anyhow::Result;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rallytime_ingest::{
    IngestOptions, IngestStats, IngestWorker, PassMessage, PassSource, TransportError,
};
use rallytime_log::EventLog;
use rallytime_protocol::{GateId, PartitionKey};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Replays a fixed script, then waits forever.
struct ScriptedSource {
    script: VecDeque<Result<PassMessage, TransportError>>,
    delivered: mpsc::UnboundedSender<tokio::time::Instant>,
}

impl PassSource for ScriptedSource {
    async fn next_message(&mut self) -> Result<PassMessage, TransportError> {
        match self.script.pop_front() {
            Some(step) => {
                if step.is_ok() {
                    let _ = self.delivered.send(tokio::time::Instant::now());
                }
                step
            }
            None => std::future::pending().await,
        }
    }
}

fn receipt() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
}

fn message(topic: &str, payload: &str) -> Result<PassMessage, TransportError> {
    Ok(PassMessage {
        topic: topic.to_string(),
        payload: payload.as_bytes().to_vec(),
        received_at: receipt(),
    })
}

fn g1_key() -> PartitionKey {
    PartitionKey::new(
        GateId::parse("G1").unwrap(),
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
    )
}

struct Running {
    shutdown: mpsc::Sender<()>,
    handle: JoinHandle<IngestStats>,
    delivered: mpsc::UnboundedReceiver<tokio::time::Instant>,
}

fn start(log: Arc<EventLog>, script: Vec<Result<PassMessage, TransportError>>) -> Running {
    let (tx, delivered) = mpsc::unbounded_channel();
    let source = ScriptedSource {
        script: script.into(),
        delivered: tx,
    };
    let (worker, shutdown) = IngestWorker::new(source, log, IngestOptions::default());
    Running {
        shutdown,
        handle: tokio::spawn(worker.run()),
        delivered,
    }
}

async fn wait_for(running: &mut Running, count: usize) {
    for _ in 0..count {
        running.delivered.recv().await.expect("delivery");
    }
    // Let the worker finish the append for the last delivery.
    tokio::time::sleep(Duration::from_millis(10)).await;
}

async fn stop(running: Running) -> Result<IngestStats> {
    running.shutdown.send(()).await?;
    Ok(running.handle.await?)
}

#[tokio::test(start_paused = true)]
async fn test_pass_without_timestamp_uses_receipt_time() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = Arc::new(EventLog::open(dir.path())?);

    let mut running = start(Arc::clone(&log), vec![message("rally/v1/gates/G1/pass", "")]);
    wait_for(&mut running, 1).await;
    let stats = stop(running).await?;

    let records = log.read_all(&g1_key())?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].ts, receipt());
    assert_eq!(records[0].gate_id.as_str(), "G1");
    assert_eq!(records[0].kind.as_deref(), Some("pass"));
    assert_eq!(stats.appended, 1);

    let on_disk = std::fs::read_to_string(
        dir.path().join("gates").join("G1").join("pass-20240501.ndjson"),
    )?;
    assert!(on_disk.contains(r#""type":"pass""#));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_numeric_tag_reads_back() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = Arc::new(EventLog::open(dir.path())?);

    let mut running = start(
        Arc::clone(&log),
        vec![
            message("rally/v1/gates/G1/pass", r#"{"tag":12345}"#),
            message("rally/v1/gates/G1/pass", r#"{"tag":{"epc":"E2001"}}"#),
        ],
    );
    wait_for(&mut running, 2).await;
    let stats = stop(running).await?;
    assert_eq!(stats.appended, 2);

    let report = log.read_all_report(&g1_key())?;
    assert_eq!(report.skipped, 0);
    assert_eq!(report.records.len(), 2);
    assert_eq!(report.records[0].tag.as_deref(), Some("12345"));
    assert_eq!(report.records[1].tag, None);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_foreign_topics_are_ignored() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = Arc::new(EventLog::open(dir.path())?);

    let mut running = start(
        Arc::clone(&log),
        vec![
            message("rally/v1/gates/G1/status", "UP"),
            message("rally/v1/gates/G1/pass", r#"{"device_id":"gate01"}"#),
            message("weather/temp", "12"),
        ],
    );
    wait_for(&mut running, 3).await;
    let stats = stop(running).await?;

    assert_eq!(stats.received, 3);
    assert_eq!(stats.appended, 1);
    assert_eq!(stats.ignored, 2);
    assert_eq!(log.read_all(&g1_key())?.len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_partition_is_receipt_day() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = Arc::new(EventLog::open(dir.path())?);

    // Device clock says yesterday; the message arrived today.
    let mut running = start(
        Arc::clone(&log),
        vec![message("rally/v1/gates/G1/pass", "2024-04-30T23:59:59Z")],
    );
    wait_for(&mut running, 1).await;
    stop(running).await?;

    let records = log.read_all(&g1_key())?;
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].ts,
        Utc.with_ymd_and_hms(2024, 4, 30, 23, 59, 59).unwrap()
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_transport_errors_back_off_then_resume() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = Arc::new(EventLog::open(dir.path())?);
    let started = tokio::time::Instant::now();

    let mut running = start(
        Arc::clone(&log),
        vec![
            Err(TransportError::Connection("refused".into())),
            Err(TransportError::Closed),
            message("rally/v1/gates/G1/pass", ""),
            Err(TransportError::Connection("reset".into())),
            message("rally/v1/gates/G1/pass", ""),
        ],
    );

    let first = running.delivered.recv().await.expect("first delivery");
    // 500ms then 1000ms of backoff before the first delivery.
    assert_eq!(first - started, Duration::from_millis(1500));

    let second = running.delivered.recv().await.expect("second delivery");
    // Backoff was reset by the successful delivery.
    assert_eq!(second - first, Duration::from_millis(500));

    tokio::time::sleep(Duration::from_millis(10)).await;
    let stats = stop(running).await?;
    assert_eq!(stats.reconnects, 3);
    assert_eq!(stats.appended, 2);
    assert_eq!(log.read_all(&g1_key())?.len(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_backoff() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = Arc::new(EventLog::open(dir.path())?);

    let running = start(
        Arc::clone(&log),
        vec![Err(TransportError::Connection("refused".into()))],
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stats = tokio::time::timeout(Duration::from_millis(50), stop(running)).await??;
    assert_eq!(stats.reconnects, 1);
    assert_eq!(stats.received, 0);
    Ok(())
}
