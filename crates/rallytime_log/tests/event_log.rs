use anyhow::Result;
use chrono::{Duration, NaiveDate, TimeZone, Utc};
use rallytime_log::{EventLog, EventLogOptions};
use rallytime_protocol::{GateId, LogRecord, PartitionKey};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::Arc;

fn gate(id: &str) -> GateId {
    GateId::parse(id).unwrap()
}

fn key(id: &str) -> PartitionKey {
    PartitionKey::new(gate(id), NaiveDate::from_ymd_opt(2024, 5, 1).unwrap())
}

fn pass(id: &str, n: i64) -> LogRecord {
    let base = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
    LogRecord::pass(gate(id), base + Duration::milliseconds(n * 250))
}

#[test]
fn test_single_append_round_trip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = EventLog::open(dir.path())?;

    let record = pass("G1", 0);
    log.append(&key("G1"), &record)?;

    assert_eq!(log.read_all(&key("G1"))?, vec![record]);
    let path = log.partition_path(&key("G1"));
    assert_eq!(
        path,
        dir.path().join("gates").join("G1").join("pass-20240501.ndjson")
    );
    Ok(())
}

#[test]
fn test_appends_read_back_in_order() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = EventLog::open(dir.path())?;

    let records: Vec<LogRecord> = (0..25).map(|n| pass("G1", n)).collect();
    for record in &records {
        log.append(&key("G1"), record)?;
    }

    assert_eq!(log.read_all(&key("G1"))?, records);
    let text = fs::read_to_string(log.partition_path(&key("G1")))?;
    assert_eq!(text.lines().count(), 25);
    assert!(text.ends_with('\n'));
    Ok(())
}

#[test]
fn test_missing_partition_reads_empty() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = EventLog::open(dir.path())?;
    assert!(log.read_all(&key("nobody"))?.is_empty());
    assert_eq!(log.len(&key("nobody"))?, 0);
    assert!(log.read_from(&key("nobody"), 0)?.is_empty());
    Ok(())
}

#[test]
fn test_truncate_is_idempotent() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = EventLog::open(dir.path())?;

    log.truncate(&key("G1"))?;
    assert!(log.read_all(&key("G1"))?.is_empty());
    assert_eq!(log.len(&key("G1"))?, 0);

    for n in 0..3 {
        log.append(&key("G1"), &pass("G1", n))?;
    }
    log.truncate(&key("G1"))?;
    assert!(log.read_all(&key("G1"))?.is_empty());
    assert_eq!(log.len(&key("G1"))?, 0);

    log.truncate(&key("G1"))?;
    assert!(log.read_all(&key("G1"))?.is_empty());

    log.append(&key("G1"), &pass("G1", 7))?;
    assert_eq!(log.read_all(&key("G1"))?, vec![pass("G1", 7)]);
    Ok(())
}

#[test]
fn test_malformed_lines_are_skipped() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = EventLog::open(dir.path())?;
    log.append(&key("G1"), &pass("G1", 0))?;

    let path = log.partition_path(&key("G1"));
    let mut file = OpenOptions::new().append(true).open(&path)?;
    file.write_all(b"this is not json\n")?;
    file.write_all(b"{\"gate_id\":\"G1\"}\n")?;
    file.write_all(b"\n")?;
    drop(file);

    log.append(&key("G1"), &pass("G1", 1))?;

    let report = log.read_all_report(&key("G1"))?;
    assert_eq!(report.records, vec![pass("G1", 0), pass("G1", 1)]);
    assert_eq!(report.skipped, 2);
    Ok(())
}

#[test]
fn test_partitions_are_independent() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = EventLog::open(dir.path())?;

    log.append(&key("G1"), &pass("G1", 0))?;
    log.append(&key("G2"), &pass("G2", 0))?;
    log.truncate(&key("G1"))?;

    assert!(log.read_all(&key("G1"))?.is_empty());
    assert_eq!(log.read_all(&key("G2"))?, vec![pass("G2", 0)]);

    let next_day = PartitionKey::new(gate("G2"), NaiveDate::from_ymd_opt(2024, 5, 2).unwrap());
    assert!(log.read_all(&next_day)?.is_empty());
    Ok(())
}

#[test]
fn test_concurrent_writers_never_tear_lines() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = Arc::new(EventLog::with_options(
        dir.path(),
        EventLogOptions { fsync: false },
    )?);

    let handles: Vec<_> = (0..4)
        .map(|writer| {
            let log = Arc::clone(&log);
            std::thread::spawn(move || {
                for n in 0..50 {
                    let mut record = pass("G1", n);
                    record
                        .extra
                        .insert("writer".to_string(), serde_json::json!(writer));
                    log.append(&key("G1"), &record).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let report = log.read_all_report(&key("G1"))?;
    assert_eq!(report.skipped, 0);
    assert_eq!(report.records.len(), 200);

    // Each writer's own records stay in the order it wrote them.
    for writer in 0..4 {
        let mine: Vec<_> = report
            .records
            .iter()
            .filter(|r| r.extra["writer"] == writer)
            .map(|r| r.ts)
            .collect();
        assert_eq!(mine.len(), 50);
        assert!(mine.windows(2).all(|w| w[0] < w[1]));
    }
    Ok(())
}

#[test]
fn test_read_from_offset() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = EventLog::open(dir.path())?;
    let first_end = log.append(&key("G1"), &pass("G1", 0))?;
    log.append(&key("G1"), &pass("G1", 1))?;

    let tail = log.read_from(&key("G1"), first_end)?;
    let text = String::from_utf8(tail)?;
    assert_eq!(LogRecord::from_ndjson_line(&text)?, pass("G1", 1));
    Ok(())
}
