//! JSON-lines log of every report sent to the controller.
//!
//! One object per line, each stamped with the wall-clock time it was written
//! and the index of the measurement window it belongs to. The file is
//! truncated when the log is opened and flushed after every entry, so a
//! crashed session still leaves every completed report on disk.

use crate::metrics::{LatencyReport, ThroughputReport};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// A report as recorded in the log.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReportRecord<'a> {
    Throughput(&'a ThroughputReport),
    Latency(&'a LatencyReport),
}

#[derive(Debug, Serialize)]
struct LogEntry<'a> {
    timestamp: chrono::DateTime<chrono::Utc>,
    window: u64,
    report: ReportRecord<'a>,
}

pub struct ReportLog {
    path: PathBuf,
    writer: BufWriter<File>,
    entries: usize,
}

impl ReportLog {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to open report log {}", path.display()))?;

        debug!("Writing reports to {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            entries: 0,
        })
    }

    pub fn append(&mut self, window: u64, report: ReportRecord<'_>) -> Result<()> {
        let entry = LogEntry {
            timestamp: chrono::Utc::now(),
            window,
            report,
        };
        serde_json::to_writer(&mut self.writer, &entry)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.entries += 1;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> usize {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::validity::Independence;

    #[test]
    fn test_reports_are_appended_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports.jsonl");
        let mut log = ReportLog::create(&path).unwrap();

        let throughput = ThroughputReport {
            rx_bytes: 1_000,
            rx_reqs: 10,
            tx_bytes: 500,
            tx_reqs: 10,
            duration_secs: 2.5,
            interarrival_correct: true,
        };
        let latency = LatencyReport {
            throughput: throughput.clone(),
            sample_count: 0,
            mean_latency: 1234,
            percentiles: Vec::new(),
            independence: Independence::AtLag(5),
            stationary: false,
        };
        log.append(1, ReportRecord::Throughput(&throughput)).unwrap();
        log.append(2, ReportRecord::Latency(&latency)).unwrap();
        assert_eq!(log.entries(), 2);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);

        assert_eq!(lines[0]["window"], 1);
        assert_eq!(lines[0]["report"]["kind"], "throughput");
        assert_eq!(lines[0]["report"]["rx_bytes"], 1_000);
        assert!(lines[0]["timestamp"].is_string());

        assert_eq!(lines[1]["report"]["kind"], "latency");
        assert_eq!(lines[1]["report"]["mean_latency"], 1234);
        assert_eq!(lines[1]["report"]["independence"]["AtLag"], 5);
    }

    #[test]
    fn test_log_is_truncated_on_create() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports.jsonl");
        std::fs::write(&path, "stale\n").unwrap();

        let log = ReportLog::create(&path).unwrap();
        assert_eq!(log.path(), path.as_path());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }
}
