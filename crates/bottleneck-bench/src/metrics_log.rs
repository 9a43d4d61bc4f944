//! Shared per-run raw metrics log.
//!
//! Newline-delimited JSON, one `{time, rtt_ms, cwnd_bytes}` record per line.
//! Every sender appends its whole buffer in a single write once its send
//! loop is over; lines from different senders may interleave but are never
//! torn.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One per-second observation from one flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Whole seconds since the flow started sending.
    pub time: u64,
    pub rtt_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwnd_bytes: Option<u64>,
}

/// `<dir>/<epoch>_raw_metrics.json`
pub fn raw_metrics_path(dir: &Path, epoch: i64) -> PathBuf {
    dir.join(format!("{epoch}_raw_metrics.json"))
}

/// Appends all samples with one `write_all` on an `O_APPEND` handle.
pub fn append_batch(path: &Path, samples: &[Sample]) -> std::io::Result<()> {
    if samples.is_empty() {
        return Ok(());
    }
    let mut buf = Vec::with_capacity(samples.len() * 48);
    for s in samples {
        serde_json::to_writer(&mut buf, s)?;
        buf.push(b'\n');
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&buf)?;
    Ok(())
}

/// Parsed records plus the number of lines that were skipped.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    pub samples: Vec<Sample>,
    pub skipped: usize,
}

/// Reads every well-formed record; malformed lines are counted and skipped.
pub fn read_samples(path: &Path) -> std::io::Result<ReadOutcome> {
    let file = std::fs::File::open(path)?;
    let mut outcome = ReadOutcome::default();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<Sample>(trimmed) {
            Ok(sample) => outcome.samples.push(sample),
            Err(e) => {
                tracing::debug!(error = %e, line = trimmed, "skipping malformed metrics line");
                outcome.skipped += 1;
            }
        }
    }
    Ok(outcome)
}
