//! # Paced Sender
//!
//! Drives one flow at a fixed bit rate: a chunk, then a sleep for whatever
//! is left of the chunk's time budget. Once per second (by clock, not by
//! chunk count) the transport's smoothed RTT and congestion window are
//! copied into an in-memory buffer, which is appended to the shared metrics
//! log in one write after the stream has been closed.

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::error::{ConfigError, FlowError};
use crate::metrics_log::{self, Sample};

/// Rate used when a sender is started without one.
pub const DEFAULT_RATE_MBPS: f64 = 15.0;

const SAMPLE_PERIOD: Duration = Duration::from_secs(1);

/// The transport capabilities a paced flow needs.
#[allow(async_fn_in_trait)]
pub trait FlowStream {
    async fn send_chunk(&mut self, chunk: &Bytes) -> Result<(), FlowError>;

    /// Signals end of stream to the peer.
    async fn finish(&mut self) -> Result<(), FlowError>;

    /// `None` when the engine has no estimate yet.
    fn smoothed_rtt_ms(&self) -> Option<f64>;

    fn congestion_window(&self) -> Option<u64>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PacingParams {
    pub duration: Duration,
    pub target_rate_mbps: f64,
    pub chunk_size: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlowStats {
    pub bytes_sent: u64,
    pub duration: Duration,
    pub throughput_mbps: f64,
}

/// Time budget of one chunk at the target rate.
pub fn pacing_interval(target_rate_mbps: f64, chunk_size: usize) -> Duration {
    let bytes_per_sec = target_rate_mbps * 1e6 / 8.0;
    if !(bytes_per_sec > 0.0) {
        return Duration::ZERO;
    }
    // a rate too small to express just never sends a second chunk
    Duration::try_from_secs_f64(chunk_size as f64 / bytes_per_sec).unwrap_or(Duration::MAX)
}

/// Parses a target rate in Mbps; it must be positive and finite.
pub fn parse_rate(s: &str) -> Result<f64, ConfigError> {
    let rate: f64 = s.trim().parse().map_err(|_| ConfigError::NotPositive {
        what: "rate",
        value: f64::NAN,
    })?;
    if !(rate.is_finite() && rate > 0.0) {
        return Err(ConfigError::NotPositive { what: "rate", value: rate });
    }
    Ok(rate)
}

/// Result of the send loop: stats plus the samples gathered so far, which
/// are kept even if a send failed part way.
#[derive(Debug)]
pub struct PacedOutcome {
    pub stats: FlowStats,
    pub samples: Vec<Sample>,
    pub error: Option<FlowError>,
}

/// The timing-sensitive loop. No file I/O happens in here.
pub async fn run_paced<S: FlowStream>(stream: &mut S, params: &PacingParams) -> PacedOutcome {
    let chunk = Bytes::from(vec![b'x'; params.chunk_size]);
    let interval = pacing_interval(params.target_rate_mbps, params.chunk_size);
    let expected = (params.duration.as_secs() as usize).max(1);
    let mut samples = Vec::with_capacity(expected);

    let start = Instant::now();
    let end = start + params.duration;
    let mut last_sample = start;
    let mut bytes_sent = 0u64;
    let mut error = None;

    while Instant::now() < end {
        let now = Instant::now();

        if let Err(e) = stream.send_chunk(&chunk).await {
            error = Some(e);
            break;
        }
        bytes_sent += chunk.len() as u64;

        if now.duration_since(last_sample) >= SAMPLE_PERIOD {
            samples.push(Sample {
                time: now.duration_since(start).as_secs(),
                rtt_ms: stream.smoothed_rtt_ms().unwrap_or(0.0),
                cwnd_bytes: stream.congestion_window(),
            });
            last_sample = now;
        }

        // an overrun send simply skips the sleep; no debt carries over
        match now.checked_add(interval) {
            Some(next) => tokio::time::sleep_until(next).await,
            None => tokio::time::sleep_until(end).await,
        }
    }

    let duration = start.elapsed();
    let secs = duration.as_secs_f64();
    let throughput_mbps = if secs > 0.0 {
        bytes_sent as f64 * 8.0 / (secs * 1e6)
    } else {
        0.0
    };

    PacedOutcome {
        stats: FlowStats {
            bytes_sent,
            duration,
            throughput_mbps,
        },
        samples,
        error,
    }
}

/// One complete flow: paced sending, end of stream, then the single
/// batched append of its samples to `metrics_file`.
pub async fn send_flow<S: FlowStream>(
    stream: &mut S,
    params: &PacingParams,
    metrics_file: Option<&Path>,
) -> Result<FlowStats, FlowError> {
    let outcome = run_paced(stream, params).await;

    let finished = match outcome.error {
        Some(e) => Err(e),
        None => stream.finish().await,
    };

    if let Some(path) = metrics_file {
        match metrics_log::append_batch(path, &outcome.samples) {
            Ok(()) => tracing::debug!(
                samples = outcome.samples.len(),
                path = %path.display(),
                "metrics written"
            ),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to write metrics"),
        }
    }

    finished?;
    tracing::info!(
        bytes_sent = outcome.stats.bytes_sent,
        duration_s = %format!("{:.2}", outcome.stats.duration.as_secs_f64()),
        throughput_mbps = %format!("{:.2}", outcome.stats.throughput_mbps),
        "flow complete"
    );
    Ok(outcome.stats)
}
