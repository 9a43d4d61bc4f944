use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::topology::{check_host_count, TopologyKind};

/// UDP port every passive receiver listens on.
pub const DEFAULT_PORT: u16 = 4433;

/// Bytes per paced send.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// A link delay as written on the command line: `500us`, `2ms`, `1s`.
///
/// A bare number is taken as milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Delay(Duration);

impl Delay {
    pub fn from_millis(ms: u64) -> Self {
        Delay(Duration::from_millis(ms))
    }

    pub fn as_duration(self) -> Duration {
        self.0
    }

    pub fn as_micros(self) -> u64 {
        self.0.as_micros() as u64
    }
}

impl FromStr for Delay {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let invalid = || ConfigError::InvalidDelay(s.to_string());

        let split = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(trimmed.len());
        let (number, unit) = trimmed.split_at(split);
        let value: f64 = number.parse().map_err(|_| invalid())?;
        if !value.is_finite() || value < 0.0 {
            return Err(invalid());
        }

        let secs = match unit.trim() {
            "us" => value / 1e6,
            "" | "ms" => value / 1e3,
            "s" => value,
            _ => return Err(invalid()),
        };
        Duration::try_from_secs_f64(secs).map(Delay).map_err(|_| invalid())
    }
}

impl fmt::Display for Delay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let us = self.0.as_micros();
        if us % 1_000_000 == 0 && us > 0 {
            write!(f, "{}s", us / 1_000_000)
        } else if us % 1_000 == 0 {
            write!(f, "{}ms", us / 1_000)
        } else {
            write!(f, "{us}us")
        }
    }
}

impl TryFrom<String> for Delay {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Delay> for String {
    fn from(value: Delay) -> Self {
        value.to_string()
    }
}

/// Formats a parameter for directory names and tables: `15`, `2.5`.
pub fn fmt_param(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        format!("{value}")
    }
}

/// Empirical waits around the measurement window.
///
/// Correctness of the throughput numbers, not only precision, depends on
/// these being long enough: receivers must be listening before the first
/// sender connects, and every sender must have finished and flushed its
/// samples before counters are re-read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunTimings {
    /// Wait after starting receivers, before the `before` snapshot.
    pub settle: Duration,
    /// Extra time allowed past `duration` for senders to finish.
    pub drain: Duration,
}

impl Default for RunTimings {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(2),
            drain: Duration::from_secs(4),
        }
    }
}

/// Parameters for a single measurement run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub topology: TopologyKind,
    /// Capacity of the first bottleneck in Mbps; later stages derive from it.
    pub bandwidth_mbps: f64,
    pub delay: Delay,
    pub jitter: Option<Delay>,
    pub loss_pct: f64,
    pub duration: Duration,
    pub hosts: usize,
    pub output_dir: PathBuf,
    pub chunk_size: usize,
    pub port: u16,
    pub timings: RunTimings,
}

impl RunConfig {
    /// A config with the harness defaults and the directory naming used
    /// when no output directory is given.
    pub fn new(topology: TopologyKind, bandwidth_mbps: f64, delay: Delay, loss_pct: f64) -> Self {
        Self {
            topology,
            bandwidth_mbps,
            delay,
            jitter: None,
            loss_pct,
            duration: Duration::from_secs(60),
            hosts: 40,
            output_dir: default_output_dir(topology, bandwidth_mbps, delay, loss_pct),
            chunk_size: DEFAULT_CHUNK_SIZE,
            port: DEFAULT_PORT,
            timings: RunTimings::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_host_count(self.hosts)?;
        if !(self.bandwidth_mbps > 0.0) {
            return Err(ConfigError::NotPositive {
                what: "bandwidth",
                value: self.bandwidth_mbps,
            });
        }
        if self.duration.is_zero() {
            return Err(ConfigError::NotPositive {
                what: "duration",
                value: 0.0,
            });
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::NotPositive {
                what: "chunk size",
                value: 0.0,
            });
        }
        if !(0.0..=100.0).contains(&self.loss_pct) {
            return Err(ConfigError::Loss(self.loss_pct));
        }
        Ok(())
    }
}

/// `dumbbell_bw15_delay2ms_loss2`
pub fn default_output_dir(
    topology: TopologyKind,
    bandwidth_mbps: f64,
    delay: Delay,
    loss_pct: f64,
) -> PathBuf {
    PathBuf::from(format!(
        "{topology}_bw{}_delay{delay}_loss{}",
        fmt_param(bandwidth_mbps),
        loss_pct.trunc() as i64
    ))
}
