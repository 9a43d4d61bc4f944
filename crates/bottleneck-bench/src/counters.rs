//! # Counter Sampler
//!
//! Cumulative per-interface byte counters and the throughput derived from
//! two snapshots of them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CounterError;
use crate::topology::Monitor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Transmitted,
    Received,
}

impl Direction {
    fn statistic(self) -> &'static str {
        match self {
            Direction::Transmitted => "tx_bytes",
            Direction::Received => "rx_bytes",
        }
    }
}

/// Anything that can report a monotonically increasing byte counter.
///
/// Implementations must error, never return 0, for an unknown interface.
pub trait CounterSource {
    fn read(&self, interface: &str, direction: Direction) -> Result<u64, CounterError>;
}

/// Reads `/sys/class/net/<iface>/statistics/{tx,rx}_bytes`.
#[derive(Debug, Clone)]
pub struct SysfsCounters {
    root: PathBuf,
}

impl SysfsCounters {
    pub fn new() -> Self {
        Self::with_root("/sys/class/net")
    }

    /// Reads from an alternative tree laid out like `/sys/class/net`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, interface: &str, direction: Direction) -> PathBuf {
        self.root
            .join(interface)
            .join("statistics")
            .join(direction.statistic())
    }
}

impl Default for SysfsCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterSource for SysfsCounters {
    fn read(&self, interface: &str, direction: Direction) -> Result<u64, CounterError> {
        if interface.is_empty() || !self.root.join(interface).is_dir() {
            return Err(CounterError::MissingInterface(interface.to_string()));
        }
        let path = self.path(interface, direction);
        read_counter(&path)
    }
}

fn read_counter(path: &Path) -> Result<u64, CounterError> {
    let raw = std::fs::read_to_string(path).map_err(|source| CounterError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    raw.trim().parse().map_err(|_| CounterError::Malformed {
        path: path.to_path_buf(),
        value: raw.trim().to_string(),
    })
}

/// Counter values for a set of monitors, taken at one instant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CounterSnapshot {
    values: HashMap<(String, Direction), u64>,
}

impl CounterSnapshot {
    pub fn get(&self, interface: &str, direction: Direction) -> Option<u64> {
        self.values.get(&(interface.to_string(), direction)).copied()
    }
}

/// Reads every monitor; the first missing interface aborts the snapshot.
pub fn snapshot(
    source: &impl CounterSource,
    monitors: &[Monitor],
) -> Result<CounterSnapshot, CounterError> {
    let mut values = HashMap::with_capacity(monitors.len());
    for m in monitors {
        let value = source.read(&m.interface, m.direction)?;
        values.insert((m.interface.clone(), m.direction), value);
    }
    Ok(CounterSnapshot { values })
}

/// `(after − before) · 8 / 1e6 / duration`, in Mbps.
///
/// A counter that went backwards (interface recreated) counts as no
/// traffic; a zero duration yields 0 rather than dividing by it.
pub fn throughput_mbps(before: u64, after: u64, duration: Duration) -> f64 {
    let secs = duration.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    after.saturating_sub(before) as f64 * 8.0 / 1e6 / secs
}

/// One row of `switches.csv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceThroughput {
    pub interface: String,
    pub throughput_mbps: f64,
    pub duration_sec: u64,
}

/// Pairs two snapshots into per-monitor throughput, in monitor order.
pub fn compare(
    monitors: &[Monitor],
    before: &CounterSnapshot,
    after: &CounterSnapshot,
    duration: Duration,
) -> Vec<InterfaceThroughput> {
    monitors
        .iter()
        .map(|m| {
            let b = before.get(&m.interface, m.direction).unwrap_or(0);
            let a = after.get(&m.interface, m.direction).unwrap_or(b);
            InterfaceThroughput {
                interface: m.interface.clone(),
                throughput_mbps: throughput_mbps(b, a, duration),
                duration_sec: duration.as_secs(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_sysfs(dir: &Path, iface: &str, tx: &str, rx: &str) {
        let stats = dir.join(iface).join("statistics");
        std::fs::create_dir_all(&stats).unwrap();
        std::fs::write(stats.join("tx_bytes"), tx).unwrap();
        std::fs::write(stats.join("rx_bytes"), rx).unwrap();
    }

    #[test]
    fn throughput_is_exact_counter_delta() {
        let d = Duration::from_secs(60);
        assert_eq!(throughput_mbps(0, 7_500_000, d), 1.0);
        assert_eq!(throughput_mbps(1_000, 1_000, d), 0.0);

        let mbps = throughput_mbps(10, 1_250_010, Duration::from_millis(500));
        assert!((mbps - 20.0).abs() < 1e-9);
    }

    #[test]
    fn throughput_never_divides_by_zero() {
        assert_eq!(throughput_mbps(0, 1_000_000, Duration::ZERO), 0.0);
        let tiny = throughput_mbps(0, 1, Duration::from_nanos(1));
        assert!(tiny.is_finite());
    }

    #[test]
    fn backwards_counter_counts_as_idle() {
        assert_eq!(throughput_mbps(5_000, 10, Duration::from_secs(1)), 0.0);
    }

    #[test]
    fn sysfs_reads_both_directions() {
        let dir = tempfile::tempdir().unwrap();
        fake_sysfs(dir.path(), "s1-eth3", "12345\n", "678\n");
        let counters = SysfsCounters::with_root(dir.path());
        assert_eq!(counters.read("s1-eth3", Direction::Transmitted).unwrap(), 12345);
        assert_eq!(counters.read("s1-eth3", Direction::Received).unwrap(), 678);
    }

    #[test]
    fn missing_interface_fails_loudly() {
        let dir = tempfile::tempdir().unwrap();
        let counters = SysfsCounters::with_root(dir.path());
        assert!(matches!(
            counters.read("s9-eth99", Direction::Transmitted),
            Err(CounterError::MissingInterface(name)) if name == "s9-eth99"
        ));
    }

    #[test]
    fn garbage_counter_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        fake_sysfs(dir.path(), "s1-eth1", "lots", "0");
        let counters = SysfsCounters::with_root(dir.path());
        assert!(matches!(
            counters.read("s1-eth1", Direction::Transmitted),
            Err(CounterError::Malformed { .. })
        ));
    }

    #[test]
    fn snapshots_compare_per_monitor() {
        let dir = tempfile::tempdir().unwrap();
        fake_sysfs(dir.path(), "s1-eth3", "1000", "0");
        fake_sysfs(dir.path(), "s2-eth1", "0", "500");
        let counters = SysfsCounters::with_root(dir.path());
        let monitors = vec![
            Monitor {
                interface: "s1-eth3".into(),
                direction: Direction::Transmitted,
            },
            Monitor {
                interface: "s2-eth1".into(),
                direction: Direction::Received,
            },
        ];

        let before = snapshot(&counters, &monitors).unwrap();
        fake_sysfs(dir.path(), "s1-eth3", "1251000", "0");
        fake_sysfs(dir.path(), "s2-eth1", "0", "625500");
        let after = snapshot(&counters, &monitors).unwrap();

        let rows = compare(&monitors, &before, &after, Duration::from_secs(1));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].interface, "s1-eth3");
        assert!((rows[0].throughput_mbps - 10.0).abs() < 1e-9);
        assert!((rows[1].throughput_mbps - 5.0).abs() < 1e-9);
        assert_eq!(rows[1].duration_sec, 1);
    }
}
