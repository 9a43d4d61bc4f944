//! Per-second aggregation of raw flow samples and the per-run CSV files.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::counters::InterfaceThroughput;
use crate::error::AggregationError;
use crate::metrics_log::{self, Sample};

pub const RTT_CSV: &str = "rtt.csv";
pub const CWND_CSV: &str = "cwnd.csv";
pub const SWITCHES_CSV: &str = "switches.csv";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RttPoint {
    pub time_sec: u64,
    pub avg_rtt_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CwndPoint {
    pub time_sec: u64,
    pub window: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregated {
    pub rtt: Vec<RttPoint>,
    pub cwnd: Vec<CwndPoint>,
}

#[derive(Default)]
struct Bucket {
    rtt_sum: f64,
    rtt_n: usize,
    cwnd_sum: u128,
    cwnd_n: usize,
}

/// Groups samples by whole second and averages across flows.
///
/// Seconds without samples do not appear. A sample whose RTT could not be
/// read carries 0 and is averaged in; a missing window is left out of the
/// window mean only.
pub fn aggregate(samples: &[Sample]) -> Aggregated {
    let mut buckets: BTreeMap<u64, Bucket> = BTreeMap::new();
    for s in samples {
        let b = buckets.entry(s.time).or_default();
        b.rtt_sum += s.rtt_ms;
        b.rtt_n += 1;
        if let Some(cwnd) = s.cwnd_bytes {
            b.cwnd_sum += cwnd as u128;
            b.cwnd_n += 1;
        }
    }

    let mut out = Aggregated::default();
    for (time_sec, b) in buckets {
        if b.rtt_n > 0 {
            out.rtt.push(RttPoint {
                time_sec,
                avg_rtt_ms: round2(b.rtt_sum / b.rtt_n as f64),
            });
        }
        if b.cwnd_n > 0 {
            out.cwnd.push(CwndPoint {
                time_sec,
                window: (b.cwnd_sum / b.cwnd_n as u128) as u64,
            });
        }
    }
    out
}

/// Reads the raw log and aggregates it. A missing log yields `None` with a
/// warning; senders that all failed leave nothing to aggregate.
pub fn aggregate_file(raw: &Path) -> Result<Option<Aggregated>, AggregationError> {
    let outcome = match metrics_log::read_samples(raw) {
        Ok(o) => o,
        Err(e) => {
            return match AggregationError::io(raw, e) {
                AggregationError::Missing(path) => {
                    tracing::warn!(path = %path.display(), "raw metrics file not found, skipping aggregation");
                    Ok(None)
                }
                other => Err(other),
            };
        }
    };
    if outcome.skipped > 0 {
        tracing::warn!(skipped = outcome.skipped, "skipped malformed metrics lines");
    }
    Ok(Some(aggregate(&outcome.samples)))
}

pub(crate) fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// ── CSV files ──

fn write_rows<T: Serialize>(path: &Path, rows: &[T], header: &[&str]) -> Result<(), AggregationError> {
    let mut w = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .map_err(|e| AggregationError::csv(path, e))?;
    // explicit header so empty series still produce a well-formed file
    w.write_record(header)
        .map_err(|e| AggregationError::csv(path, e))?;
    for row in rows {
        w.serialize(row).map_err(|e| AggregationError::csv(path, e))?;
    }
    w.flush().map_err(|e| AggregationError::io(path, e))
}

fn read_rows<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>, AggregationError> {
    let mut r = csv::Reader::from_path(path).map_err(|e| AggregationError::csv(path, e))?;
    r.deserialize()
        .collect::<Result<Vec<T>, _>>()
        .map_err(|e| AggregationError::csv(path, e))
}

pub fn write_rtt_csv(path: &Path, rows: &[RttPoint]) -> Result<(), AggregationError> {
    write_rows(path, rows, &["time_sec", "avg_rtt_ms"])
}

pub fn write_cwnd_csv(path: &Path, rows: &[CwndPoint]) -> Result<(), AggregationError> {
    write_rows(path, rows, &["time_sec", "window"])
}

/// Throughput is written rounded to two decimals.
pub fn write_switches_csv(path: &Path, rows: &[InterfaceThroughput]) -> Result<(), AggregationError> {
    let rounded: Vec<InterfaceThroughput> = rows
        .iter()
        .map(|r| InterfaceThroughput {
            throughput_mbps: round2(r.throughput_mbps),
            ..r.clone()
        })
        .collect();
    write_rows(path, &rounded, &["interface", "throughput_mbps", "duration_sec"])
}

pub fn read_rtt_csv(path: &Path) -> Result<Vec<RttPoint>, AggregationError> {
    read_rows(path)
}

pub fn read_cwnd_csv(path: &Path) -> Result<Vec<CwndPoint>, AggregationError> {
    read_rows(path)
}

pub fn read_switches_csv(path: &Path) -> Result<Vec<InterfaceThroughput>, AggregationError> {
    read_rows(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(time: u64, rtt_ms: f64, cwnd: Option<u64>) -> Sample {
        Sample {
            time,
            rtt_ms,
            cwnd_bytes: cwnd,
        }
    }

    #[test]
    fn averages_per_second_and_omits_empty_seconds() {
        let samples = [
            sample(0, 10.0, Some(1000)),
            sample(0, 20.0, Some(3000)),
            sample(2, 5.0, None),
            sample(0, 30.0, None),
        ];
        let agg = aggregate(&samples);
        assert_eq!(
            agg.rtt,
            [
                RttPoint { time_sec: 0, avg_rtt_ms: 20.0 },
                RttPoint { time_sec: 2, avg_rtt_ms: 5.0 },
            ]
        );
        // second 2 has no window reading at all
        assert_eq!(agg.cwnd, [CwndPoint { time_sec: 0, window: 2000 }]);
    }

    #[test]
    fn rtt_mean_is_rounded_and_includes_zero_reads() {
        let agg = aggregate(&[sample(1, 0.0, None), sample(1, 1.0, None), sample(1, 1.0, None)]);
        assert_eq!(agg.rtt[0].avg_rtt_ms, 0.67);
    }

    #[test]
    fn window_mean_truncates() {
        let agg = aggregate(&[sample(3, 1.0, Some(10)), sample(3, 1.0, Some(11))]);
        assert_eq!(agg.cwnd[0].window, 10);
    }

    #[test]
    fn garbage_line_does_not_change_the_result() {
        let dir = tempfile::tempdir().unwrap();
        let lines: Vec<String> = (0..9)
            .map(|i| {
                format!(
                    "{{\"time\":{},\"rtt_ms\":{}.5,\"cwnd_bytes\":{}}}",
                    i % 3,
                    i,
                    1000 * (i + 1)
                )
            })
            .collect();
        let mut dirty_lines = lines.clone();
        dirty_lines.insert(5, "garbage text".to_string());

        let clean = dir.path().join("clean.json");
        let dirty = dir.path().join("dirty.json");
        std::fs::write(&clean, lines.join("\n")).unwrap();
        std::fs::write(&dirty, dirty_lines.join("\n")).unwrap();

        let a = aggregate_file(&clean).unwrap().unwrap();
        let b = aggregate_file(&dirty).unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.rtt.len(), 3);
    }

    #[test]
    fn missing_raw_file_skips_aggregation() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(aggregate_file(&dir.path().join("none.json")).unwrap(), None);
    }

    #[test]
    fn csv_files_have_expected_shape() {
        let dir = tempfile::tempdir().unwrap();
        let rtt = dir.path().join(RTT_CSV);
        let switches = dir.path().join(SWITCHES_CSV);
        let cwnd = dir.path().join(CWND_CSV);

        write_rtt_csv(&rtt, &[RttPoint { time_sec: 1, avg_rtt_ms: 4.25 }]).unwrap();
        write_cwnd_csv(&cwnd, &[]).unwrap();
        write_switches_csv(
            &switches,
            &[InterfaceThroughput {
                interface: "s1-eth21".into(),
                throughput_mbps: 9.87654,
                duration_sec: 60,
            }],
        )
        .unwrap();

        assert_eq!(
            std::fs::read_to_string(&rtt).unwrap(),
            "time_sec,avg_rtt_ms\n1,4.25\n"
        );
        assert_eq!(std::fs::read_to_string(&cwnd).unwrap(), "time_sec,window\n");
        assert_eq!(
            std::fs::read_to_string(&switches).unwrap(),
            "interface,throughput_mbps,duration_sec\ns1-eth21,9.88,60\n"
        );

        let back = read_switches_csv(&switches).unwrap();
        assert_eq!(back[0].throughput_mbps, 9.88);
        assert!(read_cwnd_csv(&cwnd).unwrap().is_empty());
    }

    #[test]
    fn reading_absent_result_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read_rtt_csv(&dir.path().join(RTT_CSV)),
            Err(AggregationError::Missing(_))
        ));
    }
}
