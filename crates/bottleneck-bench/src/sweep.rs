//! # Sweep Orchestrator
//!
//! Varies one parameter while holding the other two fixed, one run per
//! point, strictly one after another (runs share counters and would corrupt
//! each other's baselines). Each successful point contributes one summary
//! row read back from the run's published CSVs; failed points are skipped.
//! Only an interruption ends a sweep early.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::aggregate::{self, round2, RTT_CSV, SWITCHES_CSV};
use crate::config::{fmt_param, Delay, RunConfig, RunTimings, DEFAULT_CHUNK_SIZE, DEFAULT_PORT};
use crate::error::{AggregationError, ConfigError, RunError, SweepError};
use crate::run::RunOrchestrator;
use crate::testbed::Testbed;
use crate::topology::{Topology, TopologyKind};

pub const SUMMARY_CSV: &str = "summary.csv";
pub const SUMMARY_TXT: &str = "summary.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Bandwidth,
    Delay,
    Loss,
}

impl Dimension {
    pub const ALL: [Dimension; 3] = [Dimension::Bandwidth, Dimension::Delay, Dimension::Loss];

    /// Sub-directory of the results dir holding this sweep.
    pub fn dir_name(self) -> &'static str {
        match self {
            Dimension::Bandwidth => "bw_vary",
            Dimension::Delay => "delay_vary",
            Dimension::Loss => "loss_vary",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Dimension::Bandwidth => "Varying Bandwidth",
            Dimension::Delay => "Varying Delay",
            Dimension::Loss => "Varying Loss",
        }
    }
}

impl FromStr for Dimension {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bw" | "bandwidth" => Ok(Dimension::Bandwidth),
            "delay" => Ok(Dimension::Delay),
            "loss" => Ok(Dimension::Loss),
            other => Err(ConfigError::Sweep(format!(
                "unknown dimension '{other}' (expected bandwidth, delay or loss)"
            ))),
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Dimension::Bandwidth => "bandwidth",
            Dimension::Delay => "delay",
            Dimension::Loss => "loss",
        })
    }
}

// ─── Configuration ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweepConfigInput {
    pub topology: Option<String>,
    pub duration_secs: Option<u64>,
    pub hosts: Option<usize>,
    pub results_dir: Option<PathBuf>,
    pub bandwidths: Option<Vec<f64>>,
    pub delays: Option<Vec<String>>,
    pub losses: Option<Vec<f64>>,
    pub fixed: FixedInput,
    pub settle_secs: Option<f64>,
    pub drain_secs: Option<f64>,
    pub chunk_size: Option<usize>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FixedInput {
    pub bandwidth: Option<f64>,
    pub delay: Option<String>,
    pub loss: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepConfig {
    pub topology: TopologyKind,
    pub duration: Duration,
    pub hosts: usize,
    pub results_dir: PathBuf,
    pub bandwidths: Vec<f64>,
    pub delays: Vec<Delay>,
    pub losses: Vec<f64>,
    pub fixed_bandwidth: f64,
    pub fixed_delay: Delay,
    pub fixed_loss: f64,
    pub timings: RunTimings,
    pub chunk_size: usize,
    pub port: u16,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            topology: TopologyKind::ParkingLot,
            duration: Duration::from_secs(60),
            hosts: 40,
            results_dir: PathBuf::from("parkinglot_results"),
            bandwidths: vec![10.0, 15.0, 20.0, 35.0],
            delays: [1, 2, 5, 10].into_iter().map(Delay::from_millis).collect(),
            losses: vec![0.0, 2.0, 5.0, 10.0],
            fixed_bandwidth: 15.0,
            fixed_delay: Delay::from_millis(2),
            fixed_loss: 2.0,
            timings: RunTimings::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            port: DEFAULT_PORT,
        }
    }
}

fn secs(value: Option<f64>, default: Duration, what: &'static str) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(v) if v < 0.0 => Err(ConfigError::NotPositive { what, value: v }),
        Some(v) => Duration::try_from_secs_f64(v).map_err(|_| ConfigError::OutOfRange { what, value: v }),
    }
}

impl SweepConfigInput {
    pub fn resolve(self) -> Result<SweepConfig, ConfigError> {
        let d = SweepConfig::default();

        let topology = match self.topology {
            Some(name) => name.parse()?,
            None => d.topology,
        };
        let delays = match self.delays {
            Some(list) => list
                .iter()
                .map(|s| s.parse())
                .collect::<Result<Vec<Delay>, _>>()?,
            None => d.delays,
        };
        let fixed_delay = match self.fixed.delay {
            Some(s) => s.parse()?,
            None => d.fixed_delay,
        };
        let results_dir = self
            .results_dir
            .unwrap_or_else(|| PathBuf::from(format!("{topology}_results")));

        let config = SweepConfig {
            topology,
            duration: self.duration_secs.map(Duration::from_secs).unwrap_or(d.duration),
            hosts: self.hosts.unwrap_or(d.hosts),
            results_dir,
            bandwidths: self.bandwidths.unwrap_or(d.bandwidths),
            delays,
            losses: self.losses.unwrap_or(d.losses),
            fixed_bandwidth: self.fixed.bandwidth.unwrap_or(d.fixed_bandwidth),
            fixed_delay,
            fixed_loss: self.fixed.loss.unwrap_or(d.fixed_loss),
            timings: RunTimings {
                settle: secs(self.settle_secs, d.timings.settle, "settle time")?,
                drain: secs(self.drain_secs, d.timings.drain, "drain time")?,
            },
            chunk_size: self.chunk_size.unwrap_or(d.chunk_size),
            port: self.port.unwrap_or(d.port),
        };
        config.validate()?;
        Ok(config)
    }
}

impl SweepConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(SweepConfig::default());
        }
        let parsed: SweepConfigInput =
            toml::from_str(input).map_err(|e| ConfigError::Sweep(e.to_string()))?;
        parsed.resolve()
    }

    /// Every point of every dimension must make a valid run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for dim in Dimension::ALL {
            for point in self.points(dim) {
                self.run_config(dim, &point).validate()?;
            }
        }
        Ok(())
    }

    /// Points of one sweep, in input order.
    pub fn points(&self, dimension: Dimension) -> Vec<SweepPoint> {
        let fixed = SweepPoint {
            bandwidth_mbps: self.fixed_bandwidth,
            delay: self.fixed_delay,
            loss_pct: self.fixed_loss,
        };
        match dimension {
            Dimension::Bandwidth => self
                .bandwidths
                .iter()
                .map(|&bandwidth_mbps| SweepPoint {
                    bandwidth_mbps,
                    ..fixed.clone()
                })
                .collect(),
            Dimension::Delay => self
                .delays
                .iter()
                .map(|&delay| SweepPoint {
                    delay,
                    ..fixed.clone()
                })
                .collect(),
            Dimension::Loss => self
                .losses
                .iter()
                .map(|&loss_pct| SweepPoint {
                    loss_pct,
                    ..fixed.clone()
                })
                .collect(),
        }
    }

    pub fn dimension_dir(&self, dimension: Dimension) -> PathBuf {
        self.results_dir.join(dimension.dir_name())
    }

    pub fn run_config(&self, dimension: Dimension, point: &SweepPoint) -> RunConfig {
        let mut config = RunConfig::new(self.topology, point.bandwidth_mbps, point.delay, point.loss_pct);
        config.duration = self.duration;
        config.hosts = self.hosts;
        config.chunk_size = self.chunk_size;
        config.port = self.port;
        config.timings = self.timings;
        config.output_dir = self.dimension_dir(dimension).join(point.dir_name());
        config
    }

    /// Number of throughput columns in this sweep's summaries.
    fn bottleneck_columns(&self) -> usize {
        let point = SweepPoint {
            bandwidth_mbps: self.fixed_bandwidth,
            delay: self.fixed_delay,
            loss_pct: self.fixed_loss,
        };
        Topology::for_run(&self.run_config(Dimension::Bandwidth, &point))
            .map(|t| t.monitors().len())
            .unwrap_or(self.topology.stages())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepPoint {
    pub bandwidth_mbps: f64,
    pub delay: Delay,
    pub loss_pct: f64,
}

impl SweepPoint {
    /// `bw15_delay2ms_loss2`
    pub fn dir_name(&self) -> String {
        format!(
            "bw{}_delay{}_loss{}",
            fmt_param(self.bandwidth_mbps),
            self.delay,
            fmt_param(self.loss_pct)
        )
    }
}

// ─── Summaries ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRow {
    pub point: SweepPoint,
    /// Per monitored interface, in `switches.csv` order.
    pub bottleneck_mbps: Vec<f64>,
    pub total_mbps: f64,
    pub avg_rtt_ms: f64,
}

impl SummaryRow {
    /// Reads a finished run's `switches.csv` and `rtt.csv`.
    pub fn from_run_dir(dir: &Path, point: &SweepPoint) -> Result<Self, AggregationError> {
        let switches = aggregate::read_switches_csv(&dir.join(SWITCHES_CSV))?;
        let rtt = aggregate::read_rtt_csv(&dir.join(RTT_CSV))?;

        let bottleneck_mbps: Vec<f64> = switches.iter().map(|r| round2(r.throughput_mbps)).collect();
        let total: f64 = switches.iter().map(|r| r.throughput_mbps).sum();
        let avg_rtt = if rtt.is_empty() {
            0.0
        } else {
            rtt.iter().map(|r| r.avg_rtt_ms).sum::<f64>() / rtt.len() as f64
        };

        Ok(SummaryRow {
            point: point.clone(),
            bottleneck_mbps,
            total_mbps: round2(total),
            avg_rtt_ms: round2(avg_rtt),
        })
    }

    fn record(&self, columns: usize) -> Vec<String> {
        let mut rec = vec![
            fmt_param(self.point.bandwidth_mbps),
            self.point.delay.to_string(),
            fmt_param(self.point.loss_pct),
        ];
        for i in 0..columns {
            rec.push(self.bottleneck_mbps.get(i).copied().unwrap_or(0.0).to_string());
        }
        rec.push(self.total_mbps.to_string());
        rec.push(self.avg_rtt_ms.to_string());
        rec
    }
}

pub fn summary_header(columns: usize) -> Vec<String> {
    let mut header = vec![
        "bandwidth_mbps".to_string(),
        "delay".to_string(),
        "loss_pct".to_string(),
    ];
    header.extend((1..=columns).map(|i| format!("bottleneck{i}_throughput_mbps")));
    header.push("total_throughput_mbps".to_string());
    header.push("avg_rtt_ms".to_string());
    header
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepResult {
    pub dimension: Dimension,
    pub columns: usize,
    pub rows: Vec<SummaryRow>,
    pub summary_path: PathBuf,
    pub skipped: usize,
}

impl SweepResult {
    pub fn write_csv(&self) -> Result<(), AggregationError> {
        let path = &self.summary_path;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AggregationError::io(parent, e))?;
        }
        let mut w = csv::Writer::from_path(path).map_err(|e| AggregationError::csv(path, e))?;
        w.write_record(summary_header(self.columns))
            .map_err(|e| AggregationError::csv(path, e))?;
        for row in &self.rows {
            w.write_record(row.record(self.columns))
                .map_err(|e| AggregationError::csv(path, e))?;
        }
        w.flush().map_err(|e| AggregationError::io(path, e))
    }
}

/// Human-readable table of every sweep, one block per dimension.
pub fn render_table(results: &[SweepResult]) -> String {
    use std::fmt::Write as _;

    let mut out = String::new();
    let rule = "=".repeat(70);
    for result in results {
        let _ = writeln!(out, "{rule}");
        let _ = writeln!(out, " {}", result.dimension.title());
        let _ = writeln!(out, "{rule}");
        let header = summary_header(result.columns);
        let line: Vec<String> = header
            .iter()
            .map(|h| format!("{:<12}", h.trim_end_matches("_throughput_mbps").trim_end_matches("_mbps")))
            .collect();
        let _ = writeln!(out, "{}", line.join(" ").trim_end());
        if result.rows.is_empty() {
            let _ = writeln!(out, "(no successful runs)");
        }
        for row in &result.rows {
            let cells: Vec<String> = row
                .record(result.columns)
                .iter()
                .map(|c| format!("{c:<12}"))
                .collect();
            let _ = writeln!(out, "{}", cells.join(" ").trim_end());
        }
        let _ = writeln!(out);
    }
    out
}

// ─── Orchestration ──────────────────────────────────────────────────────────

pub struct SweepOrchestrator<T: Testbed> {
    runs: RunOrchestrator<T>,
    config: SweepConfig,
}

impl<T: Testbed> SweepOrchestrator<T> {
    pub fn new(runs: RunOrchestrator<T>, config: SweepConfig) -> Self {
        Self { runs, config }
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    pub fn into_runs(self) -> RunOrchestrator<T> {
        self.runs
    }

    /// Runs one dimension and writes its `summary.csv`.
    pub async fn run_dimension(&mut self, dimension: Dimension) -> Result<SweepResult, SweepError> {
        let points = self.config.points(dimension);
        tracing::info!(%dimension, points = points.len(), "starting sweep");

        let mut rows = Vec::with_capacity(points.len());
        let mut skipped = 0;
        for (i, point) in points.iter().enumerate() {
            let run_config = self.config.run_config(dimension, point);
            tracing::info!(
                %dimension,
                point = i + 1,
                of = points.len(),
                run = %point.dir_name(),
                "sweep point"
            );

            match self.runs.run(&run_config).await {
                Ok(_) => match SummaryRow::from_run_dir(&run_config.output_dir, point) {
                    Ok(row) => rows.push(row),
                    Err(e) => {
                        tracing::warn!(run = %point.dir_name(), error = %e, "no results, point skipped");
                        skipped += 1;
                    }
                },
                Err(RunError::Interrupted) => {
                    tracing::warn!(%dimension, "sweep interrupted");
                    return Err(SweepError::Interrupted);
                }
                Err(e) => {
                    tracing::warn!(run = %point.dir_name(), error = %e, "run failed, point skipped");
                    skipped += 1;
                }
            }
        }

        let result = SweepResult {
            dimension,
            columns: self.config.bottleneck_columns(),
            rows,
            summary_path: self.config.dimension_dir(dimension).join(SUMMARY_CSV),
            skipped,
        };
        result.write_csv()?;
        tracing::info!(
            %dimension,
            rows = result.rows.len(),
            skipped,
            path = %result.summary_path.display(),
            "sweep summary written"
        );
        Ok(result)
    }

    /// Runs each dimension in turn, then writes the combined table to
    /// `summary.txt` in the results dir.
    pub async fn run_all(&mut self, dimensions: &[Dimension]) -> Result<Vec<SweepResult>, SweepError> {
        let started = chrono::Local::now();
        tracing::info!(start = %started.format("%Y-%m-%d %H:%M:%S"), "sweeps started");

        let mut results = Vec::with_capacity(dimensions.len());
        for &dim in dimensions {
            results.push(self.run_dimension(dim).await?);
        }

        let table = render_table(&results);
        let dir = &self.config.results_dir;
        std::fs::create_dir_all(dir).map_err(|e| AggregationError::io(dir, e))?;
        let path = dir.join(SUMMARY_TXT);
        std::fs::write(&path, &table).map_err(|e| AggregationError::io(&path, e))?;

        let finished = chrono::Local::now();
        let elapsed = finished - started;
        tracing::info!(
            end = %finished.format("%Y-%m-%d %H:%M:%S"),
            elapsed = %format!(
                "{}h {}m {}s",
                elapsed.num_hours(),
                elapsed.num_minutes() % 60,
                elapsed.num_seconds() % 60
            ),
            "sweeps finished"
        );
        Ok(results)
    }
}
