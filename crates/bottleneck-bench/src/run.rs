//! # Run Orchestrator
//!
//! One measurement run for one parameter set:
//!
//! ```text
//! Built → Provisioned → Measuring → Drained → Aggregated → TornDown
//! ```
//!
//! Counters are snapshotted strictly outside the sender window. Senders are
//! awaited through their completion channels, bounded by
//! `duration + drain`; stragglers are killed at teardown. Teardown runs
//! whenever provisioning succeeded, whatever happened afterwards.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::aggregate::{self, CwndPoint, RttPoint, CWND_CSV, RTT_CSV, SWITCHES_CSV};
use crate::config::RunConfig;
use crate::counters::{self, InterfaceThroughput};
use crate::error::RunError;
use crate::metrics_log;
use crate::testbed::{FlowExit, FlowHandle, FlowRole, Network, ReceiverSpec, SenderSpec, Testbed};
use crate::topology::{Host, Topology};

/// Upper bound on waiting for killed flows to confirm their exit.
const KILL_WAIT: Duration = Duration::from_secs(3);

pub const LOG_DIR: &str = "logs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunPhase {
    Built,
    Provisioned,
    Measuring,
    Drained,
    Aggregated,
    TornDown,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunPhase::Built => "built",
            RunPhase::Provisioned => "provisioned",
            RunPhase::Measuring => "measuring",
            RunPhase::Drained => "drained",
            RunPhase::Aggregated => "aggregated",
            RunPhase::TornDown => "torn-down",
        };
        f.write_str(s)
    }
}

fn enter(phase: RunPhase) {
    tracing::info!(%phase, "run phase");
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub output_dir: PathBuf,
    /// One entry per monitored interface, in monitor order.
    pub throughput: Vec<InterfaceThroughput>,
    pub rtt: Vec<RttPoint>,
    pub cwnd: Vec<CwndPoint>,
    pub wall_clock: Duration,
    /// Senders and receivers that failed to start, failed, or overran.
    pub failed_flows: usize,
}

#[derive(Default)]
struct Flows {
    receivers: Vec<FlowHandle>,
    senders: Vec<FlowHandle>,
    failed: usize,
}

pub struct RunOrchestrator<T: Testbed> {
    testbed: T,
    shutdown: watch::Receiver<bool>,
}

impl<T: Testbed> RunOrchestrator<T> {
    /// `shutdown` flipping to `true` interrupts the current run.
    pub fn new(testbed: T, shutdown: watch::Receiver<bool>) -> Self {
        Self { testbed, shutdown }
    }

    pub fn testbed(&self) -> &T {
        &self.testbed
    }

    pub fn testbed_mut(&mut self) -> &mut T {
        &mut self.testbed
    }

    pub async fn run(&mut self, config: &RunConfig) -> Result<RunResult, RunError> {
        config.validate()?;
        let topology = Topology::for_run(config)?;
        let started = Instant::now();
        enter(RunPhase::Built);
        tracing::info!(
            topology = %config.topology,
            bandwidth_mbps = config.bandwidth_mbps,
            delay = %config.delay,
            loss_pct = config.loss_pct,
            duration_s = config.duration.as_secs(),
            hosts = config.hosts,
            output = %config.output_dir.display(),
            "starting run"
        );

        let out = config.output_dir.as_path();
        std::fs::create_dir_all(out.join(LOG_DIR)).map_err(|source| RunError::Output {
            path: out.to_path_buf(),
            source,
        })?;
        clear_results(out)?;

        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return Err(RunError::Interrupted);
        }

        let mut network = self.testbed.provision(&topology).await?;
        enter(RunPhase::Provisioned);

        let raw = metrics_log::raw_metrics_path(out, chrono::Utc::now().timestamp());
        let mut flows = Flows::default();
        let outcome = measure(&topology, &mut network, config, &raw, &mut flows, &mut shutdown).await;

        teardown(network, &mut flows, &raw).await;
        enter(RunPhase::TornDown);

        let mut result = outcome?;
        result.failed_flows = flows.failed;
        result.wall_clock = started.elapsed();
        tracing::info!(
            wall_clock_s = %format!("{:.1}", result.wall_clock.as_secs_f64()),
            failed_flows = result.failed_flows,
            "run complete"
        );
        Ok(result)
    }
}

/// Removes result files a previous run left in `out`, so a failed run never
/// leaves them looking fresh.
fn clear_results(out: &Path) -> Result<(), RunError> {
    for name in [RTT_CSV, CWND_CSV, SWITCHES_CSV] {
        let path = out.join(name);
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed stale result"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(RunError::Output { path, source }),
        }
    }
    Ok(())
}

/// Everything between provisioning and teardown.
async fn measure<N: Network>(
    topology: &Topology,
    network: &mut N,
    config: &RunConfig,
    raw: &Path,
    flows: &mut Flows,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<RunResult, RunError> {
    let out = config.output_dir.as_path();

    // ── receivers ──
    for host in topology.destinations() {
        let Some(addr) = network.address(host) else {
            tracing::warn!(host = %host.name, "no address, receiver not started");
            flows.failed += 1;
            continue;
        };
        let spec = ReceiverSpec {
            bind: SocketAddr::new(addr, config.port),
            log_file: flow_log(out, host, FlowRole::Receiver),
        };
        match network.spawn_receiver(host, &spec) {
            Ok(handle) => flows.receivers.push(handle),
            Err(e) => {
                tracing::warn!(host = %host.name, error = %e, "receiver failed to start");
                flows.failed += 1;
            }
        }
    }

    let settle = config.timings.settle + network.convergence_time();
    tracing::debug!(settle_ms = settle.as_millis() as u64, "waiting for receivers");
    interruptible(shutdown, tokio::time::sleep(settle)).await?;

    let before = counters::snapshot(&*network, topology.monitors())?;
    enter(RunPhase::Measuring);

    // ── senders ──
    let pairs = topology.flow_pairs();
    let rate_mbps = config.bandwidth_mbps / pairs.len() as f64;
    tracing::info!(flows = pairs.len(), rate_mbps, "starting senders");
    for (src, dst) in pairs {
        let Some(addr) = network.address(dst) else {
            tracing::warn!(host = %src.name, destination = %dst.name, "destination has no address");
            flows.failed += 1;
            continue;
        };
        let spec = SenderSpec {
            destination: SocketAddr::new(addr, config.port),
            duration: config.duration,
            rate_mbps,
            chunk_size: config.chunk_size,
            metrics_file: raw.to_path_buf(),
            log_file: flow_log(out, src, FlowRole::Sender),
        };
        match network.spawn_sender(src, &spec) {
            Ok(handle) => flows.senders.push(handle),
            Err(e) => {
                tracing::warn!(host = %src.name, error = %e, "sender failed to start");
                flows.failed += 1;
            }
        }
    }

    let window = config.duration + config.timings.drain;
    let all_done = join_all(flows.senders.iter_mut().map(|h| h.wait()));
    match interruptible(shutdown, tokio::time::timeout(window, all_done)).await? {
        Ok(exits) => {
            for (handle, exit) in flows.senders.iter().zip(exits) {
                if exit != FlowExit::Success {
                    tracing::warn!(host = handle.host(), %exit, "sender did not complete");
                    flows.failed += 1;
                }
            }
        }
        Err(_) => {
            let stragglers = flows
                .senders
                .iter_mut()
                .filter_map(|h| match h.try_exit() {
                    None => Some(h.host().to_string()),
                    Some(FlowExit::Success) => None,
                    Some(exit) => {
                        tracing::warn!(host = h.host(), %exit, "sender did not complete");
                        Some(h.host().to_string())
                    }
                })
                .collect::<Vec<_>>();
            tracing::warn!(
                count = stragglers.len(),
                window_s = window.as_secs(),
                "senders still running after drain window; measurement may be short"
            );
            flows.failed += stragglers.len();
        }
    }

    let after = counters::snapshot(&*network, topology.monitors())?;
    enter(RunPhase::Drained);

    let throughput = counters::compare(topology.monitors(), &before, &after, config.duration);
    for row in &throughput {
        tracing::info!(
            interface = %row.interface,
            throughput_mbps = %format!("{:.2}", row.throughput_mbps),
            "interface throughput"
        );
    }

    let aggregated = aggregate::aggregate_file(raw)?;
    if let Some(agg) = &aggregated {
        aggregate::write_rtt_csv(&out.join(RTT_CSV), &agg.rtt)?;
        aggregate::write_cwnd_csv(&out.join(CWND_CSV), &agg.cwnd)?;
    }
    aggregate::write_switches_csv(&out.join(SWITCHES_CSV), &throughput)?;
    enter(RunPhase::Aggregated);

    let agg = aggregated.unwrap_or_default();
    Ok(RunResult {
        output_dir: out.to_path_buf(),
        throughput,
        rtt: agg.rtt,
        cwnd: agg.cwnd,
        wall_clock: Duration::ZERO,
        failed_flows: 0,
    })
}

/// Kills senders, then receivers, removes the raw log and releases the
/// network. Never fails.
async fn teardown<N: Network>(network: N, flows: &mut Flows, raw: &Path) {
    for group in [&mut flows.senders, &mut flows.receivers] {
        for handle in group.iter_mut() {
            handle.kill();
        }
        let confirmed = tokio::time::timeout(KILL_WAIT, join_all(group.iter_mut().map(|h| h.wait())));
        if confirmed.await.is_err() {
            tracing::warn!("some flows did not confirm exit");
        }
    }

    match std::fs::remove_file(raw) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %raw.display(), error = %e, "failed to remove raw metrics"),
    }

    network.teardown().await;
}

fn flow_log(out: &Path, host: &Host, role: FlowRole) -> PathBuf {
    out.join(LOG_DIR)
        .join(format!("{}_{}.log", host.name, role.log_suffix()))
}

/// Resolves to `Err(Interrupted)` as soon as `shutdown` reads `true`.
async fn interruptible<F: Future>(
    shutdown: &mut watch::Receiver<bool>,
    fut: F,
) -> Result<F::Output, RunError> {
    tokio::select! {
        biased;
        _ = interrupted(shutdown) => Err(RunError::Interrupted),
        out = fut => Ok(out),
    }
}

async fn interrupted(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        // no one can interrupt any more
        std::future::pending::<()>().await;
    }
}
