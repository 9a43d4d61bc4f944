//! bottleneck-bench
//!
//! - `run`: one measurement run on a freshly built topology
//! - `sweep`: batches of runs varying bandwidth, delay or loss
//! - `send` / `serve`: the per-host flow processes spawned by `run`

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use bottleneck_bench::config::{default_output_dir, DEFAULT_CHUNK_SIZE, DEFAULT_PORT};
use bottleneck_bench::linux::LinuxTestbed;
use bottleneck_bench::pacer::{self, PacingParams, DEFAULT_RATE_MBPS};
use bottleneck_bench::sweep::{render_table, Dimension, SweepConfig, SweepOrchestrator};
use bottleneck_bench::transport::{self, PassiveReceiver, ServerIdentity, Verification};
use bottleneck_bench::{Delay, RunConfig, RunError, RunOrchestrator, RunTimings, SweepError, TopologyKind};

#[derive(Parser, Debug)]
#[command(name = "bottleneck-bench", about = "QUIC throughput measurement across emulated bottlenecks")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Measure one parameter set.
    Run(RunArgs),
    /// Run the bandwidth, delay and loss sweeps.
    Sweep(SweepArgs),
    /// Paced sender (one flow).
    Send(SendArgs),
    /// Passive receiver.
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// dumbbell, parkinglot or multibottleneck.
    #[arg(long, default_value = "dumbbell")]
    topo: TopologyKind,

    /// First bottleneck capacity in Mbps.
    #[arg(long, default_value_t = 15.0)]
    bw: f64,

    /// Bottleneck one-way delay, e.g. 2ms.
    #[arg(long, default_value = "2ms")]
    delay: Delay,

    /// Bottleneck loss in percent.
    #[arg(long, default_value_t = 2.0)]
    loss: f64,

    /// Sender duration in seconds.
    #[arg(long, default_value_t = 60)]
    duration: u64,

    /// Total host count, even, from 4 to 65534.
    #[arg(long, default_value_t = 40)]
    hosts: usize,

    /// Defaults to `{topo}_bw{bw}_delay{delay}_loss{loss}`.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Bottleneck delay jitter.
    #[arg(long)]
    jitter: Option<Delay>,

    /// Seconds between starting receivers and the first counter snapshot.
    #[arg(long, default_value_t = 2.0)]
    settle: f64,

    /// Seconds allowed past the duration for senders to finish.
    #[arg(long, default_value_t = 4.0)]
    drain: f64,

    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
}

#[derive(Args, Debug)]
struct SweepArgs {
    /// TOML sweep description; defaults apply when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Dimensions to sweep (bandwidth, delay, loss); all when omitted.
    #[arg(long, value_delimiter = ',')]
    dimension: Vec<Dimension>,
}

#[derive(Args, Debug)]
struct SendArgs {
    /// Receiver address.
    #[arg(long)]
    host: IpAddr,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Seconds to send for.
    #[arg(long)]
    duration: u64,

    /// Target rate in Mbps.
    #[arg(long, default_value_t = DEFAULT_RATE_MBPS, value_parser = pacer::parse_rate)]
    rate: f64,

    /// File the RTT samples are appended to.
    #[arg(long)]
    metrics_file: Option<PathBuf>,

    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Skip certificate verification.
    #[arg(long, conflicts_with = "ca")]
    no_verify: bool,

    /// Trust only the certificate(s) in this PEM file.
    #[arg(long, required_unless_present = "no_verify")]
    ca: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))]
    bind: SocketAddr,

    /// PEM certificate; a self-signed one is generated when absent.
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,
}

fn seconds(value: f64, what: &str) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("invalid {what}: {value}"))
}

impl RunArgs {
    fn into_config(self) -> anyhow::Result<RunConfig> {
        let output_dir = self
            .output_dir
            .unwrap_or_else(|| default_output_dir(self.topo, self.bw, self.delay, self.loss));
        Ok(RunConfig {
            topology: self.topo,
            bandwidth_mbps: self.bw,
            delay: self.delay,
            jitter: self.jitter,
            loss_pct: self.loss,
            duration: Duration::from_secs(self.duration),
            hosts: self.hosts,
            output_dir,
            chunk_size: self.chunk_size,
            port: self.port,
            timings: RunTimings {
                settle: seconds(self.settle, "settle time")?,
                drain: seconds(self.drain, "drain time")?,
            },
        })
    }
}

/// Flips the returned receiver to `true` on the first Ctrl-C.
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received SIGINT, shutting down");
            let _ = tx.send(true);
        }
        // keep the sender alive so receivers don't see a closed channel
        std::future::pending::<()>().await;
    });
    rx
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run(args) => run(args).await,
        Command::Sweep(args) => sweep(args).await,
        Command::Send(args) => send(args).await,
        Command::Serve(args) => serve(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = args.into_config()?;
    let testbed = LinuxTestbed::new().context("locating own executable")?;
    let mut orchestrator = RunOrchestrator::new(testbed, shutdown_on_ctrl_c());

    let result = match orchestrator.run(&config).await {
        Err(RunError::Interrupted) => anyhow::bail!("run interrupted, partial results discarded"),
        other => other.context("measurement run failed")?,
    };

    for t in &result.throughput {
        tracing::info!(
            interface = %t.interface,
            throughput_mbps = %format!("{:.2}", t.throughput_mbps),
            "bottleneck throughput"
        );
    }
    tracing::info!(
        output = %result.output_dir.display(),
        rtt_points = result.rtt.len(),
        cwnd_points = result.cwnd.len(),
        failed_flows = result.failed_flows,
        wall_clock_s = result.wall_clock.as_secs(),
        "run complete"
    );
    Ok(())
}

async fn sweep(args: SweepArgs) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            SweepConfig::from_toml_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => SweepConfig::default(),
    };
    let dimensions = if args.dimension.is_empty() {
        Dimension::ALL.to_vec()
    } else {
        args.dimension
    };

    let testbed = LinuxTestbed::new().context("locating own executable")?;
    let runs = RunOrchestrator::new(testbed, shutdown_on_ctrl_c());
    let mut orchestrator = SweepOrchestrator::new(runs, config);

    match orchestrator.run_all(&dimensions).await {
        Ok(results) => {
            println!("{}", render_table(&results));
            Ok(())
        }
        Err(SweepError::Interrupted) => anyhow::bail!("sweep interrupted"),
        Err(e) => Err(e).context("sweep failed"),
    }
}

async fn send(args: SendArgs) -> anyhow::Result<()> {
    let verification = Verification::from_flags(args.no_verify, args.ca)?;
    let addr = SocketAddr::new(args.host, args.port);
    let params = PacingParams {
        duration: Duration::from_secs(args.duration),
        target_rate_mbps: args.rate,
        chunk_size: args.chunk_size,
    };

    let mut flow = transport::connect(addr, &verification)
        .await
        .with_context(|| format!("connecting to {addr}"))?;
    let outcome = pacer::send_flow(&mut flow, &params, args.metrics_file.as_deref()).await;
    flow.close().await;
    outcome.with_context(|| format!("flow to {addr}"))?;
    Ok(())
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let identity = match (args.cert, args.key) {
        (Some(cert), Some(key)) => ServerIdentity::Files { cert, key },
        _ => ServerIdentity::Generated,
    };
    let receiver = PassiveReceiver::bind(args.bind, &identity)
        .with_context(|| format!("binding {}", args.bind))?;
    receiver.run(shutdown_on_ctrl_c()).await;
    Ok(())
}
