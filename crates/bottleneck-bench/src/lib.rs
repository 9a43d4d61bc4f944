//! Multi-bottleneck QUIC throughput and RTT measurement harness.
//!
//! A run builds a dumbbell, parking-lot or multi-bottleneck topology,
//! drives paced QUIC flows across it from source to destination hosts,
//! and publishes per-bottleneck throughput together with the time series
//! of average RTT and congestion window. Sweeps repeat runs while varying
//! one of bandwidth, delay or loss.
//!
//! The pipeline is split along the seams it crosses:
//!
//! - [`topology`]: pure description of hosts, switches, shaped links and
//!   monitored interfaces
//! - [`testbed`]: traits the orchestrators drive; [`linux`] implements them
//!   with namespaces and bridges
//! - [`pacer`] / [`transport`]: the sender loop and its QUIC stream
//! - [`counters`], [`metrics_log`], [`aggregate`]: measurement and results
//! - [`run`], [`sweep`]: orchestration

pub mod aggregate;
pub mod config;
pub mod counters;
pub mod error;
pub mod linux;
pub mod metrics_log;
pub mod pacer;
pub mod run;
pub mod sweep;
pub mod testbed;
pub mod topology;
pub mod transport;

pub use config::{Delay, RunConfig, RunTimings};
pub use error::{AggregationError, ConfigError, CounterError, FlowError, ProvisionError, RunError, SweepError};
pub use run::{RunOrchestrator, RunResult};
pub use sweep::{Dimension, SweepConfig, SweepOrchestrator};
pub use topology::{Topology, TopologyKind};
