//! Error taxonomy for the measurement pipeline.
//!
//! - [`ConfigError`]: rejected before anything is provisioned
//! - [`ProvisionError`]: fatal to the run, teardown still happens
//! - [`FlowError`]: isolated to one sender or receiver
//! - [`CounterError`]: a monitored interface is missing or unreadable
//! - [`AggregationError`]: raw metrics or result files unreadable
//! - [`RunError`] / [`SweepError`]: what the orchestrators surface

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown topology '{0}' (expected dumbbell, parkinglot or multibottleneck)")]
    UnknownTopology(String),
    #[error("host count must be even and at least {min}, got {got}")]
    HostCount { got: usize, min: usize },
    #[error("invalid delay '{0}' (expected e.g. 500us, 2ms or 1s)")]
    InvalidDelay(String),
    #[error("{what} must be positive, got {value}")]
    NotPositive { what: &'static str, value: f64 },
    #[error("loss must be within 0..=100 percent, got {0}")]
    Loss(f64),
    #[error("at most {max} hosts fit the address plan, got {got}")]
    TooManyHosts { got: usize, max: usize },
    #[error("{what} out of range: {value}")]
    OutOfRange { what: &'static str, value: f64 },
    #[error("no way to verify the receiver's certificate: pass --ca <pem> or --no-verify")]
    NoTrustAnchor,
    #[error("{topology} needs {expected} bottleneck capacities, got {got}")]
    Bandwidths {
        topology: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("invalid sweep config: {0}")]
    Sweep(String),
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("insufficient privileges: root with `ip` and `tc` is required")]
    Privileges,
    #[error("failed to {step}: {source}")]
    Step {
        step: String,
        #[source]
        source: io::Error,
    },
}

impl ProvisionError {
    pub fn step(step: impl Into<String>, source: io::Error) -> Self {
        ProvisionError::Step {
            step: step.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum CounterError {
    #[error("monitored interface {0} does not exist")]
    MissingInterface(String),
    #[error("failed to read counter {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed counter value in {path}: {value:?}")]
    Malformed { path: PathBuf, value: String },
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("failed to spawn {role} on {host}: {source}")]
    Spawn {
        role: &'static str,
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("no address known for host {0}")]
    NoAddress(String),
    #[error("TLS setup failed: {0}")]
    Tls(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("endpoint error: {0}")]
    Endpoint(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("{0} not found")]
    Missing(PathBuf),
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

impl AggregationError {
    pub(crate) fn io(path: &std::path::Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            AggregationError::Missing(path.to_path_buf())
        } else {
            AggregationError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    pub(crate) fn csv(path: &std::path::Path, source: csv::Error) -> Self {
        let missing = matches!(
            source.kind(),
            csv::ErrorKind::Io(e) if e.kind() == io::ErrorKind::NotFound
        );
        if missing {
            AggregationError::Missing(path.to_path_buf())
        } else {
            AggregationError::Csv {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Counter(#[from] CounterError),
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
    #[error("failed to prepare output directory {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("run interrupted")]
    Interrupted,
}

#[derive(Debug, Error)]
pub enum SweepError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Output(#[from] AggregationError),
    #[error("sweep interrupted")]
    Interrupted,
}
