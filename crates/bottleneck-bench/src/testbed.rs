//! Seams between the orchestrators and the emulation platform.
//!
//! A [`Testbed`] turns a [`Topology`] into a running [`Network`]; the
//! network reads counters, starts flows on hosts and tears itself down.
//! Every started flow is represented by a [`FlowHandle`] whose supervisor
//! reports the flow's exit on a one-shot channel.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::counters::CounterSource;
use crate::error::{FlowError, ProvisionError};
use crate::topology::{Host, Topology};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowRole {
    Sender,
    Receiver,
}

impl FlowRole {
    /// Suffix used for per-flow log files.
    pub fn log_suffix(self) -> &'static str {
        match self {
            FlowRole::Sender => "client",
            FlowRole::Receiver => "server",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FlowRole::Sender => "sender",
            FlowRole::Receiver => "receiver",
        }
    }
}

impl fmt::Display for FlowRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SenderSpec {
    pub destination: SocketAddr,
    pub duration: Duration,
    pub rate_mbps: f64,
    pub chunk_size: usize,
    pub metrics_file: PathBuf,
    pub log_file: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceiverSpec {
    pub bind: SocketAddr,
    pub log_file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowExit {
    Success,
    Failed(String),
    /// Terminated on request before it finished on its own.
    Killed,
}

impl fmt::Display for FlowExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowExit::Success => f.write_str("success"),
            FlowExit::Failed(reason) => write!(f, "failed: {reason}"),
            FlowExit::Killed => f.write_str("killed"),
        }
    }
}

/// The supervisor's half of a [`FlowHandle`].
///
/// `kill` resolves when the handle asks for termination or is dropped.
#[derive(Debug)]
pub struct FlowControl {
    pub done: oneshot::Sender<FlowExit>,
    pub kill: oneshot::Receiver<()>,
}

/// The orchestrator's view of one running sender or receiver.
#[derive(Debug)]
pub struct FlowHandle {
    host: String,
    role: FlowRole,
    done: Option<oneshot::Receiver<FlowExit>>,
    kill: Option<oneshot::Sender<()>>,
    exit: Option<FlowExit>,
}

impl FlowHandle {
    pub fn new(host: impl Into<String>, role: FlowRole) -> (FlowHandle, FlowControl) {
        let (done_tx, done_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let handle = FlowHandle {
            host: host.into(),
            role,
            done: Some(done_rx),
            kill: Some(kill_tx),
            exit: None,
        };
        (
            handle,
            FlowControl {
                done: done_tx,
                kill: kill_rx,
            },
        )
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn role(&self) -> FlowRole {
        self.role
    }

    /// Waits for the flow to exit. Cancel safe; once resolved the exit is
    /// remembered.
    pub async fn wait(&mut self) -> FlowExit {
        if let Some(exit) = &self.exit {
            return exit.clone();
        }
        let exit = match self.done.as_mut() {
            Some(rx) => rx
                .await
                .unwrap_or_else(|_| FlowExit::Failed("supervisor vanished".into())),
            None => FlowExit::Failed("supervisor vanished".into()),
        };
        self.done = None;
        self.exit = Some(exit.clone());
        exit
    }

    /// Exit status if already known, without waiting.
    pub fn try_exit(&mut self) -> Option<FlowExit> {
        if self.exit.is_none() {
            if let Some(rx) = self.done.as_mut() {
                match rx.try_recv() {
                    Ok(exit) => {
                        self.exit = Some(exit);
                        self.done = None;
                    }
                    Err(oneshot::error::TryRecvError::Empty) => {}
                    Err(oneshot::error::TryRecvError::Closed) => {
                        self.exit = Some(FlowExit::Failed("supervisor vanished".into()));
                        self.done = None;
                    }
                }
            }
        }
        self.exit.clone()
    }

    /// Asks the supervisor to terminate the flow; a no-op once it exited.
    pub fn kill(&mut self) {
        if let Some(tx) = self.kill.take() {
            let _ = tx.send(());
        }
    }
}

/// A provisioned topology.
#[allow(async_fn_in_trait)]
pub trait Network: CounterSource {
    /// Address reachable from every other host.
    fn address(&self, host: &Host) -> Option<IpAddr>;

    /// Extra time the fabric needs before it forwards reliably.
    fn convergence_time(&self) -> Duration {
        Duration::ZERO
    }

    fn spawn_receiver(&mut self, host: &Host, spec: &ReceiverSpec) -> Result<FlowHandle, FlowError>;

    fn spawn_sender(&mut self, host: &Host, spec: &SenderSpec) -> Result<FlowHandle, FlowError>;

    /// Releases every host, switch and link. Best effort, never fails.
    async fn teardown(self);
}

/// An emulation platform able to instantiate topologies.
#[allow(async_fn_in_trait)]
pub trait Testbed {
    type Network: Network;

    async fn provision(&mut self, topology: &Topology) -> Result<Self::Network, ProvisionError>;
}
