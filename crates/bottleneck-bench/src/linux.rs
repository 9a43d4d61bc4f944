//! Linux testbed: namespaces for hosts, root-namespace bridges for switches,
//! `tc netem` on both ends of every link, and flows run as child processes
//! of this binary (`send` / `serve`) inside the host namespaces.

use std::collections::HashMap;
use std::fs::File;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use bottleneck_sim::{
    apply_impairment, check_privileges, Bridge, ImpairmentConfig, Namespace, RootNs, VethPair,
    STP_CONVERGENCE,
};

use crate::counters::{CounterSource, Direction, SysfsCounters};
use crate::error::{CounterError, FlowError, ProvisionError};
use crate::testbed::{
    FlowControl, FlowExit, FlowHandle, FlowRole, Network, ReceiverSpec, SenderSpec, Testbed,
};
use crate::topology::{Host, LinkKind, LinkSpec, NodeId, Topology};

/// Grace period between SIGINT and SIGKILL for a flow process.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// Log filter handed to flow processes unless overridden.
pub const FLOW_LOG_FILTER: &str = "warn";

/// netem parameters for one end of a link.
pub fn shaping(spec: &LinkSpec) -> ImpairmentConfig {
    ImpairmentConfig {
        delay_us: Some(spec.delay.as_micros()),
        jitter_us: spec.jitter.map(|j| j.as_micros()),
        loss_percent: Some(spec.loss_pct),
        rate_kbit: Some((spec.bandwidth_mbps * 1000.0).round().max(1.0) as u64),
        limit_packets: spec.max_queue,
    }
}

pub struct LinuxTestbed {
    exe: PathBuf,
    flow_log_filter: String,
}

impl LinuxTestbed {
    /// Flows re-execute the current binary.
    pub fn new() -> Result<Self, ProvisionError> {
        let exe = std::env::current_exe()
            .map_err(|e| ProvisionError::step("locate current executable", e))?;
        Ok(Self::with_executable(exe))
    }

    /// Flows run `exe send ...` / `exe serve ...`.
    pub fn with_executable(exe: impl Into<PathBuf>) -> Self {
        Self {
            exe: exe.into(),
            flow_log_filter: FLOW_LOG_FILTER.to_string(),
        }
    }

    pub fn flow_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.flow_log_filter = filter.into();
        self
    }
}

impl Testbed for LinuxTestbed {
    type Network = LinuxNetwork;

    /// Every step shells out to `ip` or `tc`, so the whole build runs on the
    /// blocking pool.
    async fn provision(&mut self, topology: &Topology) -> Result<LinuxNetwork, ProvisionError> {
        let topology = topology.clone();
        let exe = self.exe.clone();
        let filter = self.flow_log_filter.clone();
        tokio::task::spawn_blocking(move || build_network(&topology, exe, filter))
            .await
            .map_err(|e| ProvisionError::step("provision network", std::io::Error::other(e)))?
    }
}

fn build_network(
    topology: &Topology,
    exe: PathBuf,
    flow_log_filter: String,
) -> Result<LinuxNetwork, ProvisionError> {
    if !check_privileges() {
        return Err(ProvisionError::Privileges);
    }

    let mut net = LinuxNetwork {
        namespaces: HashMap::new(),
        trunks: Vec::new(),
        bridges: Vec::new(),
        addresses: HashMap::new(),
        counters: SysfsCounters::new(),
        exe,
        flow_log_filter,
        convergence: if topology.has_loop() {
            STP_CONVERGENCE
        } else {
            Duration::ZERO
        },
    };

    for switch in &topology.switches {
        let bridge = Bridge::new(&switch.name, topology.has_loop())
            .map_err(|e| ProvisionError::step(format!("create switch {}", switch.name), e))?;
        net.bridges.push(bridge);
    }

    for host in &topology.hosts {
        let ns = Namespace::new(&host.name)
            .map_err(|e| ProvisionError::step(format!("create host {}", host.name), e))?;
        if let Some(share) = host.cpu_share {
            tracing::debug!(host = %host.name, cpu_share = share, "cpu share recorded, not enforced");
        }
        net.namespaces.insert(host.name.clone(), ns);
        net.addresses.insert(host.name.clone(), IpAddr::V4(host.address));
    }

    for link in &topology.links {
        let netem = shaping(&link.spec);
        match (link.kind, link.a.node, link.b.node) {
            (LinkKind::Access, NodeId::Host(h), NodeId::Switch(s)) => {
                let host = &topology.hosts[h];
                let ns = &net.namespaces[&host.name];
                ns.attach_veth(&link.a.interface, &link.b.interface, &host.cidr())
                    .map_err(|e| {
                        ProvisionError::step(format!("attach {} to {}", host.name, link.b.interface), e)
                    })?;
                net.bridges[s].add_port(&link.b.interface).map_err(|e| {
                    ProvisionError::step(format!("add port {}", link.b.interface), e)
                })?;
                apply_impairment(ns, &link.a.interface, &netem)
                    .map_err(|e| ProvisionError::step(format!("shape {}", link.a.interface), e))?;
                apply_impairment(&RootNs, &link.b.interface, &netem)
                    .map_err(|e| ProvisionError::step(format!("shape {}", link.b.interface), e))?;
            }
            (_, NodeId::Switch(sa), NodeId::Switch(sb)) => {
                let pair = VethPair::new(&link.a.interface, &link.b.interface).map_err(|e| {
                    ProvisionError::step(
                        format!("link {} and {}", link.a.interface, link.b.interface),
                        e,
                    )
                })?;
                net.trunks.push(pair);
                for (bridge, iface) in [(sa, &link.a.interface), (sb, &link.b.interface)] {
                    net.bridges[bridge].add_port(iface).map_err(|e| {
                        ProvisionError::step(format!("add port {iface}"), e)
                    })?;
                    apply_impairment(&RootNs, iface, &netem)
                        .map_err(|e| ProvisionError::step(format!("shape {iface}"), e))?;
                }
            }
            _ => {
                return Err(ProvisionError::step(
                    format!("link {} and {}", link.a.interface, link.b.interface),
                    std::io::Error::other("unsupported link endpoints"),
                ));
            }
        }
    }

    tracing::info!(
        topology = %topology.kind,
        hosts = topology.hosts.len(),
        switches = topology.switches.len(),
        links = topology.links.len(),
        stp = topology.has_loop(),
        "network provisioned"
    );
    Ok(net)
}

/// A provisioned topology. Dropping it removes everything it created.
pub struct LinuxNetwork {
    // drop order: hosts (and their veths) first, then trunks, then bridges
    namespaces: HashMap<String, Namespace>,
    trunks: Vec<VethPair>,
    bridges: Vec<Bridge>,
    addresses: HashMap<String, IpAddr>,
    counters: SysfsCounters,
    exe: PathBuf,
    flow_log_filter: String,
    convergence: Duration,
}

impl LinuxNetwork {
    fn spawn(
        &self,
        host: &Host,
        role: FlowRole,
        args: Vec<String>,
        log_file: &Path,
    ) -> Result<FlowHandle, FlowError> {
        let spawn_err = |source: std::io::Error| FlowError::Spawn {
            role: role.as_str(),
            host: host.name.clone(),
            source,
        };

        let ns = self.namespaces.get(&host.name).ok_or_else(|| {
            spawn_err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "host not provisioned",
            ))
        })?;
        let log = File::create(log_file).map_err(spawn_err)?;
        let log_err = log.try_clone().map_err(spawn_err)?;

        let exe = self.exe.to_string_lossy();
        let mut cmd = ns.command(&exe);
        cmd.args(&args)
            .env("RUST_LOG", &self.flow_log_filter)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        let mut cmd = tokio::process::Command::from(cmd);
        cmd.kill_on_drop(true);
        let child = cmd.spawn().map_err(spawn_err)?;

        tracing::debug!(host = %host.name, %role, pid = ?child.id(), "flow started");
        let (handle, control) = FlowHandle::new(host.name.clone(), role);
        tokio::spawn(supervise(child, control, host.name.clone(), role));
        Ok(handle)
    }
}

async fn supervise(mut child: tokio::process::Child, control: FlowControl, host: String, role: FlowRole) {
    let FlowControl { done, mut kill } = control;
    let exit = tokio::select! {
        status = child.wait() => match status {
            Ok(s) if s.success() => FlowExit::Success,
            Ok(s) => FlowExit::Failed(format!("exited with {s}")),
            Err(e) => FlowExit::Failed(e.to_string()),
        },
        _ = &mut kill => {
            terminate(&mut child, &host).await;
            FlowExit::Killed
        }
    };
    tracing::debug!(%host, %role, exit = %exit, "flow exited");
    let _ = done.send(exit);
}

async fn terminate(child: &mut tokio::process::Child, host: &str) {
    if let Some(pid) = child.id() {
        // SAFETY: `pid` is our own child which has not been reaped yet
        // (`id()` returns None after that), so it cannot name another process.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGINT);
        }
    }
    if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_err() {
        tracing::warn!(%host, "flow didn't exit cleanly, killing");
        let _ = child.kill().await;
    }
}

impl CounterSource for LinuxNetwork {
    fn read(&self, interface: &str, direction: Direction) -> Result<u64, CounterError> {
        self.counters.read(interface, direction)
    }
}

impl Network for LinuxNetwork {
    fn address(&self, host: &Host) -> Option<IpAddr> {
        self.addresses.get(&host.name).copied()
    }

    fn convergence_time(&self) -> Duration {
        self.convergence
    }

    fn spawn_receiver(&mut self, host: &Host, spec: &ReceiverSpec) -> Result<FlowHandle, FlowError> {
        let args = vec!["serve".to_string(), "--bind".to_string(), spec.bind.to_string()];
        self.spawn(host, FlowRole::Receiver, args, &spec.log_file)
    }

    fn spawn_sender(&mut self, host: &Host, spec: &SenderSpec) -> Result<FlowHandle, FlowError> {
        let args = vec![
            "send".to_string(),
            "--host".to_string(),
            spec.destination.ip().to_string(),
            "--port".to_string(),
            spec.destination.port().to_string(),
            "--duration".to_string(),
            spec.duration.as_secs().to_string(),
            "--rate".to_string(),
            spec.rate_mbps.to_string(),
            "--chunk-size".to_string(),
            spec.chunk_size.to_string(),
            "--metrics-file".to_string(),
            spec.metrics_file.to_string_lossy().into_owned(),
            "--no-verify".to_string(),
        ];
        self.spawn(host, FlowRole::Sender, args, &spec.log_file)
    }

    async fn teardown(self) {
        let hosts = self.namespaces.len();
        let switches = self.bridges.len();
        // removal shells out per interface, keep it off the runtime threads
        if let Err(e) = tokio::task::spawn_blocking(move || drop(self)).await {
            tracing::warn!(error = %e, "network teardown did not complete");
            return;
        }
        tracing::info!(hosts, switches, "network torn down");
    }
}
