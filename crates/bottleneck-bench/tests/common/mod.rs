//! In-memory testbed: counters live in a map, flows are tokio tasks that
//! bump every monitored counter once per second at their target rate and
//! write their samples to the raw metrics file when they finish.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bottleneck_bench::counters::{CounterSource, Direction};
use bottleneck_bench::error::{CounterError, FlowError, ProvisionError};
use bottleneck_bench::metrics_log::{self, Sample};
use bottleneck_bench::testbed::{
    FlowControl, FlowExit, FlowHandle, FlowRole, Network, ReceiverSpec, SenderSpec, Testbed,
};
use bottleneck_bench::topology::{Host, Monitor, Topology};
use bottleneck_bench::{RunConfig, TopologyKind};

type Counters = Arc<Mutex<HashMap<(String, Direction), u64>>>;

/// Arbitrary non-zero starting value so deltas, not absolutes, are tested.
const COUNTER_BASE: u64 = 1_000_000;

#[derive(Default)]
pub struct FakeTestbed {
    /// Provisioning fails when the first bottleneck has one of these capacities.
    pub fail_bandwidths: Vec<f64>,
    /// Senders on these hosts fail right away.
    pub failing_hosts: Vec<String>,
    /// Senders on these hosts never finish on their own.
    pub hanging_hosts: Vec<String>,
    /// Monitored interface left out of the counter map.
    pub missing_interface: Option<String>,
    pub provisioned: Arc<AtomicUsize>,
    pub teardowns: Arc<AtomicUsize>,
    pub senders: Arc<Mutex<Vec<(String, SenderSpec)>>>,
}

impl FakeTestbed {
    pub fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }

    pub fn provisioned(&self) -> usize {
        self.provisioned.load(Ordering::SeqCst)
    }

    pub fn sender_specs(&self) -> Vec<(String, SenderSpec)> {
        self.senders.lock().unwrap().clone()
    }
}

impl Testbed for FakeTestbed {
    type Network = FakeNetwork;

    async fn provision(&mut self, topology: &Topology) -> Result<FakeNetwork, ProvisionError> {
        let first = topology.bottlenecks().next().map(|l| l.spec.bandwidth_mbps);
        if first.is_some_and(|bw| self.fail_bandwidths.contains(&bw)) {
            return Err(ProvisionError::step(
                "create bridge s1",
                std::io::Error::new(std::io::ErrorKind::Other, "injected failure"),
            ));
        }

        let mut counters = HashMap::new();
        for m in topology.monitors() {
            if self.missing_interface.as_deref() != Some(m.interface.as_str()) {
                counters.insert((m.interface.clone(), m.direction), COUNTER_BASE);
            }
        }
        self.provisioned.fetch_add(1, Ordering::SeqCst);

        Ok(FakeNetwork {
            counters: Arc::new(Mutex::new(counters)),
            monitors: topology.monitors().to_vec(),
            addresses: topology
                .hosts
                .iter()
                .map(|h| (h.name.clone(), IpAddr::V4(h.address)))
                .collect(),
            failing_hosts: self.failing_hosts.clone(),
            hanging_hosts: self.hanging_hosts.clone(),
            teardowns: self.teardowns.clone(),
            senders: self.senders.clone(),
        })
    }
}

pub struct FakeNetwork {
    counters: Counters,
    monitors: Vec<Monitor>,
    addresses: HashMap<String, IpAddr>,
    failing_hosts: Vec<String>,
    hanging_hosts: Vec<String>,
    teardowns: Arc<AtomicUsize>,
    senders: Arc<Mutex<Vec<(String, SenderSpec)>>>,
}

impl CounterSource for FakeNetwork {
    fn read(&self, interface: &str, direction: Direction) -> Result<u64, CounterError> {
        self.counters
            .lock()
            .unwrap()
            .get(&(interface.to_string(), direction))
            .copied()
            .ok_or_else(|| CounterError::MissingInterface(interface.to_string()))
    }
}

#[derive(Clone, Copy)]
enum Behaviour {
    Normal,
    Fail,
    Hang,
}

impl Network for FakeNetwork {
    fn address(&self, host: &Host) -> Option<IpAddr> {
        self.addresses.get(&host.name).copied()
    }

    fn spawn_receiver(&mut self, host: &Host, _spec: &ReceiverSpec) -> Result<FlowHandle, FlowError> {
        let (handle, control) = FlowHandle::new(host.name.clone(), FlowRole::Receiver);
        tokio::spawn(async move {
            let FlowControl { done, kill } = control;
            let _ = kill.await;
            let _ = done.send(FlowExit::Killed);
        });
        Ok(handle)
    }

    fn spawn_sender(&mut self, host: &Host, spec: &SenderSpec) -> Result<FlowHandle, FlowError> {
        let behaviour = if self.failing_hosts.contains(&host.name) {
            Behaviour::Fail
        } else if self.hanging_hosts.contains(&host.name) {
            Behaviour::Hang
        } else {
            Behaviour::Normal
        };
        self.senders
            .lock()
            .unwrap()
            .push((host.name.clone(), spec.clone()));

        let (handle, control) = FlowHandle::new(host.name.clone(), FlowRole::Sender);
        let counters = self.counters.clone();
        let monitors = self.monitors.clone();
        let spec = spec.clone();
        let index = host.index;
        tokio::spawn(async move {
            let FlowControl { done, mut kill } = control;
            let exit = tokio::select! {
                exit = fake_flow(behaviour, &spec, &counters, &monitors, index) => exit,
                _ = &mut kill => FlowExit::Killed,
            };
            let _ = done.send(exit);
        });
        Ok(handle)
    }

    async fn teardown(self) {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// RTT reported by the flow from host `index`.
pub fn flow_rtt_ms(index: usize) -> f64 {
    10.0 + index as f64
}

/// Congestion window reported by the flow from host `index`.
pub fn flow_cwnd(index: usize) -> u64 {
    1000 * (index as u64 + 1)
}

async fn fake_flow(
    behaviour: Behaviour,
    spec: &SenderSpec,
    counters: &Counters,
    monitors: &[Monitor],
    index: usize,
) -> FlowExit {
    match behaviour {
        Behaviour::Fail => return FlowExit::Failed("connection refused".into()),
        Behaviour::Hang => std::future::pending::<()>().await,
        Behaviour::Normal => {}
    }

    let secs = spec.duration.as_secs();
    let bytes_per_sec = (spec.rate_mbps * 1e6 / 8.0).round() as u64;
    let mut samples = Vec::new();
    for t in 1..=secs {
        tokio::time::sleep(Duration::from_secs(1)).await;
        {
            let mut map = counters.lock().unwrap();
            for m in monitors {
                if let Some(v) = map.get_mut(&(m.interface.clone(), m.direction)) {
                    *v += bytes_per_sec;
                }
            }
        }
        // a sample is due once per full second, never at the very end
        if t < secs {
            samples.push(Sample {
                time: t,
                rtt_ms: flow_rtt_ms(index),
                cwnd_bytes: Some(flow_cwnd(index)),
            });
        }
    }

    match metrics_log::append_batch(&spec.metrics_file, &samples) {
        Ok(()) => FlowExit::Success,
        Err(e) => FlowExit::Failed(e.to_string()),
    }
}

/// Short run with instant settle.
pub fn quick_config(dir: &Path, topology: TopologyKind, bandwidth_mbps: f64, hosts: usize) -> RunConfig {
    let mut config = RunConfig::new(topology, bandwidth_mbps, bottleneck_bench::Delay::from_millis(1), 0.0);
    config.duration = Duration::from_secs(5);
    config.hosts = hosts;
    config.output_dir = dir.join("run");
    config
}
