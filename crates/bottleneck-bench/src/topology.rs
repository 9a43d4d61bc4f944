//! # Topology Model
//!
//! Declarative host/switch/link graphs for the three bottleneck shapes.
//! Building a [`Topology`] touches nothing on the system; provisioning is
//! done by a [`Testbed`](crate::testbed::Testbed).
//!
//! Switch ports are numbered per switch from 1 in link-creation order, so
//! the interface name of every bottleneck endpoint (`s1-eth21` for the
//! dumbbell with 40 hosts) follows from the host count alone.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::config::{Delay, RunConfig};
use crate::counters::Direction;
use crate::error::ConfigError;

/// Smallest host count that still splits destinations across two switches.
pub const MIN_HOSTS: usize = 4;

/// Largest host count whose addresses stay unique within `10.0.0.0/16`.
pub const MAX_HOSTS: usize = 65_534;

/// Fixed small capacity of every host-to-switch link. With few hosts a
/// flow's share can exceed it, and the access link rather than the
/// bottleneck then limits that flow.
pub const ACCESS_LINK_MBPS: f64 = 1.0;

pub const ACCESS_LINK_DELAY_MS: u64 = 1;

/// Queue bound on every inter-switch link.
pub const BOTTLENECK_QUEUE_PACKETS: u32 = 100;

/// CPU share assigned to dumbbell sources.
pub const SOURCE_CPU_SHARE: f64 = 0.1;

// ─── Topology registry ──────────────────────────────────────────────────────

/// Host counts must be even, at least [`MIN_HOSTS`] and at most [`MAX_HOSTS`].
pub fn check_host_count(hosts: usize) -> Result<(), ConfigError> {
    if hosts % 2 != 0 || hosts < MIN_HOSTS {
        return Err(ConfigError::HostCount {
            got: hosts,
            min: MIN_HOSTS,
        });
    }
    if hosts > MAX_HOSTS {
        return Err(ConfigError::TooManyHosts {
            got: hosts,
            max: MAX_HOSTS,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopologyKind {
    /// Two switches, one bottleneck between them.
    Dumbbell,
    /// Three switches in a line, two bottlenecks in series.
    ParkingLot,
    /// Fan-out, converge, fan-out across six switches.
    MultiBottleneck,
}

impl TopologyKind {
    pub const ALL: [TopologyKind; 3] = [
        TopologyKind::Dumbbell,
        TopologyKind::ParkingLot,
        TopologyKind::MultiBottleneck,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TopologyKind::Dumbbell => "dumbbell",
            TopologyKind::ParkingLot => "parkinglot",
            TopologyKind::MultiBottleneck => "multibottleneck",
        }
    }

    /// Number of distinct bottleneck capacities the shape takes.
    pub fn stages(self) -> usize {
        match self {
            TopologyKind::Dumbbell => 1,
            TopologyKind::ParkingLot => 2,
            TopologyKind::MultiBottleneck => 3,
        }
    }

    /// Whether the switch graph has a cycle and needs spanning tree.
    pub fn has_loop(self) -> bool {
        matches!(self, TopologyKind::MultiBottleneck)
    }
}

impl FromStr for TopologyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dumbbell" => Ok(TopologyKind::Dumbbell),
            "parkinglot" | "parking-lot" | "parking_lot" => Ok(TopologyKind::ParkingLot),
            "multibottleneck" | "multi-bottleneck" | "multi_bottleneck" => {
                Ok(TopologyKind::MultiBottleneck)
            }
            other => Err(ConfigError::UnknownTopology(other.to_string())),
        }
    }
}

impl fmt::Display for TopologyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl serde::Serialize for TopologyKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> serde::Deserialize<'de> for TopologyKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ─── Graph types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Source,
    Destination,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Host {
    /// `h<index>`
    pub name: String,
    pub index: usize,
    pub role: Role,
    /// Fraction of one CPU the host may use, when capped.
    pub cpu_share: Option<f64>,
    pub address: Ipv4Addr,
}

impl Host {
    /// The host's only interface.
    pub fn interface(&self) -> String {
        format!("{}-eth0", self.name)
    }

    /// Address with prefix, as handed to `ip addr add`.
    pub fn cidr(&self) -> String {
        format!("{}/8", self.address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Switch {
    /// `s<k>`, counting from 1
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeId {
    Host(usize),
    Switch(usize),
}

/// One end of a link and the interface carrying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    pub node: NodeId,
    pub interface: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkSpec {
    pub bandwidth_mbps: f64,
    pub delay: Delay,
    pub jitter: Option<Delay>,
    pub loss_pct: f64,
    /// Queue bound in packets; `None` leaves it to the shaper.
    pub max_queue: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Access,
    Bottleneck,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub a: Port,
    pub b: Port,
    pub kind: LinkKind,
    pub spec: LinkSpec,
}

/// A counter whose before/after delta yields one throughput figure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Monitor {
    pub interface: String,
    pub direction: Direction,
}

/// Bottleneck capacities in Mbps, one per stage of the shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Bandwidths(Vec<f64>);

impl Bandwidths {
    /// Derives stage capacities from the first: `bw`, `0.8·bw`, `0.6·bw`.
    pub fn for_kind(kind: TopologyKind, bandwidth_mbps: f64) -> Self {
        let all = [bandwidth_mbps, 0.8 * bandwidth_mbps, 0.6 * bandwidth_mbps];
        Bandwidths(all[..kind.stages()].to_vec())
    }

    /// Independently specified stage capacities.
    pub fn explicit(kind: TopologyKind, stages: Vec<f64>) -> Result<Self, ConfigError> {
        if stages.len() != kind.stages() {
            return Err(ConfigError::Bandwidths {
                topology: kind.name(),
                expected: kind.stages(),
                got: stages.len(),
            });
        }
        if let Some(bad) = stages.iter().copied().find(|bw| !(*bw > 0.0)) {
            return Err(ConfigError::NotPositive {
                what: "bottleneck bandwidth",
                value: bad,
            });
        }
        Ok(Bandwidths(stages))
    }

    pub fn stage(&self, i: usize) -> f64 {
        self.0[i]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
}

/// Delay, jitter and loss shared by every bottleneck link.
#[derive(Debug, Clone, PartialEq)]
pub struct BottleneckShape {
    pub delay: Delay,
    pub jitter: Option<Delay>,
    pub loss_pct: f64,
}

#[derive(Debug, Clone)]
pub struct Topology {
    pub kind: TopologyKind,
    pub hosts: Vec<Host>,
    pub switches: Vec<Switch>,
    pub links: Vec<Link>,
    monitors: Vec<Monitor>,
}

impl Topology {
    pub fn for_run(config: &RunConfig) -> Result<Self, ConfigError> {
        let bandwidths = Bandwidths::for_kind(config.topology, config.bandwidth_mbps);
        let shape = BottleneckShape {
            delay: config.delay,
            jitter: config.jitter,
            loss_pct: config.loss_pct,
        };
        Self::build(config.topology, &bandwidths, &shape, config.hosts)
    }

    pub fn build(
        kind: TopologyKind,
        bandwidths: &Bandwidths,
        shape: &BottleneckShape,
        host_count: usize,
    ) -> Result<Self, ConfigError> {
        check_host_count(host_count)?;
        if bandwidths.as_slice().len() != kind.stages() {
            return Err(ConfigError::Bandwidths {
                topology: kind.name(),
                expected: kind.stages(),
                got: bandwidths.as_slice().len(),
            });
        }

        let mut b = Builder::new(shape);
        let mid = host_count / 2;
        let near = mid / 2;

        let topo = match kind {
            TopologyKind::Dumbbell => {
                let s1 = b.switch();
                let s2 = b.switch();
                for _ in 0..mid {
                    let h = b.host(Role::Source, Some(SOURCE_CPU_SHARE));
                    b.access(h, s1);
                }
                b.destinations(host_count - mid, s2);
                let (out, _) = b.trunk(s1, s2, bandwidths.stage(0));
                b.monitor(out, Direction::Transmitted);
                b.finish(kind)
            }
            TopologyKind::ParkingLot => {
                let s1 = b.switch();
                let s2 = b.switch();
                let s3 = b.switch();
                b.sources(mid, s1);
                b.destinations(near, s2);
                b.destinations(mid - near, s3);
                let (first, _) = b.trunk(s1, s2, bandwidths.stage(0));
                let (second, _) = b.trunk(s2, s3, bandwidths.stage(1));
                b.monitor(first, Direction::Transmitted);
                b.monitor(second, Direction::Transmitted);
                b.finish(kind)
            }
            TopologyKind::MultiBottleneck => {
                let s: Vec<usize> = (0..6).map(|_| b.switch()).collect();
                b.sources(mid, s[0]);
                b.destinations(near, s[4]);
                b.destinations(mid - near, s[5]);

                let (s1_to_s2, s2_from_s1) = b.trunk(s[0], s[1], bandwidths.stage(0));
                b.trunk(s[0], s[2], bandwidths.stage(1));
                let (s2_to_s4, _) = b.trunk(s[1], s[3], bandwidths.stage(1));
                let (s3_to_s4, _) = b.trunk(s[2], s[3], bandwidths.stage(1));
                let (s4_to_s5, _) = b.trunk(s[3], s[4], bandwidths.stage(2));
                let (s4_to_s6, _) = b.trunk(s[3], s[5], bandwidths.stage(2));

                for iface in [s1_to_s2, s2_to_s4, s3_to_s4, s4_to_s5, s4_to_s6] {
                    b.monitor(iface, Direction::Transmitted);
                }
                b.monitor(s2_from_s1, Direction::Received);
                b.finish(kind)
            }
        };
        Ok(topo)
    }

    /// Transmit-side bottleneck interfaces, in stage order.
    pub fn monitored_interfaces(&self) -> Vec<&str> {
        self.monitors_in(Direction::Transmitted)
    }

    /// Receive-side interfaces at convergence points; empty unless the
    /// shape branches.
    pub fn secondary_monitored_interfaces(&self) -> Vec<&str> {
        self.monitors_in(Direction::Received)
    }

    /// Every monitor, transmit side first.
    pub fn monitors(&self) -> &[Monitor] {
        &self.monitors
    }

    fn monitors_in(&self, direction: Direction) -> Vec<&str> {
        self.monitors
            .iter()
            .filter(|m| m.direction == direction)
            .map(|m| m.interface.as_str())
            .collect()
    }

    pub fn sources(&self) -> impl Iterator<Item = &Host> {
        self.hosts.iter().filter(|h| h.role == Role::Source)
    }

    pub fn destinations(&self) -> impl Iterator<Item = &Host> {
        self.hosts.iter().filter(|h| h.role == Role::Destination)
    }

    /// The i-th source sends to the i-th destination.
    pub fn flow_pairs(&self) -> Vec<(&Host, &Host)> {
        self.sources().zip(self.destinations()).collect()
    }

    pub fn has_loop(&self) -> bool {
        self.kind.has_loop()
    }

    pub fn bottlenecks(&self) -> impl Iterator<Item = &Link> {
        self.links.iter().filter(|l| l.kind == LinkKind::Bottleneck)
    }
}

// ─── Builder ────────────────────────────────────────────────────────────────

struct Builder<'a> {
    shape: &'a BottleneckShape,
    hosts: Vec<Host>,
    switches: Vec<Switch>,
    next_port: Vec<u32>,
    links: Vec<Link>,
    monitors: Vec<Monitor>,
}

impl<'a> Builder<'a> {
    fn new(shape: &'a BottleneckShape) -> Self {
        Self {
            shape,
            hosts: Vec::new(),
            switches: Vec::new(),
            next_port: Vec::new(),
            links: Vec::new(),
            monitors: Vec::new(),
        }
    }

    fn switch(&mut self) -> usize {
        let idx = self.switches.len();
        self.switches.push(Switch {
            name: format!("s{}", idx + 1),
        });
        self.next_port.push(1);
        idx
    }

    fn host(&mut self, role: Role, cpu_share: Option<f64>) -> usize {
        let index = self.hosts.len();
        let n = index + 1;
        self.hosts.push(Host {
            name: format!("h{index}"),
            index,
            role,
            cpu_share,
            address: Ipv4Addr::new(10, 0, (n >> 8) as u8, (n & 0xff) as u8),
        });
        index
    }

    fn sources(&mut self, count: usize, switch: usize) {
        for _ in 0..count {
            let h = self.host(Role::Source, None);
            self.access(h, switch);
        }
    }

    fn destinations(&mut self, count: usize, switch: usize) {
        for _ in 0..count {
            let h = self.host(Role::Destination, None);
            self.access(h, switch);
        }
    }

    fn port(&mut self, switch: usize) -> Port {
        let p = self.next_port[switch];
        self.next_port[switch] += 1;
        Port {
            node: NodeId::Switch(switch),
            interface: format!("{}-eth{p}", self.switches[switch].name),
        }
    }

    fn access(&mut self, host: usize, switch: usize) {
        let a = Port {
            node: NodeId::Host(host),
            interface: self.hosts[host].interface(),
        };
        let b = self.port(switch);
        self.links.push(Link {
            a,
            b,
            kind: LinkKind::Access,
            spec: LinkSpec {
                bandwidth_mbps: ACCESS_LINK_MBPS,
                delay: Delay::from_millis(ACCESS_LINK_DELAY_MS),
                jitter: None,
                loss_pct: 0.0,
                max_queue: None,
            },
        });
    }

    /// Adds a bottleneck between two switches and returns the interface
    /// names on `from` and on `to`.
    fn trunk(&mut self, from: usize, to: usize, bandwidth_mbps: f64) -> (String, String) {
        let a = self.port(from);
        let b = self.port(to);
        let names = (a.interface.clone(), b.interface.clone());
        self.links.push(Link {
            a,
            b,
            kind: LinkKind::Bottleneck,
            spec: LinkSpec {
                bandwidth_mbps,
                delay: self.shape.delay,
                jitter: self.shape.jitter,
                loss_pct: self.shape.loss_pct,
                max_queue: Some(BOTTLENECK_QUEUE_PACKETS),
            },
        });
        names
    }

    fn monitor(&mut self, interface: String, direction: Direction) {
        self.monitors.push(Monitor {
            interface,
            direction,
        });
    }

    fn finish(self, kind: TopologyKind) -> Topology {
        let mut monitors = self.monitors;
        // transmit side first, stable within each direction
        monitors.sort_by_key(|m| m.direction == Direction::Received);
        Topology {
            kind,
            hosts: self.hosts,
            switches: self.switches,
            links: self.links,
            monitors,
        }
    }
}
