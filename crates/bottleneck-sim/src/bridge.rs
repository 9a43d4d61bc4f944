use std::io;
use std::process::Command;
use std::time::Duration;

use crate::namespace::check_status;

/// STP forward delay used on looped topologies, in centiseconds (the
/// kernel minimum).
const STP_FORWARD_DELAY_CS: &str = "200";

/// Time for STP to walk listening and learning with the forward delay above,
/// plus one hello interval.
pub const STP_CONVERGENCE: Duration = Duration::from_secs(6);

/// A Linux bridge in the root namespace standing in for an emulated switch.
///
/// Bridge ports stay in the root namespace, so their byte counters are
/// visible under `/sys/class/net/<port>/statistics` without entering any
/// host namespace.
#[derive(Debug)]
pub struct Bridge {
    pub name: String,
}

impl Bridge {
    /// Creates the bridge and brings it up. `stp` must be set when the
    /// switch graph contains a loop, otherwise broadcasts circulate forever.
    pub fn new(name: &str, stp: bool) -> io::Result<Self> {
        let _ = Command::new("ip").args(["link", "del", name]).output();

        let mut args = vec!["link", "add", "name", name, "type", "bridge"];
        if stp {
            args.extend(["stp_state", "1", "forward_delay", STP_FORWARD_DELAY_CS]);
        }
        let output = Command::new("ip").args(&args).output()?;
        check_status(output, &format!("create bridge {name}"))?;

        let bridge = Self {
            name: name.to_string(),
        };
        let output = Command::new("ip")
            .args(["link", "set", name, "up"])
            .output()?;
        check_status(output, &format!("bring bridge {name} up"))?;
        Ok(bridge)
    }

    /// Enslaves a root-namespace interface to this bridge and brings it up.
    pub fn add_port(&self, interface: &str) -> io::Result<()> {
        let output = Command::new("ip")
            .args(["link", "set", interface, "master", &self.name])
            .output()?;
        check_status(output, &format!("attach {interface} to {}", self.name))?;

        let output = Command::new("ip")
            .args(["link", "set", interface, "up"])
            .output()?;
        check_status(output, &format!("bring {interface} up"))?;
        Ok(())
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        let _ = Command::new("ip")
            .args(["link", "del", &self.name])
            .status();
    }
}

/// A veth pair with both ends in the root namespace (switch-to-switch link).
///
/// Deleting either end destroys the pair; that happens on drop.
#[derive(Debug)]
pub struct VethPair {
    pub a: String,
    pub b: String,
}

impl VethPair {
    pub fn new(a: &str, b: &str) -> io::Result<Self> {
        let _ = Command::new("ip").args(["link", "del", a]).output();
        let _ = Command::new("ip").args(["link", "del", b]).output();

        let output = Command::new("ip")
            .args(["link", "add", a, "type", "veth", "peer", "name", b])
            .output()?;
        check_status(output, &format!("create veth pair {a}/{b}"))?;

        Ok(Self {
            a: a.to_string(),
            b: b.to_string(),
        })
    }
}

impl Drop for VethPair {
    fn drop(&mut self) {
        let _ = Command::new("ip").args(["link", "del", &self.a]).status();
    }
}
