use std::io;
use std::process::{Command, Output};

/// Something that can run a command inside a network context.
pub trait Exec {
    fn exec(&self, cmd: &str, args: &[&str]) -> io::Result<Output>;
}

/// The root network namespace, home of the switch bridges and their ports.
#[derive(Debug, Clone, Copy, Default)]
pub struct RootNs;

impl Exec for RootNs {
    fn exec(&self, cmd: &str, args: &[&str]) -> io::Result<Output> {
        Command::new(cmd).args(args).output()
    }
}

/// Turns a non-zero exit status into an error carrying stderr.
pub(crate) fn check_status(output: Output, what: &str) -> io::Result<Output> {
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "Failed to {what}: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(output)
}

/// A Linux network namespace managed via `ip netns`, one per emulated host.
///
/// Creates the namespace on construction, initializes loopback, and
/// deletes the namespace on drop. Deleting the namespace also destroys
/// the veth ends living inside it, which takes their root-side peers
/// down with them.
#[derive(Debug)]
pub struct Namespace {
    pub name: String,
}

impl Namespace {
    pub fn new(name: &str) -> io::Result<Self> {
        // cleanup any leftover namespace with the same name
        let _ = Command::new("ip").args(["netns", "del", name]).output();

        let output = Command::new("ip").args(["netns", "add", name]).output()?;
        check_status(output, &format!("create netns {name}"))?;

        let ns = Self {
            name: name.to_string(),
        };
        let _ = ns.exec("ip", &["link", "set", "lo", "up"]);
        Ok(ns)
    }

    /// Builds a command that runs `program` inside this namespace.
    ///
    /// `ip netns exec` replaces itself with `program`, so the spawned
    /// child's pid is the program's pid and signals reach it directly.
    pub fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new("ip");
        cmd.args(["netns", "exec", &self.name, program]);
        cmd
    }

    /// Creates a veth pair in the root namespace, moves `local` into this
    /// namespace with address `cidr`, and leaves `peer` in the root
    /// namespace (down) for the caller to attach to a bridge.
    pub fn attach_veth(&self, local: &str, peer: &str, cidr: &str) -> io::Result<()> {
        let _ = Command::new("ip").args(["link", "del", local]).output();
        let _ = Command::new("ip").args(["link", "del", peer]).output();

        let output = Command::new("ip")
            .args(["link", "add", local, "type", "veth", "peer", "name", peer])
            .output()?;
        check_status(output, &format!("create veth pair {local}/{peer}"))?;

        let output = Command::new("ip")
            .args(["link", "set", local, "netns", &self.name])
            .output()?;
        check_status(output, &format!("move {local} into {}", self.name))?;

        let output = self.exec("ip", &["addr", "add", cidr, "dev", local])?;
        check_status(output, &format!("set address {cidr} on {local}"))?;

        let output = self.exec("ip", &["link", "set", local, "up"])?;
        check_status(output, &format!("bring {local} up"))?;

        Ok(())
    }
}

impl Exec for Namespace {
    fn exec(&self, cmd: &str, args: &[&str]) -> io::Result<Output> {
        self.command(cmd).args(args).output()
    }
}

impl Drop for Namespace {
    fn drop(&mut self) {
        let _ = Command::new("ip")
            .args(["netns", "del", &self.name])
            .status();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{check_privileges, unique_name};

    #[test]
    fn namespace_has_loopback() {
        if !check_privileges() {
            eprintln!("Skipping test, insufficient privileges or missing tools");
            return;
        }

        let ns = Namespace::new(&unique_name("bn_a")).expect("Failed to create ns");
        let out = ns.exec("ip", &["link"]).expect("Failed to exec ip link");
        assert!(String::from_utf8_lossy(&out.stdout).contains("lo"));
    }

    #[test]
    fn command_wraps_program_in_netns_exec() {
        let ns = Namespace {
            name: "h7".into(),
        };
        let cmd = ns.command("cat");
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy()).collect();
        assert_eq!(cmd.get_program(), "ip");
        assert_eq!(args, ["netns", "exec", "h7", "cat"]);
        // nothing was created, keep Drop from touching the system
        std::mem::forget(ns);
    }
}
