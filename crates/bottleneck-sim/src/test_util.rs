use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};

/// Monotonically increasing counter for generating unique resource names.
static NAME_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Check whether we run as root and have the tools (`ip`, `tc`) needed to
/// create namespaces, bridges and qdiscs. Returns `false` if the
/// environment cannot support emulated topologies.
pub fn check_privileges() -> bool {
    let is_root = Command::new("id")
        .arg("-u")
        .output()
        .map(|o| o.status.success() && String::from_utf8_lossy(&o.stdout).trim() == "0")
        .unwrap_or(false);
    if !is_root {
        return false;
    }

    let has_ip = matches!(Command::new("ip").arg("netns").output(), Ok(o) if o.status.success());
    let has_tc = matches!(Command::new("tc").arg("-V").output(), Ok(o) if o.status.success());
    has_ip && has_tc
}

/// Generates a unique namespace/interface name with the given prefix.
///
/// Combines the prefix, process ID, and an atomic counter to avoid
/// collisions when tests run in parallel. Names are truncated to 15
/// characters to respect the Linux interface name limit.
pub fn unique_name(prefix: &str) -> String {
    let seq = NAME_COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    let name = format!("{}{:x}{}", prefix, pid % 0xFFFF, seq);
    if name.len() > 15 {
        name[name.len() - 15..].to_string()
    } else {
        name
    }
}
