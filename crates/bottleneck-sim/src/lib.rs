//! Linux network emulation toolkit for bottleneck experiments.
//!
//! Provides network namespace management for hosts, root-namespace
//! bridges acting as switches, veth plumbing between them, and
//! `tc netem` shaping (rate, delay, jitter, loss, queue bound).
//!
//! Every resource deletes itself on drop, so a partially provisioned
//! network is cleaned up by simply dropping what was built so far.

pub mod bridge;
pub mod impairment;
pub mod namespace;
pub mod test_util;

pub use bridge::{Bridge, VethPair, STP_CONVERGENCE};
pub use impairment::{apply_impairment, ImpairmentConfig};
pub use namespace::{Exec, Namespace, RootNs};
pub use test_util::check_privileges;
