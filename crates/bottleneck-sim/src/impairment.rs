use crate::namespace::Exec;
use std::io;

/// Link shaping parameters applied via `tc netem`.
///
/// All fields are optional — only non-`None` parameters are passed to netem.
/// If every field is `None`, any existing root qdisc is removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImpairmentConfig {
    pub delay_us: Option<u64>,
    pub jitter_us: Option<u64>,
    pub loss_percent: Option<f64>,
    pub rate_kbit: Option<u64>,
    /// Queue bound in packets. When `None` and `rate_kbit` is set, a limit
    /// of ~2× the bandwidth-delay product (minimum 20) is derived so the
    /// rate limit drops excess packets instead of queueing them forever.
    pub limit_packets: Option<u32>,
}

impl ImpairmentConfig {
    fn is_empty(&self) -> bool {
        self.delay_us.is_none()
            && self.loss_percent.is_none()
            && self.rate_kbit.is_none()
            && self.limit_packets.is_none()
    }

    /// Queue limit actually installed, explicit or derived from the BDP.
    pub fn effective_limit(&self) -> Option<u32> {
        if let Some(explicit) = self.limit_packets {
            return Some(explicit);
        }
        let rate = self.rate_kbit?;
        // one-way delay doubled for a full RTT, 20ms when unset
        let rtt_us = self.delay_us.unwrap_or(10_000) * 2;
        let bdp_bytes = rate * 1000 / 8 * rtt_us / 1_000_000;
        let mtu = 1500u64;
        let bdp_packets = (bdp_bytes / mtu) as u32;
        Some(std::cmp::max(bdp_packets * 2, 20))
    }

    /// Arguments following `tc qdisc add dev <iface> root netem`.
    pub fn netem_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(limit) = self.effective_limit() {
            args.push("limit".into());
            args.push(limit.to_string());
        }

        if let Some(delay) = self.delay_us {
            args.push("delay".into());
            args.push(format!("{delay}us"));

            if let Some(jitter) = self.jitter_us.filter(|j| *j > 0) {
                args.push(format!("{jitter}us"));
            }
        }

        if let Some(loss) = self.loss_percent.filter(|l| *l > 0.0) {
            args.push("loss".into());
            args.push(format!("{loss}%"));
        }

        if let Some(rate) = self.rate_kbit {
            args.push("rate".into());
            args.push(format!("{rate}kbit"));
        }

        args
    }
}

/// Applies shaping to `interface` in the given network context.
///
/// Removes any existing root qdisc first, then installs netem with the
/// configured limit, delay, jitter, loss and rate.
pub fn apply_impairment(
    ctx: &impl Exec,
    interface: &str,
    config: &ImpairmentConfig,
) -> io::Result<()> {
    let _ = ctx.exec("tc", &["qdisc", "del", "dev", interface, "root"]);

    if config.is_empty() {
        return Ok(());
    }

    let mut args_storage: Vec<String> = vec![
        "qdisc".into(),
        "add".into(),
        "dev".into(),
        interface.into(),
        "root".into(),
        "netem".into(),
    ];
    args_storage.extend(config.netem_args());

    let args: Vec<&str> = args_storage.iter().map(|s| s.as_str()).collect();
    let output = ctx.exec("tc", &args)?;
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "Failed to apply tc netem: {}\nCommand: tc {}",
            String::from_utf8_lossy(&output.stderr),
            args.join(" ")
        )));
    }

    tracing::debug!(interface, args = %args.join(" "), "netem applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::{Namespace, RootNs};
    use crate::test_util::{check_privileges, unique_name};
    use crate::Bridge;

    #[test]
    fn bottleneck_args_carry_every_parameter() {
        let cfg = ImpairmentConfig {
            delay_us: Some(2_000),
            jitter_us: Some(500),
            loss_percent: Some(2.0),
            rate_kbit: Some(15_000),
            limit_packets: Some(100),
        };
        assert_eq!(
            cfg.netem_args(),
            [
                "limit", "100", "delay", "2000us", "500us", "loss", "2%", "rate", "15000kbit"
            ]
        );
    }

    #[test]
    fn zero_loss_and_zero_jitter_are_omitted() {
        let cfg = ImpairmentConfig {
            delay_us: Some(1_000),
            jitter_us: Some(0),
            loss_percent: Some(0.0),
            limit_packets: Some(100),
            ..Default::default()
        };
        assert_eq!(cfg.netem_args(), ["limit", "100", "delay", "1000us"]);
    }

    #[test]
    fn limit_is_derived_from_bdp_when_unset() {
        let slow = ImpairmentConfig {
            rate_kbit: Some(1_000),
            delay_us: Some(1_000),
            ..Default::default()
        };
        assert_eq!(slow.effective_limit(), Some(20));

        let fast = ImpairmentConfig {
            rate_kbit: Some(1_000_000),
            delay_us: Some(50_000),
            ..Default::default()
        };
        // 1 Gbit/s × 100 ms = 12.5 MB ≈ 8333 packets, doubled
        assert_eq!(fast.effective_limit(), Some(16_666));

        assert_eq!(ImpairmentConfig::default().effective_limit(), None);
    }

    #[test]
    fn rate_limit_applies_on_bridge_port() {
        if !check_privileges() {
            eprintln!("Skipping test, insufficient privileges");
            return;
        }

        let _br = Bridge::new(&unique_name("bnbr"), false).expect("bridge");
        let ns = Namespace::new(&unique_name("bni")).expect("ns");
        let port = unique_name("bnp");
        ns.attach_veth(&unique_name("bne"), &port, "10.204.0.1/24")
            .expect("veth");

        let cfg = ImpairmentConfig {
            delay_us: Some(1_000),
            rate_kbit: Some(1_000),
            limit_packets: Some(100),
            ..Default::default()
        };
        if let Err(err) = apply_impairment(&RootNs, &port, &cfg) {
            if err.to_string().contains("qdisc kind is unknown") {
                eprintln!("Skipping test, netem qdisc not available");
                return;
            }
            panic!("Failed to apply impairment: {err}");
        }

        let out = RootNs
            .exec("tc", &["qdisc", "show", "dev", &port])
            .expect("tc show");
        let shown = String::from_utf8_lossy(&out.stdout);
        assert!(shown.contains("netem"), "unexpected qdisc: {shown}");
        assert!(shown.contains("limit 100"), "unexpected qdisc: {shown}");
    }
}
