//! Qdisc management for link impairment
//!
//! Impairments are applied with `tc qdisc replace ... root netem`, which
//! swaps the whole discipline in one call so a link side never carries a
//! half-updated configuration. Interfaces inside a network namespace are
//! reached through `ip netns exec`.

use crate::errors::Result;
use crate::link::{LinkPort, LinkShaper};
use crate::process::run_checked;
use crate::types::ImpairmentProfile;
use async_trait::async_trait;
use std::fmt;
use tracing::{debug, info};

/// Network emulation configuration for one interface
#[derive(Debug, Clone, PartialEq)]
pub struct NetemConfig {
    pub delay_us: u64,
    pub jitter_us: u64,
    pub loss_percent: f64,
    pub rate_kbit: u64,
    /// Queue limit in packets (netem default when unset)
    pub limit_packets: Option<u32>,
}

impl From<&ImpairmentProfile> for NetemConfig {
    fn from(profile: &ImpairmentProfile) -> Self {
        Self {
            delay_us: profile.delay_ms as u64 * 1000,
            jitter_us: profile.jitter_ms as u64 * 1000,
            loss_percent: profile.loss_percent,
            rate_kbit: profile.rate_kbit(),
            limit_packets: None,
        }
    }
}

impl NetemConfig {
    /// Arguments following `netem`
    pub fn netem_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(limit) = self.limit_packets {
            args.push("limit".to_string());
            args.push(limit.to_string());
        }

        if self.delay_us > 0 {
            args.push("delay".to_string());
            args.push(format!("{}us", self.delay_us));
            if self.jitter_us > 0 {
                args.push(format!("{}us", self.jitter_us));
            }
        }

        if self.loss_percent > 0.0 {
            args.push("loss".to_string());
            args.push(format!("{}%", self.loss_percent));
        }

        if self.rate_kbit > 0 {
            args.push("rate".to_string());
            args.push(format!("{}kbit", self.rate_kbit));
        }

        args
    }
}

impl fmt::Display for NetemConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "netem {{ delay: {}us, jitter: {}us, loss: {}%, rate: {}kbit }}",
            self.delay_us, self.jitter_us, self.loss_percent, self.rate_kbit
        )
    }
}

/// Manager for tc qdisc operations on link ports
#[derive(Debug, Default, Clone)]
pub struct QdiscManager;

impl QdiscManager {
    pub fn new() -> Self {
        Self
    }

    /// Full argv of `tc qdisc <verb> dev <if> root [netem ...]`, namespace-wrapped
    pub fn tc_argv(port: &LinkPort, verb: &str, netem: Option<&NetemConfig>) -> Vec<String> {
        let mut argv = Vec::new();
        if let Some(ns) = &port.netns {
            argv.extend(["ip", "netns", "exec", ns.as_str()].map(String::from));
        }
        argv.extend(["tc", "qdisc", verb, "dev", port.interface.as_str(), "root"].map(String::from));
        if let Some(config) = netem {
            argv.push("netem".to_string());
            argv.extend(config.netem_args());
        }
        argv
    }

    /// Replace the root qdisc of `port` with the given netem configuration
    pub async fn configure(&self, port: &LinkPort, config: &NetemConfig) -> Result<()> {
        let argv = Self::tc_argv(port, "replace", Some(config));
        debug!("Applying netem with args: {:?}", argv);
        run_checked(&argv).await?;
        info!("Configured {} with {}", port, config);
        Ok(())
    }

    /// Remove any qdisc configuration from the port (best-effort)
    pub async fn clear(&self, port: &LinkPort) -> Result<()> {
        let argv = Self::tc_argv(port, "del", None);
        if let Err(e) = run_checked(&argv).await {
            debug!("No qdisc to delete on {}: {}", port, e);
        }
        Ok(())
    }
}

#[async_trait]
impl LinkShaper for QdiscManager {
    async fn shape(&self, port: &LinkPort, profile: &ImpairmentProfile) -> Result<()> {
        self.configure(port, &NetemConfig::from(profile)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_netem_args_full_profile() {
        let config = NetemConfig::from(&ImpairmentProfile::new(35.0, 70, 5, 0.1));
        assert_eq!(
            config.netem_args(),
            vec!["delay", "70000us", "5000us", "loss", "0.1%", "rate", "35000kbit"]
        );
    }

    #[test]
    fn test_netem_args_skip_zero_fields() {
        let config = NetemConfig::from(&ImpairmentProfile::shaped(10.0, 0));
        assert_eq!(config.netem_args(), vec!["rate", "10000kbit"]);

        let mut config = NetemConfig::from(&ImpairmentProfile::shaped(10.0, 10));
        config.limit_packets = Some(5000);
        assert_eq!(
            config.netem_args(),
            vec!["limit", "5000", "delay", "10000us", "rate", "10000kbit"]
        );
    }

    #[test]
    fn test_tc_argv_in_namespace() {
        let port = LinkPort::in_namespace("il-server", "server-eth0");
        let config = NetemConfig::from(&ImpairmentProfile::shaped(10.0, 10));
        let argv = QdiscManager::tc_argv(&port, "replace", Some(&config));
        assert_eq!(
            argv[..12],
            [
                "ip", "netns", "exec", "il-server", "tc", "qdisc", "replace", "dev",
                "server-eth0", "root", "netem", "delay"
            ]
        );
    }

    #[test]
    fn test_tc_argv_root_namespace_delete() {
        let port = LinkPort::root("s1-eth3");
        assert_eq!(
            QdiscManager::tc_argv(&port, "del", None),
            vec!["tc", "qdisc", "del", "dev", "s1-eth3", "root"]
        );
    }

    #[tokio::test]
    async fn test_configure_missing_interface_fails() {
        let q = QdiscManager::new();
        let port = LinkPort::root("if_not_exist_zzz");
        let res = q
            .configure(&port, &NetemConfig::from(&ImpairmentProfile::shaped(10.0, 10)))
            .await;
        assert!(res.is_err());
    }
}
