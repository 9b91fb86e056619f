//! Run configuration
//!
//! A [`LabConfig`] describes one experiment: the emulated network, the
//! workload containers, captures, traffic, and the impairment schedule.
//! Configurations load from JSON and are validated before anything is
//! acquired.

use crate::capture::{CaptureBinding, CaptureSpec, CaptureTiming};
use crate::errors::{LabError, Result};
use crate::scheduler::SchedulerSpec;
use crate::task::TrafficTaskSpec;
use crate::topology::{LinkParams, WorkloadHostSpec};
use crate::types::{CommandSpec, Endpoint};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HostSpec {
    pub id: String,
    pub addr: IpNetwork,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinkSpec {
    /// Defaults to `<a>-<b>`
    #[serde(default)]
    pub id: Option<String>,
    pub a: String,
    pub b: String,
    #[serde(default, flatten)]
    pub params: LinkParams,
}

impl LinkSpec {
    pub fn new(a: &str, b: &str) -> Self {
        Self {
            id: None,
            a: a.to_string(),
            b: b.to_string(),
            params: LinkParams::default(),
        }
    }

    pub fn named(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn shaped(mut self, bandwidth_mbps: f64, delay_ms: u32) -> Self {
        self.params = LinkParams::shaped(bandwidth_mbps, delay_ms);
        self
    }

    pub fn link_id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.a, self.b))
    }
}

/// Baseline reachability check run before any capture or traffic
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProbeSpec {
    pub from: Endpoint,
    pub target: String,
    #[serde(default = "default_probe_count")]
    pub count: u32,
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,
}

fn default_probe_count() -> u32 {
    5
}

fn default_probe_timeout() -> u64 {
    15
}

impl ProbeSpec {
    pub fn command(&self) -> CommandSpec {
        CommandSpec::new(self.from.clone(), "ping").args([
            "-c".to_string(),
            self.count.to_string(),
            self.target.clone(),
        ])
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    #[serde(default = "default_warmup")]
    pub capture_warmup_ms: u64,
    #[serde(default = "default_capture_stop")]
    pub capture_stop_timeout_ms: u64,
}

fn default_warmup() -> u64 {
    2000
}

fn default_capture_stop() -> u64 {
    5000
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            capture_warmup_ms: default_warmup(),
            capture_stop_timeout_ms: default_capture_stop(),
        }
    }
}

impl Timing {
    pub fn capture(&self) -> CaptureTiming {
        CaptureTiming {
            warmup: Duration::from_millis(self.capture_warmup_ms),
            stop_timeout: Duration::from_millis(self.capture_stop_timeout_ms),
        }
    }
}

fn default_shared_dir() -> PathBuf {
    PathBuf::from("pcap")
}

fn default_prefix() -> String {
    "il-".to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LabConfig {
    pub name: String,
    /// Capture and artifact output, created if absent
    #[serde(default = "default_shared_dir")]
    pub shared_dir: PathBuf,
    /// Prefix of the network namespace of every emulated host
    #[serde(default = "default_prefix")]
    pub netns_prefix: String,
    pub hosts: Vec<HostSpec>,
    #[serde(default)]
    pub switches: Vec<String>,
    pub links: Vec<LinkSpec>,
    #[serde(default)]
    pub containers: Vec<WorkloadHostSpec>,
    #[serde(default)]
    pub probe: Option<ProbeSpec>,
    #[serde(default)]
    pub captures: Vec<CaptureSpec>,
    #[serde(default)]
    pub tasks: Vec<TrafficTaskSpec>,
    #[serde(default)]
    pub scheduler: Option<SchedulerSpec>,
    #[serde(default)]
    pub timing: Timing,
}

fn invalid(message: String) -> LabError {
    LabError::InvalidConfig(message)
}

fn check_unique<'a>(kind: &str, ids: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if id.is_empty() {
            return Err(invalid(format!("{} id must not be empty", kind)));
        }
        if !seen.insert(id) {
            return Err(invalid(format!("duplicate {} id '{}'", kind, id)));
        }
    }
    Ok(())
}

impl LabConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: LabConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    fn check_endpoint(&self, owner: &str, endpoint: &Endpoint) -> Result<()> {
        let known = match endpoint {
            Endpoint::Local | Endpoint::Netns(_) => true,
            Endpoint::Host(id) => self.hosts.iter().any(|h| &h.id == id),
            Endpoint::Container(id) => self.containers.iter().any(|c| &c.id == id),
        };
        if known {
            Ok(())
        } else {
            Err(invalid(format!("{} runs on unknown endpoint {}", owner, endpoint)))
        }
    }

    fn check_link(&self, owner: &str, link: &str) -> Result<()> {
        if self.links.iter().any(|l| l.link_id() == link) {
            Ok(())
        } else {
            Err(invalid(format!("{} refers to unknown link '{}'", owner, link)))
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(invalid("run name must not be empty".to_string()));
        }
        if self.hosts.is_empty() {
            return Err(invalid("no hosts specified".to_string()));
        }

        check_unique(
            "node",
            self.hosts
                .iter()
                .map(|h| h.id.as_str())
                .chain(self.switches.iter().map(String::as_str)),
        )?;
        let link_ids: Vec<String> = self.links.iter().map(LinkSpec::link_id).collect();
        check_unique("link", link_ids.iter().map(String::as_str))?;
        check_unique("container", self.containers.iter().map(|c| c.id.as_str()))?;
        check_unique("capture", self.captures.iter().map(|c| c.id.as_str()))?;
        check_unique("task", self.tasks.iter().map(|t| t.id.as_str()))?;

        let is_node =
            |id: &str| self.hosts.iter().any(|h| h.id == id) || self.switches.iter().any(|s| s == id);
        for link in &self.links {
            for end in [&link.a, &link.b] {
                if !is_node(end) {
                    return Err(invalid(format!(
                        "link {} connects unknown node '{}'",
                        link.link_id(),
                        end
                    )));
                }
            }
            if let Some(profile) = link.params.initial_profile() {
                profile.validate()?;
            }
        }

        for container in &self.containers {
            if let Some(host) = &container.host {
                if !self.hosts.iter().any(|h| &h.id == host) {
                    return Err(invalid(format!(
                        "container {} attached to unknown host '{}'",
                        container.id, host
                    )));
                }
            }
        }

        for capture in &self.captures {
            let owner = format!("capture {}", capture.id);
            match &capture.binding {
                CaptureBinding::Interface { endpoint, .. } => self.check_endpoint(&owner, endpoint)?,
                CaptureBinding::LinkSide { link, .. } => self.check_link(&owner, link)?,
            }
            if let Some(link) = &capture.link {
                self.check_link(&owner, link)?;
            }
            if capture.output.is_empty() {
                return Err(invalid(format!("{} has no output file", owner)));
            }
        }

        for task in &self.tasks {
            task.validate()?;
            let owner = format!("task {}", task.id);
            self.check_endpoint(&owner, &task.command.endpoint)?;
            if let Some(link) = &task.link {
                self.check_link(&owner, link)?;
            }
        }

        if let Some(probe) = &self.probe {
            self.check_endpoint("probe", &probe.from)?;
        }

        if let Some(scheduler) = &self.scheduler {
            self.check_link("scheduler", &scheduler.link)?;
            scheduler.validate()?;
        }

        Ok(())
    }

    /// Create the shared directory if needed and return its absolute path
    pub async fn prepare_shared_dir(&self) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.shared_dir).await?;
        let path = tokio::fs::canonicalize(&self.shared_dir).await?;
        info!("Shared directory: {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "name": "minimal",
        "hosts": [
            {"id": "server", "addr": "10.0.0.1/8"},
            {"id": "client", "addr": "10.0.0.2/8"}
        ],
        "switches": ["s1"],
        "links": [
            {"a": "server", "b": "s1"},
            {"id": "middle", "a": "client", "b": "s1", "bandwidth_mbps": 10.0, "delay_ms": 10}
        ]
    }"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = LabConfig::from_json(MINIMAL).unwrap();
        assert_eq!(config.shared_dir, PathBuf::from("pcap"));
        assert_eq!(config.netns_prefix, "il-");
        assert_eq!(config.timing, Timing::default());
        assert_eq!(config.links[0].link_id(), "server-s1");
        assert_eq!(config.links[1].params, LinkParams::shaped(10.0, 10));
        assert!(config.scheduler.is_none());
    }

    #[test]
    fn test_rejects_unknown_references() {
        let mut config = LabConfig::from_json(MINIMAL).unwrap();
        config.links.push(LinkSpec::new("h9", "s1"));
        assert!(config.validate().is_err());

        let mut config = LabConfig::from_json(MINIMAL).unwrap();
        config.tasks.push(TrafficTaskSpec::new(
            "pull",
            crate::task::TaskKind::OneShot,
            CommandSpec::new(Endpoint::Container("streaming_client".into()), "ffmpeg"),
        ));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let mut config = LabConfig::from_json(MINIMAL).unwrap();
        config.switches.push("server".into());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate node id 'server'"));
    }

    #[test]
    fn test_probe_command() {
        let probe: ProbeSpec =
            serde_json::from_str(r#"{"from": {"host": "client"}, "target": "10.0.0.1"}"#).unwrap();
        assert_eq!(probe.command().to_string(), "[host:client] ping -c 5 10.0.0.1");
        assert_eq!(probe.timeout(), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_from_file_and_shared_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lab.json");
        let mut config = LabConfig::from_json(MINIMAL).unwrap();
        config.shared_dir = dir.path().join("out/pcap");
        tokio::fs::write(&path, config.to_json_pretty().unwrap())
            .await
            .unwrap();

        let loaded = LabConfig::from_file(&path).await.unwrap();
        assert_eq!(loaded, config);

        let shared = loaded.prepare_shared_dir().await.unwrap();
        assert!(shared.is_dir());
        // Idempotent
        loaded.prepare_shared_dir().await.unwrap();
    }

    #[tokio::test]
    async fn test_from_file_missing() {
        assert!(matches!(
            LabConfig::from_file("/nonexistent/lab.json").await,
            Err(LabError::Io(_))
        ));
    }
}
