//! Topology and container capabilities
//!
//! The orchestrator only sees the [`TopologyProvider`] and
//! [`ContainerProvider`] traits. [`NetnsTopology`] builds the emulated
//! network out of Linux primitives: every host is a network namespace,
//! every switch a bridge in the root namespace, and every link a veth pair
//! named `<node>-eth<n>` on each end. [`DockerContainers`] runs workload
//! containers and can bind a container's network namespace to an emulated
//! host so the container sits on the emulated network.

use crate::errors::{LabError, Result};
use crate::link::{LinkHandle, LinkPort, LinkShaper};
use crate::process::{run_checked, run_output};
use crate::types::ImpairmentProfile;
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Longest interface name the kernel accepts
const IFNAMSIZ: usize = 15;

/// Static shaping set when a link is created
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkParams {
    #[serde(default)]
    pub bandwidth_mbps: Option<f64>,
    #[serde(default)]
    pub delay_ms: u32,
}

impl LinkParams {
    pub fn shaped(bandwidth_mbps: f64, delay_ms: u32) -> Self {
        Self {
            bandwidth_mbps: Some(bandwidth_mbps),
            delay_ms,
        }
    }

    /// Profile to apply at creation time; unshaped links carry none
    pub fn initial_profile(&self) -> Option<ImpairmentProfile> {
        self.bandwidth_mbps
            .map(|bw| ImpairmentProfile::shaped(bw, self.delay_ms))
    }
}

/// Builds and tears down the emulated network
#[async_trait]
pub trait TopologyProvider: Send + Sync {
    async fn add_host(&mut self, id: &str, addr: IpNetwork) -> Result<()>;

    async fn add_switch(&mut self, id: &str) -> Result<()>;

    /// Connect two nodes. Side A of the returned handle is on `a`.
    async fn add_link(&mut self, id: &str, a: &str, b: &str, params: &LinkParams)
        -> Result<LinkHandle>;

    async fn start(&mut self) -> Result<()>;

    /// Release everything this provider created
    async fn stop(&mut self) -> Result<()>;
}

/// A host-path bind mount for a workload container
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    /// Relative sources are resolved against the shared directory
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkloadHostSpec {
    pub id: String,
    pub role: String,
    pub image: String,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    /// Emulated host whose network the container takes over
    #[serde(default)]
    pub host: Option<String>,
    /// Overrides the image's default command
    #[serde(default)]
    pub command: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadHost {
    pub id: String,
    pub container: String,
}

#[async_trait]
pub trait ContainerProvider: Send + Sync {
    async fn create_workload_host(&self, spec: &WorkloadHostSpec) -> Result<WorkloadHost>;

    async fn remove_workload_host(&self, host: &WorkloadHost) -> Result<()>;
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug)]
struct HostEntry {
    netns: String,
    addr: IpNetwork,
    addressed: bool,
    next_port: u32,
}

#[derive(Debug)]
struct SwitchEntry {
    next_port: u32,
}

/// Where one end of a veth pair ends up
enum Attachment {
    Host { netns: String, addr: Option<IpNetwork> },
    Bridge(String),
}

/// Topology built from network namespaces, bridges, and veth pairs
pub struct NetnsTopology {
    prefix: String,
    shaper: Arc<dyn LinkShaper>,
    hosts: HashMap<String, HostEntry>,
    switches: HashMap<String, SwitchEntry>,
    /// Creation order, used for teardown
    host_order: Vec<String>,
    switch_order: Vec<String>,
    links: Vec<LinkHandle>,
    started: bool,
}

impl NetnsTopology {
    pub fn new(prefix: impl Into<String>, shaper: Arc<dyn LinkShaper>) -> Self {
        Self {
            prefix: prefix.into(),
            shaper,
            hosts: HashMap::new(),
            switches: HashMap::new(),
            host_order: Vec::new(),
            switch_order: Vec::new(),
            links: Vec::new(),
            started: false,
        }
    }

    pub fn netns_name(&self, host: &str) -> String {
        format!("{}{}", self.prefix, host)
    }

    fn next_interface(&mut self, node: &str) -> Result<(String, Attachment)> {
        if let Some(host) = self.hosts.get_mut(node) {
            let name = format!("{}-eth{}", node, host.next_port);
            host.next_port += 1;
            let addr = if host.addressed {
                None
            } else {
                host.addressed = true;
                Some(host.addr)
            };
            return Ok((
                name,
                Attachment::Host {
                    netns: host.netns.clone(),
                    addr,
                },
            ));
        }
        if let Some(switch) = self.switches.get_mut(node) {
            let name = format!("{}-eth{}", node, switch.next_port);
            switch.next_port += 1;
            return Ok((name, Attachment::Bridge(node.to_string())));
        }
        Err(LabError::InvalidConfig(format!("unknown node '{}'", node)))
    }

    /// Commands that delete a veth pair by one end, wherever that end now lives
    fn discard_veth_argvs(interface: &str, attachment: &Attachment) -> Vec<Vec<String>> {
        let mut argvs = vec![argv(&["ip", "link", "del", interface])];
        if let Attachment::Host { netns, .. } = attachment {
            argvs.push(argv(&["ip", "-n", netns, "link", "del", interface]));
        }
        argvs
    }

    async fn discard_veth(interface: &str, attachment: &Attachment) {
        for cmd in Self::discard_veth_argvs(interface, attachment) {
            if run_checked(&cmd).await.is_ok() {
                debug!("Removed half-built link end {}", interface);
                return;
            }
        }
        warn!("Could not remove interface {}", interface);
    }

    async fn attach(interface: &str, attachment: &Attachment) -> Result<LinkPort> {
        match attachment {
            Attachment::Host { netns, addr } => {
                run_checked(&argv(&["ip", "link", "set", interface, "netns", netns])).await?;
                if let Some(addr) = addr {
                    let cidr = addr.to_string();
                    run_checked(&argv(&[
                        "ip", "-n", netns, "addr", "add", &cidr, "dev", interface,
                    ]))
                    .await?;
                }
                run_checked(&argv(&["ip", "-n", netns, "link", "set", interface, "up"])).await?;
                Ok(LinkPort::in_namespace(netns.clone(), interface))
            }
            Attachment::Bridge(bridge) => {
                run_checked(&argv(&["ip", "link", "set", interface, "master", bridge])).await?;
                run_checked(&argv(&["ip", "link", "set", interface, "up"])).await?;
                Ok(LinkPort::root(interface))
            }
        }
    }
}

#[async_trait]
impl TopologyProvider for NetnsTopology {
    async fn add_host(&mut self, id: &str, addr: IpNetwork) -> Result<()> {
        if self.hosts.contains_key(id) {
            return Err(LabError::InvalidConfig(format!("duplicate host '{}'", id)));
        }
        let netns = self.netns_name(id);

        // A workload container may already have bound its namespace under this name
        let existing = Path::new("/run/netns").join(&netns);
        if tokio::fs::try_exists(&existing).await.unwrap_or(false) {
            info!("Adopting existing namespace {} for host {}", netns, id);
        } else {
            info!("Creating namespace {} for host {}", netns, id);
            run_checked(&argv(&["ip", "netns", "add", &netns])).await?;
        }
        run_checked(&argv(&["ip", "-n", &netns, "link", "set", "lo", "up"])).await?;

        self.hosts.insert(
            id.to_string(),
            HostEntry {
                netns,
                addr,
                addressed: false,
                next_port: 0,
            },
        );
        self.host_order.push(id.to_string());
        Ok(())
    }

    async fn add_switch(&mut self, id: &str) -> Result<()> {
        if self.switches.contains_key(id) || id.len() > IFNAMSIZ {
            return Err(LabError::InvalidConfig(format!("invalid switch id '{}'", id)));
        }
        info!("Creating bridge {}", id);
        let _ = run_checked(&argv(&["ip", "link", "del", id])).await;
        run_checked(&argv(&["ip", "link", "add", "name", id, "type", "bridge"])).await?;
        self.switches
            .insert(id.to_string(), SwitchEntry { next_port: 1 });
        self.switch_order.push(id.to_string());
        Ok(())
    }

    async fn add_link(
        &mut self,
        id: &str,
        a: &str,
        b: &str,
        params: &LinkParams,
    ) -> Result<LinkHandle> {
        let (a_if, a_at) = self.next_interface(a)?;
        let (b_if, b_at) = self.next_interface(b)?;
        for name in [&a_if, &b_if] {
            if name.len() > IFNAMSIZ {
                return Err(LabError::InvalidConfig(format!(
                    "interface name '{}' exceeds {} characters",
                    name, IFNAMSIZ
                )));
            }
        }

        info!("Creating link {}: {} <-> {}", id, a_if, b_if);
        let _ = run_checked(&argv(&["ip", "link", "del", &a_if])).await;
        run_checked(&argv(&[
            "ip", "link", "add", &a_if, "type", "veth", "peer", "name", &b_if,
        ]))
        .await?;

        let shaper = self.shaper.clone();
        let wired = async {
            let side_a = Self::attach(&a_if, &a_at).await?;
            let side_b = Self::attach(&b_if, &b_at).await?;
            let handle = LinkHandle::new(id, side_a, side_b, shaper);
            if let Some(profile) = params.initial_profile() {
                handle.apply(&profile).await?;
            }
            Ok::<_, LabError>(handle)
        }
        .await;

        match wired {
            Ok(handle) => {
                self.links.push(handle.clone());
                Ok(handle)
            }
            Err(e) => {
                // The pair is not tracked yet, so stop() would never delete it
                Self::discard_veth(&a_if, &a_at).await;
                Err(e)
            }
        }
    }

    async fn start(&mut self) -> Result<()> {
        for bridge in &self.switch_order {
            run_checked(&argv(&["ip", "link", "set", bridge, "up"])).await?;
        }
        self.started = true;
        info!(
            "Topology started: {} hosts, {} switches, {} links",
            self.hosts.len(),
            self.switches.len(),
            self.links.len()
        );
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        let mut failures = Vec::new();

        // Deleting one end of a veth pair removes its peer
        for link in self.links.drain(..).rev() {
            let port = link.port(crate::errors::Side::A);
            let cmd = match &port.netns {
                Some(ns) => argv(&["ip", "-n", ns, "link", "del", &port.interface]),
                None => argv(&["ip", "link", "del", &port.interface]),
            };
            if let Err(e) = run_checked(&cmd).await {
                debug!("Link {} already gone: {}", link.id(), e);
            }
        }

        for bridge in self.switch_order.drain(..).rev() {
            if let Err(e) = run_checked(&argv(&["ip", "link", "del", &bridge])).await {
                warn!("Failed to delete bridge {}: {}", bridge, e);
                failures.push(e.to_string());
            }
        }

        for host in self.host_order.drain(..).rev() {
            if let Some(entry) = self.hosts.remove(&host) {
                if let Err(e) = run_checked(&argv(&["ip", "netns", "del", &entry.netns])).await {
                    warn!("Failed to delete namespace {}: {}", entry.netns, e);
                    failures.push(e.to_string());
                }
            }
        }
        self.switches.clear();
        self.started = false;

        if failures.is_empty() {
            info!("Topology stopped");
            Ok(())
        } else {
            Err(LabError::Command {
                command: "topology teardown".to_string(),
                stderr: failures.join("; "),
            })
        }
    }
}

/// Workload containers managed through the docker CLI
#[derive(Clone, Debug)]
pub struct DockerContainers {
    run_label: String,
    netns_prefix: String,
    shared_dir: std::path::PathBuf,
}

impl DockerContainers {
    pub fn new(
        run_label: impl Into<String>,
        netns_prefix: impl Into<String>,
        shared_dir: impl Into<std::path::PathBuf>,
    ) -> Self {
        Self {
            run_label: run_label.into(),
            netns_prefix: netns_prefix.into(),
            shared_dir: shared_dir.into(),
        }
    }

    /// `docker run` argv for a workload host
    pub fn run_argv(&self, spec: &WorkloadHostSpec) -> Vec<String> {
        let mut cmd = argv(&["docker", "run", "-d", "--name", &spec.id]);
        cmd.push("--label".to_string());
        cmd.push(format!("impairlab.run={}", self.run_label));
        cmd.push("--label".to_string());
        cmd.push(format!("impairlab.role={}", spec.role));
        if spec.host.is_some() {
            cmd.extend(argv(&["--network", "none", "--cap-add", "NET_ADMIN"]));
        }
        for mount in &spec.mounts {
            let source = self.shared_dir.join(&mount.source);
            let mode = if mount.read_only { "ro" } else { "rw" };
            cmd.push("-v".to_string());
            cmd.push(format!("{}:{}:{}", source.display(), mount.target, mode));
        }
        cmd.push(spec.image.clone());
        cmd.extend(spec.command.iter().cloned());
        cmd
    }
}

#[async_trait]
impl ContainerProvider for DockerContainers {
    async fn create_workload_host(&self, spec: &WorkloadHostSpec) -> Result<WorkloadHost> {
        let _ = run_checked(&argv(&["docker", "rm", "-f", &spec.id])).await;

        info!("Starting container {} ({}) from {}", spec.id, spec.role, spec.image);
        let container = run_output(&self.run_argv(spec)).await?;
        let host = WorkloadHost {
            id: spec.id.clone(),
            container: container.chars().take(12).collect(),
        };

        if let Some(emulated) = &spec.host {
            let pid = run_output(&argv(&[
                "docker",
                "inspect",
                "--format",
                "{{.State.Pid}}",
                &spec.id,
            ]))
            .await?;
            let netns = format!("{}{}", self.netns_prefix, emulated);
            debug!("Binding container {} (pid {}) as namespace {}", spec.id, pid, netns);
            if let Err(e) = run_checked(&argv(&["ip", "netns", "attach", &netns, &pid])).await {
                let _ = self.remove_workload_host(&host).await;
                return Err(e);
            }
        }

        Ok(host)
    }

    async fn remove_workload_host(&self, host: &WorkloadHost) -> Result<()> {
        info!("Removing container {}", host.id);
        run_checked(&argv(&["docker", "rm", "-f", &host.id])).await
    }
}
