//! In-memory fakes for the capability interfaces
//!
//! These let the orchestration logic run without root, namespaces, or
//! external tools. Fake processes live on tokio's clock, so tests built on
//! `#[tokio::test(start_paused = true)]` observe exact timings.
//!
//! ```no_run
//! use impairlab::testing::{FakeBehavior, FakeExecutor};
//! use std::time::Duration;
//!
//! let executor = FakeExecutor::new();
//! executor.script("ffmpeg", FakeBehavior::exits_after(Duration::from_secs(30)));
//! executor.script("tcpdump", FakeBehavior::runs_until_signalled());
//! ```

use crate::errors::{LabError, Result};
use crate::link::{LinkHandle, LinkPort, LinkShaper};
use crate::process::{ProcessExecutor, ProcessRef, WaitOutcome};
use crate::topology::{
    ContainerProvider, LinkParams, TopologyProvider, WorkloadHost, WorkloadHostSpec,
};
use crate::types::{CommandSpec, ImpairmentProfile, SignalKind};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Shared, ordered log of provider operations
#[derive(Clone, Debug, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    /// Index of the first entry starting with `prefix`
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.entries.lock().iter().position(|e| e.starts_with(prefix))
    }
}

/// Link shaper that records successful calls and fails on chosen interfaces
#[derive(Debug, Default)]
pub struct RecordingShaper {
    calls: Mutex<Vec<(LinkPort, ImpairmentProfile)>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingShaper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(LinkPort, ImpairmentProfile)> {
        self.calls.lock().clone()
    }

    pub fn fail_interface(&self, interface: &str) {
        self.failing.lock().insert(interface.to_string());
    }

    pub fn heal_interface(&self, interface: &str) {
        self.failing.lock().remove(interface);
    }
}

#[async_trait]
impl LinkShaper for RecordingShaper {
    async fn shape(&self, port: &LinkPort, profile: &ImpairmentProfile) -> Result<()> {
        if self.failing.lock().contains(&port.interface) {
            return Err(LabError::Command {
                command: format!("tc qdisc replace dev {}", port.interface),
                stderr: "Cannot find device".to_string(),
            });
        }
        self.calls.lock().push((port.clone(), profile.clone()));
        Ok(())
    }
}

/// Scripted behavior of a fake process
#[derive(Clone, Debug, PartialEq)]
pub struct FakeBehavior {
    /// Exit on its own after this long; `None` runs until signalled
    pub runs_for: Option<Duration>,
    pub exit_success: bool,
    /// Only SIGKILL ends it
    pub ignores_graceful: bool,
    /// Not even SIGKILL ends it, as with a process stuck in the kernel
    pub survives_kill: bool,
    pub fails_to_spawn: bool,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self::runs_until_signalled()
    }
}

impl FakeBehavior {
    pub fn runs_until_signalled() -> Self {
        Self {
            runs_for: None,
            exit_success: true,
            ignores_graceful: false,
            survives_kill: false,
            fails_to_spawn: false,
        }
    }

    pub fn exits_after(duration: Duration) -> Self {
        Self {
            runs_for: Some(duration),
            ..Self::runs_until_signalled()
        }
    }

    pub fn fails_after(duration: Duration) -> Self {
        Self {
            runs_for: Some(duration),
            exit_success: false,
            ..Self::runs_until_signalled()
        }
    }

    pub fn ignores_graceful() -> Self {
        Self {
            ignores_graceful: true,
            ..Self::runs_until_signalled()
        }
    }

    pub fn unkillable() -> Self {
        Self {
            ignores_graceful: true,
            survives_kill: true,
            ..Self::runs_until_signalled()
        }
    }

    pub fn unlaunchable() -> Self {
        Self {
            fails_to_spawn: true,
            ..Self::runs_until_signalled()
        }
    }
}

#[derive(Clone, Debug)]
pub struct SpawnRecord {
    pub process: ProcessRef,
    pub command: CommandSpec,
    pub at: Instant,
}

#[derive(Clone, Debug)]
pub struct SignalRecord {
    pub process: ProcessRef,
    pub kind: SignalKind,
    pub at: Instant,
}

#[derive(Clone, Debug)]
pub struct ExitRecord {
    pub process: ProcessRef,
    pub success: bool,
    pub at: Instant,
}

struct FakeProcess {
    behavior: FakeBehavior,
    /// `Some(success)` once exited
    exit: Arc<watch::Sender<Option<bool>>>,
}

#[derive(Default)]
struct ExecutorState {
    scripts: HashMap<String, FakeBehavior>,
    processes: HashMap<u64, FakeProcess>,
    spawns: Vec<SpawnRecord>,
    signals: Vec<SignalRecord>,
    exits: Arc<Mutex<Vec<ExitRecord>>>,
}

/// Process executor whose processes are simulated on tokio's clock.
///
/// Behavior is chosen by program name; unscripted programs run until
/// signalled.
#[derive(Clone, Default)]
pub struct FakeExecutor {
    state: Arc<Mutex<ExecutorState>>,
    next_id: Arc<AtomicU64>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, program: &str, behavior: FakeBehavior) {
        self.state
            .lock()
            .scripts
            .insert(program.to_string(), behavior);
    }

    pub fn spawns(&self) -> Vec<SpawnRecord> {
        self.state.lock().spawns.clone()
    }

    pub fn spawns_of(&self, program: &str) -> Vec<SpawnRecord> {
        self.state
            .lock()
            .spawns
            .iter()
            .filter(|s| s.command.program == program)
            .cloned()
            .collect()
    }

    pub fn signals(&self) -> Vec<SignalRecord> {
        self.state.lock().signals.clone()
    }

    pub fn exits(&self) -> Vec<ExitRecord> {
        self.state.lock().exits.lock().clone()
    }

    /// Processes spawned and not yet exited
    pub fn running(&self) -> usize {
        self.state
            .lock()
            .processes
            .values()
            .filter(|p| p.exit.borrow().is_none())
            .count()
    }

    fn finish(
        exit: &watch::Sender<Option<bool>>,
        exits: &Mutex<Vec<ExitRecord>>,
        process: &ProcessRef,
        success: bool,
    ) {
        let changed = exit.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(success);
            true
        });
        if changed {
            exits.lock().push(ExitRecord {
                process: process.clone(),
                success,
                at: Instant::now(),
            });
        }
    }
}

#[async_trait]
impl ProcessExecutor for FakeExecutor {
    async fn spawn(&self, command: &CommandSpec) -> Result<ProcessRef> {
        let mut state = self.state.lock();
        let behavior = state
            .scripts
            .get(&command.program)
            .cloned()
            .unwrap_or_default();

        if behavior.fails_to_spawn {
            return Err(LabError::TaskLaunch {
                id: command.to_string(),
                reason: format!("{}: No such file or directory", command.program),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let process = ProcessRef {
            id,
            pid: Some(10_000 + id as u32),
            label: command.to_string(),
        };
        let (tx, _) = watch::channel(None);
        let exit = Arc::new(tx);

        if let Some(runs_for) = behavior.runs_for {
            let exit = exit.clone();
            let exits = state.exits.clone();
            let process = process.clone();
            let success = behavior.exit_success;
            tokio::spawn(async move {
                tokio::time::sleep(runs_for).await;
                FakeExecutor::finish(&exit, &exits, &process, success);
            });
        }

        state.processes.insert(id, FakeProcess { behavior, exit });
        state.spawns.push(SpawnRecord {
            process: process.clone(),
            command: command.clone(),
            at: Instant::now(),
        });
        Ok(process)
    }

    async fn signal(&self, process: &ProcessRef, kind: SignalKind) -> Result<()> {
        let mut state = self.state.lock();
        state.signals.push(SignalRecord {
            process: process.clone(),
            kind,
            at: Instant::now(),
        });
        let exits = state.exits.clone();
        if let Some(fake) = state.processes.get(&process.id) {
            let ends = match kind {
                SignalKind::Kill => !fake.behavior.survives_kill,
                _ => !fake.behavior.ignores_graceful,
            };
            if ends {
                FakeExecutor::finish(&fake.exit, &exits, process, kind != SignalKind::Kill);
            }
        }
        Ok(())
    }

    async fn wait(&self, process: &ProcessRef, timeout: Duration) -> Result<WaitOutcome> {
        let receiver = self
            .state
            .lock()
            .processes
            .get(&process.id)
            .map(|p| p.exit.subscribe());
        let Some(mut receiver) = receiver else {
            return Ok(WaitOutcome::Exited {
                success: false,
                code: None,
            });
        };

        let outcome = match tokio::time::timeout(timeout, receiver.wait_for(|exit| exit.is_some())).await {
            Ok(Ok(exit)) => {
                let success = exit.unwrap_or(false);
                Ok(WaitOutcome::Exited {
                    success,
                    code: Some(if success { 0 } else { 1 }),
                })
            }
            Ok(Err(_)) => Ok(WaitOutcome::Exited {
                success: false,
                code: None,
            }),
            Err(_) => Ok(WaitOutcome::TimedOut),
        };
        outcome
    }

    async fn release(&self, process: &ProcessRef) {
        if let Some(fake) = self.state.lock().processes.get(&process.id) {
            // Released processes must not linger as running
            fake.exit.send_if_modified(|state| {
                if state.is_some() {
                    return false;
                }
                *state = Some(false);
                true
            });
        }
    }
}

/// Topology provider that records operations in a [`Journal`]
pub struct FakeTopology {
    journal: Journal,
    shaper: Arc<RecordingShaper>,
    fail_on: Option<String>,
    links: Vec<LinkHandle>,
}

impl FakeTopology {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            shaper: Arc::new(RecordingShaper::new()),
            fail_on: None,
            links: Vec::new(),
        }
    }

    /// Fail the first operation whose journal entry starts with `prefix`
    pub fn failing_on(mut self, prefix: &str) -> Self {
        self.fail_on = Some(prefix.to_string());
        self
    }

    pub fn shaper(&self) -> Arc<RecordingShaper> {
        self.shaper.clone()
    }

    fn step(&mut self, entry: String) -> Result<()> {
        if let Some(prefix) = &self.fail_on {
            if entry.starts_with(prefix.as_str()) {
                self.fail_on = None;
                self.journal.record(format!("{} failed", entry));
                return Err(LabError::Command {
                    command: entry,
                    stderr: "injected failure".to_string(),
                });
            }
        }
        self.journal.record(entry);
        Ok(())
    }
}

#[async_trait]
impl TopologyProvider for FakeTopology {
    async fn add_host(&mut self, id: &str, addr: IpNetwork) -> Result<()> {
        self.step(format!("topology.add_host {} {}", id, addr))
    }

    async fn add_switch(&mut self, id: &str) -> Result<()> {
        self.step(format!("topology.add_switch {}", id))
    }

    async fn add_link(
        &mut self,
        id: &str,
        a: &str,
        b: &str,
        params: &LinkParams,
    ) -> Result<LinkHandle> {
        self.step(format!("topology.add_link {} {} {}", id, a, b))?;
        let handle = LinkHandle::new(
            id,
            LinkPort::root(format!("{}-{}", a, id)),
            LinkPort::root(format!("{}-{}", b, id)),
            self.shaper.clone(),
        );
        if let Some(profile) = params.initial_profile() {
            handle.apply(&profile).await?;
        }
        self.links.push(handle.clone());
        Ok(handle)
    }

    async fn start(&mut self) -> Result<()> {
        self.step("topology.start".to_string())
    }

    async fn stop(&mut self) -> Result<()> {
        self.links.clear();
        self.step("topology.stop".to_string())
    }
}

/// Container provider that records operations in a [`Journal`]
pub struct FakeContainers {
    journal: Journal,
    fail_on: Mutex<HashSet<String>>,
}

impl FakeContainers {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            fail_on: Mutex::new(HashSet::new()),
        }
    }

    pub fn failing_create(self, id: &str) -> Self {
        self.fail_on.lock().insert(id.to_string());
        self
    }
}

#[async_trait]
impl ContainerProvider for FakeContainers {
    async fn create_workload_host(&self, spec: &WorkloadHostSpec) -> Result<WorkloadHost> {
        if self.fail_on.lock().contains(&spec.id) {
            self.journal
                .record(format!("containers.create {} failed", spec.id));
            return Err(LabError::Command {
                command: format!("docker run {}", spec.image),
                stderr: "Unable to find image".to_string(),
            });
        }
        self.journal.record(format!("containers.create {}", spec.id));
        Ok(WorkloadHost {
            id: spec.id.clone(),
            container: format!("fake-{}", spec.id),
        })
    }

    async fn remove_workload_host(&self, host: &WorkloadHost) -> Result<()> {
        self.journal.record(format!("containers.remove {}", host.id));
        Ok(())
    }
}
