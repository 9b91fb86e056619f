//! Run orchestration
//!
//! [`Orchestrator::run`] drives one experiment through its phases:
//!
//! 1. acquire containers and the emulated network
//! 2. probe baseline reachability (reported, never fatal)
//! 3. start every capture and wait out the warm-up
//! 4. start traffic tasks and the impairment scheduler together
//! 5. wait for the primary tasks
//! 6. unless in autotest mode, wait for the shutdown signal
//! 7. tear down: scheduler, tasks, captures, containers, network
//!
//! Only a failure in phase 1 aborts the run. Everything acquired up to
//! that point is released before the error is returned. Teardown always
//! attempts every step.
//!
//! A shutdown request during phases 1 to 4 skips the remaining setup and
//! goes straight to teardown. Acquisition steps are never cut short; the
//! request is noticed once the current one finishes.

use crate::capture::{CaptureReport, CaptureSession};
use crate::config::LabConfig;
use crate::context::{RunContext, Teardown};
use crate::errors::{LabError, Result};
use crate::link::LinkHandle;
use crate::process::{ProcessExecutor, ProcessRef, WaitOutcome, KILL_WAIT};
use crate::scheduler::{ImpairmentScheduler, SchedulerReport};
use crate::task::{TaskReport, TaskState, TrafficTask};
use crate::topology::{ContainerProvider, TopologyProvider, WorkloadHost};
use crate::types::SignalKind;
use futures::future::join_all;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Resolves on the first SIGINT received after this call.
///
/// The handler is installed before returning, so an interrupt that
/// arrives while the network is still being built is held until
/// [`Orchestrator::run`] polls the future instead of killing the process.
pub fn interrupt_signal() -> Result<impl Future<Output = ()> + Send> {
    let mut sigint = unix::signal(unix::SignalKind::interrupt())?;
    Ok(async move {
        if sigint.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
        info!("Interrupted by user");
    })
}

/// Result of the baseline connectivity probe
#[derive(Clone, Debug, PartialEq)]
pub enum ProbeOutcome {
    Reachable,
    Unreachable { code: Option<i32> },
    TimedOut,
    Failed(String),
}

impl ProbeOutcome {
    pub fn is_reachable(&self) -> bool {
        matches!(self, ProbeOutcome::Reachable)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PhaseTiming {
    pub phase: &'static str,
    pub elapsed: Duration,
}

/// What happened during a run
#[derive(Clone, Debug, Default)]
pub struct RunReport {
    pub name: String,
    pub probe: Option<ProbeOutcome>,
    pub tasks: Vec<TaskReport>,
    pub captures: Vec<CaptureReport>,
    pub scheduler: Option<SchedulerReport>,
    /// Non-fatal errors before teardown
    pub errors: Vec<String>,
    pub teardown_errors: Vec<String>,
    pub teardown: Vec<PhaseTiming>,
    /// Worst-case duration of the scheduler, task, and capture stops
    pub shutdown_bound: Duration,
    /// The shutdown signal cut the wait for primary tasks short
    pub interrupted: bool,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn teardown_elapsed(&self) -> Duration {
        self.teardown.iter().map(|p| p.elapsed).sum()
    }

    /// Time spent stopping the scheduler, tasks, and captures
    pub fn shutdown_elapsed(&self) -> Duration {
        self.teardown
            .iter()
            .filter(|p| matches!(p.phase, "scheduler" | "tasks" | "captures"))
            .map(|p| p.elapsed)
            .sum()
    }

    pub fn task(&self, id: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn capture(&self, id: &str) -> Option<&CaptureReport> {
        self.captures.iter().find(|c| c.id == id)
    }
}

#[derive(Default)]
struct Acquired {
    containers: Vec<WorkloadHost>,
    topology: bool,
}

pub struct Orchestrator {
    config: LabConfig,
    topology: Box<dyn TopologyProvider>,
    containers: Box<dyn ContainerProvider>,
    executor: Arc<dyn ProcessExecutor>,
}

impl Orchestrator {
    pub fn new(
        config: LabConfig,
        topology: Box<dyn TopologyProvider>,
        containers: Box<dyn ContainerProvider>,
        executor: Arc<dyn ProcessExecutor>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            topology,
            containers,
            executor,
        })
    }

    pub fn config(&self) -> &LabConfig {
        &self.config
    }

    /// Run the experiment once.
    ///
    /// `shutdown` resolves when an operator asks to stop. Before traffic
    /// starts it cancels the rest of setup; afterwards it ends the wait for
    /// primary tasks early and ends the interactive wait.
    pub async fn run<F>(mut self, autotest: bool, shutdown: F) -> Result<RunReport>
    where
        F: Future<Output = ()>,
    {
        let ctx = RunContext::new();
        let mut report = RunReport {
            name: self.config.name.clone(),
            ..RunReport::default()
        };
        tokio::pin!(shutdown);

        info!("*** Starting run {}", self.config.name);
        let shared_dir = self
            .config
            .prepare_shared_dir()
            .await
            .map_err(|e| LabError::acquisition("shared directory", e))?;

        let mut acquired = Acquired::default();
        let links = match self.acquire(&mut acquired).await {
            Ok(links) => links,
            Err(e) => {
                error!("Resource acquisition failed: {}", e);
                self.release(&mut acquired, &mut report).await;
                return Err(if e.is_fatal() {
                    e
                } else {
                    LabError::acquisition("setup", e)
                });
            }
        };

        let mut interrupted = shutdown.as_mut().now_or_never().is_some();
        if !interrupted {
            report.probe = self.probe(shutdown.as_mut(), &mut interrupted).await;
        }

        let mut scheduler = self.prepare(&ctx, &links, &shared_dir, &mut report);

        let captures = ctx.captures();
        if !interrupted {
            info!("*** Starting {} captures", captures.len());
            tokio::select! {
                results = join_all(captures.iter().map(|c| c.start())) => {
                    for (capture, result) in captures.iter().zip(results) {
                        if let Err(e) = result {
                            report.errors.push(format!("capture {}: {}", capture.id(), e));
                        }
                    }
                }
                _ = &mut shutdown => interrupted = true,
            }
        }

        let tasks = ctx.tasks();
        if !interrupted {
            info!("*** Starting traffic");
            if let Some(s) = scheduler.as_mut() {
                if let Err(e) = s.start(ctx.cancel_signal()) {
                    warn!("Impairment scheduler not started: {}", e);
                    report.errors.push(e.to_string());
                }
            }
            let cancel = ctx.cancel_signal();
            for result in join_all(tasks.iter().map(|t| t.start(cancel))).await {
                if let Err(e) = result {
                    report.errors.push(e.to_string());
                }
            }
        } else {
            warn!("Shutdown requested during setup, skipping traffic");
        }

        let primaries: Vec<TrafficTask> = tasks.into_iter().filter(|t| t.spec().primary).collect();
        if !interrupted && !primaries.is_empty() {
            info!("*** Waiting for {} primary tasks", primaries.len());
            tokio::select! {
                states = join_all(primaries.iter().map(|t| t.wait_finished())) => {
                    for (task, state) in primaries.iter().zip(states) {
                        info!("Primary task {} finished: {:?}", task.id(), state);
                    }
                }
                _ = &mut shutdown => {
                    warn!("Shutdown requested before primary tasks finished");
                    interrupted = true;
                }
            }
        }
        report.interrupted = interrupted;

        if !autotest && !report.interrupted {
            info!("*** Run {} is idle, press Ctrl-C to tear down", self.config.name);
            (&mut shutdown).await;
        }

        self.teardown(&ctx, scheduler, &mut acquired, &mut report)
            .await;
        report.elapsed = ctx.started_at().elapsed();
        info!(
            "*** Run {} finished in {:?} (teardown {:?})",
            report.name,
            report.elapsed,
            report.teardown_elapsed()
        );
        Ok(report)
    }

    async fn acquire(&mut self, acquired: &mut Acquired) -> Result<HashMap<String, LinkHandle>> {
        info!("*** Creating {} containers", self.config.containers.len());
        for spec in &self.config.containers {
            let host = self
                .containers
                .create_workload_host(spec)
                .await
                .map_err(|e| LabError::acquisition(&format!("container {}", spec.id), e))?;
            acquired.containers.push(host);
        }

        info!("*** Building network");
        acquired.topology = true;
        for host in &self.config.hosts {
            self.topology
                .add_host(&host.id, host.addr)
                .await
                .map_err(|e| LabError::acquisition(&format!("host {}", host.id), e))?;
        }
        for switch in &self.config.switches {
            self.topology
                .add_switch(switch)
                .await
                .map_err(|e| LabError::acquisition(&format!("switch {}", switch), e))?;
        }
        let mut links = HashMap::new();
        for link in &self.config.links {
            let id = link.link_id();
            let handle = self
                .topology
                .add_link(&id, &link.a, &link.b, &link.params)
                .await
                .map_err(|e| LabError::acquisition(&format!("link {}", id), e))?;
            links.insert(id, handle);
        }
        self.topology
            .start()
            .await
            .map_err(|e| LabError::acquisition("network start", e))?;
        Ok(links)
    }

    /// Check baseline reachability. A shutdown request ends the check early,
    /// sets `interrupted`, and yields no outcome.
    async fn probe<F>(
        &self,
        shutdown: Pin<&mut F>,
        interrupted: &mut bool,
    ) -> Option<ProbeOutcome>
    where
        F: Future<Output = ()>,
    {
        let spec = self.config.probe.as_ref()?;
        let command = spec.command();
        info!("*** Probing connectivity: {}", command);

        let process = match self.executor.spawn(&command).await {
            Ok(process) => process,
            Err(e) => {
                warn!("Connectivity probe could not run: {}", e);
                return Some(ProbeOutcome::Failed(e.to_string()));
            }
        };
        let waited = tokio::select! {
            waited = self.executor.wait(&process, spec.timeout()) => Some(waited),
            _ = shutdown => None,
        };
        let outcome = match waited {
            None => {
                warn!("Shutdown requested during connectivity check");
                *interrupted = true;
                self.kill_overrun(&process).await;
                None
            }
            Some(Ok(WaitOutcome::Exited { success: true, .. })) => Some(ProbeOutcome::Reachable),
            Some(Ok(WaitOutcome::Exited { code, .. })) => Some(ProbeOutcome::Unreachable { code }),
            Some(Ok(WaitOutcome::TimedOut)) => {
                self.kill_overrun(&process).await;
                Some(ProbeOutcome::TimedOut)
            }
            Some(Err(e)) => Some(ProbeOutcome::Failed(e.to_string())),
        };
        self.executor.release(&process).await;

        match &outcome {
            Some(outcome) if outcome.is_reachable() => info!("{} is reachable", spec.target),
            Some(outcome) => {
                warn!("{} is not reachable ({:?}), continuing", spec.target, outcome)
            }
            None => {}
        }
        outcome
    }

    /// SIGKILL a process that ran too long and wait for it to go away
    async fn kill_overrun(&self, process: &ProcessRef) {
        if let Err(e) = self.executor.signal(process, SignalKind::Kill).await {
            warn!("Cannot kill {}: {}", process.label, e);
            return;
        }
        match self.executor.wait(process, KILL_WAIT).await {
            Ok(WaitOutcome::Exited { .. }) => {}
            Ok(WaitOutcome::TimedOut) => warn!("{} still running after SIGKILL", process.label),
            Err(e) => warn!("Waiting for {} after SIGKILL: {}", process.label, e),
        }
    }

    /// Build captures, tasks, and the scheduler and register them in `ctx`
    fn prepare(
        &self,
        ctx: &RunContext,
        links: &HashMap<String, LinkHandle>,
        shared_dir: &Path,
        report: &mut RunReport,
    ) -> Option<ImpairmentScheduler> {
        let timing = self.config.timing.capture();
        for spec in &self.config.captures {
            let registered = spec.binding.resolve(links).and_then(|(endpoint, interface)| {
                ctx.register_capture(CaptureSession::new(
                    spec.clone(),
                    endpoint,
                    interface,
                    shared_dir.join(&spec.output),
                    timing,
                    self.executor.clone(),
                ))
            });
            if let Err(e) = registered {
                report.errors.push(format!("capture {}: {}", spec.id, e));
            }
        }

        for spec in &self.config.tasks {
            let task = TrafficTask::new(spec.clone(), self.executor.clone());
            if let Err(e) = ctx.register_task(task) {
                report.errors.push(e.to_string());
            }
        }

        let spec = self.config.scheduler.as_ref()?;
        let link = match links.get(&spec.link) {
            Some(link) => link.clone(),
            None => {
                report
                    .errors
                    .push(format!("scheduler link '{}' was not created", spec.link));
                return None;
            }
        };
        match ImpairmentScheduler::new(spec.clone(), link) {
            Ok(scheduler) => Some(scheduler),
            Err(e) => {
                report.errors.push(e.to_string());
                None
            }
        }
    }

    async fn teardown(
        &mut self,
        ctx: &RunContext,
        scheduler: Option<ImpairmentScheduler>,
        acquired: &mut Acquired,
        report: &mut RunReport,
    ) {
        info!("*** Tearing down");
        let Teardown { tasks, captures } = match ctx.begin_teardown() {
            Ok(units) => units,
            Err(e) => {
                report.teardown_errors.push(e.to_string());
                Teardown {
                    tasks: Vec::new(),
                    captures: Vec::new(),
                }
            }
        };

        report.shutdown_bound = scheduler
            .as_ref()
            .map(|s| s.stop_bound())
            .unwrap_or_default()
            + tasks.iter().map(|t| t.stop_bound()).sum::<Duration>()
            + captures.iter().map(|c| c.stop_bound()).sum::<Duration>();

        let started = Instant::now();
        if let Some(mut scheduler) = scheduler {
            if let Err(e) = scheduler.stop().await {
                warn!("Stopping scheduler: {}", e);
                report.teardown_errors.push(e.to_string());
            }
            report.scheduler = Some(scheduler.report());
        }
        report.teardown.push(PhaseTiming {
            phase: "scheduler",
            elapsed: started.elapsed(),
        });

        let started = Instant::now();
        for (task, result) in tasks.iter().zip(join_all(tasks.iter().map(|t| t.stop())).await) {
            if let Err(e) = result {
                warn!("Stopping task {}: {}", task.id(), e);
                report.teardown_errors.push(e.to_string());
            }
            let task_report = task.report();
            if let TaskState::Failed(reason) = &task_report.state {
                warn!("Task {} failed: {}", task.id(), reason);
            }
            report.tasks.push(task_report);
        }
        report.teardown.push(PhaseTiming {
            phase: "tasks",
            elapsed: started.elapsed(),
        });

        let started = Instant::now();
        for (capture, result) in captures
            .iter()
            .zip(join_all(captures.iter().map(|c| c.stop())).await)
        {
            if let Err(e) = result {
                warn!("Stopping capture {}: {}", capture.id(), e);
                report.teardown_errors.push(e.to_string());
            }
            report.captures.push(capture.report());
        }
        report.teardown.push(PhaseTiming {
            phase: "captures",
            elapsed: started.elapsed(),
        });

        self.release(acquired, report).await;
    }

    /// Remove containers, then stop the network. Best-effort.
    async fn release(&mut self, acquired: &mut Acquired, report: &mut RunReport) {
        let started = Instant::now();
        for host in acquired.containers.drain(..).rev() {
            if let Err(e) = self.containers.remove_workload_host(&host).await {
                warn!("Removing container {}: {}", host.id, e);
                report.teardown_errors.push(e.to_string());
            }
        }
        report.teardown.push(PhaseTiming {
            phase: "containers",
            elapsed: started.elapsed(),
        });

        let started = Instant::now();
        if std::mem::take(&mut acquired.topology) {
            if let Err(e) = self.topology.stop().await {
                warn!("Stopping network: {}", e);
                report.teardown_errors.push(e.to_string());
            }
        }
        report.teardown.push(PhaseTiming {
            phase: "topology",
            elapsed: started.elapsed(),
        });
    }
}
