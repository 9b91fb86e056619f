//! Supervised traffic workloads
//!
//! A [`TrafficTask`] wraps one external workload (media push or pull,
//! iperf client or server, periodic fetch). Once started, a supervisor
//! tokio task owns the running process and publishes status through a
//! watch channel; the orchestrator never polls the process itself.
//!
//! Kinds:
//! - `OneShot` runs until the process exits or it is stopped
//! - `Bounded` additionally stops itself after a fixed duration
//! - `Recurring` relaunches the workload every interval (start to start)
//!   until the shared cancel signal is set or it is stopped. A running
//!   iteration is never preempted by the cancel signal.

use crate::context::CancelSignal;
use crate::errors::{LabError, Result};
use crate::process::{
    terminate_gracefully, ProcessExecutor, ProcessRef, StopOutcome, WaitOutcome, KILL_WAIT,
};
use crate::types::{CommandSpec, SignalKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Granularity of exit polling inside the supervisor
const EXIT_POLL: Duration = Duration::from_secs(1);

/// Slack added to every stop bound for scheduling and the final kill
const STOP_MARGIN: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    OneShot,
    Bounded { duration_ms: u64 },
    Recurring { interval_ms: u64 },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StartPolicy {
    #[default]
    Immediate,
    /// Launch this long after `start()` returns
    Delayed { delay_ms: u64 },
}

impl StartPolicy {
    pub fn delay(&self) -> Duration {
        match self {
            StartPolicy::Immediate => Duration::ZERO,
            StartPolicy::Delayed { delay_ms } => Duration::from_millis(*delay_ms),
        }
    }
}

/// How a running workload is asked to stop
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopPolicy {
    pub signal: SignalKind,
    pub grace_ms: u64,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            signal: SignalKind::Interrupt,
            grace_ms: 5000,
        }
    }
}

impl StopPolicy {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrafficTaskSpec {
    pub id: String,
    pub kind: TaskKind,
    pub command: CommandSpec,
    #[serde(default)]
    pub start: StartPolicy,
    #[serde(default)]
    pub stop: StopPolicy,
    /// The orchestrator waits for primary tasks before shutting down
    #[serde(default)]
    pub primary: bool,
    /// Link this workload sends across; captures on it start first
    #[serde(default)]
    pub link: Option<String>,
}

impl TrafficTaskSpec {
    pub fn new(id: impl Into<String>, kind: TaskKind, command: CommandSpec) -> Self {
        Self {
            id: id.into(),
            kind,
            command,
            start: StartPolicy::Immediate,
            stop: StopPolicy::default(),
            primary: false,
            link: None,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.start = StartPolicy::Delayed {
            delay_ms: delay.as_millis() as u64,
        };
        self
    }

    pub fn stop_with(mut self, signal: SignalKind, grace: Duration) -> Self {
        self.stop = StopPolicy {
            signal,
            grace_ms: grace.as_millis() as u64,
        };
        self
    }

    pub fn primary(mut self) -> Self {
        self.primary = true;
        self
    }

    pub fn on_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(LabError::InvalidConfig(
                "traffic task id must not be empty".to_string(),
            ));
        }
        match self.kind {
            TaskKind::Bounded { duration_ms: 0 } => Err(LabError::InvalidConfig(format!(
                "bounded task '{}' needs a non-zero duration",
                self.id
            ))),
            TaskKind::Recurring { interval_ms: 0 } => Err(LabError::InvalidConfig(format!(
                "recurring task '{}' needs a non-zero interval",
                self.id
            ))),
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TaskState {
    Pending,
    Running,
    /// The workload exited on its own
    Completed { success: bool },
    Stopped(StopOutcome),
    Failed(String),
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed { .. } | TaskState::Stopped(_) | TaskState::Failed(_)
        )
    }
}

/// Status published by a task's supervisor
#[derive(Clone, Debug)]
pub struct TaskReport {
    pub id: String,
    pub state: TaskState,
    /// One entry per successful launch
    pub launches: Vec<Instant>,
    pub failed_launches: u32,
    pub finished_at: Option<Instant>,
}

struct TaskInner {
    spec: TrafficTaskSpec,
    executor: Arc<dyn ProcessExecutor>,
    report: watch::Sender<TaskReport>,
    process: Mutex<Option<ProcessRef>>,
    stop: CancelSignal,
    supervisor: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl TaskInner {
    async fn launch(&self) -> Result<ProcessRef> {
        match self.executor.spawn(&self.spec.command).await {
            Ok(process) => {
                *self.process.lock() = Some(process.clone());
                let mut count = 0;
                self.report.send_modify(|r| {
                    r.launches.push(Instant::now());
                    r.state = TaskState::Running;
                    count = r.launches.len();
                });
                info!("Task {} launched (#{}): {}", self.spec.id, count, process.label);
                Ok(process)
            }
            Err(e) => {
                let reason = match e {
                    LabError::TaskLaunch { reason, .. } => reason,
                    other => other.to_string(),
                };
                self.report.send_modify(|r| r.failed_launches += 1);
                Err(LabError::TaskLaunch {
                    id: self.spec.id.clone(),
                    reason,
                })
            }
        }
    }

    async fn wait_exit(&self, process: &ProcessRef) -> bool {
        loop {
            match self.executor.wait(process, EXIT_POLL).await {
                Ok(WaitOutcome::Exited { success, .. }) => return success,
                Ok(WaitOutcome::TimedOut) => continue,
                Err(e) => {
                    warn!("Task {}: lost track of {}: {}", self.spec.id, process.label, e);
                    return false;
                }
            }
        }
    }

    async fn release(&self, process: &ProcessRef) {
        self.executor.release(process).await;
        let mut current = self.process.lock();
        if current.as_ref() == Some(process) {
            *current = None;
        }
    }

    async fn terminate(&self, process: &ProcessRef) -> TaskState {
        let stop = &self.spec.stop;
        match terminate_gracefully(self.executor.as_ref(), process, stop.signal, stop.grace()).await
        {
            Ok(outcome) => {
                info!("Task {} stopped ({:?})", self.spec.id, outcome);
                TaskState::Stopped(outcome)
            }
            Err(e) => {
                error!("Task {}: {}", self.spec.id, e);
                TaskState::Failed(e.to_string())
            }
        }
    }

    fn finish(&self, state: TaskState) {
        self.report.send_modify(|r| {
            r.state = state;
            r.finished_at = Some(Instant::now());
        });
    }

    async fn run_once(&self, process: ProcessRef, bound: Option<Duration>) -> TaskState {
        let deadline = async {
            match bound {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending::<()>().await,
            }
        };

        let state = tokio::select! {
            success = self.wait_exit(&process) => {
                info!("Task {} exited (success: {})", self.spec.id, success);
                TaskState::Completed { success }
            }
            _ = deadline => {
                info!("Task {} reached its {:?} limit", self.spec.id, bound.unwrap_or_default());
                self.terminate(&process).await
            }
            _ = self.stop.cancelled() => self.terminate(&process).await,
        };

        self.release(&process).await;
        state
    }

    async fn run_recurring(
        &self,
        first: ProcessRef,
        interval: Duration,
        cancel: &CancelSignal,
    ) -> TaskState {
        let mut current = Some(first);
        let mut iteration_start = self
            .report
            .borrow()
            .launches
            .last()
            .copied()
            .unwrap_or_else(Instant::now);

        loop {
            if let Some(process) = current.take() {
                let success = self.wait_exit(&process).await;
                self.release(&process).await;
                debug!("Task {} iteration done (success: {})", self.spec.id, success);
            }

            if cancel.is_cancelled() || self.stop.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(iteration_start + interval) => {}
                _ = cancel.cancelled() => break,
                _ = self.stop.cancelled() => break,
            }

            iteration_start = Instant::now();
            match self.launch().await {
                Ok(process) => current = Some(process),
                Err(e) => warn!("{}", e),
            }
        }

        let launches = self.report.borrow().launches.len();
        info!("Task {} stopped after {} launches", self.spec.id, launches);
        TaskState::Stopped(StopOutcome::AlreadyExited)
    }
}

async fn supervise(inner: Arc<TaskInner>, first: Option<ProcessRef>, cancel: CancelSignal) {
    let process = match first {
        Some(process) => process,
        None => {
            tokio::select! {
                _ = tokio::time::sleep(inner.spec.start.delay()) => {}
                _ = inner.stop.cancelled() => {
                    inner.finish(TaskState::Stopped(StopOutcome::AlreadyExited));
                    return;
                }
                _ = cancel.cancelled() => {
                    inner.finish(TaskState::Stopped(StopOutcome::AlreadyExited));
                    return;
                }
            }
            match inner.launch().await {
                Ok(process) => process,
                Err(e) => {
                    warn!("{}", e);
                    inner.finish(TaskState::Failed(e.to_string()));
                    return;
                }
            }
        }
    };

    let state = match inner.spec.kind {
        TaskKind::OneShot => inner.run_once(process, None).await,
        TaskKind::Bounded { duration_ms } => {
            inner
                .run_once(process, Some(Duration::from_millis(duration_ms)))
                .await
        }
        TaskKind::Recurring { interval_ms } => {
            inner
                .run_recurring(process, Duration::from_millis(interval_ms), &cancel)
                .await
        }
    };
    inner.finish(state);
}

/// Handle to one supervised workload. Clones share the same task.
#[derive(Clone)]
pub struct TrafficTask {
    inner: Arc<TaskInner>,
}

impl std::fmt::Debug for TrafficTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrafficTask")
            .field("id", &self.inner.spec.id)
            .field("state", &self.state())
            .finish()
    }
}

impl TrafficTask {
    pub fn new(spec: TrafficTaskSpec, executor: Arc<dyn ProcessExecutor>) -> Self {
        let (report, _) = watch::channel(TaskReport {
            id: spec.id.clone(),
            state: TaskState::Pending,
            launches: Vec::new(),
            failed_launches: 0,
            finished_at: None,
        });
        Self {
            inner: Arc::new(TaskInner {
                spec,
                executor,
                report,
                process: Mutex::new(None),
                stop: CancelSignal::new(),
                supervisor: tokio::sync::Mutex::new(None),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.spec.id
    }

    pub fn spec(&self) -> &TrafficTaskSpec {
        &self.inner.spec
    }

    pub fn state(&self) -> TaskState {
        self.inner.report.borrow().state.clone()
    }

    pub fn report(&self) -> TaskReport {
        self.inner.report.borrow().clone()
    }

    pub fn launch_count(&self) -> usize {
        self.inner.report.borrow().launches.len()
    }

    /// Launch the workload and hand it to a supervisor.
    ///
    /// With an immediate start policy a launch failure is returned and the
    /// task is marked failed. Delayed launches report failure through
    /// [`state`](Self::state) instead.
    pub async fn start(&self, cancel: &CancelSignal) -> Result<()> {
        self.inner.spec.validate()?;
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(LabError::InvalidState(format!(
                "task {} already started",
                self.id()
            )));
        }

        let first = match self.inner.spec.start {
            StartPolicy::Immediate => match self.inner.launch().await {
                Ok(process) => Some(process),
                Err(e) => {
                    warn!("{}", e);
                    self.inner.finish(TaskState::Failed(e.to_string()));
                    return Err(e);
                }
            },
            StartPolicy::Delayed { delay_ms } => {
                debug!("Task {} launches in {}ms", self.id(), delay_ms);
                None
            }
        };

        let handle = tokio::spawn(supervise(self.inner.clone(), first, cancel.clone()));
        *self.inner.supervisor.lock().await = Some(handle);
        Ok(())
    }

    /// Stop the workload. Stopping a task that never started, already
    /// finished, or was stopped before is a no-op.
    ///
    /// Returns within [`stop_bound`](Self::stop_bound); past it the
    /// current process is killed.
    pub async fn stop(&self) -> Result<()> {
        if !self.inner.started.load(Ordering::Acquire) {
            return Ok(());
        }
        self.inner.stop.cancel();

        let handle = self.inner.supervisor.lock().await.take();
        let Some(mut handle) = handle else {
            return Ok(());
        };

        let budget = self.stop_bound().saturating_sub(KILL_WAIT);
        if tokio::time::timeout(budget, &mut handle).await.is_ok() {
            return Ok(());
        }

        warn!("Task {} did not stop within {:?}, killing it", self.id(), budget);
        handle.abort();
        let killed = self.kill_current().await;
        self.inner.finish(match &killed {
            Ok(()) => TaskState::Stopped(StopOutcome::Forced),
            Err(e) => TaskState::Failed(e.to_string()),
        });
        killed
    }

    async fn kill_current(&self) -> Result<()> {
        let process = self.inner.process.lock().take();
        let Some(process) = process else {
            return Ok(());
        };
        let executor = &self.inner.executor;

        let result = match executor.signal(&process, SignalKind::Kill).await {
            Ok(()) => match executor.wait(&process, KILL_WAIT).await {
                Ok(WaitOutcome::Exited { .. }) => Ok(()),
                Ok(WaitOutcome::TimedOut) => Err(LabError::TaskTermination {
                    id: self.id().to_string(),
                    reason: "still running after SIGKILL".to_string(),
                }),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        executor.release(&process).await;
        result
    }

    /// Upper bound on how long [`stop`](Self::stop) can take
    pub fn stop_bound(&self) -> Duration {
        let base = self.inner.spec.stop.grace() + KILL_WAIT + STOP_MARGIN;
        match self.inner.spec.kind {
            TaskKind::Recurring { interval_ms } => base + Duration::from_millis(interval_ms),
            _ => base,
        }
    }

    /// Wait until the task reaches a terminal state
    pub async fn wait_finished(&self) -> TaskState {
        if !self.inner.started.load(Ordering::Acquire) {
            return self.state();
        }
        let mut rx = self.inner.report.subscribe();
        let state = match rx.wait_for(|r| r.state.is_terminal()).await {
            Ok(report) => report.state.clone(),
            Err(_) => TaskState::Failed("task dropped".to_string()),
        };
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBehavior, FakeExecutor};
    use crate::types::Endpoint;

    fn iperf(kind: TaskKind) -> TrafficTaskSpec {
        TrafficTaskSpec::new(
            "iperf-h3",
            kind,
            CommandSpec::new(Endpoint::Host("h3".into()), "iperf").args(["-c", "10.0.0.6"]),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_task_stops_itself() {
        let executor = Arc::new(FakeExecutor::new());
        let task = TrafficTask::new(
            iperf(TaskKind::Bounded {
                duration_ms: 20_000,
            }),
            executor.clone(),
        );
        let t0 = Instant::now();

        task.start(&CancelSignal::new()).await.unwrap();
        assert_eq!(task.state(), TaskState::Running);

        let state = task.wait_finished().await;
        assert_eq!(state, TaskState::Stopped(StopOutcome::Graceful));

        let finished = task.report().finished_at.unwrap() - t0;
        assert!(finished >= Duration::from_secs(20));
        assert!(finished < Duration::from_millis(20_100));
        assert_eq!(executor.signals()[0].kind, SignalKind::Interrupt);
        assert_eq!(executor.running(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recurring_task_observes_cancel_between_iterations() {
        let executor = Arc::new(FakeExecutor::new());
        executor.script("iperf", FakeBehavior::exits_after(Duration::from_secs(2)));
        let task = TrafficTask::new(
            iperf(TaskKind::Recurring {
                interval_ms: 30_000,
            }),
            executor.clone(),
        );
        let cancel = CancelSignal::new();
        let t0 = Instant::now();

        task.start(&cancel).await.unwrap();
        tokio::time::sleep(Duration::from_secs(65)).await;
        cancel.cancel();
        task.wait_finished().await;

        let report = task.report();
        let offsets: Vec<u64> = report
            .launches
            .iter()
            .map(|at| (*at - t0).as_secs())
            .collect();
        assert_eq!(offsets, vec![0, 30, 60]);
        assert!(report.finished_at.unwrap() - t0 < Duration::from_secs(90));
        assert_eq!(executor.spawns_of("iperf").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let executor = Arc::new(FakeExecutor::new());
        let task = TrafficTask::new(iperf(TaskKind::OneShot), executor.clone());

        // Never started
        task.stop().await.unwrap();
        assert_eq!(task.state(), TaskState::Pending);

        task.start(&CancelSignal::new()).await.unwrap();
        task.stop().await.unwrap();
        assert_eq!(task.state(), TaskState::Stopped(StopOutcome::Graceful));

        let before = Instant::now();
        task.stop().await.unwrap();
        assert_eq!(Instant::now(), before);
        assert_eq!(executor.signals().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_completes() {
        let executor = Arc::new(FakeExecutor::new());
        executor.script("iperf", FakeBehavior::exits_after(Duration::from_secs(10)));
        let task = TrafficTask::new(iperf(TaskKind::OneShot), executor);

        task.start(&CancelSignal::new()).await.unwrap();
        assert_eq!(
            task.wait_finished().await,
            TaskState::Completed { success: true }
        );
        // Stopping a finished task does nothing
        task.stop().await.unwrap();
        assert_eq!(task.state(), TaskState::Completed { success: true });
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_failure_marks_task_failed() {
        let executor = Arc::new(FakeExecutor::new());
        executor.script("iperf", FakeBehavior::unlaunchable());
        let task = TrafficTask::new(iperf(TaskKind::OneShot), executor);

        let err = task.start(&CancelSignal::new()).await.unwrap_err();
        assert!(matches!(err, LabError::TaskLaunch { ref id, .. } if id == "iperf-h3"));
        assert!(matches!(task.state(), TaskState::Failed(_)));
        assert_eq!(task.report().failed_launches, 1);
        task.stop().await.unwrap();
        assert!(task.start(&CancelSignal::new()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_start() {
        let executor = Arc::new(FakeExecutor::new());
        let task = TrafficTask::new(
            iperf(TaskKind::OneShot).delayed(Duration::from_secs(2)),
            executor.clone(),
        );
        let t0 = Instant::now();

        task.start(&CancelSignal::new()).await.unwrap();
        assert_eq!(task.state(), TaskState::Pending);
        tokio::time::sleep(Duration::from_secs(3)).await;

        let spawns = executor.spawns_of("iperf");
        assert_eq!(spawns.len(), 1);
        assert_eq!(spawns[0].at - t0, Duration::from_secs(2));
        task.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_launch_failure_is_reported_as_state() {
        let executor = Arc::new(FakeExecutor::new());
        executor.script("iperf", FakeBehavior::unlaunchable());
        let task = TrafficTask::new(
            iperf(TaskKind::OneShot).delayed(Duration::from_secs(2)),
            executor,
        );

        task.start(&CancelSignal::new()).await.unwrap();
        assert!(matches!(task.wait_finished().await, TaskState::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_delayed_launch() {
        let executor = Arc::new(FakeExecutor::new());
        let task = TrafficTask::new(
            iperf(TaskKind::OneShot).delayed(Duration::from_secs(10)),
            executor.clone(),
        );
        task.start(&CancelSignal::new()).await.unwrap();
        task.stop().await.unwrap();
        assert!(executor.spawns().is_empty());
        assert_eq!(task.state(), TaskState::Stopped(StopOutcome::AlreadyExited));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stubborn_process_is_killed() {
        let executor = Arc::new(FakeExecutor::new());
        executor.script("iperf", FakeBehavior::ignores_graceful());
        let task = TrafficTask::new(
            iperf(TaskKind::OneShot).stop_with(SignalKind::Terminate, Duration::from_secs(3)),
            executor.clone(),
        );
        task.start(&CancelSignal::new()).await.unwrap();

        let t0 = Instant::now();
        task.stop().await.unwrap();
        assert!(Instant::now() - t0 <= task.stop_bound());
        assert_eq!(task.state(), TaskState::Stopped(StopOutcome::Forced));

        let kinds: Vec<_> = executor.signals().iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![SignalKind::Terminate, SignalKind::Kill]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recurring_stop_kills_overrunning_iteration() {
        let executor = Arc::new(FakeExecutor::new());
        let task = TrafficTask::new(
            iperf(TaskKind::Recurring {
                interval_ms: 30_000,
            }),
            executor.clone(),
        );
        task.start(&CancelSignal::new()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let t0 = Instant::now();
        task.stop().await.unwrap();
        assert!(Instant::now() - t0 <= task.stop_bound());
        assert_eq!(task.state(), TaskState::Stopped(StopOutcome::Forced));
        assert_eq!(executor.running(), 0);
    }

    #[test]
    fn test_spec_validation() {
        assert!(iperf(TaskKind::Bounded { duration_ms: 0 }).validate().is_err());
        assert!(iperf(TaskKind::Recurring { interval_ms: 0 })
            .validate()
            .is_err());
        assert!(iperf(TaskKind::OneShot).validate().is_ok());
    }

    #[test]
    fn test_spec_json_shape() {
        let spec: TrafficTaskSpec = serde_json::from_str(
            r#"{
                "id": "iperf-h3",
                "kind": {"type": "bounded", "duration_ms": 20000},
                "command": {"endpoint": {"host": "h3"}, "program": "iperf", "args": ["-u"]},
                "start": {"type": "delayed", "delay_ms": 2000}
            }"#,
        )
        .unwrap();
        assert_eq!(spec.kind, TaskKind::Bounded { duration_ms: 20_000 });
        assert_eq!(spec.start.delay(), Duration::from_secs(2));
        assert_eq!(spec.stop, StopPolicy::default());
        assert!(!spec.primary);
    }
}
