//! Per-run shared state

use crate::capture::CaptureSession;
use crate::errors::{LabError, Result};
use crate::task::TrafficTask;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Cooperative cancellation shared by background units.
///
/// Set at most once; every clone observes it.
#[derive(Clone, Debug)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Returns `true` for the call that actually set the signal
    pub fn cancel(&self) -> bool {
        self.tx.send_if_modified(|cancelled| {
            if *cancelled {
                false
            } else {
                *cancelled = true;
                true
            }
        })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal is set
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns once set
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

#[derive(Default)]
struct Registry {
    tasks: Vec<TrafficTask>,
    captures: Vec<CaptureSession>,
    torn_down: bool,
}

/// Everything taken out of the context at shutdown
pub struct Teardown {
    pub tasks: Vec<TrafficTask>,
    pub captures: Vec<CaptureSession>,
}

/// State of one orchestration run.
///
/// Registries are only touched by the orchestrator; tasks and sessions
/// report their status through their own handles.
pub struct RunContext {
    cancel: CancelSignal,
    started_at: Instant,
    registry: Mutex<Registry>,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            cancel: CancelSignal::new(),
            started_at: Instant::now(),
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn register_task(&self, task: TrafficTask) -> Result<()> {
        let mut registry = self.registry.lock();
        if registry.torn_down {
            return Err(LabError::InvalidState(
                "run context already torn down".to_string(),
            ));
        }
        if registry.tasks.iter().any(|t| t.id() == task.id()) {
            return Err(LabError::InvalidConfig(format!(
                "duplicate traffic task '{}'",
                task.id()
            )));
        }
        debug!("Registered traffic task {}", task.id());
        registry.tasks.push(task);
        Ok(())
    }

    pub fn register_capture(&self, session: CaptureSession) -> Result<()> {
        let mut registry = self.registry.lock();
        if registry.torn_down {
            return Err(LabError::InvalidState(
                "run context already torn down".to_string(),
            ));
        }
        if registry.captures.iter().any(|c| c.id() == session.id()) {
            return Err(LabError::InvalidConfig(format!(
                "duplicate capture '{}'",
                session.id()
            )));
        }
        debug!("Registered capture {}", session.id());
        registry.captures.push(session);
        Ok(())
    }

    pub fn tasks(&self) -> Vec<TrafficTask> {
        self.registry.lock().tasks.clone()
    }

    pub fn captures(&self) -> Vec<CaptureSession> {
        self.registry.lock().captures.clone()
    }

    pub fn task(&self, id: &str) -> Option<TrafficTask> {
        self.registry
            .lock()
            .tasks
            .iter()
            .find(|t| t.id() == id)
            .cloned()
    }

    /// Set the cancel signal and hand over every registered unit.
    ///
    /// Succeeds exactly once per context.
    pub fn begin_teardown(&self) -> Result<Teardown> {
        let mut registry = self.registry.lock();
        if registry.torn_down {
            return Err(LabError::InvalidState(
                "run context already torn down".to_string(),
            ));
        }
        registry.torn_down = true;
        self.cancel.cancel();
        Ok(Teardown {
            tasks: std::mem::take(&mut registry.tasks),
            captures: std::mem::take(&mut registry.captures),
        })
    }

    pub fn is_torn_down(&self) -> bool {
        self.registry.lock().torn_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskKind, TrafficTaskSpec};
    use crate::testing::FakeExecutor;
    use crate::types::{CommandSpec, Endpoint};
    use std::time::Duration;

    fn task(id: &str) -> TrafficTask {
        TrafficTask::new(
            TrafficTaskSpec::new(
                id,
                TaskKind::OneShot,
                CommandSpec::new(Endpoint::Local, "iperf"),
            ),
            Arc::new(FakeExecutor::new()),
        )
    }

    #[tokio::test]
    async fn test_cancel_signal_set_once() {
        let signal = CancelSignal::new();
        let observer = signal.clone();
        assert!(!observer.is_cancelled());

        let waiter = tokio::spawn(async move { observer.cancelled().await });
        assert!(signal.cancel());
        assert!(!signal.cancel());
        assert!(signal.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        // Late observers return immediately
        signal.cancelled().await;
    }

    #[tokio::test]
    async fn test_registry_rejects_duplicates() {
        let ctx = RunContext::new();
        ctx.register_task(task("iperf-h3")).unwrap();
        assert!(ctx.register_task(task("iperf-h3")).is_err());
        ctx.register_task(task("iperf-h4")).unwrap();
        assert_eq!(ctx.tasks().len(), 2);
        assert!(ctx.task("iperf-h4").is_some());
    }

    #[tokio::test]
    async fn test_teardown_exactly_once() {
        let ctx = RunContext::new();
        ctx.register_task(task("media")).unwrap();

        let teardown = ctx.begin_teardown().unwrap();
        assert_eq!(teardown.tasks.len(), 1);
        assert!(ctx.cancel_signal().is_cancelled());
        assert!(ctx.is_torn_down());

        assert!(ctx.begin_teardown().is_err());
        assert!(ctx.register_task(task("late")).is_err());
        assert!(ctx.tasks().is_empty());
    }
}
