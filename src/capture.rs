//! Packet capture sessions
//!
//! Each session runs `tcpdump -U -s0 -i <if> -w <file> [filter]` on the
//! endpoint that owns the interface. `start()` returns only after the
//! warm-up delay, so traffic started afterwards is on the wire while the
//! capture is live. `stop()` interrupts tcpdump so it flushes its output,
//! then kills it if it does not exit in time.

use crate::errors::{LabError, Result, Side};
use crate::link::LinkHandle;
use crate::process::{terminate_gracefully, ProcessExecutor, ProcessRef, StopOutcome, KILL_WAIT};
use crate::types::{CommandSpec, Endpoint, SignalKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Where a capture listens
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CaptureBinding {
    Interface { endpoint: Endpoint, interface: String },
    LinkSide { link: String, side: Side },
}

impl CaptureBinding {
    /// Endpoint and interface name to run tcpdump against
    pub fn resolve(&self, links: &HashMap<String, LinkHandle>) -> Result<(Endpoint, String)> {
        match self {
            CaptureBinding::Interface {
                endpoint,
                interface,
            } => Ok((endpoint.clone(), interface.clone())),
            CaptureBinding::LinkSide { link, side } => {
                let handle = links.get(link).ok_or_else(|| {
                    LabError::InvalidConfig(format!("capture bound to unknown link '{}'", link))
                })?;
                let port = handle.port(*side);
                let endpoint = match &port.netns {
                    Some(ns) => Endpoint::Netns(ns.clone()),
                    None => Endpoint::Local,
                };
                Ok((endpoint, port.interface.clone()))
            }
        }
    }

    /// Link the capture observes, when bound to one
    pub fn link(&self) -> Option<&str> {
        match self {
            CaptureBinding::LinkSide { link, .. } => Some(link),
            CaptureBinding::Interface { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureSpec {
    pub id: String,
    pub binding: CaptureBinding,
    /// BPF filter expression
    #[serde(default)]
    pub filter: Option<String>,
    /// File name, relative to the shared directory
    pub output: String,
    /// Link whose traffic this capture brackets, if not implied by the binding
    #[serde(default)]
    pub link: Option<String>,
}

impl CaptureSpec {
    /// Link this capture must be live on before traffic starts
    pub fn observed_link(&self) -> Option<&str> {
        self.link.as_deref().or_else(|| self.binding.link())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureTiming {
    pub warmup: Duration,
    pub stop_timeout: Duration,
}

impl Default for CaptureTiming {
    fn default() -> Self {
        Self {
            warmup: Duration::from_secs(2),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CaptureState {
    Pending,
    Active,
    Stopped(StopOutcome),
    Failed(String),
}

#[derive(Clone, Debug)]
pub struct CaptureReport {
    pub id: String,
    pub endpoint: Endpoint,
    pub interface: String,
    pub output: PathBuf,
    pub state: CaptureState,
    pub started_at: Option<Instant>,
    pub ready_at: Option<Instant>,
    pub stopped_at: Option<Instant>,
    /// Size of the capture file after stop, if it exists
    pub bytes_written: Option<u64>,
}

struct CaptureInner {
    spec: CaptureSpec,
    timing: CaptureTiming,
    executor: Arc<dyn ProcessExecutor>,
    process: tokio::sync::Mutex<Option<ProcessRef>>,
    report: Mutex<CaptureReport>,
    started: AtomicBool,
}

/// Handle to one capture. Clones share the same session.
#[derive(Clone)]
pub struct CaptureSession {
    inner: Arc<CaptureInner>,
}

impl CaptureSession {
    pub fn new(
        spec: CaptureSpec,
        endpoint: Endpoint,
        interface: impl Into<String>,
        output: PathBuf,
        timing: CaptureTiming,
        executor: Arc<dyn ProcessExecutor>,
    ) -> Self {
        let report = CaptureReport {
            id: spec.id.clone(),
            endpoint,
            interface: interface.into(),
            output,
            state: CaptureState::Pending,
            started_at: None,
            ready_at: None,
            stopped_at: None,
            bytes_written: None,
        };
        Self {
            inner: Arc::new(CaptureInner {
                spec,
                timing,
                executor,
                process: tokio::sync::Mutex::new(None),
                report: Mutex::new(report),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.spec.id
    }

    pub fn spec(&self) -> &CaptureSpec {
        &self.inner.spec
    }

    pub fn report(&self) -> CaptureReport {
        self.inner.report.lock().clone()
    }

    pub fn state(&self) -> CaptureState {
        self.inner.report.lock().state.clone()
    }

    pub fn command(&self) -> CommandSpec {
        let report = self.inner.report.lock();
        let output = report.output.display().to_string();
        let mut cmd = CommandSpec::new(report.endpoint.clone(), "tcpdump").args([
            "-U",
            "-s0",
            "-i",
            report.interface.as_str(),
            "-w",
            output.as_str(),
        ]);
        if let Some(filter) = &self.inner.spec.filter {
            cmd = cmd.args(filter.split_whitespace());
        }
        cmd
    }

    fn fail(&self, reason: String) -> LabError {
        warn!("Capture {} failed: {}", self.id(), reason);
        self.inner.report.lock().state = CaptureState::Failed(reason.clone());
        LabError::TaskLaunch {
            id: self.id().to_string(),
            reason,
        }
    }

    /// Launch tcpdump and return once it has been live for the warm-up delay
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(LabError::InvalidState(format!(
                "capture {} already started",
                self.id()
            )));
        }

        let command = self.command();
        let process = match self.inner.executor.spawn(&command).await {
            Ok(process) => process,
            Err(e) => return Err(self.fail(e.to_string())),
        };
        self.inner.report.lock().started_at = Some(Instant::now());
        *self.inner.process.lock().await = Some(process.clone());
        info!("Capture {} started: {}", self.id(), command);

        tokio::time::sleep(self.inner.timing.warmup).await;

        let exited = self
            .inner
            .executor
            .wait(&process, Duration::ZERO)
            .await
            .map(|outcome| outcome.has_exited())
            .unwrap_or(true);
        if exited {
            self.inner.process.lock().await.take();
            self.inner.executor.release(&process).await;
            return Err(self.fail("capture exited during warm-up".to_string()));
        }

        let mut report = self.inner.report.lock();
        report.ready_at = Some(Instant::now());
        report.state = CaptureState::Active;
        info!("Capture {} ready on {}", self.id(), report.interface);
        Ok(())
    }

    /// Interrupt tcpdump, wait for it to flush, kill it past the stop
    /// timeout. Stopping again, or stopping a session that never started,
    /// does nothing.
    pub async fn stop(&self) -> Result<()> {
        let mut slot = self.inner.process.lock().await;
        let Some(process) = slot.take() else {
            return Ok(());
        };

        let executor = self.inner.executor.as_ref();
        let outcome = terminate_gracefully(
            executor,
            &process,
            SignalKind::Interrupt,
            self.inner.timing.stop_timeout,
        )
        .await;
        executor.release(&process).await;
        drop(slot);

        let output = self.inner.report.lock().output.clone();
        let bytes = tokio::fs::metadata(&output).await.ok().map(|m| m.len());

        let mut report = self.inner.report.lock();
        report.stopped_at = Some(Instant::now());
        report.bytes_written = bytes;
        match outcome {
            Ok(outcome) => {
                info!(
                    "Capture {} stopped ({:?}), {} bytes in {}",
                    self.id(),
                    outcome,
                    bytes.unwrap_or(0),
                    output.display()
                );
                report.state = CaptureState::Stopped(outcome);
                Ok(())
            }
            Err(e) => {
                warn!("Capture {} did not stop: {}", self.id(), e);
                report.state = CaptureState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Upper bound on how long [`stop`](Self::stop) can take
    pub fn stop_bound(&self) -> Duration {
        self.inner.timing.stop_timeout + KILL_WAIT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkPort;
    use crate::testing::{FakeBehavior, FakeExecutor, RecordingShaper};

    fn session(executor: Arc<FakeExecutor>) -> CaptureSession {
        let spec = CaptureSpec {
            id: "server".into(),
            binding: CaptureBinding::Interface {
                endpoint: Endpoint::Host("server".into()),
                interface: "server-eth0".into(),
            },
            filter: Some("src port 1935".into()),
            output: "server.pcap".into(),
            link: None,
        };
        CaptureSession::new(
            spec,
            Endpoint::Host("server".into()),
            "server-eth0",
            PathBuf::from("/tmp/impairlab-test/server.pcap"),
            CaptureTiming::default(),
            executor,
        )
    }

    #[test]
    fn test_tcpdump_command() {
        let capture = session(Arc::new(FakeExecutor::new()));
        assert_eq!(
            capture.command().to_string(),
            "[host:server] tcpdump -U -s0 -i server-eth0 -w /tmp/impairlab-test/server.pcap src port 1935"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_waits_for_warmup() {
        let executor = Arc::new(FakeExecutor::new());
        let capture = session(executor.clone());
        let t0 = Instant::now();

        capture.start().await.unwrap();
        assert_eq!(Instant::now() - t0, Duration::from_secs(2));

        let report = capture.report();
        assert_eq!(report.state, CaptureState::Active);
        assert_eq!(
            report.ready_at.unwrap() - report.started_at.unwrap(),
            Duration::from_secs(2)
        );
        capture.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_stop_is_single_stop() {
        let executor = Arc::new(FakeExecutor::new());
        let capture = session(executor.clone());
        capture.start().await.unwrap();

        capture.stop().await.unwrap();
        let first = capture.report();
        capture.stop().await.unwrap();
        let second = capture.report();

        assert_eq!(first.state, CaptureState::Stopped(StopOutcome::Graceful));
        assert_eq!(first.state, second.state);
        assert_eq!(first.stopped_at, second.stopped_at);
        assert_eq!(executor.signals().len(), 1);
        assert_eq!(executor.signals()[0].kind, SignalKind::Interrupt);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_without_start() {
        let capture = session(Arc::new(FakeExecutor::new()));
        capture.stop().await.unwrap();
        assert_eq!(capture.state(), CaptureState::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_during_warmup_fails_start() {
        let executor = Arc::new(FakeExecutor::new());
        executor.script("tcpdump", FakeBehavior::fails_after(Duration::from_millis(300)));
        let capture = session(executor);

        assert!(capture.start().await.is_err());
        assert!(matches!(capture.state(), CaptureState::Failed(_)));
        capture.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_capture_is_killed_within_timeout() {
        let executor = Arc::new(FakeExecutor::new());
        executor.script("tcpdump", FakeBehavior::ignores_graceful());
        let capture = session(executor.clone());
        capture.start().await.unwrap();

        let t0 = Instant::now();
        capture.stop().await.unwrap();
        assert!(Instant::now() - t0 <= capture.stop_bound());
        assert_eq!(capture.state(), CaptureState::Stopped(StopOutcome::Forced));
        assert_eq!(executor.running(), 0);
    }

    #[test]
    fn test_resolve_link_side() {
        let link = LinkHandle::new(
            "server-link",
            LinkPort::in_namespace("il-server", "server-eth0"),
            LinkPort::root("s1-eth1"),
            Arc::new(RecordingShaper::new()),
        );
        let links = HashMap::from([("server-link".to_string(), link)]);

        let binding = CaptureBinding::LinkSide {
            link: "server-link".into(),
            side: Side::A,
        };
        assert_eq!(
            binding.resolve(&links).unwrap(),
            (Endpoint::Netns("il-server".into()), "server-eth0".to_string())
        );

        let binding = CaptureBinding::LinkSide {
            link: "server-link".into(),
            side: Side::B,
        };
        assert_eq!(
            binding.resolve(&links).unwrap(),
            (Endpoint::Local, "s1-eth1".to_string())
        );

        let missing = CaptureBinding::LinkSide {
            link: "middle".into(),
            side: Side::A,
        };
        assert!(missing.resolve(&links).is_err());
    }
}
