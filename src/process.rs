//! Process execution for workloads, captures, and probes
//!
//! [`ProcessExecutor`] is the capability every supervised unit goes through
//! to launch and stop external tools. [`SystemExecutor`] runs real commands
//! with tokio, placing them inside a host's network namespace
//! (`ip netns exec`) or a workload container (`docker exec`).
//!
//! Every child gets its own process group so a Ctrl-C at the terminal
//! reaches only the orchestrator, which then stops children in order.

use crate::errors::{LabError, Result};
use crate::types::{CommandSpec, Endpoint, SignalKind};
use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// How long to wait for a process to disappear after SIGKILL
pub const KILL_WAIT: Duration = Duration::from_secs(2);

/// Reference to a spawned external process
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProcessRef {
    pub id: u64,
    pub pid: Option<u32>,
    pub label: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited { success: bool, code: Option<i32> },
    TimedOut,
}

impl WaitOutcome {
    pub fn has_exited(&self) -> bool {
        matches!(self, WaitOutcome::Exited { .. })
    }
}

/// How a process ended when we asked it to stop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// It was already gone before any signal was sent
    AlreadyExited,
    /// It exited within the grace period after the stop signal
    Graceful,
    /// It had to be killed
    Forced,
}

/// Spawns, signals, and waits on external processes
#[async_trait]
pub trait ProcessExecutor: Send + Sync {
    async fn spawn(&self, command: &CommandSpec) -> Result<ProcessRef>;

    async fn signal(&self, process: &ProcessRef, kind: SignalKind) -> Result<()>;

    /// Wait up to `timeout` for the process to exit. Released or unknown
    /// processes report as exited.
    async fn wait(&self, process: &ProcessRef, timeout: Duration) -> Result<WaitOutcome>;

    /// Forget an exited process
    async fn release(&self, process: &ProcessRef);
}

/// Send `signal`, wait `grace`, then escalate to SIGKILL.
///
/// Total time is bounded by `grace + KILL_WAIT`.
pub async fn terminate_gracefully(
    executor: &dyn ProcessExecutor,
    process: &ProcessRef,
    signal: SignalKind,
    grace: Duration,
) -> Result<StopOutcome> {
    if executor.wait(process, Duration::ZERO).await?.has_exited() {
        return Ok(StopOutcome::AlreadyExited);
    }

    if let Err(e) = executor.signal(process, signal).await {
        warn!("{} to {} failed, escalating: {}", signal, process.label, e);
    } else if executor.wait(process, grace).await?.has_exited() {
        return Ok(StopOutcome::Graceful);
    }

    debug!("{} did not exit within {:?}, sending SIGKILL", process.label, grace);
    executor.signal(process, SignalKind::Kill).await?;
    match executor.wait(process, KILL_WAIT).await? {
        WaitOutcome::Exited { .. } => Ok(StopOutcome::Forced),
        WaitOutcome::TimedOut => Err(LabError::TaskTermination {
            id: process.label.clone(),
            reason: "still running after SIGKILL".to_string(),
        }),
    }
}

/// Run a short-lived administrative command and fail on non-zero exit
pub(crate) async fn run_checked(argv: &[String]) -> Result<()> {
    run_output(argv).await.map(|_| ())
}

/// Like [`run_checked`], returning trimmed stdout
pub(crate) async fn run_output(argv: &[String]) -> Result<String> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| LabError::InvalidConfig("empty command".to_string()))?;
    debug!("Running: {}", argv.join(" "));
    let output = Command::new(program)
        .args(args)
        .process_group(0)
        .kill_on_drop(true)
        .output()
        .await?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(LabError::Command {
            command: argv.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

fn to_nix_signal(kind: SignalKind) -> Signal {
    match kind {
        SignalKind::Interrupt => Signal::SIGINT,
        SignalKind::Terminate => Signal::SIGTERM,
        SignalKind::Kill => Signal::SIGKILL,
    }
}

/// A `docker exec` workload. The docker CLI does not forward signals, so
/// the workload records its in-container pid and is signalled through a
/// second `docker exec`.
#[derive(Clone, Debug, PartialEq, Eq)]
struct ContainerProcess {
    container: String,
    pid_file: String,
}

impl ContainerProcess {
    fn launch_argv(&self, spec: &CommandSpec) -> Vec<String> {
        let mut argv = vec![
            "docker".to_string(),
            "exec".to_string(),
            self.container.clone(),
            "sh".to_string(),
            "-c".to_string(),
            format!("echo $$ > {} && exec \"$0\" \"$@\"", self.pid_file),
        ];
        argv.push(spec.program.clone());
        argv.extend(spec.args.iter().cloned());
        argv
    }

    fn signal_argv(&self, kind: SignalKind) -> Vec<String> {
        vec![
            "docker".to_string(),
            "exec".to_string(),
            self.container.clone(),
            "sh".to_string(),
            "-c".to_string(),
            format!("kill -s {} \"$(cat {})\"", signal_name(kind), self.pid_file),
        ]
    }
}

fn signal_name(kind: SignalKind) -> &'static str {
    match kind {
        SignalKind::Interrupt => "INT",
        SignalKind::Terminate => "TERM",
        SignalKind::Kill => "KILL",
    }
}

struct Spawned {
    child: Arc<tokio::sync::Mutex<Child>>,
    container: Option<ContainerProcess>,
}

/// Runs commands on the local machine with tokio
pub struct SystemExecutor {
    netns_prefix: String,
    log_dir: Option<PathBuf>,
    children: Mutex<HashMap<u64, Spawned>>,
    next_id: AtomicU64,
}

impl SystemExecutor {
    /// `netns_prefix` must match the prefix the topology used to name host namespaces
    pub fn new(netns_prefix: impl Into<String>) -> Self {
        Self {
            netns_prefix: netns_prefix.into(),
            log_dir: None,
            children: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Redirect stdout/stderr of every process into `<dir>/<id>-<program>.log`
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Translate a command spec into the concrete argv to execute as process `id`
    pub fn argv(&self, id: u64, spec: &CommandSpec) -> Vec<String> {
        let mut argv = match &spec.endpoint {
            Endpoint::Local => Vec::new(),
            Endpoint::Host(host) => vec![
                "ip".to_string(),
                "netns".to_string(),
                "exec".to_string(),
                format!("{}{}", self.netns_prefix, host),
            ],
            Endpoint::Netns(name) => vec![
                "ip".to_string(),
                "netns".to_string(),
                "exec".to_string(),
                name.clone(),
            ],
            Endpoint::Container(container) => {
                return self.container_process(id, container).launch_argv(spec);
            }
        };
        argv.push(spec.program.clone());
        argv.extend(spec.args.iter().cloned());
        argv
    }

    fn container_process(&self, id: u64, container: &str) -> ContainerProcess {
        ContainerProcess {
            container: container.to_string(),
            pid_file: format!("/tmp/impairlab-{}-{}.pid", std::process::id(), id),
        }
    }

    fn output_stdio(&self, id: u64, program: &str) -> std::io::Result<(Stdio, Stdio)> {
        match &self.log_dir {
            Some(dir) => {
                let name = program.rsplit('/').next().unwrap_or(program);
                let file = std::fs::File::create(dir.join(format!("{:03}-{}.log", id, name)))?;
                let err = file.try_clone()?;
                Ok((Stdio::from(file), Stdio::from(err)))
            }
            None => Ok((Stdio::null(), Stdio::null())),
        }
    }

    fn child(&self, process: &ProcessRef) -> Option<Arc<tokio::sync::Mutex<Child>>> {
        self.children
            .lock()
            .get(&process.id)
            .map(|spawned| spawned.child.clone())
    }

    fn signal_local(&self, process: &ProcessRef, pid: u32, kind: SignalKind) -> Result<()> {
        debug!("Sending {} to {} (pid {})", kind, process.label, pid);
        match kill(Pid::from_raw(pid as i32), to_nix_signal(kind)) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(LabError::TaskTermination {
                id: process.label.clone(),
                reason: format!("{}: {}", kind, e),
            }),
        }
    }
}

#[async_trait]
impl ProcessExecutor for SystemExecutor {
    async fn spawn(&self, spec: &CommandSpec) -> Result<ProcessRef> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let label = spec.to_string();
        let argv = self.argv(id, spec);
        let container = match &spec.endpoint {
            Endpoint::Container(container) => Some(self.container_process(id, container)),
            _ => None,
        };

        let (stdout, stderr) =
            self.output_stdio(id, &spec.program)
                .map_err(|e| LabError::TaskLaunch {
                    id: label.clone(),
                    reason: format!("cannot open log file: {}", e),
                })?;

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| LabError::TaskLaunch {
            id: label.clone(),
            reason: e.to_string(),
        })?;
        let pid = child.id();

        self.children.lock().insert(
            id,
            Spawned {
                child: Arc::new(tokio::sync::Mutex::new(child)),
                container,
            },
        );

        info!("Spawned {} (pid {:?})", label, pid);
        Ok(ProcessRef { id, pid, label })
    }

    async fn signal(&self, process: &ProcessRef, kind: SignalKind) -> Result<()> {
        let Some(pid) = process.pid else {
            return Ok(());
        };
        let container = match self.children.lock().get(&process.id) {
            Some(spawned) => spawned.container.clone(),
            None => return Ok(()),
        };

        let Some(container) = container else {
            return self.signal_local(process, pid, kind);
        };

        debug!(
            "Sending {} to {} inside {}",
            kind, process.label, container.container
        );
        if let Err(e) = run_checked(&container.signal_argv(kind)).await {
            // Workload gone or pid file not written yet
            debug!("In-container {} to {} failed: {}", kind, process.label, e);
            return self.signal_local(process, pid, kind);
        }
        if kind == SignalKind::Kill {
            // Reap a docker client that outlives its workload
            self.signal_local(process, pid, kind)?;
        }
        Ok(())
    }

    async fn wait(&self, process: &ProcessRef, timeout: Duration) -> Result<WaitOutcome> {
        let Some(child) = self.child(process) else {
            return Ok(WaitOutcome::Exited {
                success: false,
                code: None,
            });
        };

        let waited = tokio::time::timeout(timeout, async move {
            let mut child = child.lock().await;
            child.wait().await
        })
        .await;

        match waited {
            Ok(Ok(status)) => Ok(WaitOutcome::Exited {
                success: status.success(),
                code: status.code(),
            }),
            Ok(Err(e)) => Err(LabError::Io(e)),
            Err(_) => Ok(WaitOutcome::TimedOut),
        }
    }

    async fn release(&self, process: &ProcessRef) {
        self.children.lock().remove(&process.id);
    }
}
