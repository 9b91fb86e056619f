//! Impaired-link testbench orchestration
//!
//! This crate builds an emulated network of namespaces, bridges and veth
//! links, starts packet captures and traffic workloads on it, and changes
//! the impairment (bandwidth, delay, jitter, loss) of a chosen link on a
//! schedule while the workloads run. Teardown is ordered and bounded in
//! time whether the run finishes on its own or is interrupted.
//!
//! External effects go through three capability traits so the
//! orchestration can run against the [`testing`] fakes:
//! [`ProcessExecutor`], [`TopologyProvider`] and [`ContainerProvider`].

pub mod capture;
pub mod config;
pub mod context;
pub mod errors;
pub mod link;
pub mod orchestrator;
pub mod presets;
pub mod process;
pub mod qdisc;
pub mod scheduler;
pub mod task;
pub mod testing;
pub mod topology;
pub mod types;

// Re-export commonly used types
pub use capture::{CaptureBinding, CaptureSession, CaptureSpec, CaptureState};
pub use config::LabConfig;
pub use context::{CancelSignal, RunContext};
pub use errors::{LabError, Result, Side};
pub use link::{LinkHandle, LinkPort, LinkShaper};
pub use orchestrator::{interrupt_signal, Orchestrator, ProbeOutcome, RunReport};
pub use process::{ProcessExecutor, SystemExecutor};
pub use qdisc::QdiscManager;
pub use scheduler::{ImpairmentScheduler, SchedulerSpec};
pub use task::{TaskKind, TaskState, TrafficTask, TrafficTaskSpec};
pub use topology::{ContainerProvider, DockerContainers, NetnsTopology, TopologyProvider};
pub use types::{Cadence, CommandSpec, Endpoint, ImpairmentDomain, ImpairmentProfile, SamplingMode};
