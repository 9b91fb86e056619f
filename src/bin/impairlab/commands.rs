//! CLI command implementations

use anyhow::{bail, Context, Result};
use impairlab::presets::{preset, PRESETS};
use impairlab::task::TaskState;
use impairlab::{
    interrupt_signal, DockerContainers, LabConfig, NetnsTopology, Orchestrator, QdiscManager,
    RunReport, SystemExecutor,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

const DEFAULT_PRESET: &str = "dynamic";

/// Load the experiment from `--config` or a preset and apply overrides
pub async fn resolve_config(
    preset_name: Option<&str>,
    config_path: Option<&Path>,
    shared_dir: Option<PathBuf>,
    seed: Option<u64>,
) -> Result<LabConfig> {
    let mut config = match config_path {
        Some(path) => LabConfig::from_file(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            let name = preset_name.unwrap_or(DEFAULT_PRESET);
            match preset(name) {
                Some(config) => config,
                None => {
                    error!("Unknown preset: {}", name);
                    bail!("Unknown preset: {}", name);
                }
            }
        }
    };

    if let Some(dir) = shared_dir {
        config.shared_dir = dir;
    }
    if let Some(seed) = seed {
        match config.scheduler.as_mut() {
            Some(scheduler) => scheduler.seed = Some(seed),
            None => warn!("--seed ignored: {} has no impairment scheduler", config.name),
        }
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

pub fn cmd_list() -> Result<()> {
    println!("Available presets:");
    println!("==================");
    for (name, description) in PRESETS {
        println!("  {:<10} - {}", name, description);
    }
    Ok(())
}

pub fn cmd_show(config: &LabConfig) -> Result<()> {
    println!("{}", config.to_json_pretty()?);
    Ok(())
}

pub async fn cmd_run(config: LabConfig, autotest: bool) -> Result<()> {
    // Before anything is created, so Ctrl-C during setup still tears down
    let shutdown = interrupt_signal().context("installing the SIGINT handler")?;

    let shared_dir = config
        .prepare_shared_dir()
        .await
        .context("preparing shared directory")?;
    let log_dir = shared_dir.join("logs");
    tokio::fs::create_dir_all(&log_dir)
        .await
        .with_context(|| format!("creating {}", log_dir.display()))?;

    let topology = NetnsTopology::new(config.netns_prefix.clone(), Arc::new(QdiscManager::new()));
    let containers = DockerContainers::new(&config.name, &config.netns_prefix, &shared_dir);
    let executor =
        Arc::new(SystemExecutor::new(config.netns_prefix.clone()).with_log_dir(&log_dir));

    let orchestrator = Orchestrator::new(
        config,
        Box::new(topology),
        Box::new(containers),
        executor,
    )?;

    let report = orchestrator.run(autotest, shutdown).await?;
    log_summary(&report);
    Ok(())
}

fn log_summary(report: &RunReport) {
    info!("Run {} summary:", report.name);
    if let Some(probe) = &report.probe {
        info!("  Probe:     {:?}", probe);
    }
    for task in &report.tasks {
        let outcome = match &task.state {
            TaskState::Failed(reason) => format!("failed: {}", reason),
            state => format!("{:?}", state),
        };
        info!(
            "  Task {:<18} {} ({} launches)",
            task.id,
            outcome,
            task.launches.len()
        );
    }
    for capture in &report.captures {
        info!(
            "  Capture {:<15} {:?}, {} bytes in {}",
            capture.id,
            capture.state,
            capture.bytes_written.unwrap_or(0),
            capture.output.display()
        );
    }
    if let Some(scheduler) = &report.scheduler {
        info!(
            "  Scheduler: {} cycles, {} applied, {} failed",
            scheduler.cycles,
            scheduler.applied.len(),
            scheduler.failures.len()
        );
    }
    for phase in &report.teardown {
        info!("  Teardown {:<10} {:?}", phase.phase, phase.elapsed);
    }
    for e in report.errors.iter().chain(&report.teardown_errors) {
        warn!("  {}", e);
    }
}
