//! Impairment scheduler
//!
//! Background loop that keeps changing one link's impairment: sample a
//! profile, apply it, sleep for the cadence, repeat until cancelled.
//! Apply failures are logged and the loop moves on to the next cycle.

use crate::context::CancelSignal;
use crate::errors::{LabError, Result};
use crate::link::{LinkHandle, MutatorClaim};
use crate::types::{Cadence, ImpairmentDomain, ImpairmentProfile, SamplingMode};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Longest a single apply may take before the cycle gives up on it
const APPLY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSpec {
    /// Link to mutate
    pub link: String,
    pub domain: ImpairmentDomain,
    pub cadence: Cadence,
    #[serde(default)]
    pub sampling: SamplingMode,
    /// Fixed seed for reproducible runs
    #[serde(default)]
    pub seed: Option<u64>,
}

impl SchedulerSpec {
    pub fn validate(&self) -> Result<()> {
        self.domain.validate()?;
        self.cadence.validate()
    }
}

/// Chooses the next profile from a domain
pub struct ImpairmentSampler {
    domain: ImpairmentDomain,
    mode: SamplingMode,
    rng: StdRng,
    cursor: usize,
}

impl ImpairmentSampler {
    /// Fails when the domain has an empty dimension or out-of-range values
    pub fn new(domain: ImpairmentDomain, mode: SamplingMode, seed: Option<u64>) -> Result<Self> {
        domain.validate()?;
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        // A singleton domain has nothing to randomize
        let mode = if domain.is_singleton() {
            SamplingMode::Rotate
        } else {
            mode
        };
        Ok(Self {
            domain,
            mode,
            rng,
            cursor: 0,
        })
    }

    pub fn mode(&self) -> SamplingMode {
        self.mode
    }

    pub fn next_profile(&mut self) -> ImpairmentProfile {
        match self.mode {
            SamplingMode::Random => self.domain.sample(&mut self.rng),
            SamplingMode::Rotate => {
                let profile = self.domain.profile_at(self.cursor);
                self.cursor = (self.cursor + 1) % self.domain.len().max(1);
                profile
            }
        }
    }

    pub fn next_delay(&mut self, cadence: &Cadence) -> Duration {
        cadence.next_delay(&mut self.rng)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AppliedImpairment {
    pub profile: ImpairmentProfile,
    pub at: Instant,
}

#[derive(Clone, Debug, Default)]
pub struct SchedulerReport {
    pub cycles: u64,
    /// Every profile drawn, applied or not
    pub sampled: Vec<ImpairmentProfile>,
    pub applied: Vec<AppliedImpairment>,
    pub failures: Vec<String>,
}

/// Drives impairment changes on one link
pub struct ImpairmentScheduler {
    spec: SchedulerSpec,
    link: LinkHandle,
    state: Arc<Mutex<SchedulerState>>,
    report: Arc<Mutex<SchedulerReport>>,
    stop: CancelSignal,
    handle: Option<JoinHandle<()>>,
}

impl ImpairmentScheduler {
    pub fn new(spec: SchedulerSpec, link: LinkHandle) -> Result<Self> {
        spec.validate()?;
        if spec.link != link.id() {
            return Err(LabError::InvalidConfig(format!(
                "scheduler configured for link '{}' but given '{}'",
                spec.link,
                link.id()
            )));
        }
        Ok(Self {
            spec,
            link,
            state: Arc::new(Mutex::new(SchedulerState::Idle)),
            report: Arc::new(Mutex::new(SchedulerReport::default())),
            stop: CancelSignal::new(),
            handle: None,
        })
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock()
    }

    pub fn report(&self) -> SchedulerReport {
        self.report.lock().clone()
    }

    /// Claim the link and start the background loop
    pub fn start(&mut self, cancel: &CancelSignal) -> Result<()> {
        if self.state() != SchedulerState::Idle {
            return Err(LabError::InvalidState(format!(
                "scheduler for link {} is {:?}",
                self.spec.link,
                self.state()
            )));
        }
        let claim = self.link.claim_mutator()?;
        let sampler =
            ImpairmentSampler::new(self.spec.domain.clone(), self.spec.sampling, self.spec.seed)?;

        info!(
            "Starting impairment scheduler on link {} ({} profiles, {:?} sampling)",
            self.spec.link,
            self.spec.domain.len(),
            sampler.mode()
        );
        *self.state.lock() = SchedulerState::Running;
        self.handle = Some(tokio::spawn(run_loop(
            claim,
            sampler,
            self.spec.cadence.clone(),
            cancel.clone(),
            self.stop.clone(),
            self.report.clone(),
            self.state.clone(),
        )));
        Ok(())
    }

    /// Cancel the loop and wait for it to exit, bounded by
    /// [`stop_bound`](Self::stop_bound). Safe to call in any state.
    pub async fn stop(&mut self) -> Result<()> {
        self.stop.cancel();
        let Some(mut handle) = self.handle.take() else {
            *self.state.lock() = SchedulerState::Stopped;
            return Ok(());
        };

        let bound = self.stop_bound();
        let result = match tokio::time::timeout(bound, &mut handle).await {
            Ok(_) => Ok(()),
            Err(_) => {
                handle.abort();
                Err(LabError::TaskTermination {
                    id: format!("scheduler:{}", self.spec.link),
                    reason: format!("loop did not exit within {:?}", bound),
                })
            }
        };
        *self.state.lock() = SchedulerState::Stopped;
        info!("Impairment scheduler on link {} stopped", self.spec.link);
        result
    }

    /// A cycle in progress may finish its apply before the loop exits
    pub fn stop_bound(&self) -> Duration {
        APPLY_TIMEOUT + Duration::from_secs(1)
    }
}

async fn run_loop(
    claim: MutatorClaim,
    mut sampler: ImpairmentSampler,
    cadence: Cadence,
    cancel: CancelSignal,
    stop: CancelSignal,
    report: Arc<Mutex<SchedulerReport>>,
    state: Arc<Mutex<SchedulerState>>,
) {
    let link = claim.link().clone();
    let halted = || cancel.is_cancelled() || stop.is_cancelled();

    loop {
        if halted() {
            break;
        }

        let profile = sampler.next_profile();
        report.lock().sampled.push(profile.clone());

        match tokio::time::timeout(APPLY_TIMEOUT, link.apply(&profile)).await {
            Ok(Ok(())) => {
                report.lock().applied.push(AppliedImpairment {
                    profile,
                    at: Instant::now(),
                });
            }
            Ok(Err(e)) => {
                warn!("Impairment cycle failed: {}", e);
                report.lock().failures.push(e.to_string());
            }
            Err(_) => {
                warn!("Applying {} on link {} timed out", profile, link.id());
                report
                    .lock()
                    .failures
                    .push(format!("apply timed out after {:?}", APPLY_TIMEOUT));
            }
        }
        report.lock().cycles += 1;

        if halted() {
            break;
        }
        let delay = sampler.next_delay(&cadence);
        debug!("Next impairment change on link {} in {:?}", link.id(), delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => break,
            _ = stop.cancelled() => break,
        }
    }

    *state.lock() = SchedulerState::Stopped;
    drop(claim);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkPort;
    use crate::testing::RecordingShaper;

    fn middle(shaper: Arc<RecordingShaper>) -> LinkHandle {
        LinkHandle::new(
            "middle",
            LinkPort::root("s1-eth3"),
            LinkPort::root("s2-eth1"),
            shaper,
        )
    }

    fn spec(domain: ImpairmentDomain, period: Duration) -> SchedulerSpec {
        SchedulerSpec {
            link: "middle".into(),
            domain,
            cadence: Cadence::fixed(period),
            sampling: SamplingMode::Random,
            seed: Some(42),
        }
    }

    #[test]
    fn test_sampler_stays_in_domain() {
        let domain = ImpairmentDomain::streaming_default();
        let mut sampler = ImpairmentSampler::new(domain.clone(), SamplingMode::Random, None).unwrap();
        for _ in 0..1000 {
            let profile = sampler.next_profile();
            assert!(domain.contains(&profile));
            assert!(profile.validate().is_ok());
        }
    }

    #[test]
    fn test_seeded_sampler_is_reproducible() {
        let domain = ImpairmentDomain::streaming_default();
        let mut a = ImpairmentSampler::new(domain.clone(), SamplingMode::Random, Some(9)).unwrap();
        let mut b = ImpairmentSampler::new(domain, SamplingMode::Random, Some(9)).unwrap();
        for _ in 0..20 {
            assert_eq!(a.next_profile(), b.next_profile());
        }
    }

    #[test]
    fn test_rotation_walks_cross_product() {
        let domain = ImpairmentDomain::new([(30.0, 60), (35.0, 70)], [0, 5], [0.0, 0.1]);
        let mut sampler = ImpairmentSampler::new(domain.clone(), SamplingMode::Rotate, None).unwrap();
        let first: Vec<_> = (0..8).map(|_| sampler.next_profile()).collect();
        let second: Vec<_> = (0..8).map(|_| sampler.next_profile()).collect();
        assert_eq!(first, second);
        assert_eq!(first[0], domain.profile_at(0));
        assert_eq!(first[7], domain.profile_at(7));
    }

    #[test]
    fn test_singleton_domain_rotates() {
        let profile = ImpairmentProfile::new(50.0, 100, 0, 0.0);
        let sampler = ImpairmentSampler::new(
            ImpairmentDomain::singleton(&profile),
            SamplingMode::Random,
            None,
        )
        .unwrap();
        assert_eq!(sampler.mode(), SamplingMode::Rotate);
    }

    #[test]
    fn test_sampler_rejects_empty_domain() {
        for domain in [
            ImpairmentDomain::new([], [0], [0.0]),
            ImpairmentDomain::new([(30.0, 60)], [], [0.0]),
            ImpairmentDomain::new([(30.0, 60)], [0], []),
        ] {
            for mode in [SamplingMode::Random, SamplingMode::Rotate] {
                assert!(matches!(
                    ImpairmentSampler::new(domain.clone(), mode, Some(1)),
                    Err(LabError::InvalidConfig(_))
                ));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_cycles_over_cross_product() {
        let shaper = Arc::new(RecordingShaper::new());
        let link = middle(shaper.clone());
        let domain = ImpairmentDomain::new([(30.0, 60), (35.0, 70)], [0, 5], [0.0, 0.1]);
        let mut scheduler =
            ImpairmentScheduler::new(spec(domain.clone(), Duration::from_secs(120)), link.clone())
                .unwrap();
        let cancel = CancelSignal::new();
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        scheduler.start(&cancel).unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Running);

        // Cycles at t=0, 120, 240
        tokio::time::sleep(Duration::from_secs(250)).await;
        cancel.cancel();
        scheduler.stop().await.unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Stopped);

        let report = scheduler.report();
        assert_eq!(report.cycles, 3);
        assert_eq!(report.applied.len(), 3);
        for applied in &report.applied {
            assert!(domain.contains(&applied.profile));
        }
        assert_eq!(link.last_applied(), Some(report.sampled[2].clone()));
        assert_eq!(shaper.calls().len(), 6);
        assert!(!link.is_claimed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_failures_do_not_stop_the_loop() {
        let shaper = Arc::new(RecordingShaper::new());
        shaper.fail_interface("s2-eth1");
        let link = middle(shaper.clone());
        let mut scheduler = ImpairmentScheduler::new(
            spec(ImpairmentDomain::streaming_default(), Duration::from_secs(15)),
            link.clone(),
        )
        .unwrap();
        let cancel = CancelSignal::new();

        scheduler.start(&cancel).unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;
        shaper.heal_interface("s2-eth1");
        tokio::time::sleep(Duration::from_secs(15)).await;
        scheduler.stop().await.unwrap();

        let report = scheduler.report();
        assert_eq!(report.cycles, 3);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.applied.len(), 1);
        assert_eq!(link.last_applied(), Some(report.applied[0].profile.clone()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_sleep() {
        let link = middle(Arc::new(RecordingShaper::new()));
        let mut scheduler = ImpairmentScheduler::new(
            spec(ImpairmentDomain::streaming_default(), Duration::from_secs(600)),
            link,
        )
        .unwrap();
        let cancel = CancelSignal::new();
        scheduler.start(&cancel).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let t0 = Instant::now();
        cancel.cancel();
        scheduler.stop().await.unwrap();
        assert_eq!(Instant::now(), t0);
        assert_eq!(scheduler.report().cycles, 1);
    }

    #[tokio::test]
    async fn test_single_scheduler_per_link() {
        let link = middle(Arc::new(RecordingShaper::new()));
        let domain = ImpairmentDomain::streaming_default();
        let mut first =
            ImpairmentScheduler::new(spec(domain.clone(), Duration::from_secs(15)), link.clone())
                .unwrap();
        let mut second =
            ImpairmentScheduler::new(spec(domain, Duration::from_secs(15)), link).unwrap();
        let cancel = CancelSignal::new();

        first.start(&cancel).unwrap();
        assert!(second.start(&cancel).is_err());
        first.stop().await.unwrap();
        assert!(first.start(&cancel).is_err());
    }

    #[tokio::test]
    async fn test_stop_idle_scheduler() {
        let link = middle(Arc::new(RecordingShaper::new()));
        let mut scheduler = ImpairmentScheduler::new(
            spec(ImpairmentDomain::streaming_default(), Duration::from_secs(15)),
            link,
        )
        .unwrap();
        scheduler.stop().await.unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }
}
