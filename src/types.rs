//! Core types shared by links, the scheduler, and workloads

use crate::errors::{LabError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Impairment applied to both directions of a link
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImpairmentProfile {
    /// Rate limit in megabits per second
    pub bandwidth_mbps: f64,
    /// One-way delay in milliseconds
    pub delay_ms: u32,
    /// Delay variation in milliseconds
    pub jitter_ms: u32,
    /// Random packet loss percentage (0.0-100.0)
    pub loss_percent: f64,
}

impl ImpairmentProfile {
    pub fn new(bandwidth_mbps: f64, delay_ms: u32, jitter_ms: u32, loss_percent: f64) -> Self {
        Self {
            bandwidth_mbps,
            delay_ms,
            jitter_ms,
            loss_percent,
        }
    }

    /// Shaping without jitter or loss, as used for initial link setup
    pub fn shaped(bandwidth_mbps: f64, delay_ms: u32) -> Self {
        Self::new(bandwidth_mbps, delay_ms, 0, 0.0)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.bandwidth_mbps.is_finite() || self.bandwidth_mbps <= 0.0 {
            return Err(LabError::InvalidConfig(format!(
                "bandwidth must be positive, got {} Mbps",
                self.bandwidth_mbps
            )));
        }
        if !(0.0..=100.0).contains(&self.loss_percent) {
            return Err(LabError::InvalidConfig(format!(
                "loss must be within 0-100%, got {}%",
                self.loss_percent
            )));
        }
        Ok(())
    }

    /// Rate in kbit/s as tc expects it
    pub fn rate_kbit(&self) -> u64 {
        ((self.bandwidth_mbps * 1000.0).round() as u64).max(1)
    }
}

impl fmt::Display for ImpairmentProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BW={} Mbps, Delay={} ms, Jitter={} ms, Loss={}%",
            self.bandwidth_mbps, self.delay_ms, self.jitter_ms, self.loss_percent
        )
    }
}

/// Admissible bandwidth/delay combination
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BandwidthDelay {
    pub bandwidth_mbps: f64,
    pub delay_ms: u32,
}

impl From<(f64, u32)> for BandwidthDelay {
    fn from((bandwidth_mbps, delay_ms): (f64, u32)) -> Self {
        Self {
            bandwidth_mbps,
            delay_ms,
        }
    }
}

/// The set of profiles the impairment scheduler may choose from.
///
/// Admissible profiles are the cross product of the three lists.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImpairmentDomain {
    pub bandwidth_delay: Vec<BandwidthDelay>,
    pub jitter_ms: Vec<u32>,
    pub loss_percent: Vec<f64>,
}

impl ImpairmentDomain {
    pub fn new(
        bandwidth_delay: impl IntoIterator<Item = (f64, u32)>,
        jitter_ms: impl IntoIterator<Item = u32>,
        loss_percent: impl IntoIterator<Item = f64>,
    ) -> Self {
        Self {
            bandwidth_delay: bandwidth_delay.into_iter().map(Into::into).collect(),
            jitter_ms: jitter_ms.into_iter().collect(),
            loss_percent: loss_percent.into_iter().collect(),
        }
    }

    /// Domain containing exactly one profile
    pub fn singleton(profile: &ImpairmentProfile) -> Self {
        Self::new(
            [(profile.bandwidth_mbps, profile.delay_ms)],
            [profile.jitter_ms],
            [profile.loss_percent],
        )
    }

    /// Bandwidth/delay pairs, jitter, and loss values of the dynamic streaming experiment
    pub fn streaming_default() -> Self {
        Self::new(
            [
                (5.0, 10),
                (10.0, 20),
                (15.0, 30),
                (20.0, 40),
                (25.0, 50),
                (30.0, 60),
                (35.0, 70),
                (40.0, 80),
                (45.0, 90),
                (50.0, 100),
            ],
            [0, 5, 10, 20],
            [0.0, 0.1, 0.5, 1.0],
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.bandwidth_delay.is_empty() {
            return Err(LabError::InvalidConfig(
                "impairment domain has no bandwidth/delay pairs".to_string(),
            ));
        }
        if self.jitter_ms.is_empty() {
            return Err(LabError::InvalidConfig(
                "impairment domain has no jitter values".to_string(),
            ));
        }
        if self.loss_percent.is_empty() {
            return Err(LabError::InvalidConfig(
                "impairment domain has no loss values".to_string(),
            ));
        }
        // Each dimension is checked on its own; the cross product can be large
        if let Some(pair) = self
            .bandwidth_delay
            .iter()
            .find(|p| !p.bandwidth_mbps.is_finite() || p.bandwidth_mbps <= 0.0)
        {
            return Err(LabError::InvalidConfig(format!(
                "bandwidth must be positive, got {} Mbps",
                pair.bandwidth_mbps
            )));
        }
        if let Some(loss) = self
            .loss_percent
            .iter()
            .find(|loss| !(0.0..=100.0).contains(*loss))
        {
            return Err(LabError::InvalidConfig(format!(
                "loss must be within 0-100%, got {}%",
                loss
            )));
        }
        Ok(())
    }

    /// Number of profiles in the cross product
    pub fn len(&self) -> usize {
        self.bandwidth_delay.len() * self.jitter_ms.len() * self.loss_percent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_singleton(&self) -> bool {
        self.len() == 1
    }

    /// Profile at `index` of the cross product (pairs outermost, loss innermost).
    /// Indices wrap around.
    pub fn profile_at(&self, index: usize) -> ImpairmentProfile {
        let losses = self.loss_percent.len();
        let jitters = self.jitter_ms.len();
        let index = index % self.len().max(1);

        let loss = self.loss_percent[index % losses];
        let jitter = self.jitter_ms[(index / losses) % jitters];
        let pair = self.bandwidth_delay[index / (losses * jitters)];

        ImpairmentProfile::new(pair.bandwidth_mbps, pair.delay_ms, jitter, loss)
    }

    /// Draw one profile, each dimension chosen independently and uniformly
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ImpairmentProfile {
        let pair = self.bandwidth_delay[rng.gen_range(0..self.bandwidth_delay.len())];
        let jitter = self.jitter_ms[rng.gen_range(0..self.jitter_ms.len())];
        let loss = self.loss_percent[rng.gen_range(0..self.loss_percent.len())];
        ImpairmentProfile::new(pair.bandwidth_mbps, pair.delay_ms, jitter, loss)
    }

    pub fn contains(&self, profile: &ImpairmentProfile) -> bool {
        self.bandwidth_delay.iter().any(|p| {
            p.bandwidth_mbps == profile.bandwidth_mbps && p.delay_ms == profile.delay_ms
        }) && self.jitter_ms.contains(&profile.jitter_ms)
            && self.loss_percent.contains(&profile.loss_percent)
    }
}

/// How long the scheduler waits between two impairment changes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    Fixed { period_ms: u64 },
    /// Uniform in `period ± jitter`
    Jittered { period_ms: u64, jitter_ms: u64 },
}

impl Cadence {
    pub fn fixed(period: Duration) -> Self {
        Cadence::Fixed {
            period_ms: period.as_millis() as u64,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Cadence::Fixed { period_ms: 0 } | Cadence::Jittered { period_ms: 0, .. } => Err(
                LabError::InvalidConfig("scheduler cadence must be non-zero".to_string()),
            ),
            Cadence::Jittered {
                period_ms,
                jitter_ms,
            } if jitter_ms >= period_ms => Err(LabError::InvalidConfig(format!(
                "cadence jitter {}ms must be smaller than period {}ms",
                jitter_ms, period_ms
            ))),
            _ => Ok(()),
        }
    }

    pub fn next_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        match *self {
            Cadence::Fixed { period_ms } => Duration::from_millis(period_ms),
            Cadence::Jittered {
                period_ms,
                jitter_ms,
            } => {
                let low = period_ms.saturating_sub(jitter_ms);
                let high = period_ms.saturating_add(jitter_ms);
                Duration::from_millis(rng.gen_range(low..=high))
            }
        }
    }

    /// Longest possible wait
    pub fn max_delay(&self) -> Duration {
        match *self {
            Cadence::Fixed { period_ms } => Duration::from_millis(period_ms),
            Cadence::Jittered {
                period_ms,
                jitter_ms,
            } => Duration::from_millis(period_ms.saturating_add(jitter_ms)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingMode {
    /// Independent uniform choice per dimension
    #[default]
    Random,
    /// Walk the cross product in order, wrapping around
    Rotate,
}

/// Where an external process runs
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    /// The orchestrator's own namespace
    Local,
    /// An emulated host (network namespace)
    Host(String),
    /// A workload container
    Container(String),
    /// A network namespace given by its full name
    Netns(String),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Local => write!(f, "local"),
            Endpoint::Host(id) => write!(f, "host:{}", id),
            Endpoint::Container(id) => write!(f, "container:{}", id),
            Endpoint::Netns(name) => write!(f, "netns:{}", name),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Interrupt,
    Terminate,
    Kill,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::Interrupt => write!(f, "SIGINT"),
            SignalKind::Terminate => write!(f, "SIGTERM"),
            SignalKind::Kill => write!(f, "SIGKILL"),
        }
    }
}

/// External command and the endpoint it runs on
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub endpoint: Endpoint,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(endpoint: Endpoint, program: impl Into<String>) -> Self {
        Self {
            endpoint,
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// `sh -c <script>` on the given endpoint
    pub fn shell(endpoint: Endpoint, script: impl Into<String>) -> Self {
        Self::new(endpoint, "sh").arg("-c").arg(script)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.endpoint, self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}
