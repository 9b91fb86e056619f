//! Handles for emulated links
//!
//! A [`LinkHandle`] owns the two ports of a link and applies an
//! [`ImpairmentProfile`] to both of them. The two sides are updated in a
//! fixed order, A then B. A failure on B after A succeeded is reported as a
//! partial [`LabError::ImpairmentApply`]; A keeps the new profile
//! (last write wins, no rollback).

use crate::errors::{LabError, Result, Side};
use crate::types::ImpairmentProfile;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// One end of a link: an interface, optionally inside a network namespace
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkPort {
    pub netns: Option<String>,
    pub interface: String,
}

impl LinkPort {
    pub fn root(interface: impl Into<String>) -> Self {
        Self {
            netns: None,
            interface: interface.into(),
        }
    }

    pub fn in_namespace(netns: impl Into<String>, interface: impl Into<String>) -> Self {
        Self {
            netns: Some(netns.into()),
            interface: interface.into(),
        }
    }
}

impl fmt::Display for LinkPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.netns {
            Some(ns) => write!(f, "{}@{}", self.interface, ns),
            None => write!(f, "{}", self.interface),
        }
    }
}

/// Sets an impairment profile on a single port
#[async_trait]
pub trait LinkShaper: Send + Sync {
    async fn shape(&self, port: &LinkPort, profile: &ImpairmentProfile) -> Result<()>;
}

/// Profiles currently carried by each side
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SideState {
    pub a: Option<ImpairmentProfile>,
    pub b: Option<ImpairmentProfile>,
}

struct LinkInner {
    id: String,
    side_a: LinkPort,
    side_b: LinkPort,
    shaper: Arc<dyn LinkShaper>,
    sides: Mutex<SideState>,
    last_applied: Mutex<Option<ImpairmentProfile>>,
    apply_lock: tokio::sync::Mutex<()>,
    claimed: AtomicBool,
}

/// Reference to one emulated link. Clones share the same link.
#[derive(Clone)]
pub struct LinkHandle {
    inner: Arc<LinkInner>,
}

impl fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkHandle")
            .field("id", &self.inner.id)
            .field("side_a", &self.inner.side_a)
            .field("side_b", &self.inner.side_b)
            .finish()
    }
}

impl LinkHandle {
    pub fn new(
        id: impl Into<String>,
        side_a: LinkPort,
        side_b: LinkPort,
        shaper: Arc<dyn LinkShaper>,
    ) -> Self {
        Self {
            inner: Arc::new(LinkInner {
                id: id.into(),
                side_a,
                side_b,
                shaper,
                sides: Mutex::new(SideState::default()),
                last_applied: Mutex::new(None),
                apply_lock: tokio::sync::Mutex::new(()),
                claimed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn port(&self, side: Side) -> &LinkPort {
        match side {
            Side::A => &self.inner.side_a,
            Side::B => &self.inner.side_b,
        }
    }

    /// Apply `profile` to side A, then side B.
    ///
    /// Concurrent callers are serialized. On success both sides carry
    /// `profile` and it becomes [`last_applied`](Self::last_applied).
    pub async fn apply(&self, profile: &ImpairmentProfile) -> Result<()> {
        profile.validate()?;
        let _guard = self.inner.apply_lock.lock().await;

        info!("*** Changing link {} properties: {}", self.inner.id, profile);

        if let Err(e) = self.inner.shaper.shape(&self.inner.side_a, profile).await {
            return Err(LabError::ImpairmentApply {
                link: self.inner.id.clone(),
                side: Side::A,
                partial: false,
                reason: e.to_string(),
            });
        }
        self.inner.sides.lock().a = Some(profile.clone());

        if let Err(e) = self.inner.shaper.shape(&self.inner.side_b, profile).await {
            warn!(
                "Link {} side B failed after side A was updated; side A keeps {}",
                self.inner.id, profile
            );
            return Err(LabError::ImpairmentApply {
                link: self.inner.id.clone(),
                side: Side::B,
                partial: true,
                reason: e.to_string(),
            });
        }
        self.inner.sides.lock().b = Some(profile.clone());
        *self.inner.last_applied.lock() = Some(profile.clone());

        Ok(())
    }

    /// Last profile that was set on both sides
    pub fn last_applied(&self) -> Option<ImpairmentProfile> {
        self.inner.last_applied.lock().clone()
    }

    /// What each side carries right now, which differs from
    /// [`last_applied`](Self::last_applied) after a partial failure
    pub fn side_state(&self) -> SideState {
        self.inner.sides.lock().clone()
    }

    /// Register the caller as the only impairment mutator of this link.
    /// The claim is released when the returned guard drops.
    pub fn claim_mutator(&self) -> Result<MutatorClaim> {
        if self
            .inner
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(LabError::InvalidState(format!(
                "link {} already has an impairment mutator",
                self.inner.id
            )));
        }
        Ok(MutatorClaim {
            link: self.clone(),
        })
    }

    pub fn is_claimed(&self) -> bool {
        self.inner.claimed.load(Ordering::Acquire)
    }
}

/// Exclusive right to mutate a link's impairment
#[derive(Debug)]
pub struct MutatorClaim {
    link: LinkHandle,
}

impl MutatorClaim {
    pub fn link(&self) -> &LinkHandle {
        &self.link
    }
}

impl Drop for MutatorClaim {
    fn drop(&mut self) {
        self.link.inner.claimed.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingShaper;

    fn link(shaper: Arc<RecordingShaper>) -> LinkHandle {
        LinkHandle::new(
            "middle",
            LinkPort::root("s1-eth3"),
            LinkPort::root("s2-eth1"),
            shaper,
        )
    }

    #[tokio::test]
    async fn test_apply_updates_a_then_b() {
        let shaper = Arc::new(RecordingShaper::new());
        let link = link(shaper.clone());
        let profile = ImpairmentProfile::new(30.0, 60, 5, 0.1);

        link.apply(&profile).await.unwrap();

        let calls = shaper.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0.interface, "s1-eth3");
        assert_eq!(calls[1].0.interface, "s2-eth1");
        assert_eq!(link.last_applied(), Some(profile.clone()));
        assert_eq!(
            link.side_state(),
            SideState {
                a: Some(profile.clone()),
                b: Some(profile)
            }
        );
    }

    #[tokio::test]
    async fn test_side_b_failure_keeps_side_a() {
        let shaper = Arc::new(RecordingShaper::new());
        let link = link(shaper.clone());
        let first = ImpairmentProfile::new(30.0, 60, 0, 0.0);
        let second = ImpairmentProfile::new(35.0, 70, 5, 0.1);

        link.apply(&first).await.unwrap();
        shaper.fail_interface("s2-eth1");

        let err = link.apply(&second).await.unwrap_err();
        match err {
            LabError::ImpairmentApply { side, partial, .. } => {
                assert_eq!(side, Side::B);
                assert!(partial);
            }
            other => panic!("unexpected error: {other}"),
        }

        // No rollback of side A, last complete profile is still the first one
        let state = link.side_state();
        assert_eq!(state.a, Some(second));
        assert_eq!(state.b, Some(first.clone()));
        assert_eq!(link.last_applied(), Some(first));
    }

    #[tokio::test]
    async fn test_side_a_failure_touches_nothing() {
        let shaper = Arc::new(RecordingShaper::new());
        shaper.fail_interface("s1-eth3");
        let link = link(shaper.clone());

        let err = link
            .apply(&ImpairmentProfile::shaped(10.0, 10))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LabError::ImpairmentApply {
                side: Side::A,
                partial: false,
                ..
            }
        ));
        assert_eq!(shaper.calls().len(), 0);
        assert_eq!(link.side_state(), SideState::default());
    }

    #[tokio::test]
    async fn test_invalid_profile_rejected_before_shaping() {
        let shaper = Arc::new(RecordingShaper::new());
        let link = link(shaper.clone());
        assert!(link
            .apply(&ImpairmentProfile::new(10.0, 10, 0, 250.0))
            .await
            .is_err());
        assert!(shaper.calls().is_empty());
    }

    #[test]
    fn test_single_mutator_claim() {
        let link = link(Arc::new(RecordingShaper::new()));
        let claim = link.claim_mutator().unwrap();
        assert!(link.is_claimed());
        assert!(link.claim_mutator().is_err());
        drop(claim);
        assert!(!link.is_claimed());
        assert!(link.claim_mutator().is_ok());
    }
}
