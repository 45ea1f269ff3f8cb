//! Bounded memory reclamation after an unload.

use std::time::Duration;

use super::runtime::InferenceRuntime;

#[derive(Debug, Clone)]
pub struct CleanupPolicy {
    /// Pressure at or below which memory counts as stable.
    pub threshold: f64,
    /// Trim passes per round.
    pub passes: u32,
    /// Rounds before giving up.
    pub retries: u32,
    /// Wait between rounds.
    pub settle: Duration,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            threshold: 0.85,
            passes: 3,
            retries: 3,
            settle: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CleanupOutcome {
    pub rounds: u32,
    pub pressure: f64,
}

/// Trim and re-measure until pressure drops to the threshold.
///
/// `Err` carries the last measurement when every round is used up.
pub async fn reclaim(runtime: &dyn InferenceRuntime, policy: &CleanupPolicy) -> Result<CleanupOutcome, CleanupOutcome> {
    let rounds = policy.retries.max(1);
    let mut round = 1;
    loop {
        for _ in 0..policy.passes {
            runtime.trim().await;
        }
        let pressure = runtime.memory_pressure();
        if pressure <= policy.threshold {
            return Ok(CleanupOutcome { rounds: round, pressure });
        }
        if round >= rounds {
            return Err(CleanupOutcome { rounds: round, pressure });
        }
        tracing::debug!(round, pressure, threshold = policy.threshold, "memory not settled yet");
        tokio::time::sleep(policy.settle).await;
        round += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::runtime::{RuntimeError, RuntimeHandle};
    use crate::storage::InstalledArtifact;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Pressure drops by `step` on every trim.
    struct Draining {
        pressure: Mutex<f64>,
        step: f64,
        trims: Mutex<u32>,
    }

    #[async_trait]
    impl InferenceRuntime for Draining {
        async fn load(&self, _a: &InstalledArtifact) -> Result<RuntimeHandle, RuntimeError> {
            Ok(RuntimeHandle::new(1))
        }
        async fn unload(&self, _h: RuntimeHandle) -> Result<(), RuntimeError> {
            Ok(())
        }
        fn memory_pressure(&self) -> f64 {
            *self.pressure.lock()
        }
        async fn trim(&self) {
            *self.trims.lock() += 1;
            let mut p = self.pressure.lock();
            *p = (*p - self.step).max(0.0);
        }
    }

    fn policy() -> CleanupPolicy {
        CleanupPolicy { settle: Duration::from_millis(1), ..CleanupPolicy::default() }
    }

    #[tokio::test]
    async fn test_settles_within_rounds() {
        let rt = Draining { pressure: Mutex::new(0.99), step: 0.02, trims: Mutex::new(0) };
        let out = reclaim(&rt, &policy()).await.unwrap();
        assert_eq!(out.rounds, 3);
        assert!(out.pressure <= 0.85);
        assert_eq!(*rt.trims.lock(), 9);
    }

    #[tokio::test]
    async fn test_gives_up_after_retries() {
        let rt = Draining { pressure: Mutex::new(0.99), step: 0.0, trims: Mutex::new(0) };
        let out = reclaim(&rt, &policy()).await.unwrap_err();
        assert_eq!(out.rounds, 3);
        assert!(out.pressure > 0.85);
    }

    #[tokio::test]
    async fn test_already_low_pressure_is_one_round() {
        let rt = Draining { pressure: Mutex::new(0.1), step: 0.0, trims: Mutex::new(0) };
        let out = reclaim(&rt, &policy()).await.unwrap();
        assert_eq!(out.rounds, 1);
    }
}
