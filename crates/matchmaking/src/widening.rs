use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Time-gated fallback that lets a lone ticket pair with adjacent skill bands.
///
/// Disabled by default: strict FIFO within a lane is the normal policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WideningPolicy {
    pub enabled: bool,
    /// Wait before the first step is allowed.
    pub after: Duration,
    /// Each further step requires this much additional wait.
    pub step_every: Duration,
    pub max_steps: u32,
}

impl Default for WideningPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            after: Duration::from_secs(30),
            step_every: Duration::from_secs(15),
            max_steps: 2,
        }
    }
}

impl WideningPolicy {
    /// Number of adjacent bands a ticket that waited `waited` may reach.
    pub fn steps_for(&self, waited: Duration) -> u32 {
        if !self.enabled || self.max_steps == 0 || waited < self.after {
            return 0;
        }
        let extra = waited - self.after;
        let step_ms = self.step_every.as_millis().max(1);
        let steps = 1u128 + extra.as_millis() / step_ms;
        u32::try_from(steps).unwrap_or(u32::MAX).min(self.max_steps)
    }
}
