//! Transport failover for HSP.
//!
//! [`FallbackManager`] owns every configured adapter in priority order
//! (lower number first), tracks each adapter's health with
//! [`AdapterHealth`], and routes each publish to the best live adapter.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod health;
pub mod manager;

pub use health::{AdapterHealth, HealthState, Transition};
pub use manager::{AdapterStatus, FallbackManager};

/// Thresholds and timers of the failover state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackPolicy {
    /// Consecutive failures that demote an adapter one level.
    pub demote_after: u32,
    /// Consecutive successes that promote an adapter one level.
    pub promote_after: u32,
    pub send_timeout_ms: u64,
    pub probe_interval_ms: u64,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            demote_after: 3,
            promote_after: 2,
            send_timeout_ms: 2_000,
            probe_interval_ms: 30_000,
        }
    }
}

impl FallbackPolicy {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms.max(1))
    }
}
