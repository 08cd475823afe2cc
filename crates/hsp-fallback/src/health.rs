//! Per-adapter health state machine.
//!
//! `Unknown -> Healthy -> Degraded -> Unhealthy`, driven by consecutive
//! outcome streaks. Everything here is atomics so publishes and the probe
//! loop never contend on a lock.

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum HealthState {
    Unknown = 0,
    Healthy = 1,
    Degraded = 2,
    Unhealthy = 3,
}

impl HealthState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Healthy,
            2 => Self::Degraded,
            3 => Self::Unhealthy,
            _ => Self::Unknown,
        }
    }

    /// One level down. `Unknown` drops straight to `Degraded`.
    pub fn demoted(self) -> Self {
        match self {
            Self::Unknown | Self::Healthy => Self::Degraded,
            Self::Degraded | Self::Unhealthy => Self::Unhealthy,
        }
    }

    /// One level up. `Unknown` jumps to `Healthy` on its first good signal.
    pub fn promoted(self) -> Self {
        match self {
            Self::Unknown | Self::Healthy | Self::Degraded => Self::Healthy,
            Self::Unhealthy => Self::Degraded,
        }
    }

    pub fn is_routable(self) -> bool {
        !matches!(self, Self::Unhealthy)
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        };
        f.write_str(label)
    }
}

/// A state change caused by one recorded outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: HealthState,
    pub to: HealthState,
}

#[derive(Debug)]
pub struct AdapterHealth {
    state: AtomicU8,
    failures: AtomicU32,
    successes: AtomicU32,
}

impl Default for AdapterHealth {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(HealthState::Unknown as u8),
            failures: AtomicU32::new(0),
            successes: AtomicU32::new(0),
        }
    }
}

impl AdapterHealth {
    pub fn state(&self) -> HealthState {
        HealthState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.successes.load(Ordering::Acquire)
    }

    fn shift(&self, step: fn(HealthState) -> HealthState) -> Option<Transition> {
        let previous = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                let next = step(HealthState::from_u8(raw)) as u8;
                (next != raw).then_some(next)
            })
            .ok()?;
        let from = HealthState::from_u8(previous);
        Some(Transition {
            from,
            to: step(from),
        })
    }

    pub fn force(&self, state: HealthState) -> Option<Transition> {
        self.failures.store(0, Ordering::Release);
        self.successes.store(0, Ordering::Release);
        let previous = HealthState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
        (previous != state).then_some(Transition {
            from: previous,
            to: state,
        })
    }

    pub fn record_success(&self, promote_after: u32) -> Option<Transition> {
        self.failures.store(0, Ordering::Release);
        let streak = self.successes.fetch_add(1, Ordering::AcqRel) + 1;
        let current = self.state();
        let promote = match current {
            HealthState::Healthy => false,
            HealthState::Unknown => true,
            HealthState::Degraded | HealthState::Unhealthy => streak >= promote_after.max(1),
        };
        if !promote {
            return None;
        }
        self.successes.store(0, Ordering::Release);
        self.shift(HealthState::promoted)
    }

    pub fn record_failure(&self, demote_after: u32) -> Option<Transition> {
        self.successes.store(0, Ordering::Release);
        let streak = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if streak < demote_after.max(1) || self.state() == HealthState::Unhealthy {
            return None;
        }
        self.failures.store(0, Ordering::Release);
        self.shift(HealthState::demoted)
    }

    /// A timed-out publish demotes without waiting for a streak.
    pub fn record_timeout(&self) -> Option<Transition> {
        self.successes.store(0, Ordering::Release);
        self.failures.store(0, Ordering::Release);
        self.shift(HealthState::demoted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_success_makes_unknown_healthy() {
        let health = AdapterHealth::default();
        let transition = health.record_success(3).unwrap();
        assert_eq!(transition.from, HealthState::Unknown);
        assert_eq!(transition.to, HealthState::Healthy);
    }

    #[test]
    fn failure_streak_demotes_one_level_at_a_time() {
        let health = AdapterHealth::default();
        health.record_success(2);
        assert_eq!(health.record_failure(3), None);
        assert_eq!(health.record_failure(3), None);
        assert_eq!(
            health.record_failure(3),
            Some(Transition {
                from: HealthState::Healthy,
                to: HealthState::Degraded
            })
        );
        for _ in 0..3 {
            health.record_failure(3);
        }
        assert_eq!(health.state(), HealthState::Unhealthy);
        assert_eq!(health.record_failure(1), None);
    }

    #[test]
    fn success_interrupts_failure_streak() {
        let health = AdapterHealth::default();
        health.record_success(2);
        health.record_failure(3);
        health.record_failure(3);
        health.record_success(2);
        health.record_failure(3);
        assert_eq!(health.state(), HealthState::Healthy);
    }

    #[test]
    fn recovery_needs_success_streak_per_level() {
        let health = AdapterHealth::default();
        health.force(HealthState::Unhealthy);
        assert_eq!(health.record_success(2), None);
        assert_eq!(health.record_success(2).map(|t| t.to), Some(HealthState::Degraded));
        assert_eq!(health.record_success(2), None);
        assert_eq!(health.record_success(2).map(|t| t.to), Some(HealthState::Healthy));
    }

    #[test]
    fn timeout_demotes_immediately() {
        let health = AdapterHealth::default();
        health.record_success(2);
        assert_eq!(health.record_timeout().map(|t| t.to), Some(HealthState::Degraded));
        assert_eq!(health.record_timeout().map(|t| t.to), Some(HealthState::Unhealthy));
        assert_eq!(health.record_timeout(), None);
    }
}
