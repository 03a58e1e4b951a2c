//! Turn state and the busy gate.
//!
//! The gate is one `AtomicBool` taken with a single `compare_exchange`, so
//! the check and the set cannot be split by a suspension point. Holding the
//! gate is represented by a [`BusyGuard`]; dropping the guard (on every exit
//! path, including early returns, panics and cancelled futures) resets the
//! phase to [`TurnPhase::Idle`] and releases the gate.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tracing::warn;

/// Where the current turn is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    Thinking,
    Speaking,
    Failed,
}

impl TurnPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Thinking,
            2 => Self::Speaking,
            3 => Self::Failed,
            _ => Self::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Thinking => 1,
            Self::Speaking => 2,
            Self::Failed => 3,
        }
    }

    /// Whether `self → next` is an edge of the turn state machine.
    pub fn can_transition_to(self, next: TurnPhase) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Thinking)
                | (Self::Thinking, Self::Speaking | Self::Idle | Self::Failed)
                | (Self::Speaking, Self::Idle | Self::Failed)
                | (Self::Failed, Self::Idle)
        )
    }
}

/// Process-wide single-flight gate plus the current phase.
#[derive(Debug, Default)]
pub struct TurnGate {
    busy: AtomicBool,
    phase: AtomicU8,
}

impl TurnGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take the gate if it is free. Synchronous; never suspends.
    pub fn try_acquire(self: &Arc<Self>) -> Option<BusyGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard {
                gate: Arc::clone(self),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> TurnPhase {
        TurnPhase::from_u8(self.phase.load(Ordering::Acquire))
    }
}

/// Proof of holding the gate.
#[derive(Debug)]
pub struct BusyGuard {
    gate: Arc<TurnGate>,
}

impl BusyGuard {
    /// Move the held turn to `next`.
    pub fn enter(&self, next: TurnPhase) {
        let current = self.gate.phase();
        if !current.can_transition_to(next) {
            warn!("unexpected turn transition {current:?} -> {next:?}");
        }
        self.gate.phase.store(next.as_u8(), Ordering::Release);
    }

    pub fn phase(&self) -> TurnPhase {
        self.gate.phase()
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.gate
            .phase
            .store(TurnPhase::Idle.as_u8(), Ordering::Release);
        self.gate.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let gate = TurnGate::new();
        let guard = gate.try_acquire().unwrap();
        assert!(gate.is_busy());
        assert!(gate.try_acquire().is_none());
        drop(guard);
        assert!(!gate.is_busy());
        assert!(gate.try_acquire().is_some());
    }

    #[test]
    fn drop_resets_phase_to_idle() {
        let gate = TurnGate::new();
        {
            let guard = gate.try_acquire().unwrap();
            guard.enter(TurnPhase::Thinking);
            guard.enter(TurnPhase::Failed);
            assert_eq!(gate.phase(), TurnPhase::Failed);
        }
        assert_eq!(gate.phase(), TurnPhase::Idle);
    }

    #[test]
    fn gate_is_released_on_panic() {
        let gate = TurnGate::new();
        let inner = Arc::clone(&gate);
        let result = std::panic::catch_unwind(move || {
            let guard = inner.try_acquire().unwrap();
            guard.enter(TurnPhase::Thinking);
            panic!("stage blew up");
        });
        assert!(result.is_err());
        assert!(!gate.is_busy());
        assert_eq!(gate.phase(), TurnPhase::Idle);
    }

    #[test]
    fn state_machine_edges() {
        use TurnPhase::*;
        assert!(Idle.can_transition_to(Thinking));
        assert!(Thinking.can_transition_to(Speaking));
        assert!(Thinking.can_transition_to(Idle));
        assert!(Speaking.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Idle));
        assert!(!Idle.can_transition_to(Speaking));
        assert!(!Failed.can_transition_to(Thinking));
    }
}
