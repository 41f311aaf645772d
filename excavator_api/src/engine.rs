//! Per-subsystem lifecycle cells.
//!
//! Every engine the coordinator owns (screen, tracker, session, PWM)
//! moves through {Idle, Starting, Running, Stopping}. A cell hands out
//! exactly one transition at a time; a second start or stop while one is
//! in flight is rejected, and a start on a running engine (or stop on an
//! idle one) is a no-op so engine control stays idempotent under
//! contention.

use parking_lot::Mutex;

/// Lifecycle state of one subsystem engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Not running.
    Idle,
    /// Start transition claimed.
    Starting,
    /// Running.
    Running,
    /// Stop transition claimed.
    Stopping,
}

/// Outcome of claiming a transition on an [`EngineCell`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// Transition claimed; caller must finish with `commit_*`.
    Claimed,
    /// Engine already in the target state; nothing to do.
    AlreadyDone,
    /// Another transition is in flight.
    Busy,
}

/// A lifecycle cell guarding one engine.
#[derive(Debug)]
pub struct EngineCell {
    name: &'static str,
    state: Mutex<EngineState>,
}

impl EngineCell {
    /// New cell in `Idle`.
    pub const fn new(name: &'static str) -> Self {
        Self { name, state: Mutex::new(EngineState::Idle) }
    }

    /// Engine name for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current state.
    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    /// Claim the start transition.
    pub fn begin_start(&self) -> Claim {
        let mut state = self.state.lock();
        match *state {
            EngineState::Idle => {
                *state = EngineState::Starting;
                Claim::Claimed
            }
            EngineState::Running => Claim::AlreadyDone,
            EngineState::Starting | EngineState::Stopping => Claim::Busy,
        }
    }

    /// Finish a claimed start: `Running` on success, back to `Idle`
    /// otherwise.
    pub fn commit_start(&self, ok: bool) {
        let mut state = self.state.lock();
        debug_assert_eq!(*state, EngineState::Starting, "{} start not claimed", self.name);
        *state = if ok { EngineState::Running } else { EngineState::Idle };
    }

    /// Claim the stop transition.
    pub fn begin_stop(&self) -> Claim {
        let mut state = self.state.lock();
        match *state {
            EngineState::Running => {
                *state = EngineState::Stopping;
                Claim::Claimed
            }
            EngineState::Idle => Claim::AlreadyDone,
            EngineState::Starting | EngineState::Stopping => Claim::Busy,
        }
    }

    /// Finish a claimed stop. Engines always land in `Idle`; a failed
    /// teardown is logged by the caller, not retried here.
    pub fn commit_stop(&self) {
        let mut state = self.state.lock();
        debug_assert_eq!(*state, EngineState::Stopping, "{} stop not claimed", self.name);
        *state = EngineState::Idle;
    }
}
