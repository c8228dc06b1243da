//! Session-wide run/pause/stop coordination.
//!
//! One [`RunState`] exists per session and is shared by reference (`Arc`) with
//! every acquisition worker at construction. Only the control context applies
//! commands; workers load the state once per poll iteration. The value is an
//! atomic, so no lock is taken on either side.

use crate::error::{AppResult, RigError};
use crate::protocol::ControlMessage;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Run state observed by acquisition workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunStateKind {
    /// No run has started yet
    Idle = 0,
    /// Workers poll their devices
    Running = 1,
    /// Workers stay attached but do not read
    Paused = 2,
    /// Workers exit at the end of their current cycle
    Stopped = 3,
}

impl RunStateKind {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Paused,
            _ => Self::Stopped,
        }
    }

    /// Whether workers should keep polling.
    pub fn is_running(self) -> bool {
        self == Self::Running
    }
}

impl fmt::Display for RunStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// User-issued run command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunCommand {
    /// Start a run, or resume a paused one
    Start,
    /// Pause a running run
    Pause,
    /// End the run
    Stop,
}

impl RunCommand {
    /// Control literal broadcast to every device for this command.
    pub fn message(self) -> ControlMessage {
        match self {
            Self::Start => ControlMessage::Start,
            Self::Pause => ControlMessage::Pause,
            Self::Stop => ControlMessage::Stop,
        }
    }
}

impl fmt::Display for RunCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message().kind())
    }
}

/// State reached by applying `command` in `from`, if the transition is allowed.
pub fn next_state(from: RunStateKind, command: RunCommand) -> Option<RunStateKind> {
    use RunCommand as C;
    use RunStateKind as S;

    match (from, command) {
        (S::Idle | S::Paused | S::Stopped, C::Start) => Some(S::Running),
        (S::Running, C::Pause) => Some(S::Paused),
        (S::Running | S::Paused, C::Stop) => Some(S::Stopped),
        _ => None,
    }
}

/// Shared run state.
#[derive(Debug)]
pub struct RunState {
    state: AtomicU8,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    /// New state, `Idle`.
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(RunStateKind::Idle as u8),
        }
    }

    /// Current state.
    pub fn load(&self) -> RunStateKind {
        RunStateKind::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Apply `command`, returning `(previous, next)`.
    ///
    /// The update is a single compare-and-swap, so a concurrent reader sees either
    /// the old or the new state, never a torn one.
    pub fn apply(&self, command: RunCommand) -> AppResult<(RunStateKind, RunStateKind)> {
        let mut current = self.load();
        loop {
            let next = next_state(current, command).ok_or(RigError::InvalidTransition {
                from: current,
                command,
            })?;
            match self.state.compare_exchange(
                current as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok((current, next)),
                Err(actual) => current = RunStateKind::from_u8(actual),
            }
        }
    }
}
