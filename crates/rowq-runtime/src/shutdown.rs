//! Cooperative shutdown token observed by the main loop.
//!
//! Signal handling is not wired here; the embedding program (or the
//! `rowq-worker` binary) forwards SIGINT/SIGTERM into [ShutdownToken::signal].
//! The token moves through three states and never moves backwards:
//! RUNNING → SHUTTING_DOWN (first signal) → TERMINATED (second signal or
//! graceful finish).

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShuttingDown,
    Terminated,
}

const RUNNING: u8 = 0;
const SHUTTING_DOWN: u8 = 1;
const TERMINATED: u8 = 2;

/// Shared three-state shutdown flag. Clones observe the same state.
#[derive(Clone, Debug, Default)]
pub struct ShutdownToken(Arc<AtomicU8>);

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ShutdownState {
        match self.0.load(Ordering::SeqCst) {
            RUNNING => ShutdownState::Running,
            SHUTTING_DOWN => ShutdownState::ShuttingDown,
            _ => ShutdownState::Terminated,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    /// Records one shutdown signal and returns the resulting state: the
    /// first signal requests a graceful stop, the second demands immediate
    /// termination.
    pub fn signal(&self) -> ShutdownState {
        let previous = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| {
                Some(state.saturating_add(1).min(TERMINATED))
            })
            .unwrap_or(TERMINATED);
        match previous {
            RUNNING => ShutdownState::ShuttingDown,
            _ => ShutdownState::Terminated,
        }
    }

    /// Marks the loop as fully stopped after a graceful finish.
    pub fn terminate(&self) {
        self.0.store(TERMINATED, Ordering::SeqCst);
    }
}
