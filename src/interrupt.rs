//! Cooperative interruption for the interpreter loop.
//!
//! A single thread-local latch: a controller running on the interpreter's
//! thread (a timer callback, a linked host function, the embedding
//! application) calls [`request_interrupt`], and the execution loop calls
//! [`poll_and_consume`] at its checkpoints. A poll that observes the request
//! clears it and reports [`Poll::Interrupted`]; the interpreter maps that
//! onto its usual trap path as "execution aborted".
//!
//! The flag is strictly per-thread. Requesting an interrupt on one thread
//! never affects execution on another.

use std::cell::Cell;

/// Outcome of a checkpoint poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    Interrupted,
    NotInterrupted,
}

impl Poll {
    #[inline]
    pub fn is_interrupted(self) -> bool {
        self == Poll::Interrupted
    }
}

thread_local! {
    static INTERRUPT_REQUESTED: Cell<bool> = const { Cell::new(false) };
}

/// Arm the calling thread's interrupt latch.
///
/// Fire-and-forget: there is no acknowledgment, and requesting again before
/// the next poll has no additional effect. The next checkpoint poll on this
/// thread observes the request and consumes it.
#[inline]
pub fn request_interrupt() {
    INTERRUPT_REQUESTED.with(|flag| flag.set(true));
}

/// Test and clear the calling thread's interrupt latch.
///
/// Returns [`Poll::Interrupted`] exactly once per request: the flag is reset
/// before returning, so a subsequent poll (absent a new request) reports
/// [`Poll::NotInterrupted`].
#[inline]
pub fn poll_and_consume() -> Poll {
    INTERRUPT_REQUESTED.with(|flag| {
        if flag.replace(false) {
            Poll::Interrupted
        } else {
            Poll::NotInterrupted
        }
    })
}
