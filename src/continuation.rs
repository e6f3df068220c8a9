//! Resumable phase machines.
//!
//! A method that must not block an event loop splits its protocol into
//! named phases. Each phase first asks [`PhaseIo::would_block`]; if the
//! next read would block it returns [`Step::Pending`], otherwise it does
//! one unit of blocking-free work and returns the next phase or the
//! result.
//!
//! ```text
//!            ┌────────────── Continue(next) ─────────────┐
//!            ▼                                           │
//!   resume ─► step(phase) ──► Pending ──► Poll::Pending  │
//!                 │                                      │
//!                 └──► Done(result) ──► Poll::Ready ─────┘ (finished)
//! ```
//!
//! The same machine serves blocking callers: in [`DriveMode::Blocking`]
//! `would_block` is always `false`, so [`Continuation::run_blocking`]
//! simply runs the phases back to back.

use core::fmt;
use std::task::Poll;

use crate::error::{AuthError, AuthResult};
use crate::transport::TransportChannel;

/// Outcome of running one phase.
#[derive(Debug)]
pub enum Step<P, T> {
    /// Run `P` next.
    Continue(P),
    /// The next read would block; call again on readiness.
    Pending,
    /// The protocol finished.
    Done(AuthResult<T>),
}

/// How the caller wants reads handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriveMode {
    /// Reads may block.
    #[default]
    Blocking,
    /// Phases yield instead of blocking on reads.
    NonBlocking,
}

/// Channel access handed to a phase.
pub struct PhaseIo<'a> {
    /// The channel the protocol runs on.
    pub chan: &'a mut dyn TransportChannel,
    mode: DriveMode,
}

impl<'a> PhaseIo<'a> {
    /// Wraps `chan` for `mode`.
    pub fn new(chan: &'a mut dyn TransportChannel, mode: DriveMode) -> Self {
        Self { chan, mode }
    }

    /// Returns `true` when non-blocking and no message is ready.
    pub fn would_block(&mut self) -> bool {
        self.mode == DriveMode::NonBlocking && !self.chan.read_ready()
    }

    /// The drive mode.
    #[must_use]
    pub const fn mode(&self) -> DriveMode {
        self.mode
    }
}

/// A protocol decomposed into phases.
pub trait PhaseMachine {
    /// Phase identifier.
    type Phase: Copy + fmt::Debug;
    /// Success value.
    type Output;

    /// Runs `phase` once.
    fn step(&mut self, phase: Self::Phase, io: &mut PhaseIo<'_>)
    -> Step<Self::Phase, Self::Output>;
}

/// Drives a [`PhaseMachine`] across calls.
#[derive(Debug)]
pub struct Continuation<M: PhaseMachine> {
    machine: M,
    phase: Option<M::Phase>,
}

impl<M: PhaseMachine> Continuation<M> {
    /// Starts `machine` at `start`.
    pub const fn new(machine: M, start: M::Phase) -> Self {
        Self {
            machine,
            phase: Some(start),
        }
    }

    /// Runs phases until one is pending or the machine finishes.
    pub fn resume(
        &mut self,
        chan: &mut dyn TransportChannel,
        mode: DriveMode,
    ) -> Poll<AuthResult<M::Output>> {
        let mut io = PhaseIo::new(chan, mode);
        loop {
            let Some(phase) = self.phase else {
                return Poll::Ready(Err(AuthError::protocol(
                    "continuation resumed after completion",
                )));
            };
            match self.machine.step(phase, &mut io) {
                Step::Continue(next) => {
                    tracing::trace!(from = ?phase, to = ?next, "phase transition");
                    self.phase = Some(next);
                }
                Step::Pending => return Poll::Pending,
                Step::Done(result) => {
                    self.phase = None;
                    return Poll::Ready(result);
                }
            }
        }
    }

    /// Runs the machine to completion, blocking on reads.
    pub fn run_blocking(&mut self, chan: &mut dyn TransportChannel) -> AuthResult<M::Output> {
        loop {
            if let Poll::Ready(result) = self.resume(chan, DriveMode::Blocking) {
                return result;
            }
        }
    }

    /// The phase that will run next, `None` once finished.
    #[must_use]
    pub const fn phase(&self) -> Option<M::Phase> {
        self.phase
    }

    /// Returns `true` once the machine produced its result.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.phase.is_none()
    }

    /// Borrows the machine.
    pub const fn machine(&self) -> &M {
        &self.machine
    }

    /// Mutably borrows the machine.
    pub fn machine_mut(&mut self) -> &mut M {
        &mut self.machine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::duplex_with_timeout;
    use std::time::Duration;

    /// Reads `n` integers, one per message, and sums them.
    struct Summer {
        remaining: u32,
        total: i32,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum SumPhase {
        Read,
        Finish,
    }

    impl PhaseMachine for Summer {
        type Phase = SumPhase;
        type Output = i32;

        fn step(&mut self, phase: SumPhase, io: &mut PhaseIo<'_>) -> Step<SumPhase, i32> {
            match phase {
                SumPhase::Read => {
                    if io.would_block() {
                        return Step::Pending;
                    }
                    match io.chan.recv_int() {
                        Ok(v) => self.total += v,
                        Err(e) => return Step::Done(Err(e.into())),
                    }
                    self.remaining -= 1;
                    if self.remaining == 0 {
                        Step::Continue(SumPhase::Finish)
                    } else {
                        Step::Continue(SumPhase::Read)
                    }
                }
                SumPhase::Finish => Step::Done(Ok(self.total)),
            }
        }
    }

    #[test]
    fn nonblocking_matches_blocking() {
        let (mut tx, mut rx) = duplex_with_timeout(Duration::from_secs(5));
        let mut cont = Continuation::new(
            Summer {
                remaining: 3,
                total: 0,
            },
            SumPhase::Read,
        );

        assert!(cont.resume(&mut rx, DriveMode::NonBlocking).is_pending());
        tx.send_ints(&[1]).expect("send");
        assert!(cont.resume(&mut rx, DriveMode::NonBlocking).is_pending());
        tx.send_ints(&[2]).expect("send");
        tx.send_ints(&[3]).expect("send");
        let Poll::Ready(result) = cont.resume(&mut rx, DriveMode::NonBlocking) else {
            panic!("all input was available");
        };
        assert_eq!(result.expect("sum"), 6);
        assert!(cont.is_finished());

        let mut blocking = Continuation::new(
            Summer {
                remaining: 3,
                total: 0,
            },
            SumPhase::Read,
        );
        tx.send_ints(&[1]).expect("send");
        tx.send_ints(&[2]).expect("send");
        tx.send_ints(&[3]).expect("send");
        assert_eq!(blocking.run_blocking(&mut rx).expect("sum"), 6);
    }

    #[test]
    fn resuming_after_completion_is_an_error() {
        let (_tx, mut rx) = duplex_with_timeout(Duration::from_secs(5));
        let mut cont = Continuation::new(
            Summer {
                remaining: 1,
                total: 0,
            },
            SumPhase::Finish,
        );
        assert!(matches!(
            cont.resume(&mut rx, DriveMode::NonBlocking),
            Poll::Ready(Ok(0))
        ));
        assert!(matches!(
            cont.resume(&mut rx, DriveMode::NonBlocking),
            Poll::Ready(Err(_))
        ));
    }
}
