//! The timebase capability: the one place that reads, nudges and steps
//! the clock the rest of the system lives on.
//!
//! Two implementors exist: the UNIX kernel clock (in `clocksteer-clock`)
//! and a simulated clock that only advances when slept on (in the daemon).
//! Everything else is written against this trait so the whole pipeline can
//! be driven off either.

use crate::timestamp::Timestamp;

/// Counts discontinuous clock changes.
///
/// Every step bumps the generation; consumers that keep running state
/// derived from clock readings (filter averages, the PLL mode machine)
/// compare their cached generation against the current one and reset
/// themselves on mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation(u32);

impl Generation {
    /// Deliberately not zero, so a forgotten "compare before use" shows up
    /// as a reset on the very first sample instead of hiding.
    pub const INITIAL: Generation = Generation(41);

    #[must_use]
    pub const fn next(self) -> Generation {
        Generation(self.0.wrapping_add(1))
    }
}

/// Outcome of a timebase sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sleep {
    Finished,
    /// A signal arrived; control must return to the caller without firing
    /// whatever the sleep was waiting for.
    Interrupted,
}

/// What `Timebase::adjust` wants from the caller.
#[derive(Debug, Clone, Copy, PartialEq)]
#[must_use]
pub enum Slew {
    /// The backend applied `frequency + offset/duration` immediately and
    /// needs a one-shot call to `restore_frequency` once the window ends.
    /// Any previously armed restore must be cancelled first.
    Armed { restore_after: f64 },
    /// The backend models the slew itself; nothing to schedule.
    Deferred,
}

pub trait Timebase {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Current time. Reading the clock is infallible on every platform we
    /// run on; a backend that cannot read its own clock is unusable.
    fn now(&self) -> Timestamp;

    /// Wait for `dur` seconds (or, for a simulated clock, advance by it).
    fn sleep(&mut self, dur: f64) -> Sleep;

    /// Apply `offset` as a discontinuous change and bump the generation.
    fn step(&mut self, offset: f64) -> Result<(), Self::Error>;

    /// Accumulate `offset` seconds of phase over `duration` seconds at a
    /// constant rate on top of the base `frequency`. The constant-rate
    /// window replaces the kernel's exponential-decay offset handling,
    /// which aliases the PLL update period into every measurement.
    fn adjust(&mut self, offset: f64, duration: f64, frequency: f64)
        -> Result<Slew, Self::Error>;

    /// End the current slew window: drop back to the base frequency of
    /// the most recent `adjust`.
    fn restore_frequency(&mut self) -> Result<(), Self::Error>;

    fn generation(&self) -> Generation;

    /// Force a generation change without touching the clock, as if a step
    /// had happened. Used by the SIGHUP restart path to make every
    /// consumer start from scratch.
    fn bump_generation(&mut self);

    /// Sleep until `when`, or return immediately if it is already past.
    fn sleep_until(&mut self, when: &Timestamp) -> Sleep {
        let dt = when.diff(&self.now());
        if dt <= 0.0 {
            return Sleep::Finished;
        }
        self.sleep(dt)
    }
}
