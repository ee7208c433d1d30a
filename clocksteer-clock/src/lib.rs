//! UNIX timebase.
//!
//! Implements [`Timebase`] on top of a modern UNIX kernel with
//! `clock_gettime(2)`/`clock_settime(2)` and the Mills-style kernel PLL
//! behind `ntp_adjtime(3)`.
//!
//! The kernel applies offset corrections in an exponential-decay fashion
//! for historical reasons, which injects odd harmonics of the update
//! period into every measurement made on the machine. We want "this much
//! offset, accumulated linearly over this many seconds" instead, so the
//! offset is folded into the frequency word ourselves and the driver is
//! told (via [`Slew::Armed`]) when to call back and restore the base
//! frequency.

use std::io;

use clocksteer_proto::{Generation, Sleep, Slew, Timebase, Timestamp};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("clock_settime failed: {0}")]
    SetTime(io::Error),
    #[error("ntp_adjtime failed: {0}")]
    AdjTime(io::Error),
}

/// The kernel frequency word counts 2^-16 ppm.
const FREQ_SCALE: f64 = 65536.0 * 1e6;

/// The realtime kernel clock.
///
/// A passive instance (used by subcommands that only observe) still
/// reads the clock and sleeps, but treats any attempt to write the clock
/// as the program error it is.
pub struct UnixTimebase {
    active: bool,
    generation: Generation,
    adj_offset: f64,
    adj_duration: f64,
    adj_freq: f64,
}

impl UnixTimebase {
    /// A timebase that is allowed to discipline the kernel clock.
    pub fn active() -> UnixTimebase {
        Self::build(true)
    }

    /// Read-and-sleep only; `step`/`adjust` abort.
    pub fn passive() -> UnixTimebase {
        Self::build(false)
    }

    fn build(active: bool) -> UnixTimebase {
        UnixTimebase {
            active,
            generation: Generation::INITIAL,
            adj_offset: 0.0,
            adj_duration: 0.0,
            adj_freq: 0.0,
        }
    }

    fn set_frequency(&self, frequency: f64) -> Result<(), ClockError> {
        assert!(frequency.is_finite());

        // SAFETY: timex is a plain data struct; zeroed is its documented
        // "change nothing" state before mode bits are set.
        let mut tx: libc::timex = unsafe { std::mem::zeroed() };
        tx.modes = libc::MOD_FREQUENCY | libc::MOD_STATUS;
        tx.status = libc::STA_PLL | libc::STA_FREQHOLD;
        tx.freq = (frequency * FREQ_SCALE).floor() as libc::c_long;

        // SAFETY: tx is a valid, initialized timex for the call's duration.
        let rc = unsafe { libc::ntp_adjtime(&mut tx) };
        if rc < 0 {
            return Err(ClockError::AdjTime(io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Timebase for UnixTimebase {
    type Error = ClockError;

    fn now(&self) -> Timestamp {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: ts outlives the call; CLOCK_REALTIME always exists.
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
        assert_eq!(rc, 0, "clock_gettime(CLOCK_REALTIME) cannot fail");
        Timestamp::nanosec(ts.tv_sec, ts.tv_nsec)
    }

    fn sleep(&mut self, dur: f64) -> Sleep {
        assert!(dur >= 0.0);
        let ms = (dur * 1e3).floor().min(i32::MAX as f64) as libc::c_int;
        // SAFETY: zero fds is a plain interruptible timeout.
        let rc = unsafe { libc::poll(std::ptr::null_mut(), 0, ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            assert_eq!(err.raw_os_error(), Some(libc::EINTR), "poll: {err}");
            return Sleep::Interrupted;
        }
        assert_eq!(rc, 0);
        Sleep::Finished
    }

    fn step(&mut self, offset: f64) -> Result<(), ClockError> {
        assert!(self.active, "step on a passive timebase");

        let whole = offset.floor();
        let frac = offset - whole;

        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: as in now().
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
        assert_eq!(rc, 0);

        ts.tv_sec += whole as libc::time_t;
        ts.tv_nsec += (frac * 1e9).floor() as libc::c_long;
        if ts.tv_nsec < 0 {
            ts.tv_sec -= 1;
            ts.tv_nsec += 1_000_000_000;
        } else if ts.tv_nsec >= 1_000_000_000 {
            ts.tv_sec += 1;
            ts.tv_nsec -= 1_000_000_000;
        }

        // SAFETY: ts is a valid normalized timespec.
        let rc = unsafe { libc::clock_settime(libc::CLOCK_REALTIME, &ts) };
        if rc != 0 {
            return Err(ClockError::SetTime(io::Error::last_os_error()));
        }
        self.generation = self.generation.next();
        Ok(())
    }

    fn adjust(
        &mut self,
        offset: f64,
        duration: f64,
        frequency: f64,
    ) -> Result<Slew, ClockError> {
        assert!(self.active, "adjust on a passive timebase");
        assert!(duration >= 0.0);

        self.adj_offset = offset;
        self.adj_duration = duration.floor();
        if self.adj_offset > 0.0 && self.adj_duration == 0.0 {
            self.adj_duration = 1.0;
        }
        self.adj_freq = frequency;

        let mut freq = self.adj_freq;
        if self.adj_duration > 0.0 {
            freq += self.adj_offset / self.adj_duration;
        }
        self.set_frequency(freq)?;

        if self.adj_duration > 0.0 {
            Ok(Slew::Armed {
                restore_after: self.adj_duration,
            })
        } else {
            Ok(Slew::Deferred)
        }
    }

    fn restore_frequency(&mut self) -> Result<(), ClockError> {
        assert!(self.active, "restore_frequency on a passive timebase");
        self.set_frequency(self.adj_freq)
    }

    fn generation(&self) -> Generation {
        self.generation
    }

    fn bump_generation(&mut self) {
        self.generation = self.generation.next();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_monotonic_enough() {
        let tb = UnixTimebase::passive();
        let a = tb.now();
        let b = tb.now();
        assert!(b.diff(&a) >= 0.0);
        // A realtime clock that thinks it is before 2020 is not running.
        assert!(a.seconds() > 1_577_836_800);
    }

    #[test]
    fn sleep_actually_sleeps() {
        let mut tb = UnixTimebase::passive();
        let a = tb.now();
        assert_eq!(tb.sleep(0.02), Sleep::Finished);
        let b = tb.now();
        assert!(b.diff(&a) >= 0.015, "slept {}", b.diff(&a));
    }

    #[test]
    fn sleep_until_the_past_returns_immediately() {
        let mut tb = UnixTimebase::passive();
        let past = tb.now().plus(-5.0);
        assert_eq!(tb.sleep_until(&past), Sleep::Finished);
    }
}
