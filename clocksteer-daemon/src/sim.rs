//! Simulated timebase.
//!
//! Very simple minded: time advances when `sleep` is called, and only
//! then. A 1 Hz task models the kernel PLL by moving one second's worth
//! of the pending offset into the effective frequency per tick, which is
//! exactly the constant-slew contract the UNIX backend implements with
//! the real kernel.
//!
//! `delta` accumulates every tweak ever applied (steps, slews, and the
//! drift of the simulated oscillator). Replaying a recorded trace adds
//! `delta` to the recorded timestamps, which turns a passive recording
//! into a closed control loop.

use std::convert::Infallible;

use clocksteer_proto::{Generation, Sleep, Slew, Timebase, Timestamp};
use tracing::debug;

#[derive(Debug)]
pub struct SimTimebase {
    now: Timestamp,
    /// Effective frequency; updated only by the kernel-model tick.
    freq: f64,
    /// Base oscillator frequency error, disturbed by bump events.
    freq0: f64,
    adj_offset: f64,
    adj_duration: f64,
    adj_freq: f64,
    delta: f64,
    generation: Generation,
}

impl Default for SimTimebase {
    fn default() -> Self {
        Self::new()
    }
}

impl SimTimebase {
    pub fn new() -> SimTimebase {
        SimTimebase {
            now: Timestamp::from_double(1e6),
            freq: 0.0,
            freq0: 0.0,
            adj_offset: 0.0,
            adj_duration: 0.0,
            adj_freq: 0.0,
            delta: 0.0,
            generation: Generation::INITIAL,
        }
    }

    /// Total time tweaked into the clock so far; trace post-processing
    /// and the end-to-end tests read this.
    pub fn delta(&self) -> f64 {
        self.delta
    }

    /// One kernel-model tick: fold the pending adjust into the effective
    /// frequency. Returns `(adj_freq, adj_offset, adj_duration)` left
    /// after the tick, for the `SIMPLL` trace record.
    pub fn kern_pll_tick(&mut self) -> (f64, f64, f64) {
        self.freq = self.freq0 + self.adj_freq;
        if self.adj_duration > 0.0 {
            let d = self.adj_offset / self.adj_duration;
            self.freq += d;
            self.adj_offset -= d;
            self.adj_duration -= 1.0;
        }
        (self.adj_freq, self.adj_offset, self.adj_duration)
    }

    /// Artificially bump the oscillator: a frequency change, a phase
    /// jump, or both. Deliberately does not touch the generation; the
    /// pipeline has to notice the disturbance on its own.
    pub fn bump(&mut self, bfreq: f64, bphase: f64) {
        debug!(bfreq, bphase, "SIMBUMP");
        self.freq0 += bfreq;
        self.delta += bphase;
    }
}

impl Timebase for SimTimebase {
    type Error = Infallible;

    fn now(&self) -> Timestamp {
        self.now
    }

    fn sleep(&mut self, dur: f64) -> Sleep {
        self.now.add(dur);
        self.delta += dur * self.freq;
        Sleep::Finished
    }

    fn step(&mut self, offset: f64) -> Result<(), Infallible> {
        debug!(offset, "SIMSTEP");
        self.delta += offset;
        self.generation = self.generation.next();
        Ok(())
    }

    fn adjust(
        &mut self,
        offset: f64,
        duration: f64,
        frequency: f64,
    ) -> Result<Slew, Infallible> {
        self.adj_offset = offset;
        self.adj_duration = duration.floor();
        if self.adj_offset > 0.0 && self.adj_duration == 0.0 {
            self.adj_duration = 1.0;
        }
        self.adj_freq = frequency;
        Ok(Slew::Deferred)
    }

    fn restore_frequency(&mut self) -> Result<(), Infallible> {
        panic!("slew restore task on the simulated timebase");
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
    fn time_advances_only_by_sleeping() {
        let mut tb = SimTimebase::new();
        let t0 = tb.now();
        assert_eq!(tb.now(), t0);

        assert_eq!(tb.sleep(2.5), Sleep::Finished);
        assert!((tb.now().diff(&t0) - 2.5).abs() < 1e-12);
        assert_eq!(tb.delta(), 0.0);
    }

    #[test]
    fn base_frequency_accrues_into_delta() {
        let mut tb = SimTimebase::new();
        tb.bump(100e-6, 0.0);
        tb.kern_pll_tick();
        for _ in 0..10 {
            tb.sleep(1.0);
        }
        assert!((tb.delta() - 10.0 * 100e-6).abs() < 1e-12);
    }

    #[test]
    fn adjust_slews_linearly_over_the_window() {
        let mut tb = SimTimebase::new();
        assert_eq!(tb.adjust(-0.004, 4.0, 0.0).unwrap(), Slew::Deferred);

        // Four ticks spread the offset evenly, then it is exhausted.
        for _ in 0..4 {
            tb.kern_pll_tick();
            tb.sleep(1.0);
        }
        assert!((tb.delta() + 0.004).abs() < 1e-12, "delta {}", tb.delta());

        let (_, left_off, left_dur) = tb.kern_pll_tick();
        assert!(left_off.abs() < 1e-15);
        assert_eq!(left_dur, 0.0);
        tb.sleep(1.0);
        assert!((tb.delta() + 0.004).abs() < 1e-12);
    }

    #[test]
    fn step_bumps_the_generation() {
        let mut tb = SimTimebase::new();
        let gen = tb.generation();
        tb.step(-0.25).unwrap();
        assert_eq!(tb.delta(), -0.25);
        assert_eq!(tb.generation(), gen.next());

        // Bumps disturb the clock without announcing themselves.
        tb.bump(0.0, 0.25);
        assert_eq!(tb.delta(), 0.0);
        assert_eq!(tb.generation(), gen.next());
    }

    #[test]
    fn positive_offset_with_zero_duration_gets_one_second() {
        let mut tb = SimTimebase::new();
        assert_eq!(tb.adjust(0.002, 0.0, 0.0).unwrap(), Slew::Deferred);
        tb.kern_pll_tick();
        tb.sleep(1.0);
        assert!((tb.delta() - 0.002).abs() < 1e-12);
    }
}
