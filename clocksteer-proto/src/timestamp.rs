//! 64.64 fixed-point wall-clock timestamps.
//!
//! The fraction field counts units of 2^-64 seconds, which divides evenly
//! into neither nanoseconds nor the NTP wire format's 2^-32 steps; all
//! conversions in this module are written so that the error stays below
//! half a nanosecond for any representable value.

/// 2^64 / 10^9, the number of fraction units per nanosecond.
const NANO_FRAC: u64 = 18_446_744_074;

/// 2^64 as a double, for moving between the fraction field and seconds.
const FRAC_SCALE: f64 = 18_446_744_073_709_551_616.0;

/// Seconds since the UNIX epoch plus a binary fraction of a second.
///
/// Equality is bit-exact. That matters for origin-timestamp matching:
/// the transmit timestamp of an outgoing packet is re-derived from the
/// packed wire bytes, so the copy a server echoes back compares equal
/// without any rounding slop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    sec: u64,
    frac: u64,
}

impl Timestamp {
    pub const fn from_parts(sec: u64, frac: u64) -> Self {
        Self { sec, frac }
    }

    pub const fn seconds(&self) -> u64 {
        self.sec
    }

    pub const fn fraction(&self) -> u64 {
        self.frac
    }

    /// Build a timestamp from whole seconds and nanoseconds.
    pub fn nanosec(sec: i64, nsec: i64) -> Self {
        assert!(sec >= 0);
        assert!((0..1_000_000_000).contains(&nsec));
        Self {
            sec: sec as u64,
            frac: nsec as u64 * NANO_FRAC,
        }
    }

    /// Build a timestamp from a non-negative count of seconds.
    pub fn from_double(d: f64) -> Self {
        assert!(d >= 0.0);
        let di = d.floor();
        Self {
            sec: di as u64,
            frac: ((d - di) * FRAC_SCALE) as u64,
        }
    }

    /// Add a (possibly negative) delta in seconds.
    ///
    /// The delta is folded into the fraction first, then the integral part
    /// is carried into the seconds, so the fraction keeps its full
    /// precision for deltas up to ~1e6 s in either direction.
    pub fn add(&mut self, dt: f64) {
        let dt = dt + self.frac as f64 / FRAC_SCALE;
        let di = dt.floor();
        self.sec = self.sec.wrapping_add(di as i64 as u64);
        self.frac = ((dt - di) * FRAC_SCALE) as u64;
    }

    /// `self + dt` without mutating.
    pub fn plus(&self, dt: f64) -> Self {
        let mut ts = *self;
        ts.add(dt);
        ts
    }

    /// `self - other` in seconds.
    ///
    /// The fractions are differenced before the seconds are added in, so
    /// far-apart timestamps lose precision in the seconds only, never in
    /// the sub-second part.
    pub fn diff(&self, other: &Timestamp) -> f64 {
        let d = (self.frac as f64 - other.frac as f64) / FRAC_SCALE;
        d + (self.sec as f64 - other.sec as f64)
    }
}

/// Renders as `<sec>.<9-digit nsec>`, rounding the fraction to the
/// nearest nanosecond with carry into the seconds.
impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut sec = self.sec;
        // Widen before rounding; a fraction near 1.0 s would overflow u64.
        let mut nsec =
            ((self.frac as u128 + (NANO_FRAC / 2) as u128) / NANO_FRAC as u128) as u64;
        if nsec >= 1_000_000_000 {
            nsec -= 1_000_000_000;
            sec += 1;
        }
        write!(f, "{}.{:09}", sec, nsec)
    }
}

/// The delta grid of the arithmetic self-test; exercised by the
/// `run-tests` subcommand and by the unit tests below.
pub const SELF_TEST_DELTAS: [f64; 15] = [
    1e-9, 1e-8, 1e-6, 1e-3, 1e-1, 0.999, 1.001, 1.999, -2.000, -1.999, -1.000,
    -0.999, -1e-3, -1e-6, -1e-9,
];

/// One step of the self-test: add `off`, difference back, compare.
pub fn self_test_step(ts: &Timestamp, off: f64) -> f64 {
    ts.plus(off).diff(ts) - off
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    #[test]
    fn nanosec_roundtrips_through_display() {
        let ts = Timestamp::nanosec(1_400_000_000, 123_456_789);
        assert_eq!(ts.to_string(), "1400000000.123456789");

        let ts = Timestamp::nanosec(7, 999_999_999);
        assert_eq!(ts.to_string(), "7.999999999");
    }

    #[test]
    fn display_carries_into_seconds() {
        // A fraction within half a nanosecond of the next second must
        // round up and carry.
        let ts = Timestamp::from_parts(41, u64::MAX - 4);
        assert_eq!(ts.to_string(), "42.000000000");
    }

    #[test]
    fn add_carries_in_both_directions() {
        let mut ts = Timestamp::nanosec(100, 900_000_000);
        ts.add(0.2);
        assert_eq!(ts.seconds(), 101);

        let mut ts = Timestamp::nanosec(100, 100_000_000);
        ts.add(-0.2);
        assert_eq!(ts.seconds(), 99);
    }

    #[test]
    fn add_diff_roundtrip_grid() {
        let base = Timestamp::nanosec(1_500_000_000, 987_654_321);
        for off in SELF_TEST_DELTAS {
            let err = self_test_step(&base, off);
            assert!(err.abs() < 5e-10, "off {off}: err {err:e}");
        }
    }

    #[test]
    fn add_diff_roundtrip_random() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x344c_d213);
        for _ in 0..10_000 {
            let base =
                Timestamp::nanosec(rng.gen_range(0..4_000_000_000), rng.gen_range(0..1_000_000_000));
            let off: f64 = rng.gen_range(-10.0..10.0);
            let err = self_test_step(&base, off);
            assert!(err.abs() < 5e-10, "off {off}: err {err:e}");
        }
    }

    #[test]
    fn diff_of_far_apart_timestamps_keeps_subsecond_precision() {
        let a = Timestamp::nanosec(2_000_000, 250_000_000);
        let b = Timestamp::nanosec(1_000_000, 750_000_000);
        let d = a.diff(&b);
        assert!((d - 999_999.5).abs() < 1e-6, "d {d}");
    }

    #[test]
    fn from_double_matches_nanosec() {
        let a = Timestamp::from_double(1234.5);
        let b = Timestamp::nanosec(1234, 500_000_000);
        assert!(a.diff(&b).abs() < 1e-9);
    }

    #[test]
    fn diff_is_antisymmetric() {
        let a = Timestamp::nanosec(500, 1);
        let b = Timestamp::nanosec(499, 999_999_999);
        assert!((a.diff(&b) + b.diff(&a)).abs() < 1e-15);
        assert!(a.diff(&b) > 0.0);
    }
}
