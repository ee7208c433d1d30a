// Sanity-filter incoming NTP packets into a per-server trust interval.
//
// Instead of the RFC 5905 shift-register clock filter, this uses the
// one-way delay bounds of each exchange directly:
//
//      lo = origin  - receive      (how far behind the server we can be)
//      hi = ts_rx   - transmit     (how far ahead)
//
// The true offset lies in [lo, hi]. Exponential averages of both bounds,
// plus averages of their squares, give a per-leg noise estimate; a sample
// whose leg shoots past the average by more than a few sigma was delayed
// in that direction on the network, and the opposite leg is trusted for
// the midpoint instead.

use tracing::debug;

use crate::packet::{Leap, Mode, NtpPacket};
use crate::params::Params;
use crate::timebase::Generation;

/// Why a packet was dropped without touching the filter state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reject {
    /// Leap indicator 3: the server itself is not synchronized.
    LeapUnknown,
    BadVersion(u8),
    BadMode(Mode),
    BadStratum(u8),
    /// Transmit not after receive; the server's timestamps are inverted.
    ReceiveAfterTransmit(f64),
    /// Reference newer than transmit (beyond 2 ns of rounding slop).
    ReferenceAfterTransmit(f64),
    /// Reference older than 2048 s: the server is flying blind.
    AncientReference(f64),
    /// The reply never got an arrival timestamp attached.
    NoArrivalTimestamp,
}

impl std::fmt::Display for Reject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reject::LeapUnknown => write!(f, "NF Unsynchronized leap"),
            Reject::BadVersion(v) => write!(f, "NF Bad version {v}"),
            Reject::BadMode(m) => write!(f, "NF Bad mode {}", m.to_bits()),
            Reject::BadStratum(s) => write!(f, "NF Bad stratum {s}"),
            Reject::ReceiveAfterTransmit(r) => write!(f, "NF rx after tx {r:.3e}"),
            Reject::ReferenceAfterTransmit(r) => write!(f, "NF ref after tx {r:.3e}"),
            Reject::AncientReference(r) => write!(f, "NF ancient ref {r:.3e}"),
            Reject::NoArrivalTimestamp => write!(f, "NF no rx timestamp"),
        }
    }
}

/// The published result of one accepted packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterUpdate {
    /// Which acceptance branch the sample took: 1 symmetric spike,
    /// 2 lower leg delayed, 3 upper leg delayed, 4 clean.
    pub branch: u8,
    pub trust: f64,
    pub lo: f64,
    pub mid: f64,
    pub hi: f64,
    /// Acceptance limits and post-update midpoint average, for the trace.
    pub lo_lim: f64,
    pub hi_lim: f64,
    pub amid: f64,
}

/// Per-peer running state. Created with the peer, reset whenever the
/// clock generation changes under it.
#[derive(Debug, Clone)]
pub struct PacketFilter {
    alo: f64,
    amid: f64,
    ahi: f64,
    alolo: f64,
    ahihi: f64,
    navg: f64,
    generation: Option<Generation>,
}

impl Default for PacketFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketFilter {
    pub fn new() -> PacketFilter {
        PacketFilter {
            alo: 0.0,
            amid: 0.0,
            ahi: 0.0,
            alolo: 0.0,
            ahihi: 0.0,
            navg: 0.0,
            generation: None,
        }
    }

    fn reset(&mut self) {
        self.navg = 0.0;
        self.alo = 0.0;
        self.amid = 0.0;
        self.ahi = 0.0;
        self.alolo = 0.0;
        self.ahihi = 0.0;
    }

    /// Run one received packet through the sanity checks and, if it
    /// passes, fold it into the running statistics.
    pub fn update(
        &mut self,
        pkt: &NtpPacket,
        generation: Generation,
        params: &Params,
    ) -> Result<FilterUpdate, Reject> {
        if self.generation != Some(generation) {
            self.reset();
            self.generation = Some(generation);
        }

        if pkt.leap == Leap::Unknown {
            return Err(Reject::LeapUnknown);
        }
        if pkt.version < 3 || pkt.version > 4 {
            return Err(Reject::BadVersion(pkt.version));
        }
        if pkt.mode != Mode::Server {
            return Err(Reject::BadMode(pkt.mode));
        }
        if pkt.stratum == 0 || pkt.stratum > 15 {
            return Err(Reject::BadStratum(pkt.stratum));
        }
        let ts_rx = pkt.ts_rx.ok_or(Reject::NoArrivalTimestamp)?;

        let r = pkt.transmit.diff(&pkt.receive);
        if r <= 0.0 {
            return Err(Reject::ReceiveAfterTransmit(r));
        }

        let r = pkt.transmit.diff(&pkt.reference);
        if r < -2e-9 {
            // two nanoseconds to Finagle rounding errors
            return Err(Reject::ReferenceAfterTransmit(r));
        }
        if r > 2048.0 {
            return Err(Reject::AncientReference(r));
        }

        if self.navg < params.ntp_filter_average {
            self.navg += 1.0;
        }

        let lo = pkt.origin.diff(&pkt.receive);
        let hi = ts_rx.diff(&pkt.transmit);
        let mut mid = 0.5 * (lo + hi);

        // The variance can cancel to a tiny negative number; clamp so the
        // noise estimate never goes NaN.
        let (lo_noise, hi_noise) = if self.navg > 2.0 {
            (
                (self.alolo - self.alo * self.alo).max(0.0).sqrt(),
                (self.ahihi - self.ahi * self.ahi).max(0.0).sqrt(),
            )
        } else {
            (0.0, 0.0)
        };

        let lo_lim = self.alo - lo_noise * params.ntp_filter_threshold;
        let hi_lim = self.ahi + hi_noise * params.ntp_filter_threshold;

        let fail_lo = lo < lo_lim;
        let fail_hi = hi > hi_lim;

        let branch: u8 = if fail_lo && fail_hi {
            1
        } else if self.navg > 3.0 && fail_lo {
            mid = self.amid + (hi - self.ahi);
            2
        } else if self.navg > 3.0 && fail_hi {
            mid = self.amid + (lo - self.alo);
            3
        } else {
            4
        };

        // Suspect samples adapt the averages at 1/navg^2 instead of
        // 1/navg, so a burst of congestion cannot drag the baseline along.
        let mut div = self.navg;
        if self.navg > 2.0 && branch != 4 {
            div *= div;
        }

        self.alo += (lo - self.alo) / div;
        self.amid += (mid - self.amid) / div;
        self.ahi += (hi - self.ahi) / div;
        self.alolo += (lo * lo - self.alolo) / div;
        self.ahihi += (hi * hi - self.ahihi) / div;

        let trust = match pkt.stratum {
            1..=14 => 1.0 / pkt.stratum as f64,
            _ => 0.0,
        };

        debug!(branch, lo, mid, hi, trust, "filter accepted packet");

        Ok(FilterUpdate {
            branch,
            trust,
            lo,
            mid,
            hi,
            lo_lim,
            hi_lim,
            amid: self.amid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::Timestamp;

    const GEN: Generation = Generation::INITIAL;

    /// A server reply implying offset bounds [lo, hi] for a request sent
    /// at local time `t0`.
    fn reply(t0: f64, lo: f64, hi: f64) -> NtpPacket {
        let origin = Timestamp::from_double(1_000_000.0 + t0);
        let receive = origin.plus(-lo);
        let transmit = receive.plus(10e-6);
        NtpPacket {
            leap: Leap::NoWarning,
            version: 4,
            mode: Mode::Server,
            stratum: 2,
            poll: 6,
            precision: -20,
            delay: Timestamp::from_parts(0, 0),
            dispersion: Timestamp::from_parts(0, 0),
            refid: *b"ATOM",
            reference: transmit.plus(-1.0),
            origin,
            receive,
            transmit,
            ts_rx: Some(transmit.plus(hi)),
        }
    }

    fn params() -> Params {
        Params::default()
    }

    #[test]
    fn rejects_before_state_is_touched() {
        let mut nf = PacketFilter::new();
        let p = params();

        let mut pkt = reply(0.0, -0.01, 0.01);
        pkt.leap = Leap::Unknown;
        assert_eq!(nf.update(&pkt, GEN, &p), Err(Reject::LeapUnknown));

        let mut pkt = reply(0.0, -0.01, 0.01);
        pkt.version = 2;
        assert_eq!(nf.update(&pkt, GEN, &p), Err(Reject::BadVersion(2)));

        let mut pkt = reply(0.0, -0.01, 0.01);
        pkt.mode = Mode::Client;
        assert_eq!(nf.update(&pkt, GEN, &p), Err(Reject::BadMode(Mode::Client)));

        let mut pkt = reply(0.0, -0.01, 0.01);
        pkt.stratum = 0;
        assert_eq!(nf.update(&pkt, GEN, &p), Err(Reject::BadStratum(0)));

        let mut pkt = reply(0.0, -0.01, 0.01);
        pkt.stratum = 16;
        assert_eq!(nf.update(&pkt, GEN, &p), Err(Reject::BadStratum(16)));

        let mut pkt = reply(0.0, -0.01, 0.01);
        pkt.receive = pkt.transmit.plus(1e-3);
        assert!(matches!(
            nf.update(&pkt, GEN, &p),
            Err(Reject::ReceiveAfterTransmit(_))
        ));

        let mut pkt = reply(0.0, -0.01, 0.01);
        pkt.reference = pkt.transmit.plus(1e-3);
        assert!(matches!(
            nf.update(&pkt, GEN, &p),
            Err(Reject::ReferenceAfterTransmit(_))
        ));

        let mut pkt = reply(0.0, -0.01, 0.01);
        pkt.reference = pkt.transmit.plus(-4000.0);
        assert!(matches!(
            nf.update(&pkt, GEN, &p),
            Err(Reject::AncientReference(_))
        ));

        let mut pkt = reply(0.0, -0.01, 0.01);
        pkt.ts_rx = None;
        assert_eq!(nf.update(&pkt, GEN, &p), Err(Reject::NoArrivalTimestamp));

        // None of the rejects consumed a sample.
        assert_eq!(nf.navg, 0.0);
    }

    #[test]
    fn clean_stream_stays_contained() {
        let mut nf = PacketFilter::new();
        let p = params();

        for i in 0..50 {
            let pkt = reply(i as f64, -0.010, 0.012);
            let upd = nf.update(&pkt, GEN, &p).unwrap();
            // The very first sample fails the (zeroed) limits trivially;
            // every later one must take the clean branch.
            if i > 0 {
                assert_eq!(upd.branch, 4);
            }
            assert!(upd.lo <= upd.mid && upd.mid <= upd.hi);
            assert!((0.0..=1.0).contains(&upd.trust));
        }
        // navg saturates at the configured average length.
        assert_eq!(nf.navg, p.ntp_filter_average);
        assert!((nf.amid - 0.001).abs() < 1e-9);
    }

    #[test]
    fn lower_leg_spike_takes_branch_two() {
        let mut nf = PacketFilter::new();
        let p = params();

        for i in 0..20 {
            nf.update(&reply(i as f64, -0.010, 0.010), GEN, &p).unwrap();
        }
        // A delay spike on the outbound leg pushes lo far down while hi
        // stays in band; the midpoint must come from the hi leg.
        let upd = nf.update(&reply(20.0, -0.080, 0.010), GEN, &p).unwrap();
        assert_eq!(upd.branch, 2);
        assert!((upd.mid - 0.0).abs() < 1e-3, "mid {}", upd.mid);
        assert!(upd.lo <= upd.mid && upd.mid <= upd.hi);
    }

    #[test]
    fn upper_leg_spike_takes_branch_three() {
        let mut nf = PacketFilter::new();
        let p = params();

        for i in 0..20 {
            nf.update(&reply(i as f64, -0.010, 0.010), GEN, &p).unwrap();
        }
        let upd = nf.update(&reply(20.0, -0.010, 0.080), GEN, &p).unwrap();
        assert_eq!(upd.branch, 3);
        assert!((upd.mid - 0.0).abs() < 1e-3, "mid {}", upd.mid);
        assert!(upd.lo <= upd.mid && upd.mid <= upd.hi);
    }

    #[test]
    fn symmetric_spike_takes_branch_one() {
        let mut nf = PacketFilter::new();
        let p = params();

        for i in 0..20 {
            nf.update(&reply(i as f64, -0.010, 0.010), GEN, &p).unwrap();
        }
        let upd = nf.update(&reply(20.0, -0.080, 0.080), GEN, &p).unwrap();
        assert_eq!(upd.branch, 1);
        // Symmetric congestion: the midpoint is kept as measured.
        assert!(upd.mid.abs() < 1e-3);
    }

    #[test]
    fn suspect_samples_barely_move_the_averages() {
        let mut nf = PacketFilter::new();
        let p = params();

        for i in 0..20 {
            nf.update(&reply(i as f64, -0.010, 0.010), GEN, &p).unwrap();
        }
        let alo_before = nf.alo;
        nf.update(&reply(20.0, -0.500, 0.010), GEN, &p).unwrap();
        // With divisor navg^2 = 400, a 0.5 s excursion moves alo by ~1 ms.
        assert!((nf.alo - alo_before).abs() < 2e-3);
    }

    #[test]
    fn trust_follows_stratum() {
        let p = params();
        for (stratum, want) in [(1u8, 1.0), (2, 0.5), (14, 1.0 / 14.0), (15, 0.0)] {
            let mut nf = PacketFilter::new();
            let mut pkt = reply(0.0, -0.01, 0.01);
            pkt.stratum = stratum;
            let upd = nf.update(&pkt, GEN, &p).unwrap();
            assert_eq!(upd.trust, want, "stratum {stratum}");
        }
    }

    #[test]
    fn generation_change_resets_averages() {
        let mut nf = PacketFilter::new();
        let p = params();

        for i in 0..10 {
            nf.update(&reply(i as f64, -0.010, 0.010), GEN, &p).unwrap();
        }
        assert!(nf.navg > 5.0);

        let upd = nf.update(&reply(10.0, -0.010, 0.010), GEN.next(), &p).unwrap();
        assert_eq!(nf.navg, 1.0);
        // First sample of the new generation: averages restart from it.
        assert_eq!(nf.alo, upd.lo);
        assert_eq!(nf.ahi, upd.hi);

        // Same generation again: no further reset.
        nf.update(&reply(11.0, -0.010, 0.010), GEN.next(), &p).unwrap();
        assert_eq!(nf.navg, 2.0);
    }
}
