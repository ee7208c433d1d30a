// Source combiner based on delta-pdfs.
//
// Each source hands us four values:
//   - the highest low value where the probability is zero,
//   - the lowest high value where the probability is zero,
//   - the most probable value in between,
//   - the relative trust in that value [0..1].
// Together these define a triangular probability density with area equal
// to the trust. The combiner adds all the densities together and picks
// the highest point that enough trusted sources can vouch for.
//
// The sum of triangles is piecewise linear between the sources' {lo, mid,
// hi} breakpoints, so the maximum sits on a breakpoint and evaluating
// only those is exact.

use tracing::debug;

use crate::timebase::Generation;

/// Evaluations must clear this density before they can become the
/// estimate; a lone source with a very wide or distrusted interval
/// produces no estimate at all.
const MIN_DENSITY: f64 = 1.0;

/// Floor added to every evaluation so single-source plots on a log axis
/// stay finite. Never decides an argmax on its own.
const DENSITY_FLOOR: f64 = 1e-3;

/// Handle to one combiner slot; owned by the peer that publishes into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceId(usize);

#[derive(Debug, Clone)]
struct Source {
    trust: f64,
    lo: f64,
    mid: f64,
    hi: f64,
    generation: Option<Generation>,
}

/// The combined estimate: the argmax of the summed density and the
/// density there. The density doubles as the confidence weight the PLL
/// keys its gain scheduling off.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    pub offset: f64,
    pub weight: f64,
}

#[derive(Debug, Default)]
pub struct Combiner {
    sources: Vec<Source>,
}

impl Combiner {
    pub fn new() -> Combiner {
        Combiner::default()
    }

    pub fn add_source(&mut self) -> SourceId {
        self.sources.push(Source {
            trust: 0.0,
            lo: f64::NAN,
            mid: f64::NAN,
            hi: f64::NAN,
            generation: None,
        });
        SourceId(self.sources.len() - 1)
    }

    /// Replace a source's interval. Sign convention: local minus remote,
    /// positive means the local clock is ahead.
    pub fn publish(
        &mut self,
        id: SourceId,
        trust: f64,
        lo: f64,
        mid: f64,
        hi: f64,
        generation: Generation,
    ) {
        assert!((0.0..=1.0).contains(&trust));
        let src = &mut self.sources[id.0];
        src.trust = trust;
        src.lo = lo;
        src.mid = mid;
        src.hi = hi;
        src.generation = Some(generation);
    }

    fn is_active(src: &Source, generation: Generation) -> bool {
        src.generation == Some(generation) && src.lo < src.hi
    }

    /// Density of the summed pdf at `x`, plus the number of trusted
    /// sources whose interval contains `x`.
    fn eval(&self, x: f64, generation: Generation) -> (f64, usize) {
        let mut prob = DENSITY_FLOOR;
        let mut quorum = 0;

        for src in &self.sources {
            if !Self::is_active(src, generation) || x < src.lo || x > src.hi {
                continue;
            }
            if src.trust > 0.0 {
                quorum += 1;
            }
            let width = src.hi - src.lo;
            // At the apex both legs agree on 2t/w; evaluating it directly
            // also covers triangles degenerate on one side.
            prob += if x == src.mid {
                2.0 * src.trust / width
            } else if x < src.mid {
                src.trust * 2.0 * (x - src.lo) / (width * (src.mid - src.lo))
            } else {
                src.trust * 2.0 * (src.hi - x) / (width * (src.hi - src.mid))
            };
        }
        (prob, quorum)
    }

    /// Find the estimate: the breakpoint maximizing the summed density
    /// among those contained in at least `quorum` trusted intervals.
    /// Ties go to the smaller offset. With nothing above the density
    /// threshold the result is the neutral `(0, 1)`.
    pub fn find_peak(&self, generation: Generation, quorum: usize) -> Peak {
        let mut best: Option<(f64, f64)> = None;

        for src in &self.sources {
            if !Self::is_active(src, generation) {
                continue;
            }
            for x in [src.lo, src.mid, src.hi] {
                let (prob, q) = self.eval(x, generation);
                if q < quorum || prob <= MIN_DENSITY {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some((bx, bp)) => prob > bp || (prob == bp && x < bx),
                };
                if better {
                    best = Some((x, prob));
                }
            }
        }

        let (offset, weight) = best.unwrap_or((0.0, MIN_DENSITY));
        debug!(offset, weight, "combined estimate");
        Peak { offset, weight }
    }
}
