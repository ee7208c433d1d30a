// The standard PLL.
//
// Locks the local clock to the combined offset estimate in four phases:
// wait for a credible estimate, step the bulk of the offset out, settle,
// then track with a proportional-integral loop whose gains stiffen once
// the frequency capture is done. The confidence weight from the combiner
// gates how aggressive the loop is allowed to be.

use tracing::debug;

use crate::params::Params;
use crate::timebase::Generation;
use crate::timestamp::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PllMode {
    Startup,
    AwaitStep,
    PostStep,
    Track,
}

impl PllMode {
    /// Numeric form for the `PLL` trace record.
    pub const fn as_int(self) -> u8 {
        match self {
            PllMode::Startup => 0,
            PllMode::AwaitStep => 1,
            PllMode::PostStep => 2,
            PllMode::Track => 3,
        }
    }
}

/// What one tick decided; the driver applies it to the timebase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PllUpdate {
    pub mode: PllMode,
    pub dt: f64,
    pub p_term: f64,
    pub duration: f64,
    pub integrator: f64,
    pub used_a: f64,
    pub used_b: f64,
    /// Phase step to apply, already negated.
    pub step: Option<f64>,
}

impl PllUpdate {
    /// True when the tick produced a slew window for the timebase.
    pub fn wants_adjust(&self) -> bool {
        self.duration > 0.0
    }
}

#[derive(Debug, Clone)]
pub struct Pll {
    mode: PllMode,
    t0: Timestamp,
    a: f64,
    b: f64,
    integrator: f64,
    last_time: Timestamp,
    generation: Option<Generation>,
}

impl Default for Pll {
    fn default() -> Self {
        Self::new()
    }
}

impl Pll {
    pub fn new() -> Pll {
        Pll {
            mode: PllMode::Startup,
            t0: Timestamp::default(),
            a: 0.0,
            b: 0.0,
            integrator: 0.0,
            last_time: Timestamp::default(),
            generation: None,
        }
    }

    pub const fn mode(&self) -> PllMode {
        self.mode
    }

    /// One tick: fold the latest combined estimate into the control loop.
    pub fn update(
        &mut self,
        now: Timestamp,
        offset: f64,
        weight: f64,
        generation: Generation,
        params: &Params,
    ) -> PllUpdate {
        let mut p_term = 0.0;
        let mut dur = 0.0;
        let mut dt = 0.0;
        let mut used_a = 0.0;
        let mut used_b = 0.0;
        let mut step = None;

        if self.generation != Some(generation) {
            self.mode = PllMode::Startup;
            self.generation = Some(generation);
        }

        match self.mode {
            PllMode::Startup => {
                self.t0 = now;
                self.a = params.pll_std_p_init;
                self.b = 0.0;
                self.mode = PllMode::AwaitStep;
            }

            PllMode::AwaitStep => {
                // Hold until the estimate has both age and confidence;
                // stepping on the first wild sample helps nobody.
                let rt = now.diff(&self.t0);
                if rt > 2.0 && weight > 3.0 {
                    if offset.abs() > 1e-3 {
                        step = Some(-offset);
                    }
                    self.mode = PllMode::PostStep;
                    self.t0 = now;
                }
            }

            PllMode::PostStep => {
                let rt = now.diff(&self.t0);
                if rt > 6.0 {
                    self.b = self.a / params.pll_std_i_init;
                    self.t0 = now;
                    self.mode = PllMode::Track;
                }
            }

            PllMode::Track => {
                let rt = now.diff(&self.t0);
                assert!(rt > 0.0);

                dt = now.diff(&self.last_time);
                assert!(dt > 0.0);

                if weight > 3.0 && offset.abs() > params.pll_std_step_limit {
                    // An offset this size would take hours to slew out at
                    // the clamped rate. Step it; the generation bump
                    // restarts the pipeline from scratch.
                    step = Some(-offset);
                    self.t0 = now;
                } else {
                    // Threshold-based gain scheduling on the weight keeps
                    // horribly distant servers from injecting noise into
                    // the very reactive default gains.
                    if weight < 50.0 {
                        used_a = 3e-2;
                        used_b = 5e-4;
                    } else if weight < 150.0 {
                        used_a = 6e-2;
                        used_b = 1e-3;
                    } else {
                        if rt > params.pll_std_capture_time && self.a > params.pll_std_p_limit {
                            self.a *= params.pll_std_stiffen_rate.powf(dt);
                            self.b *= params.pll_std_stiffen_rate.powf(dt);
                        }
                        used_a = self.a;
                        used_b = self.b;
                    }
                    p_term = -offset * used_a;
                    self.integrator += p_term * used_b;
                    dur = dt;
                }
            }
        }

        dur = dur.ceil();

        let clamp = dur * 500e-6;
        p_term = p_term.clamp(-clamp, clamp);

        self.last_time = now;

        if self.mode != PllMode::Track || step.is_some() {
            debug!(mode = self.mode.as_int(), offset, weight, ?step, "pll state");
        }

        PllUpdate {
            mode: self.mode,
            dt,
            p_term,
            duration: dur,
            integrator: self.integrator,
            used_a,
            used_b,
            step,
        }
    }
}
