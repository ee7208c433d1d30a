//! Tunable parameters.
//!
//! Every knob reachable from the command line is declared exactly once in
//! the `params!` invocation below, together with its bounds, default and
//! a not too terse documentation string. The macro expands into the
//! `Params` struct the algorithms read, plus the spec table the CLI uses
//! for listing, querying and bounds-checking tweaks.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub min: f64,
    pub max: f64,
    pub default: f64,
    pub doc: &'static str,
}

impl ParamSpec {
    pub fn find(name: &str) -> Option<&'static ParamSpec> {
        PARAM_SPECS.iter().find(|spec| spec.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamError {
    Unknown(String),
    BelowMin { name: &'static str, min: f64, value: f64 },
    AboveMax { name: &'static str, max: f64, value: f64 },
}

impl std::fmt::Display for ParamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamError::Unknown(name) => {
                write!(f, "unknown parameter '{name}' (try '?')")
            }
            ParamError::BelowMin { name, min, value } => {
                write!(f, "parameter '{name}': {value} below minimum {min}")
            }
            ParamError::AboveMax { name, max, value } => {
                write!(f, "parameter '{name}': {value} above maximum {max}")
            }
        }
    }
}

impl std::error::Error for ParamError {}

macro_rules! params {
    ($(($name:ident, $min:expr, $max:expr, $def:expr, $doc:expr)),+ $(,)?) => {
        /// The resolved parameter values threaded through the pipeline.
        #[derive(Debug, Clone, Serialize, Deserialize)]
        #[serde(default)]
        pub struct Params {
            $(pub $name: f64,)+
        }

        impl Default for Params {
            fn default() -> Params {
                Params { $($name: $def,)+ }
            }
        }

        pub const PARAM_SPECS: &[ParamSpec] = &[
            $(ParamSpec {
                name: stringify!($name),
                min: $min,
                max: $max,
                default: $def,
                doc: $doc,
            },)+
        ];

        impl Params {
            /// Set one parameter by name, enforcing its declared bounds.
            pub fn set(&mut self, name: &str, value: f64) -> Result<(), ParamError> {
                match name {
                    $(stringify!($name) => {
                        if value < $min {
                            return Err(ParamError::BelowMin {
                                name: stringify!($name), min: $min, value,
                            });
                        }
                        if value > $max {
                            return Err(ParamError::AboveMax {
                                name: stringify!($name), max: $max, value,
                            });
                        }
                        self.$name = value;
                        Ok(())
                    })+
                    _ => Err(ParamError::Unknown(name.to_owned())),
                }
            }

            pub fn get(&self, name: &str) -> Option<f64> {
                match name {
                    $(stringify!($name) => Some(self.$name),)+
                    _ => None,
                }
            }
        }
    };
}

params! {
    (ntp_filter_average, 3.0, 1e3, 20.0,
     "Exponential average divisor for average packet delays. The value \
      chosen is a compromise between gliding through congestion of common \
      durations and reacting to large-scale routing changes in a timely \
      manner. In reality there is no way to tell the two apart."),
    (ntp_filter_threshold, 0.01, 10.0, 3.0,
     "Packet delays exceeding the average by this factor are \
      untrustworthy. Setting this too high increases noise from (mild) \
      congestion. Setting it too low throws away adequate timestamps."),
    (combine_quorum, 1.0, 100.0, 1.0,
     "Minimum number of trusted sources whose interval must contain the \
      combined estimate before it is accepted. Sources with zero trust \
      never count. Raise this when polling enough servers that a single \
      falseticker should not be able to carry the estimate alone."),
    (poll_period, 16.0, 4096.0, 64.0,
     "Steady-state seconds between polls of the same server. The spacing \
      between consecutive polls of different servers is this divided by \
      the number of servers."),
    (pll_std_p_init, 1e-3, 0.50, 0.33,
     "Proportional term when PLL starts. Reducing this will make the PLL \
      more resistant to measurement noise and jitter, but also makes it \
      converge slower. Increasing this will almost certainly cause \
      oscillation."),
    (pll_std_i_init, 10.0, 1000.0, 60.0,
     "Initial P/I ratio when PLL starts. Reducing this speeds up \
      convergence, but risks overshoot. Increasing this will slow \
      convergence and reduce impact of noise."),
    (pll_std_capture_time, 20.0, 1e6, 300.0,
     "Capture time before stiffening PLL. After this many seconds, the \
      PLL will start to stiffen the P and I terms to gain noise immunity. \
      Decreasing risks that initial frequency capture is not finished, \
      which will increase the offset-excursion. Increasing just delays \
      this stiffening."),
    (pll_std_stiffen_rate, 0.5, 1.0, 0.999,
     "Rate of PLL P/I term stiffening. The exponential stiffening per \
      second of P and I terms. Decreasing makes stiffening faster. \
      Increasing makes stiffening slower."),
    (pll_std_p_limit, 1e-6, 0.50, 3e-2,
     "Lower limit for the proportional term. Reducing this will make the \
      PLL more resistant to noise, but going too far it will not be able \
      to steer the clock fast enough. Increasing this makes the PLL more \
      agile and prone to noise."),
    (pll_std_step_limit, 1e-3, 10.0, 0.128,
     "Offset beyond which the tracking PLL gives up on slewing and steps \
      the clock instead. A step resets the whole measurement pipeline, so \
      this should stay well above any offset the servers' noise can \
      produce."),
}
