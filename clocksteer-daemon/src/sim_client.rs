//! The simulation client: replay a recorded poll trace against the
//! virtual clock. Same pipeline as the steering client, with the UDP
//! layer replaced by the trace reader; used for offline tuning of the
//! filter, combiner and PLL parameters.

use std::io::BufRead;

use clocksteer_proto::{Params, Timebase};

use crate::config::{self, SimClientArgs, TweakOutcome};
use crate::driver::{ClockSource, Driver, TaskKind};
use crate::sim::SimTimebase;
use crate::simfile::SimFile;
use crate::tracer::Tracer;
use crate::Error;

pub fn run(args: SimClientArgs) -> Result<(), Error> {
    let mut params = Params::default();
    if config::apply_tweaks(&mut params, &args.param)? == TweakOutcome::QueryHandled {
        return Ok(());
    }

    let tracer = Tracer::from_arg(args.tracefile.as_deref()).map_err(|source| Error::TraceFile {
        path: args.tracefile.clone().unwrap_or_default(),
        source,
    })?;

    let bumps = args
        .bump
        .iter()
        .map(|arg| config::parse_bump(arg))
        .collect::<Result<Vec<_>, _>>()?;

    let mut driver = build(params, &bumps, tracer);
    let reader = SimFile::open(&args.simfile, &mut driver.peers)?;
    finish(&mut driver, reader)?;
    Ok(())
}

/// Wire up a simulation driver: virtual clock, 1 Hz kernel model, and
/// any scheduled oscillator disturbances.
pub fn build(params: Params, bumps: &[(f64, f64, f64)], tracer: Tracer) -> Driver {
    let mut driver = Driver::new(ClockSource::Sim(SimTimebase::new()), params, tracer);
    let now = driver.timebase.now();
    driver
        .todo
        .schedule_rel(now, 0.0, 1.0, TaskKind::SimKernPll, "SIMPLL");
    for (when, freq, phase) in bumps {
        driver.todo.schedule_rel(
            now,
            *when,
            0.0,
            TaskKind::SimBump {
                freq: *freq,
                phase: *phase,
            },
            "BUMP",
        );
    }
    config::report_params(&mut driver.tracer, &driver.params);
    driver
}

/// Attach the trace reader and run to completion.
pub fn finish(driver: &mut Driver, reader: SimFile) -> Result<(), Error> {
    driver.sim_reader = Some(reader);
    driver.register_sources();
    let now = driver.timebase.now();
    driver
        .todo
        .schedule_rel(now, 0.0, 0.0, TaskKind::SimReadLine, "Readline");
    driver.run()?;
    Ok(())
}

/// Replay a trace from any reader; the end-to-end tests drive this.
pub fn run_replay(
    input: Box<dyn BufRead>,
    name: &str,
    params: Params,
    bumps: &[(f64, f64, f64)],
    tracer: Tracer,
) -> Result<Driver, Error> {
    let mut driver = build(params, bumps, tracer);
    let reader = SimFile::from_reader(input, name, &mut driver.peers)?;
    finish(&mut driver, reader)?;
    Ok(driver)
}
