//! The arithmetic self-test behind `clocksteer run-tests`.
//!
//! Adds a grid of deltas to the current time and checks that the
//! difference comes back to within half a nanosecond. Exists so a port
//! to a new platform can prove the fixed-point arithmetic before anyone
//! lets it near a clock.

use clocksteer_clock::UnixTimebase;
use clocksteer_proto::{self_test_step, Timebase, SELF_TEST_DELTAS};

use crate::Error;

pub fn run() -> Result<(), Error> {
    let tb = UnixTimebase::passive();
    let ts = tb.now();

    let mut failures = 0;
    for off in SELF_TEST_DELTAS {
        let err = self_test_step(&ts, off);
        let ok = err.abs() < 5e-10;
        println!(
            "{} + {:12.9} = {} {:8.1e} {}",
            ts,
            off,
            ts.plus(off),
            err,
            if ok { "OK" } else { "ERR" }
        );
        if !ok {
            failures += 1;
        }
    }
    println!("timestamp self-test: {failures} failures");

    if failures > 0 {
        return Err(Error::SelfTest(failures));
    }
    Ok(())
}
