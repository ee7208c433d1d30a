//! The steering client: poll the given servers and discipline the
//! kernel clock.

use std::sync::atomic::{AtomicBool, Ordering};

use clocksteer_clock::UnixTimebase;
use clocksteer_proto::{Params, Timebase};
use clocksteer_udp::TimedSocket;
use tracing::debug;

use crate::config::{self, ClientArgs, TweakOutcome};
use crate::driver::{ClockSource, Driver};
use crate::tracer::{trace_rec, Tracer};
use crate::Error;

/// Set by SIGHUP; the top loop re-arms polling when it sees it. Starts
/// true so the first pass through the loop is the initial arm.
static RESTART: AtomicBool = AtomicBool::new(true);

extern "C" fn on_sighup(_sig: libc::c_int) {
    RESTART.store(true, Ordering::Relaxed);
}

/// Install the handler without SA_RESTART, so the scheduler's sleep
/// returns with EINTR and the restart flag gets looked at promptly.
fn install_sighup() {
    let handler: extern "C" fn(libc::c_int) = on_sighup;
    // SAFETY: sigaction with a handler that only touches an atomic.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler as usize;
        sa.sa_flags = 0;
        libc::sigemptyset(&mut sa.sa_mask);
        let rc = libc::sigaction(libc::SIGHUP, &sa, std::ptr::null_mut());
        assert_eq!(rc, 0, "sigaction(SIGHUP) cannot fail");
    }
}

pub fn run(args: ClientArgs) -> Result<(), Error> {
    let mut params = Params::default();

    let mut servers = args.servers.clone();
    if let Some(path) = &args.config {
        servers.extend(config::load_config(path, &mut params)?);
    }
    if config::apply_tweaks(&mut params, &args.param)? == TweakOutcome::QueryHandled {
        return Ok(());
    }

    let tracer = Tracer::from_arg(args.tracefile.as_deref()).map_err(|source| Error::TraceFile {
        path: args.tracefile.clone().unwrap_or_default(),
        source,
    })?;

    let mut driver = Driver::new(ClockSource::Unix(UnixTimebase::active()), params, tracer);

    let mut npeer = 0;
    for hostname in &servers {
        npeer += driver.peers.add_hostname(hostname)?;
    }
    if npeer == 0 {
        return Err(Error::NoPeers);
    }

    trace_rec!(driver.tracer, "# NTIMED Format client 1.0");
    trace_rec!(driver.tracer, "# Found {} peers", npeer);
    config::report_params(&mut driver.tracer, &driver.params);

    driver.socket = Some(TimedSocket::open()?);
    driver.register_sources();

    install_sighup();
    loop {
        if RESTART.swap(false, Ordering::Relaxed) {
            debug!("RESTART");
            // A fresh generation makes every filter and the PLL start
            // over; stale intervals must not steer a re-polled clock.
            driver.timebase.bump_generation();
            driver.begin_polling();
        }
        driver.run()?;
        if !RESTART.load(Ordering::Relaxed) {
            return Ok(());
        }
    }
}
