//! The passive poller: record server replies as a trace for later
//! analysis or replay. Never touches the clock.

use clocksteer_clock::UnixTimebase;
use clocksteer_proto::{Params, Timebase};
use clocksteer_udp::TimedSocket;

use crate::config::PollServerArgs;
use crate::driver::{ClockSource, Driver, PollAction, TaskKind, MONITOR_PERIOD};
use crate::peer::Peer;
use crate::simfile::TRACE_HEADER;
use crate::tracer::{trace_rec, Tracer};
use crate::Error;

pub fn run(args: PollServerArgs) -> Result<(), Error> {
    if args.duration < 1.0 {
        return Err(Error::Usage("invalid -d argument".to_owned()));
    }

    let tracer = match args.tracefile.as_deref() {
        Some(path) => Tracer::open(path).map_err(|source| Error::TraceFile {
            path: path.to_owned(),
            source,
        })?,
        None => Tracer::stdout(),
    };

    let mut driver = Driver::new(
        ClockSource::Unix(UnixTimebase::passive()),
        Params::default(),
        tracer,
    );
    driver.poll_action = PollAction::Record;

    let mut npeer = 0;
    for hostname in &args.servers {
        npeer += driver.peers.add_hostname(hostname)?;
    }
    trace_rec!(driver.tracer, "{}", TRACE_HEADER);
    trace_rec!(driver.tracer, "# Found {} peers", npeer);
    if npeer == 0 {
        return Err(Error::NoPeers);
    }
    for np in driver.peers.iter() {
        let (host, ip) = (np.hostname.clone(), np.ip.clone());
        trace_rec!(driver.tracer, "# Peer {} {}", host, ip);
    }

    if let Some(hostname) = &args.monitor {
        let mon = Peer::lookup(hostname)?;
        trace_rec!(driver.tracer, "# Monitor {} {}", mon.hostname, mon.ip);
        driver.monitor = Some(mon);
    }

    driver.socket = Some(TimedSocket::open()?);

    let now = driver.timebase.now();
    driver
        .todo
        .schedule_rel(now, args.duration, 0.0, TaskKind::EndRun, "End task");
    if driver.monitor.is_some() {
        driver
            .todo
            .schedule_rel(now, 0.0, MONITOR_PERIOD, TaskKind::Monitor, "Monitor");
    }
    driver.begin_polling();

    driver.run()?;
    Ok(())
}
