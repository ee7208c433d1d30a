//! The trace channel.
//!
//! Traces are the machine-readable record stream (`Now`, `Poll`,
//! `NTP_Filter`, `PLL`, ...) that the poll-server emits and the simulator
//! consumes; think `/var/run/stats`, not logging. Diagnostics and debug
//! chatter go through `tracing` instead and end up on stderr.
//!
//! Writes are flushed per record: the reader on the other end of a pipe
//! is often a live plot.

use std::fs::File;
use std::io::{self, Write};

use tracing::warn;

enum Dest {
    Stdout(io::Stdout),
    File(File),
    Memory(Vec<u8>),
}

/// Record writer for `-t tracefile`; `-` means stdout, absent means the
/// trace channel is disabled and every record is dropped.
pub struct Tracer {
    dst: Option<Dest>,
    failed: bool,
}

impl Tracer {
    pub fn disabled() -> Tracer {
        Tracer {
            dst: None,
            failed: false,
        }
    }

    pub fn stdout() -> Tracer {
        Tracer {
            dst: Some(Dest::Stdout(io::stdout())),
            failed: false,
        }
    }

    pub fn open(path: &str) -> io::Result<Tracer> {
        if path == "-" {
            return Ok(Tracer::stdout());
        }
        Ok(Tracer {
            dst: Some(Dest::File(File::create(path)?)),
            failed: false,
        })
    }

    /// From the optional `-t` argument.
    pub fn from_arg(arg: Option<&str>) -> io::Result<Tracer> {
        match arg {
            Some(path) => Tracer::open(path),
            None => Ok(Tracer::disabled()),
        }
    }

    /// Capture records in memory; tests assert on the stream.
    pub fn memory() -> Tracer {
        Tracer {
            dst: Some(Dest::Memory(Vec::new())),
            failed: false,
        }
    }

    pub fn captured(&self) -> Option<&[u8]> {
        match &self.dst {
            Some(Dest::Memory(buf)) => Some(buf),
            _ => None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.dst.is_some()
    }

    /// Write one record line. A failing trace destination must not take
    /// the clock discipline down with it; the failure is reported once.
    pub fn record(&mut self, args: std::fmt::Arguments<'_>) {
        let Some(dst) = &mut self.dst else { return };
        let result = match dst {
            Dest::Stdout(out) => writeln!(out, "{args}").and_then(|_| out.flush()),
            Dest::File(file) => writeln!(file, "{args}").and_then(|_| file.flush()),
            Dest::Memory(buf) => writeln!(buf, "{args}"),
        };
        if let Err(err) = result {
            if !self.failed {
                warn!(%err, "trace output failed; further records are dropped");
                self.failed = true;
            }
            self.dst = None;
        }
    }
}

/// `trace_rec!(tracer, "Poll {} {} {}", ...)` — one trace record.
macro_rules! trace_rec {
    ($tracer:expr, $($arg:tt)*) => {
        $tracer.record(format_args!($($arg)*))
    };
}
pub(crate) use trace_rec;
