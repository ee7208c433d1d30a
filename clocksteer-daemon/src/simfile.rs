//! Trace replay for the simulation client.
//!
//! The input is a poll-server trace: a fixed header naming the peers,
//! then `Now` lines that advance the virtual clock and `Poll` lines that
//! carry one recorded server reply each. Replies are injected into the
//! matching peer with the simulation's accumulated clock tweak added to
//! the locally measured timestamps, so the recorded exchange behaves as
//! if it had been measured on the steered clock.

use std::fs::File;
use std::io::{BufRead, BufReader};

use clocksteer_proto::{NtpPacket, Timebase, Timestamp};
use tracing::debug;

use crate::driver::{Driver, TaskKind};
use crate::peerset::PeerSet;
use crate::todo::TaskStatus;
use crate::Error;

pub const TRACE_HEADER: &str = "# NTIMED Format poll-server 1.0";

pub struct SimFile {
    input: Box<dyn BufRead>,
    name: String,
    n_peer: usize,
    /// Maps trace seconds onto virtual-clock seconds; fixed by the first
    /// `Now` line.
    anchor: Option<i64>,
}

impl SimFile {
    pub fn open(path: &str, peers: &mut PeerSet) -> Result<SimFile, Error> {
        let file = File::open(path).map_err(|source| Error::SimOpen {
            path: path.to_owned(),
            source,
        })?;
        SimFile::from_reader(Box::new(BufReader::new(file)), path, peers)
    }

    /// Parse the header and register the recorded peers.
    pub fn from_reader(
        input: Box<dyn BufRead>,
        name: &str,
        peers: &mut PeerSet,
    ) -> Result<SimFile, Error> {
        let mut sf = SimFile {
            input,
            name: name.to_owned(),
            n_peer: 0,
            anchor: None,
        };

        let mut state = 0;
        let mut found = 0;
        while state < 3 {
            let line = sf.next_line()?.ok_or(Error::SimHeaderEof)?;
            if line.is_empty() {
                continue;
            }
            match state {
                0 => {
                    if line != TRACE_HEADER {
                        return Err(Error::SimFormat(sf.name.clone()));
                    }
                    state = 1;
                }
                1 => {
                    sf.n_peer = line
                        .strip_prefix("# Found ")
                        .and_then(|rest| rest.strip_suffix(" peers"))
                        .and_then(|n| n.parse().ok())
                        .ok_or(Error::SimHeader("# Found ... peers"))?;
                    if sf.n_peer == 0 {
                        return Err(Error::NoPeers);
                    }
                    state = 2;
                }
                2 => {
                    let mut fields = line
                        .strip_prefix("# Peer ")
                        .map(str::split_whitespace)
                        .ok_or(Error::SimHeader("# Peer"))?;
                    let hostname = fields.next().ok_or(Error::SimHeader("# Peer"))?;
                    let ip = fields.next().ok_or(Error::SimHeader("# Peer"))?;
                    peers.add_sim(hostname, ip);
                    found += 1;
                    if found == sf.n_peer {
                        state = 3;
                    }
                }
                _ => unreachable!(),
            }
        }
        Ok(sf)
    }

    fn next_line(&mut self) -> Result<Option<String>, Error> {
        let mut line = String::new();
        let n = self
            .input
            .read_line(&mut line)
            .map_err(|source| Error::SimOpen {
                path: self.name.clone(),
                source,
            })?;
        if n == 0 {
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }

    /// Consume lines until the next `Now` instant that lies measurably in
    /// the virtual future, then schedule ourselves for it. Lines with
    /// unrecognised prefixes are ignored.
    pub fn read_tick(&mut self, driver: &mut Driver) -> Result<TaskStatus, Error> {
        let t0 = driver.timebase.now();

        loop {
            let Some(line) = self.next_line()? else {
                debug!(file = %self.name, "EOF on sim file");
                return Ok(TaskStatus::Fail);
            };

            if let Some(rest) = line.strip_prefix("Now ") {
                let stamp = rest
                    .split_whitespace()
                    .next()
                    .ok_or_else(|| Error::SimParse(line.clone()))?;
                let (sec, nsec) = stamp
                    .split_once('.')
                    .and_then(|(s, n)| Some((s.parse::<i64>().ok()?, n.parse::<i64>().ok()?)))
                    .ok_or_else(|| Error::SimParse(line.clone()))?;

                let anchor = *self
                    .anchor
                    .get_or_insert(sec - t0.seconds() as i64);
                let when_sec = sec - anchor;
                if when_sec < 0 || !(0..1_000_000_000).contains(&nsec) {
                    return Err(Error::SimParse(line.clone()));
                }
                let when = Timestamp::nanosec(when_sec, nsec);
                if when.diff(&t0) >= 1e-3 {
                    driver
                        .todo
                        .schedule_abs(when, 0.0, TaskKind::SimReadLine, "Readline");
                    return Ok(TaskStatus::Ok);
                }
            } else if let Some(rest) = line.strip_prefix("Poll ") {
                self.inject(driver, rest)?;
            }
            // We ignore things we don't understand.
        }
    }

    /// Hand one recorded reply to the peer it belongs to.
    fn inject(&self, driver: &mut Driver, rest: &str) -> Result<(), Error> {
        let (hostname, rest) = rest
            .split_once(' ')
            .ok_or_else(|| Error::SimParse(rest.to_owned()))?;
        let (ip, pkt) = rest
            .split_once(' ')
            .ok_or_else(|| Error::SimParse(rest.to_owned()))?;

        let id = driver
            .peers
            .find(hostname, ip)
            .ok_or_else(|| Error::SimUnknownPeer(hostname.to_owned(), ip.to_owned()))?;

        let mut rx = NtpPacket::parse_trace(pkt)?;

        // The recording was made against an unsteered clock; shift the
        // locally measured timestamps by everything we have tweaked since.
        let delta = driver
            .timebase
            .sim()
            .expect("sim trace replay on the real clock")
            .delta();
        rx.origin.add(delta);
        if let Some(ts_rx) = rx.ts_rx.as_mut() {
            ts_rx.add(delta);
        }

        let np = driver.peers.get_mut(id);
        np.tx_pkt.transmit = rx.origin;
        np.rx_pkt = Some(rx);

        driver.run_filter_chain(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(s: &str) -> Box<dyn BufRead> {
        Box::new(std::io::Cursor::new(s.to_owned()))
    }

    #[test]
    fn header_registers_peers() {
        let text = "# NTIMED Format poll-server 1.0\n\
                    # Found 2 peers\n\
                    # Peer a.example 192.0.2.1\n\
                    # Peer b.example 192.0.2.2\n";
        let mut peers = PeerSet::new();
        let sf = SimFile::from_reader(reader(text), "test", &mut peers).unwrap();
        assert_eq!(sf.n_peer, 2);
        assert_eq!(peers.len(), 2);
        assert_eq!(peers.find("b.example", "192.0.2.2"), Some(1));
    }

    #[test]
    fn wrong_magic_is_fatal() {
        let mut peers = PeerSet::new();
        let result = SimFile::from_reader(
            reader("# SOMETHING ELSE 2.0\n# Found 1 peers\n"),
            "test",
            &mut peers,
        );
        assert!(matches!(result, Err(Error::SimFormat(_))));
    }

    #[test]
    fn truncated_header_is_fatal() {
        let mut peers = PeerSet::new();
        let result = SimFile::from_reader(
            reader("# NTIMED Format poll-server 1.0\n# Found 3 peers\n# Peer a 10.0.0.1\n"),
            "test",
            &mut peers,
        );
        assert!(matches!(result, Err(Error::SimHeaderEof)));
    }

    #[test]
    fn missing_found_line_is_fatal() {
        let mut peers = PeerSet::new();
        let result = SimFile::from_reader(
            reader("# NTIMED Format poll-server 1.0\n# Peer a 10.0.0.1\n"),
            "test",
            &mut peers,
        );
        assert!(matches!(result, Err(Error::SimHeader(_))));
    }
}
