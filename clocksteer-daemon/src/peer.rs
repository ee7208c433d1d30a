//! One remote NTP server: its resolved address, the request template,
//! the latest reply, and the poll transaction.

use std::net::{SocketAddr, ToSocketAddrs};

use clocksteer_proto::{NtpPacket, PacketFilter, SourceId, Timebase, PACKET_LEN};
use clocksteer_udp::{RecvOutcome, TimedSocket};
use tracing::debug;

use crate::Error;

pub const NTP_PORT: u16 = 123;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Active,
    Available,
    Unsynchronized,
    Unresponsive,
    Unreachable,
    Multihome,
    /// Same socket address as an earlier peer; never polled itself.
    Duplicate,
}

#[derive(Debug)]
pub struct Peer {
    /// Hostname as supplied on the command line or in the trace header.
    pub hostname: String,
    /// Numeric rendering of the address, stable across re-resolution.
    pub ip: String,
    /// Simulated peers have no address; polling one is a program error.
    pub addr: Option<SocketAddr>,
    pub tx_pkt: NtpPacket,
    pub rx_pkt: Option<NtpPacket>,
    pub filter: PacketFilter,
    /// Combiner slot, assigned when the steering pipeline is wired up.
    pub source: Option<SourceId>,
    /// Index of the peer group (one group per supplied hostname).
    pub group: Option<usize>,
    pub state: PeerState,
    /// For duplicates: link toward the peer that owns the address.
    pub other: Option<usize>,
}

impl Peer {
    pub fn new(hostname: &str, addr: SocketAddr, group: Option<usize>) -> Peer {
        Peer {
            hostname: hostname.to_owned(),
            ip: addr.ip().to_string(),
            addr: Some(addr),
            tx_pkt: NtpPacket::client_request(),
            rx_pkt: None,
            filter: PacketFilter::new(),
            source: None,
            group,
            state: PeerState::New,
            other: None,
        }
    }

    /// A peer reconstructed from a trace header; it is only ever fed
    /// synthesized replies.
    pub fn new_sim(hostname: &str, ip: &str, group: Option<usize>) -> Peer {
        Peer {
            hostname: hostname.to_owned(),
            ip: ip.to_owned(),
            addr: None,
            tx_pkt: NtpPacket::client_request(),
            rx_pkt: None,
            filter: PacketFilter::new(),
            source: None,
            group,
            state: PeerState::New,
            other: None,
        }
    }

    /// Resolve a hostname to a single peer (used for the monitor probe).
    pub fn lookup(hostname: &str) -> Result<Peer, Error> {
        let addr = resolve(hostname)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NoAddresses(hostname.to_owned()))?;
        Ok(Peer::new(hostname, addr, None))
    }
}

pub fn resolve(hostname: &str) -> Result<Vec<SocketAddr>, Error> {
    (hostname, NTP_PORT)
        .to_socket_addrs()
        .map(|addrs| addrs.collect())
        .map_err(|source| Error::Lookup {
            hostname: hostname.to_owned(),
            source,
        })
}

/// One request/reply transaction.
///
/// Sends the peer's request and waits until `tmo` for the matching reply:
/// wrong sizes, foreign senders and replies whose origin field is not the
/// transmit timestamp we just sent are skipped within the deadline.
/// Returns false on a quiet timeout or failed send; the next scheduled
/// poll is the retry policy.
pub fn poll<T: Timebase>(
    peer: &mut Peer,
    usc: &TimedSocket,
    timebase: &mut T,
    tmo: f64,
) -> Result<bool, Error> {
    let addr = match peer.addr {
        Some(addr) => addr,
        None => panic!("poll of simulated peer {}", peer.hostname),
    };
    assert!(tmo > 0.0 && tmo <= 1.0);

    let mut buf = [0u8; PACKET_LEN];
    peer.tx_pkt.pack(&mut buf, timebase.now());

    if let Err(err) = usc.send(&addr, &buf) {
        debug!(host = %peer.hostname, ip = %peer.ip, %err, "poll send failed");
        return Ok(false);
    }

    let t0 = timebase.now();
    let mut rxbuf = [0u8; 100];
    loop {
        let remaining = tmo - timebase.now().diff(&t0);
        if remaining <= 0.0 {
            return Ok(false);
        }

        match usc.recv(&addr, &mut rxbuf, remaining)? {
            RecvOutcome::TimedOut | RecvOutcome::Interrupted => return Ok(false),
            RecvOutcome::Packet {
                len,
                from,
                timestamp,
            } => {
                if len != PACKET_LEN {
                    debug!(host = %peer.hostname, len, "ignoring odd-size datagram");
                    continue;
                }
                if from != addr {
                    continue;
                }
                let mut rx = match NtpPacket::unpack(&rxbuf[..len]) {
                    Ok(rx) => rx,
                    Err(_) => continue,
                };
                rx.ts_rx = Some(timestamp.unwrap_or_else(|| timebase.now()));

                // Only accept replies to the packet we just sent.
                if rx.origin != peer.tx_pkt.transmit {
                    continue;
                }

                peer.rx_pkt = Some(rx);
                return Ok(true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clocksteer_clock::UnixTimebase;
    use clocksteer_proto::{Leap, Mode};
    use std::net::UdpSocket;

    /// One-shot fake server: answers the first request with a reply
    /// derived from it.
    fn fake_server(mangle_origin: bool) -> (std::thread::JoinHandle<()>, SocketAddr) {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = sock.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 64];
            let (len, from) = sock.recv_from(&mut buf).unwrap();
            let req = NtpPacket::unpack(&buf[..len]).unwrap();

            let mut reply = NtpPacket {
                leap: Leap::NoWarning,
                mode: Mode::Server,
                stratum: 2,
                origin: req.transmit,
                receive: req.transmit.plus(0.01),
                reference: req.transmit.plus(-1.0),
                ..NtpPacket::client_request()
            };
            if mangle_origin {
                reply.origin = req.transmit.plus(1.0);
            }
            let transmit = reply.receive.plus(0.001);
            let mut out = [0u8; PACKET_LEN];
            reply.pack(&mut out, transmit);
            sock.send_to(&out, from).unwrap();
        });
        (handle, addr)
    }

    #[test]
    fn poll_accepts_a_matching_reply() {
        let (server, addr) = fake_server(false);
        let usc = TimedSocket::open().unwrap();
        let mut tb = UnixTimebase::passive();
        let mut peer = Peer::new("fake", addr, None);

        let got = poll(&mut peer, &usc, &mut tb, 1.0).unwrap();
        assert!(got);

        let rx = peer.rx_pkt.as_ref().unwrap();
        assert_eq!(rx.origin, peer.tx_pkt.transmit);
        assert!(rx.ts_rx.is_some());
        server.join().unwrap();
    }

    #[test]
    fn poll_ignores_mismatched_origin_and_times_out() {
        let (server, addr) = fake_server(true);
        let usc = TimedSocket::open().unwrap();
        let mut tb = UnixTimebase::passive();
        let mut peer = Peer::new("fake", addr, None);

        let got = poll(&mut peer, &usc, &mut tb, 0.3).unwrap();
        assert!(!got);
        assert!(peer.rx_pkt.is_none());
        server.join().unwrap();
    }

    #[test]
    fn poll_times_out_when_nobody_answers() {
        // A bound socket that never replies.
        let quiet = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = quiet.local_addr().unwrap();

        let usc = TimedSocket::open().unwrap();
        let mut tb = UnixTimebase::passive();
        let mut peer = Peer::new("quiet", addr, None);

        let t0 = tb.now();
        let got = poll(&mut peer, &usc, &mut tb, 0.2).unwrap();
        let elapsed = tb.now().diff(&t0);
        assert!(!got);
        assert!(elapsed >= 0.15, "gave up after {elapsed}s");
    }

    #[test]
    fn lookup_resolves_numeric_hosts() {
        let peer = Peer::lookup("127.0.0.1").unwrap();
        assert_eq!(peer.ip, "127.0.0.1");
        assert_eq!(peer.addr.unwrap().port(), NTP_PORT);
    }

    #[test]
    fn new_sim_peer_has_no_address() {
        let peer = Peer::new_sim("server.example", "192.0.2.1", Some(0));
        assert_eq!(peer.addr, None);
        assert_eq!(peer.state, PeerState::New);
    }
}
