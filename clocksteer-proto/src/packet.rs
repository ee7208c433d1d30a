//! NTP packet (de)serialization and the text form used in trace files.
//!
//! ```text
//!      0                   1                   2                   3
//!      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//!     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  0  |LI | VN  |Mode |    Stratum     |     Poll      |  Precision   |
//!     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  4  |                         Root Delay                            |
//!     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  8  |                         Root Dispersion                       |
//!     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! 12  |                          Reference ID                         |
//!     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! 16  |                     Reference Timestamp (64)                  |
//! 24  |                      Origin Timestamp (64)                    |
//! 32  |                      Receive Timestamp (64)                   |
//! 40  |                      Transmit Timestamp (64)                  |
//!     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::fmt::Write as _;

use crate::timestamp::Timestamp;

/// Seconds between 1900 (NTP epoch) and 1970 (UNIX epoch).
/// 17 is the number of leapdays.
const NTP_UNIX: u32 = ((1970 - 1900) * 365 + 17) * 24 * 60 * 60;

pub const PACKET_LEN: usize = 48;

/// Leap indicator, bits 0-1 of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leap {
    NoWarning,
    Insert,
    Delete,
    Unknown,
}

impl Leap {
    pub const fn from_bits(bits: u8) -> Leap {
        match bits & 0x03 {
            0 => Leap::NoWarning,
            1 => Leap::Insert,
            2 => Leap::Delete,
            _ => Leap::Unknown,
        }
    }

    pub const fn to_bits(self) -> u8 {
        match self {
            Leap::NoWarning => 0,
            Leap::Insert => 1,
            Leap::Delete => 2,
            Leap::Unknown => 3,
        }
    }
}

/// Association mode, bits 5-7 of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Reserved0,
    SymmetricActive,
    SymmetricPassive,
    Client,
    Server,
    Broadcast,
    Control,
    Reserved7,
}

impl Mode {
    pub const fn from_bits(bits: u8) -> Mode {
        match bits & 0x07 {
            0 => Mode::Reserved0,
            1 => Mode::SymmetricActive,
            2 => Mode::SymmetricPassive,
            3 => Mode::Client,
            4 => Mode::Server,
            5 => Mode::Broadcast,
            6 => Mode::Control,
            _ => Mode::Reserved7,
        }
    }

    pub const fn to_bits(self) -> u8 {
        match self {
            Mode::Reserved0 => 0,
            Mode::SymmetricActive => 1,
            Mode::SymmetricPassive => 2,
            Mode::Client => 3,
            Mode::Server => 4,
            Mode::Broadcast => 5,
            Mode::Control => 6,
            Mode::Reserved7 => 7,
        }
    }
}

#[derive(Debug)]
pub enum PacketError {
    /// NTP packets are exactly 48 bytes in the profile we speak.
    WrongLength(usize),
    /// A trace record did not match the bracketed packet layout.
    TraceSyntax,
}

impl std::fmt::Display for PacketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketError::WrongLength(len) => write!(f, "packet length {len}, expected 48"),
            PacketError::TraceSyntax => write!(f, "malformed packet trace record"),
        }
    }
}

impl std::error::Error for PacketError {}

/// Decoded 48-byte NTP record, plus the locally captured arrival time of
/// a reply (`ts_rx`), which never travels on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NtpPacket {
    pub leap: Leap,
    pub version: u8,
    pub mode: Mode,
    pub stratum: u8,
    pub poll: u8,
    pub precision: i8,
    pub delay: Timestamp,
    pub dispersion: Timestamp,
    pub refid: [u8; 4],
    pub reference: Timestamp,
    pub origin: Timestamp,
    pub receive: Timestamp,
    pub transmit: Timestamp,
    pub ts_rx: Option<Timestamp>,
}

fn dec_ntp64(p: &[u8]) -> Timestamp {
    let sec = u32::from_be_bytes([p[0], p[1], p[2], p[3]]).wrapping_sub(NTP_UNIX);
    let frac = (u32::from_be_bytes([p[4], p[5], p[6], p[7]]) as u64) << 32;
    Timestamp::from_parts(sec as u64, frac)
}

fn enc_ntp64(p: &mut [u8], ts: &Timestamp) {
    let sec = (ts.seconds() as u32).wrapping_add(NTP_UNIX);
    p[..4].copy_from_slice(&sec.to_be_bytes());
    p[4..8].copy_from_slice(&((ts.fraction() >> 32) as u32).to_be_bytes());
}

fn dec_ntp32(p: &[u8]) -> Timestamp {
    let sec = u16::from_be_bytes([p[0], p[1]]) as u64;
    let frac = (u16::from_be_bytes([p[2], p[3]]) as u64) << 48;
    Timestamp::from_parts(sec, frac)
}

fn enc_ntp32(p: &mut [u8], ts: &Timestamp) {
    assert!(ts.seconds() < 65536);
    p[..2].copy_from_slice(&(ts.seconds() as u16).to_be_bytes());
    p[2..4].copy_from_slice(&((ts.fraction() >> 48) as u16).to_be_bytes());
}

impl NtpPacket {
    /// The standard client query. Transmit is left zero; `pack` stamps it.
    pub fn client_request() -> NtpPacket {
        NtpPacket {
            leap: Leap::Unknown,
            version: 4,
            mode: Mode::Client,
            stratum: 0,
            poll: 4,
            precision: -6,
            delay: Timestamp::from_parts(1, 0),
            dispersion: Timestamp::from_parts(1, 0),
            refid: [0; 4],
            reference: Timestamp::default(),
            origin: Timestamp::default(),
            receive: Timestamp::default(),
            transmit: Timestamp::default(),
            ts_rx: None,
        }
    }

    pub fn unpack(buf: &[u8]) -> Result<NtpPacket, PacketError> {
        if buf.len() != PACKET_LEN {
            return Err(PacketError::WrongLength(buf.len()));
        }
        Ok(NtpPacket {
            leap: Leap::from_bits(buf[0] >> 6),
            version: (buf[0] >> 3) & 0x07,
            mode: Mode::from_bits(buf[0]),
            stratum: buf[1],
            poll: buf[2],
            precision: buf[3] as i8,
            delay: dec_ntp32(&buf[4..8]),
            dispersion: dec_ntp32(&buf[8..12]),
            refid: [buf[12], buf[13], buf[14], buf[15]],
            reference: dec_ntp64(&buf[16..24]),
            origin: dec_ntp64(&buf[24..32]),
            receive: dec_ntp64(&buf[32..40]),
            transmit: dec_ntp64(&buf[40..48]),
            ts_rx: None,
        })
    }

    /// Serialize, stamping the transmit timestamp with `now` as late as
    /// possible. The stored transmit field is then re-derived from the
    /// written bytes, so comparing it against the origin field a server
    /// echoes back is bit-exact.
    pub fn pack(&mut self, buf: &mut [u8; PACKET_LEN], now: Timestamp) {
        assert!(self.version < 8);
        assert!(self.stratum < 15);

        buf[0] = (self.leap.to_bits() << 6) | (self.version << 3) | self.mode.to_bits();
        buf[1] = self.stratum;
        buf[2] = self.poll;
        buf[3] = self.precision as u8;
        enc_ntp32(&mut buf[4..8], &self.delay);
        enc_ntp32(&mut buf[8..12], &self.dispersion);
        buf[12..16].copy_from_slice(&self.refid);
        enc_ntp64(&mut buf[16..24], &self.reference);
        enc_ntp64(&mut buf[24..32], &self.origin);
        enc_ntp64(&mut buf[32..40], &self.receive);

        self.transmit = now;
        enc_ntp64(&mut buf[40..48], &self.transmit);
        self.transmit = dec_ntp64(&buf[40..48]);
    }

    /// The bracketed one-line layout used in trace files.
    ///
    /// Absolute timestamps are dumped relative to the origin timestamp, so
    /// a record survives being replayed against a clock with a different
    /// epoch. Nanosecond precision is enough for everybody.
    pub fn trace_format(&self) -> String {
        let mut s = String::with_capacity(192);
        let _ = write!(
            s,
            "[{} {} {} {:3} {:3} {:4} {} {} 0x{:02x}{:02x}{:02x}{:02x}",
            self.leap.to_bits(),
            self.version,
            self.mode.to_bits(),
            self.stratum,
            self.poll,
            self.precision,
            self.delay,
            self.dispersion,
            self.refid[0],
            self.refid[1],
            self.refid[2],
            self.refid[3],
        );
        let _ = write!(
            s,
            " {:.9} {} {:.9} {:.9}",
            self.reference.diff(&self.origin),
            self.origin,
            self.receive.diff(&self.origin),
            self.transmit.diff(&self.receive),
        );
        let rx = match &self.ts_rx {
            Some(ts) => ts.diff(&self.transmit),
            None => 0.0,
        };
        let _ = write!(s, " {:.9}]", rx);
        s
    }

    /// Parse a record in `trace_format` layout.
    pub fn parse_trace(buf: &str) -> Result<NtpPacket, PacketError> {
        let inner = buf
            .trim()
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .ok_or(PacketError::TraceSyntax)?;
        let fields: Vec<&str> = inner.split_whitespace().collect();
        if fields.len() != 14 {
            return Err(PacketError::TraceSyntax);
        }

        fn num<T: std::str::FromStr>(s: &str) -> Result<T, PacketError> {
            s.parse().map_err(|_| PacketError::TraceSyntax)
        }

        let leap_bits: u8 = num(fields[0])?;
        let mode_bits: u8 = num(fields[2])?;
        if leap_bits > 3 || mode_bits > 7 {
            return Err(PacketError::TraceSyntax);
        }

        let refid_word = fields[8]
            .strip_prefix("0x")
            .and_then(|h| u32::from_str_radix(h, 16).ok())
            .ok_or(PacketError::TraceSyntax)?;

        let (osec, onsec) = fields[10].split_once('.').ok_or(PacketError::TraceSyntax)?;
        let origin = Timestamp::nanosec(num(osec)?, num(onsec)?);

        let ref_off: f64 = num(fields[9])?;
        let recv_off: f64 = num(fields[11])?;
        let xmit_off: f64 = num(fields[12])?;
        let rx_off: f64 = num(fields[13])?;

        let receive = origin.plus(recv_off);
        let transmit = receive.plus(xmit_off);

        Ok(NtpPacket {
            leap: Leap::from_bits(leap_bits),
            version: num(fields[1])?,
            mode: Mode::from_bits(mode_bits),
            stratum: num(fields[3])?,
            poll: num(fields[4])?,
            precision: num::<f64>(fields[5])?.floor() as i8,
            delay: Timestamp::from_double(num(fields[6])?),
            dispersion: Timestamp::from_double(num(fields[7])?),
            refid: refid_word.to_be_bytes(),
            reference: origin.plus(ref_off),
            origin,
            receive,
            transmit,
            ts_rx: (rx_off != 0.0).then(|| transmit.plus(rx_off)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A server reply, built by hand: LI 0, version 4, mode 4, stratum 2,
    // poll 6, precision -20, delay 0.25, dispersion 0.5, refid "GPS\0",
    // and four timestamps around UNIX second 1549107584.
    const WIRE: [u8; 48] = [
        0x24, 0x02, 0x06, 0xec, // LI|VN|Mode, stratum, poll, precision
        0x00, 0x00, 0x40, 0x00, // root delay
        0x00, 0x00, 0x80, 0x00, // root dispersion
        0x47, 0x50, 0x53, 0x00, // refid
        0xe0, 0x00, 0x00, 0x00, 0x80, 0x00, 0x00, 0x00, // reference
        0xe0, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, // origin
        0xe0, 0x00, 0x00, 0x01, 0x40, 0x00, 0x00, 0x00, // receive
        0xe0, 0x00, 0x00, 0x01, 0xc0, 0x00, 0x00, 0x00, // transmit
    ];

    const WIRE_SEC: u64 = 0xe000_0000 - 2_208_988_800;

    #[test]
    fn unpack_known_bytes() {
        let pkt = NtpPacket::unpack(&WIRE).unwrap();
        assert_eq!(pkt.leap, Leap::NoWarning);
        assert_eq!(pkt.version, 4);
        assert_eq!(pkt.mode, Mode::Server);
        assert_eq!(pkt.stratum, 2);
        assert_eq!(pkt.poll, 6);
        assert_eq!(pkt.precision, -20);
        assert_eq!(pkt.delay, Timestamp::from_parts(0, 0x4000_0000_0000_0000));
        assert_eq!(pkt.dispersion, Timestamp::from_parts(0, 0x8000_0000_0000_0000));
        assert_eq!(pkt.refid, *b"GPS\0");
        assert_eq!(pkt.reference, Timestamp::from_parts(WIRE_SEC, 0x8000_0000_0000_0000));
        assert_eq!(pkt.origin, Timestamp::from_parts(WIRE_SEC + 1, 0));
        assert_eq!(pkt.receive, Timestamp::from_parts(WIRE_SEC + 1, 0x4000_0000_0000_0000));
        assert_eq!(pkt.transmit, Timestamp::from_parts(WIRE_SEC + 1, 0xc000_0000_0000_0000));
        assert_eq!(pkt.ts_rx, None);
    }

    #[test]
    fn repack_reproduces_bytes() {
        let mut pkt = NtpPacket::unpack(&WIRE).unwrap();
        let transmit = pkt.transmit;
        let mut buf = [0u8; 48];
        pkt.pack(&mut buf, transmit);
        assert_eq!(buf, WIRE);
        // The stamped transmit must equal what a decoder reads back out.
        assert_eq!(pkt.transmit, transmit);
    }

    #[test]
    fn pack_truncates_transmit_to_wire_precision() {
        let mut pkt = NtpPacket::client_request();
        let mut buf = [0u8; 48];
        // Low 32 fraction bits are below wire precision and must vanish.
        let now = Timestamp::from_parts(1_500_000_000, 0x8000_0000_1234_5678);
        pkt.pack(&mut buf, now);
        assert_eq!(pkt.transmit, Timestamp::from_parts(1_500_000_000, 0x8000_0000_0000_0000));
        assert_eq!(pkt.transmit, NtpPacket::unpack(&buf).unwrap().transmit);
    }

    #[test]
    fn unpack_rejects_wrong_length() {
        assert!(matches!(
            NtpPacket::unpack(&WIRE[..47]),
            Err(PacketError::WrongLength(47))
        ));
        let mut long = [0u8; 49];
        long[..48].copy_from_slice(&WIRE);
        assert!(matches!(
            NtpPacket::unpack(&long),
            Err(PacketError::WrongLength(49))
        ));
    }

    #[test]
    fn stratum_zero_is_accepted_by_the_codec() {
        let mut wire = WIRE;
        wire[1] = 0;
        assert_eq!(NtpPacket::unpack(&wire).unwrap().stratum, 0);
    }

    #[test]
    fn trace_format_roundtrip() {
        let mut pkt = NtpPacket::unpack(&WIRE).unwrap();
        pkt.ts_rx = Some(pkt.transmit.plus(0.015625));

        let line = pkt.trace_format();
        let back = NtpPacket::parse_trace(&line).unwrap();

        assert_eq!(back.leap, pkt.leap);
        assert_eq!(back.version, pkt.version);
        assert_eq!(back.mode, pkt.mode);
        assert_eq!(back.stratum, pkt.stratum);
        assert_eq!(back.poll, pkt.poll);
        assert_eq!(back.precision, pkt.precision);
        assert_eq!(back.refid, pkt.refid);
        // Timestamps travel as nanosecond-rounded offsets from the origin.
        assert!(back.origin.diff(&pkt.origin).abs() < 1e-9);
        assert!(back.reference.diff(&pkt.reference).abs() < 2e-9);
        assert!(back.receive.diff(&pkt.receive).abs() < 2e-9);
        assert!(back.transmit.diff(&pkt.transmit).abs() < 4e-9);
        let rx = back.ts_rx.unwrap();
        assert!(rx.diff(&pkt.ts_rx.unwrap()).abs() < 8e-9);
    }

    #[test]
    fn parse_trace_rejects_garbage() {
        assert!(NtpPacket::parse_trace("Poll lines are not packets").is_err());
        assert!(NtpPacket::parse_trace("[1 2 3]").is_err());
        assert!(NtpPacket::parse_trace(
            "[9 4 4 2 6 -20 1.0 1.0 0xdeadbeef 0.0 100.0 0.1 0.1 0.1]"
        )
        .is_err());
    }

    #[test]
    fn client_request_template() {
        let pkt = NtpPacket::client_request();
        assert_eq!(pkt.leap, Leap::Unknown);
        assert_eq!(pkt.version, 4);
        assert_eq!(pkt.mode, Mode::Client);
        assert_eq!(pkt.stratum, 0);
        assert_eq!(pkt.poll, 4);
        assert_eq!(pkt.precision, -6);
        assert_eq!(pkt.delay.seconds(), 1);
        assert_eq!(pkt.dispersion.seconds(), 1);
    }
}
