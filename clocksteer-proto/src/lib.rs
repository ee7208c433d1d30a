//! Protocol and algorithm core of the clocksteer NTP client.
//!
//! Everything in this crate is sans-io: packets come in as byte slices,
//! time comes in as [`Timestamp`] values, and clock manipulation goes out
//! through the [`Timebase`] trait. The daemon crate wires these pieces to
//! real sockets and the real (or simulated) clock.

mod combine;
mod filter;
mod packet;
mod params;
mod pll;
mod timebase;
mod timestamp;

pub use combine::{Combiner, Peak, SourceId};
pub use filter::{FilterUpdate, PacketFilter, Reject};
pub use packet::{Leap, Mode, NtpPacket, PacketError, PACKET_LEN};
pub use params::{ParamError, ParamSpec, Params, PARAM_SPECS};
pub use pll::{Pll, PllMode, PllUpdate};
pub use timebase::{Generation, Sleep, Slew, Timebase};
pub use timestamp::{self_test_step, Timestamp, SELF_TEST_DELTAS};
