//! The clocksteer daemon: scheduler, peers, driver context, simulation
//! and the subcommand entry points behind the `clocksteer` binary.

pub mod client;
pub mod config;
pub mod driver;
pub mod peer;
pub mod peerset;
pub mod poll_server;
pub mod selftest;
pub mod sim;
pub mod sim_client;
pub mod simfile;
pub mod todo;
pub mod tracer;

use std::io;

use clocksteer_clock::ClockError;
use clocksteer_proto::{PacketError, ParamError};
use clocksteer_udp::SocketError;
use thiserror::Error;

/// Anything that ends a run. Config and usage problems are fatal at
/// startup; runtime clock or socket failures are fatal wherever they
/// surface (the next poll is the only retry policy, and it lives in the
/// scheduler, not here).
#[derive(Debug, Error)]
pub enum Error {
    #[error("clock: {0}")]
    Clock(#[from] ClockError),
    #[error("socket: {0}")]
    Socket(#[from] SocketError),
    #[error(transparent)]
    Param(#[from] ParamError),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error("hostname '{hostname}', port 'ntp': {source}")]
    Lookup {
        hostname: String,
        source: io::Error,
    },
    #[error("hostname '{0}' resolved to no addresses")]
    NoAddresses(String),
    #[error("no NTP peers found")]
    NoPeers,
    #[error("could not open '{path}' for writing: {source}")]
    TraceFile { path: String, source: io::Error },
    #[error("could not read config file '{path}': {source}")]
    Config { path: String, source: io::Error },
    #[error("config file '{path}': {source}")]
    ConfigParse {
        path: String,
        source: toml::de::Error,
    },
    #[error("could not open sim file '{path}': {source}")]
    SimOpen { path: String, source: io::Error },
    #[error("wrong file format in sim file '{0}'")]
    SimFormat(String),
    #[error("premature EOF in sim file header")]
    SimHeaderEof,
    #[error("sim file: expected '{0}' line")]
    SimHeader(&'static str),
    #[error("sim file: peer not found ({0}, {1})")]
    SimUnknownPeer(String, String),
    #[error("sim file: bad line ({0})")]
    SimParse(String),
    #[error("bad -B argument '{0}', expected when,freq,phase")]
    BadBump(String),
    #[error("parameter '{param}': bad value '{value}'")]
    BadValue { param: String, value: String },
    #[error("timestamp self-test: {0} failures")]
    SelfTest(usize),
    #[error("{0}")]
    Usage(String),
}
