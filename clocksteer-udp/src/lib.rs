//! UDP sockets with kernel receive timestamps.
//!
//! An NTP exchange is only as good as its arrival timestamp. The kernel
//! stamps datagrams well before userland gets scheduled, so receive time
//! is taken from a `SO_TIMESTAMPNS` control message (`SO_TIMESTAMP` at
//! microsecond resolution where nanoseconds are unavailable), and the
//! caller is told when no stamp was attached so it can substitute its own
//! clock reading.
//!
//! The receive path takes a timeout and must remain signal-interruptible;
//! both come from a `poll(2)` in front of `recvmsg(2)`.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use clocksteer_proto::Timestamp;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("could not open UDP socket: {0}")]
    Open(io::Error),
    #[error("send failed: {0}")]
    Send(io::Error),
    #[error("short send: {sent} of {len} bytes")]
    ShortSend { sent: usize, len: usize },
    #[error("receive failed: {0}")]
    Recv(io::Error),
    #[error("no socket for address family of {0}")]
    NoFamily(SocketAddr),
}

#[derive(Debug)]
pub enum RecvOutcome {
    Packet {
        len: usize,
        from: SocketAddr,
        /// Kernel arrival stamp, if one was attached.
        timestamp: Option<Timestamp>,
    },
    TimedOut,
    Interrupted,
}

/// One socket per address family; v4 is mandatory, v6 best-effort.
pub struct TimedSocket {
    fd4: OwnedFd,
    fd6: Option<OwnedFd>,
}

fn open_family(family: libc::c_int) -> Result<OwnedFd, SocketError> {
    // SAFETY: plain socket(2); ownership of the fd is taken immediately.
    let fd = unsafe { libc::socket(family, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(SocketError::Open(io::Error::last_os_error()));
    }
    // SAFETY: fd is a freshly returned, unowned descriptor.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let on: libc::c_int = 1;
    // Timestamping is best-effort: without it we fall back to reading the
    // clock after recvmsg returns.
    // SAFETY: setsockopt with a valid int option buffer.
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_TIMESTAMPNS,
            &on as *const _ as *const libc::c_void,
            mem::size_of_val(&on) as libc::socklen_t,
        )
    };
    if rc != 0 {
        // SAFETY: as above.
        let rc = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_TIMESTAMP,
                &on as *const _ as *const libc::c_void,
                mem::size_of_val(&on) as libc::socklen_t,
            )
        };
        if rc != 0 {
            warn!("kernel refused both SO_TIMESTAMPNS and SO_TIMESTAMP");
        }
    }
    Ok(fd)
}

fn encode_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: sockaddr_storage is plain old data.
    let mut ss: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            // SAFETY: sockaddr_in fits inside sockaddr_storage.
            unsafe {
                std::ptr::write(&mut ss as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (ss, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            // SAFETY: sockaddr_in6 fits inside sockaddr_storage.
            unsafe {
                std::ptr::write(&mut ss as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (ss, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

fn decode_sockaddr(ss: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match ss.ss_family as libc::c_int {
        libc::AF_INET => {
            // SAFETY: family says this storage holds a sockaddr_in.
            let sin: &libc::sockaddr_in =
                unsafe { &*(ss as *const _ as *const libc::sockaddr_in) };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            // SAFETY: family says this storage holds a sockaddr_in6.
            let sin6: &libc::sockaddr_in6 =
                unsafe { &*(ss as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

impl TimedSocket {
    pub fn open() -> Result<TimedSocket, SocketError> {
        let fd4 = open_family(libc::AF_INET)?;
        let fd6 = open_family(libc::AF_INET6)
            .map_err(|err| debug!(%err, "no IPv6 socket"))
            .ok();
        Ok(TimedSocket { fd4, fd6 })
    }

    fn fd_for(&self, addr: &SocketAddr) -> Result<&OwnedFd, SocketError> {
        match addr {
            SocketAddr::V4(_) => Ok(&self.fd4),
            SocketAddr::V6(_) => self.fd6.as_ref().ok_or(SocketError::NoFamily(*addr)),
        }
    }

    pub fn send(&self, to: &SocketAddr, buf: &[u8]) -> Result<(), SocketError> {
        let fd = self.fd_for(to)?;
        let (ss, sl) = encode_sockaddr(to);
        // SAFETY: buf and ss are live for the duration of the call.
        let rc = unsafe {
            libc::sendto(
                fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
                &ss as *const _ as *const libc::sockaddr,
                sl,
            )
        };
        if rc < 0 {
            return Err(SocketError::Send(io::Error::last_os_error()));
        }
        if rc as usize != buf.len() {
            return Err(SocketError::ShortSend {
                sent: rc as usize,
                len: buf.len(),
            });
        }
        Ok(())
    }

    /// Wait up to `timeout` seconds for a datagram on the socket of
    /// `family`'s address family.
    pub fn recv(
        &self,
        family: &SocketAddr,
        buf: &mut [u8],
        timeout: f64,
    ) -> Result<RecvOutcome, SocketError> {
        let fd = self.fd_for(family)?;

        let mut pfd = libc::pollfd {
            fd: fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ms = (timeout * 1e3).floor().max(0.0) as libc::c_int;
        // SAFETY: pfd is a valid pollfd array of length 1.
        let rc = unsafe { libc::poll(&mut pfd, 1, ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(RecvOutcome::Interrupted);
            }
            return Err(SocketError::Recv(err));
        }
        if rc == 0 {
            return Ok(RecvOutcome::TimedOut);
        }

        // SAFETY: plain data, fully initialized below before use.
        let mut ss: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut ctrl = [0u8; 1024];
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        // SAFETY: as above.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_name = &mut ss as *mut _ as *mut libc::c_void;
        msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = ctrl.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = ctrl.len();

        // SAFETY: every pointer in msg refers to live local storage.
        let len = unsafe { libc::recvmsg(fd.as_raw_fd(), &mut msg, 0) };
        if len < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(RecvOutcome::Interrupted);
            }
            return Err(SocketError::Recv(err));
        }

        let from = match decode_sockaddr(&ss) {
            Some(addr) => addr,
            None => {
                debug!(family = ss.ss_family, "datagram from unknown address family");
                return Ok(RecvOutcome::TimedOut);
            }
        };

        let timestamp = parse_timestamp(&msg);

        Ok(RecvOutcome::Packet {
            len: len as usize,
            from,
            timestamp,
        })
    }
}

fn parse_timestamp(msg: &libc::msghdr) -> Option<Timestamp> {
    // SAFETY: CMSG_* walk the control buffer recvmsg just filled;
    // msg_controllen bounds the iteration.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            let c = &*cmsg;
            if c.cmsg_level == libc::SOL_SOCKET
                && c.cmsg_type == libc::SCM_TIMESTAMPNS
                && c.cmsg_len as usize
                    >= libc::CMSG_LEN(mem::size_of::<libc::timespec>() as u32) as usize
            {
                let mut ts: libc::timespec = mem::zeroed();
                std::ptr::copy_nonoverlapping(
                    libc::CMSG_DATA(cmsg),
                    &mut ts as *mut _ as *mut u8,
                    mem::size_of::<libc::timespec>(),
                );
                return Some(Timestamp::nanosec(ts.tv_sec, ts.tv_nsec));
            }
            if c.cmsg_level == libc::SOL_SOCKET
                && c.cmsg_type == libc::SCM_TIMESTAMP
                && c.cmsg_len as usize
                    >= libc::CMSG_LEN(mem::size_of::<libc::timeval>() as u32) as usize
            {
                let mut tv: libc::timeval = mem::zeroed();
                std::ptr::copy_nonoverlapping(
                    libc::CMSG_DATA(cmsg),
                    &mut tv as *mut _ as *mut u8,
                    mem::size_of::<libc::timeval>(),
                );
                return Some(Timestamp::nanosec(tv.tv_sec, tv.tv_usec * 1000));
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }
    None
}
