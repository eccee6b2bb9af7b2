//! Synchronous UDP socket wrapper (spec §4.8): binds v4/v6 server
//! sockets, opens per-source client sockets, and decodes kernel RX
//! timestamps where the platform provides them, falling back to the
//! scheduler's own notion of "now" otherwise.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

use ntp_proto::{LocalClock, NtpTimestamp};

mod sockaddr;

use sockaddr::{socket_addr_to_raw, PackedSockAddr};

pub struct RecvResult {
    pub bytes_read: usize,
    pub timestamp: Option<NtpTimestamp>,
    pub from: SocketAddr,
}

/// Mirrors the corpus's accept/ignore/network-gone trichotomy so a
/// caller doesn't need to inspect `io::Error` itself.
#[derive(Debug)]
pub enum AcceptResult<'a> {
    Accept(&'a [u8], NtpTimestamp),
    Ignore,
    NetworkGone,
}

pub fn accept_packet<'a, C: LocalClock>(
    result: io::Result<RecvResult>,
    buf: &'a [u8],
    clock: &C,
) -> AcceptResult<'a> {
    match result {
        Ok(RecvResult {
            bytes_read,
            timestamp,
            ..
        }) => {
            let recv_timestamp = timestamp.unwrap_or_else(|| match clock.now() {
                Ok(now) => {
                    tracing::debug!(bytes_read, "received a packet without a kernel timestamp, substituting local time");
                    now
                }
                Err(_) => NtpTimestamp::ZERO,
            });

            if bytes_read < ntp_proto::packet::HEADER_LENGTH {
                tracing::debug!(
                    expected = ntp_proto::packet::HEADER_LENGTH,
                    actual = bytes_read,
                    "received packet is too small"
                );
                AcceptResult::Ignore
            } else {
                AcceptResult::Accept(&buf[..bytes_read], recv_timestamp)
            }
        }
        Err(receive_error) => {
            tracing::warn!(error = ?receive_error, "could not receive packet");
            match receive_error.raw_os_error() {
                Some(libc::EHOSTDOWN)
                | Some(libc::EHOSTUNREACH)
                | Some(libc::ENETDOWN)
                | Some(libc::ENETUNREACH) => AcceptResult::NetworkGone,
                _ => AcceptResult::Ignore,
            }
        }
    }
}

/// A raw, non-blocking UDP socket. Used both for a source's own client
/// socket (connected to one peer) and for the server socket that
/// answers inbound client/peer requests.
pub struct NtpUdpSocket {
    fd: RawFd,
}

impl NtpUdpSocket {
    /// Binds a server socket for the given local address, requesting
    /// kernel RX timestamps via `SO_TIMESTAMP`.
    pub fn server(local: SocketAddr) -> io::Result<Self> {
        let socket = Self::raw_socket(local.is_ipv6())?;
        socket.set_nonblocking()?;
        socket.set_reuse_addr()?;
        socket.enable_timestamping()?;
        socket.bind(local)?;
        Ok(socket)
    }

    /// Opens a client socket connected to one peer, used to poll a
    /// single NTP source.
    pub fn client(local: SocketAddr, peer: SocketAddr) -> io::Result<Self> {
        let socket = Self::raw_socket(peer.is_ipv6())?;
        socket.set_nonblocking()?;
        socket.enable_timestamping()?;
        socket.bind(local)?;
        socket.connect(peer)?;
        Ok(socket)
    }

    fn raw_socket(is_ipv6: bool) -> io::Result<Self> {
        let domain = if is_ipv6 { libc::AF_INET6 } else { libc::AF_INET };
        let fd = unsafe { libc::socket(domain, libc::SOCK_DGRAM, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    fn set_nonblocking(&self) -> io::Result<()> {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL, 0) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let rc = unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn set_reuse_addr(&self) -> io::Result<()> {
        let value: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &value as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Best-effort: not every platform/kernel combination supports
    /// `SO_TIMESTAMP`; a failure here is not fatal, just means
    /// `accept_packet` will substitute the scheduler's own clock read.
    fn enable_timestamping(&self) -> io::Result<()> {
        let value: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_TIMESTAMP,
                &value as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            tracing::debug!(error = ?io::Error::last_os_error(), "SO_TIMESTAMP unavailable");
        }
        Ok(())
    }

    fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        let packed = socket_addr_to_raw(addr);
        let rc = unsafe { libc::bind(self.fd, packed.as_ptr(), packed.len()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn connect(&self, addr: SocketAddr) -> io::Result<()> {
        let packed = socket_addr_to_raw(addr);
        let rc = unsafe { libc::connect(self.fd, packed.as_ptr(), packed.len()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Never blocks. A would-block result is reported as `Ok(0)` so the
    /// caller (which already owns an outgoing retry/backoff policy at
    /// the protocol layer) doesn't need a second error path for it.
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let rc = unsafe { libc::send(self.fd, buf.as_ptr() as *const libc::c_void, buf.len(), 0) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) || err.raw_os_error() == Some(libc::EAGAIN) {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(rc as usize)
    }

    /// Sends to an explicit address over an unconnected (server) socket.
    /// Same would-block handling as [`Self::send`].
    pub fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
        let packed = socket_addr_to_raw(to);
        let rc = unsafe {
            libc::sendto(
                self.fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
                packed.as_ptr(),
                packed.len(),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) || err.raw_os_error() == Some(libc::EAGAIN) {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(rc as usize)
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<RecvResult> {
        let mut from = PackedSockAddr::empty();
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut cmsg_buf = [0u8; 64];
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = from.as_mut_ptr() as *mut libc::c_void;
        msg.msg_namelen = from.capacity();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_buf.len() as _;

        let rc = unsafe { libc::recvmsg(self.fd, &mut msg, 0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        let timestamp = unsafe { extract_timestamp(&msg) };
        let from_addr = from.to_socket_addr(msg.msg_namelen)?;

        Ok(RecvResult {
            bytes_read: rc as usize,
            timestamp,
            from: from_addr,
        })
    }
}

/// Walks the control messages looking for `SCM_TIMESTAMP`
/// (`struct timeval`). Returns `None` if the kernel didn't attach one.
unsafe fn extract_timestamp(msg: &libc::msghdr) -> Option<NtpTimestamp> {
    let mut cmsg = libc::CMSG_FIRSTHDR(msg);
    while !cmsg.is_null() {
        let hdr = &*cmsg;
        if hdr.cmsg_level == libc::SOL_SOCKET && hdr.cmsg_type == libc::SCM_TIMESTAMP {
            let data = libc::CMSG_DATA(cmsg) as *const libc::timeval;
            let tv = std::ptr::read_unaligned(data);
            return Some(NtpTimestamp::from_seconds_nanos_since_ntp_era(
                ntp_proto::time::EPOCH_OFFSET.wrapping_add(tv.tv_sec as u32),
                (tv.tv_usec as u32).saturating_mul(1000),
            ));
        }
        cmsg = libc::CMSG_NXTHDR(msg as *const _ as *mut _, cmsg);
    }
    None
}

impl AsRawFd for NtpUdpSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for NtpUdpSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ntp_proto::clock::TestClock;

    #[test]
    fn accept_packet_ignores_undersized_datagrams() {
        let clock = TestClock::new();
        let buf = [0u8; 10];
        let result = Ok(RecvResult {
            bytes_read: 10,
            timestamp: None,
            from: "127.0.0.1:123".parse().unwrap(),
        });
        assert!(matches!(
            accept_packet(result, &buf, &clock),
            AcceptResult::Ignore
        ));
    }

    #[test]
    fn accept_packet_substitutes_local_time_when_no_kernel_timestamp() {
        let clock = TestClock::new();
        let buf = [0u8; ntp_proto::packet::HEADER_LENGTH];
        let result = Ok(RecvResult {
            bytes_read: ntp_proto::packet::HEADER_LENGTH,
            timestamp: None,
            from: "127.0.0.1:123".parse().unwrap(),
        });
        match accept_packet(result, &buf, &clock) {
            AcceptResult::Accept(_, ts) => assert_eq!(ts, clock.now().unwrap()),
            other => panic!("expected Accept, got {other:?}"),
        }
    }

    #[test]
    fn accept_packet_maps_unreachable_errors_to_network_gone() {
        let clock = TestClock::new();
        let buf = [0u8; 0];
        let result: io::Result<RecvResult> =
            Err(io::Error::from_raw_os_error(libc::ENETUNREACH));
        assert!(matches!(
            accept_packet(result, &buf, &clock),
            AcceptResult::NetworkGone
        ));
    }
}
