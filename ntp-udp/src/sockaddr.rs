//! Conversions between `std::net::SocketAddr` and the raw `sockaddr`
//! structures the `libc` socket calls need, plus a fixed-size buffer
//! large enough to hold either an `AF_INET` or `AF_INET6` address for
//! `recvmsg`'s `msg_name` out-parameter.

use std::io;
use std::mem::size_of;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// Owns either a `sockaddr_in` or `sockaddr_in6`, large enough to be
/// reused as the `msg_name` buffer for `recvmsg`.
pub struct PackedSockAddr {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl PackedSockAddr {
    pub fn empty() -> Self {
        Self {
            storage: unsafe { std::mem::zeroed() },
            len: size_of::<libc::sockaddr_storage>() as libc::socklen_t,
        }
    }

    pub fn as_mut_ptr(&mut self) -> *mut libc::sockaddr_storage {
        &mut self.storage
    }

    pub fn capacity(&self) -> libc::socklen_t {
        self.len
    }

    pub fn to_socket_addr(&self, actual_len: libc::socklen_t) -> io::Result<SocketAddr> {
        if actual_len == 0 {
            return Ok(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)));
        }
        match self.storage.ss_family as libc::c_int {
            libc::AF_INET => {
                let addr_in: libc::sockaddr_in = unsafe {
                    std::ptr::read_unaligned(&self.storage as *const _ as *const libc::sockaddr_in)
                };
                let ip = Ipv4Addr::from(u32::from_be(addr_in.sin_addr.s_addr));
                let port = u16::from_be(addr_in.sin_port);
                Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
            }
            libc::AF_INET6 => {
                let addr_in6: libc::sockaddr_in6 = unsafe {
                    std::ptr::read_unaligned(&self.storage as *const _ as *const libc::sockaddr_in6)
                };
                let ip = Ipv6Addr::from(addr_in6.sin6_addr.s6_addr);
                let port = u16::from_be(addr_in6.sin6_port);
                Ok(SocketAddr::V6(SocketAddrV6::new(
                    ip,
                    port,
                    addr_in6.sin6_flowinfo,
                    addr_in6.sin6_scope_id,
                )))
            }
            family => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported address family {family}"),
            )),
        }
    }
}

/// A packed `sockaddr_in`/`sockaddr_in6`, ready for `bind`/`connect`.
pub enum RawSockAddr {
    V4(libc::sockaddr_in),
    V6(libc::sockaddr_in6),
}

impl RawSockAddr {
    pub fn as_ptr(&self) -> *const libc::sockaddr {
        match self {
            RawSockAddr::V4(addr) => addr as *const _ as *const libc::sockaddr,
            RawSockAddr::V6(addr) => addr as *const _ as *const libc::sockaddr,
        }
    }

    pub fn len(&self) -> libc::socklen_t {
        match self {
            RawSockAddr::V4(_) => size_of::<libc::sockaddr_in>() as libc::socklen_t,
            RawSockAddr::V6(_) => size_of::<libc::sockaddr_in6>() as libc::socklen_t,
        }
    }
}

pub fn socket_addr_to_raw(addr: SocketAddr) -> RawSockAddr {
    match addr {
        SocketAddr::V4(v4) => {
            let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.ip().octets()),
            };
            RawSockAddr::V4(sin)
        }
        SocketAddr::V6(v6) => {
            let mut sin6: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr = libc::in6_addr {
                s6_addr: v6.ip().octets(),
            };
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_scope_id = v6.scope_id();
            RawSockAddr::V6(sin6)
        }
    }
}
