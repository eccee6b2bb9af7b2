//! A source's 32-bit `ReferenceId`: a dotted-quad-derived value for IPv4
//! sources, an MD5 hash of the address for IPv6 (RFC 5905 section 7.3), or
//! an assigned ASCII clock-name code for reference clocks.

use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ReferenceId(u32);

impl ReferenceId {
    pub const fn from_int(bits: u32) -> Self {
        Self(bits)
    }

    pub fn from_bits(bits: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(bits))
    }

    pub fn to_bits(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub fn from_ip(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => Self(u32::from_be_bytes(v4.octets())),
            IpAddr::V6(v6) => {
                use md5::{Digest, Md5};
                let mut hasher = Md5::new();
                hasher.update(v6.octets());
                let digest = hasher.finalize();
                Self(u32::from_be_bytes(digest[0..4].try_into().unwrap()))
            }
        }
    }

    /// A four-character ASCII clock name, as used for reference clocks
    /// (e.g. `GPS `, `PPS `, `LOCL`).
    pub fn from_ascii(name: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(name))
    }

    pub fn to_dotted_quad(self) -> String {
        let b = self.0.to_be_bytes();
        format!("{}.{}.{}.{}", b[0], b[1], b[2], b[3])
    }
}

impl std::fmt::Display for ReferenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_dotted_quad())
    }
}
