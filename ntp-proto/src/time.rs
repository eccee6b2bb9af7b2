//! Fixed-point NTP timestamps and durations, per RFC 5905 section 6, plus
//! conversion to/from the host's wall-clock representation.
//!
//! Two generations of opaque low bits coexist in the wire format: the
//! "short" 32-bit (16.16) fields `root_delay`/`root_dispersion`, and the
//! full 64-bit (32.32) timestamp fields. We keep them as distinct types so
//! that a mismatch is a compile error rather than a silent truncation.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Seconds between the NTP epoch (1900-01-01) and the Unix epoch
/// (1970-01-01).
pub const EPOCH_OFFSET: u32 = 2_208_988_800;

/// A 32-bit fixed-point seconds value (Q16.16), used for `root_delay` and
/// `root_dispersion` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct NtpShort(i32);

impl NtpShort {
    pub const ZERO: Self = Self(0);

    pub fn from_bits(bits: [u8; 4]) -> Self {
        Self(i32::from_be_bytes(bits))
    }

    pub fn to_bits(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub fn to_seconds(self) -> f64 {
        self.0 as f64 / (1u32 << 16) as f64
    }

    pub fn from_seconds(seconds: f64) -> Self {
        Self((seconds * (1u32 << 16) as f64).round() as i32)
    }
}

/// A 64-bit absolute NTP timestamp (Q32.32 seconds since the NTP epoch).
///
/// Distinct from [`NtpDuration`]: a timestamp is a point, a duration is a
/// delta. Keeping them separate is what makes the sign conventions in the
/// statistics and selector code auditable instead of ambiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash, Serialize, Deserialize)]
pub struct NtpTimestamp(u64);

impl NtpTimestamp {
    pub const ZERO: Self = Self(0);

    pub fn from_bits(bits: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bits))
    }

    pub fn to_bits(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub const fn from_seconds_nanos_since_ntp_era(seconds: u32, nanos: u32) -> Self {
        let frac = ((nanos as u64) << 32) / 1_000_000_000;
        Self(((seconds as u64) << 32) | frac)
    }

    /// Reads the current wall-clock time, fuzzing the low bits of the
    /// fractional second so that two stamps formed at the same integer
    /// microsecond still differ with overwhelming probability. Used only
    /// when *forming an outbound* transmit timestamp (spec §4.1, §4.7).
    pub fn now_fuzzed() -> Self {
        Self::now_fuzzed_from(Self::now())
    }

    /// Like [`Self::now_fuzzed`] but fuzzes the low bits of a
    /// caller-supplied timestamp instead of reading the wall clock,
    /// so callers that already have a `now` (and tests) don't need to
    /// race the clock twice.
    pub fn now_fuzzed_from(base: Self) -> Self {
        let mut ts = base;
        let mut rng = rand::thread_rng();
        let fuzz: u16 = rng.gen();
        ts.0 = (ts.0 & !0xffff) | fuzz as u64;
        ts
    }

    pub fn now() -> Self {
        let since_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self::from_seconds_nanos_since_ntp_era(
            EPOCH_OFFSET.wrapping_add(since_unix.as_secs() as u32),
            since_unix.subsec_nanos(),
        )
    }

    pub fn to_system_time(self) -> Option<SystemTime> {
        let secs = (self.0 >> 32) as u32;
        let unix_secs = secs.checked_sub(EPOCH_OFFSET)?;
        let frac = (self.0 & 0xffff_ffff) as u32;
        let nanos = ((frac as u64) * 1_000_000_000 / (1u64 << 32)) as u32;
        Some(UNIX_EPOCH + Duration::new(unix_secs as u64, nanos))
    }
}

impl std::ops::Sub for NtpTimestamp {
    type Output = NtpDuration;

    fn sub(self, rhs: Self) -> NtpDuration {
        NtpDuration(self.0.wrapping_sub(rhs.0) as i64)
    }
}

impl std::ops::Add<NtpDuration> for NtpTimestamp {
    type Output = NtpTimestamp;

    fn add(self, rhs: NtpDuration) -> NtpTimestamp {
        NtpTimestamp(self.0.wrapping_add(rhs.0 as u64))
    }
}

impl std::ops::AddAssign<NtpDuration> for NtpTimestamp {
    fn add_assign(&mut self, rhs: NtpDuration) {
        *self = *self + rhs;
    }
}

/// A signed difference between two [`NtpTimestamp`]s, or a free-standing
/// duration (e.g. a poll interval). Q32.32 seconds, same bit layout as
/// `NtpTimestamp` but signed and interpreted relative to zero rather than
/// the NTP epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash, Serialize, Deserialize)]
pub struct NtpDuration(i64);

impl NtpDuration {
    pub const ZERO: Self = Self(0);
    pub const ONE: Self = Self(1 << 32);
    /// RFC 5905's NAP/MAXDISP: the dispersion assigned to unfilled filter
    /// register slots.
    pub const MAX_DISPERSION: Self = Self(16 << 32);
    pub const MIN_DISPERSION: Self = Self((1 << 32) / 1000); // 1 ms

    pub const fn from_bits(bits: i64) -> Self {
        Self(bits)
    }

    pub const fn to_bits(self) -> i64 {
        self.0
    }

    pub fn from_seconds(seconds: f64) -> Self {
        Self((seconds * (1i64 << 32) as f64).round() as i64)
    }

    pub fn to_seconds(self) -> f64 {
        self.0 as f64 / (1i64 << 32) as f64
    }

    /// A duration of `2^exponent` seconds, used for poll intervals.
    pub fn from_exponent(exponent: i8) -> Self {
        if exponent >= 0 {
            Self::ONE * (1i64 << exponent)
        } else {
            Self::ONE / (1i64 << -exponent)
        }
    }

    pub fn divided_by(self, n: i64) -> Self {
        Self(self.0 / n)
    }

    pub fn abs(self) -> Self {
        Self(self.0.abs())
    }

    pub fn max(self, other: Self) -> Self {
        if self.0 >= other.0 {
            self
        } else {
            other
        }
    }

    pub fn min(self, other: Self) -> Self {
        if self.0 <= other.0 {
            self
        } else {
            other
        }
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }
}

impl std::ops::Add for NtpDuration {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self(self.0.wrapping_add(rhs.0))
    }
}

impl std::ops::Sub for NtpDuration {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self(self.0.wrapping_sub(rhs.0))
    }
}

impl std::ops::Neg for NtpDuration {
    type Output = Self;
    fn neg(self) -> Self {
        Self(-self.0)
    }
}

impl std::ops::Mul<i64> for NtpDuration {
    type Output = Self;
    fn mul(self, rhs: i64) -> Self {
        Self(self.0 * rhs)
    }
}

impl std::ops::Div<i64> for NtpDuration {
    type Output = Self;
    fn div(self, rhs: i64) -> Self {
        Self(self.0 / rhs)
    }
}

impl TryFrom<Duration> for NtpDuration {
    type Error = std::num::TryFromIntError;

    fn try_from(value: Duration) -> Result<Self, Self::Error> {
        let secs: i64 = value.as_secs().try_into()?;
        let frac = ((value.subsec_nanos() as i64) << 32) / 1_000_000_000;
        Ok(Self((secs << 32) + frac))
    }
}

impl From<NtpDuration> for Duration {
    fn from(value: NtpDuration) -> Self {
        let v = value.0.max(0);
        let secs = (v >> 32) as u64;
        let frac = (v & 0xffff_ffff) as u64;
        Duration::new(secs, ((frac * 1_000_000_000) >> 32) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_roundtrip() {
        let d = NtpDuration::from_seconds(1.5);
        assert!((d.to_seconds() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn exponent_matches_definition() {
        assert_eq!(NtpDuration::from_exponent(0), NtpDuration::ONE);
        assert_eq!(NtpDuration::from_exponent(4).to_seconds(), 16.0);
        assert!((NtpDuration::from_exponent(-2).to_seconds() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn fuzzed_timestamps_differ_with_overwhelming_probability() {
        let mut same_low_bits = 0;
        let mut prev = None;
        for _ in 0..1000 {
            let ts = NtpTimestamp::now_fuzzed();
            if let Some(p) = prev {
                if p == ts {
                    same_low_bits += 1;
                }
            }
            prev = Some(ts);
        }
        assert!(same_low_bits < 5);
    }

    #[test]
    fn subtraction_yields_signed_duration() {
        let a = NtpTimestamp::from_seconds_nanos_since_ntp_era(100, 0);
        let b = NtpTimestamp::from_seconds_nanos_since_ntp_era(101, 0);
        assert!((a - b).is_negative());
        assert!(!(b - a).is_negative());
    }
}
