//! `UnixClock`: the real `LocalClock` implementation, wrapping
//! `clock_gettime`/`clock_settime`/`ntp_adjtime` (spec §4.3).

use std::time::{SystemTime, UNIX_EPOCH};

use ntp_proto::{ClockChangeKind, LocalClock, NtpDuration, NtpTimestamp};

#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    #[error("permission denied adjusting the system clock")]
    PermissionDenied,
    #[error("kernel rejected clock adjustment (errno {0})")]
    KernelRejected(i32),
    #[error("platform does not support this clock operation")]
    Unsupported,
}

impl ClockError {
    fn from_last_errno() -> Self {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if errno == libc::EPERM {
            ClockError::PermissionDenied
        } else {
            ClockError::KernelRejected(errno)
        }
    }
}

/// The units `ntp_adjtime`'s `timex.freq` is expressed in: parts per
/// million, scaled by 2^16.
const FREQ_SCALE: f64 = 65536.0 * 1_000_000.0;

#[derive(Debug, Default)]
pub struct UnixClock;

impl UnixClock {
    pub fn new() -> Self {
        Self
    }

    fn adjtime(&self, tx: &mut libc::timex) -> Result<(), ClockError> {
        let rc = unsafe { libc::ntp_adjtime(tx) };
        if rc < 0 {
            return Err(ClockError::from_last_errno());
        }
        Ok(())
    }
}

impl LocalClock for UnixClock {
    type Error = ClockError;

    fn now(&self) -> Result<NtpTimestamp, Self::Error> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
        if rc != 0 {
            return Err(ClockError::from_last_errno());
        }
        let unix_secs = ts.tv_sec as u64;
        Ok(NtpTimestamp::from_seconds_nanos_since_ntp_era(
            ntp_proto::time::EPOCH_OFFSET.wrapping_add(unix_secs as u32),
            ts.tv_nsec as u32,
        ))
    }

    #[tracing::instrument(skip(self))]
    fn step(&mut self, offset: NtpDuration) -> Result<(), Self::Error> {
        let stepped = self.now()? + offset;
        let system_time = stepped.to_system_time().ok_or(ClockError::Unsupported)?;
        let duration = system_time.duration_since(UNIX_EPOCH).unwrap_or_default();
        let ts = libc::timespec {
            tv_sec: duration.as_secs() as libc::time_t,
            tv_nsec: duration.subsec_nanos() as libc::c_long,
        };
        let rc = unsafe { libc::clock_settime(libc::CLOCK_REALTIME, &ts) };
        if rc != 0 {
            return Err(ClockError::from_last_errno());
        }
        tracing::info!(offset = offset.to_seconds(), "stepped system clock");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn steer(&mut self, frequency: f64, offset: f64) -> Result<(), Self::Error> {
        let mut tx: libc::timex = unsafe { std::mem::zeroed() };
        tx.modes = (libc::ADJ_OFFSET | libc::ADJ_FREQUENCY) as u32;
        tx.offset = (offset * 1_000_000.0) as libc::c_long;
        tx.freq = (frequency * FREQ_SCALE) as libc::c_long;
        self.adjtime(&mut tx)
    }

    fn current_frequency(&self) -> Result<f64, Self::Error> {
        let mut tx: libc::timex = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::ntp_adjtime(&mut tx) };
        if rc < 0 {
            return Err(ClockError::from_last_errno());
        }
        Ok(tx.freq as f64 / FREQ_SCALE)
    }

    #[tracing::instrument(skip(self))]
    fn set_frequency(&mut self, frequency: f64) -> Result<(), Self::Error> {
        let mut tx: libc::timex = unsafe { std::mem::zeroed() };
        tx.modes = libc::ADJ_FREQUENCY as u32;
        tx.freq = (frequency * FREQ_SCALE) as libc::c_long;
        self.adjtime(&mut tx)
    }

    fn notify_parameter_change(&mut self, kind: ClockChangeKind) {
        tracing::debug!(?kind, "clock parameter change");
    }
}
