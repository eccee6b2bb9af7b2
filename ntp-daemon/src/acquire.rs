//! Rapid one-shot clock acquisition, the `ntpdate`-equivalent collaborator
//! (spec §9 Design Notes: "the ntpdate-like rapid acquisition mode is
//! modeled as a distinct external collaborator with its own sockets,
//! never sharing state with the main engine's per-source sockets"). Sends
//! one request to each configured server, waits briefly for replies, and
//! steps the local clock to the best observed offset so the slower,
//! disciplined [`crate::daemon::Daemon`] sources start from a clock
//! that's already close, instead of slewing a large initial error away.

use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::time::{Duration as StdDuration, Instant};

use ntp_proto::{
    LocalClock, NtpAssociationMode, NtpDuration, NtpHeader, NtpLeapIndicator, NtpTimestamp,
    ReferenceId,
};
use ntp_udp::{accept_packet, AcceptResult, NtpUdpSocket};

#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),
    #[error("local clock operation failed: {0}")]
    Clock(String),
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    offset: NtpDuration,
    delay: NtpDuration,
    stratum: u8,
}

/// How long to wait for replies before giving up on whatever already
/// arrived, mirroring `ntpdate`'s bounded one-shot timeout rather than
/// the main engine's open-ended reachability tracking.
const REPLY_WAIT: StdDuration = StdDuration::from_secs(3);

/// Sends a single client-mode request to each address in `servers` and
/// steps `clock` to the lowest-delay reply's offset. Returns the applied
/// offset, or `None` if nothing replied within [`REPLY_WAIT`] (matching
/// `ntpdate`'s "no server suitable for synchronization" outcome — logged
/// by the caller, never an error on its own).
pub fn acquire<C: LocalClock>(
    clock: &mut C,
    servers: &[SocketAddr],
) -> Result<Option<NtpDuration>, AcquireError> {
    if servers.is_empty() {
        return Ok(None);
    }

    let mut pending: Vec<(NtpUdpSocket, NtpTimestamp)> = Vec::with_capacity(servers.len());
    for &peer in servers {
        let local: SocketAddr = if peer.is_ipv6() {
            "[::]:0".parse().unwrap()
        } else {
            "0.0.0.0:0".parse().unwrap()
        };
        let socket = NtpUdpSocket::client(local, peer)?;
        let now = clock.now().map_err(|e| AcquireError::Clock(format!("{e:?}")))?;
        let transmit_timestamp = NtpTimestamp::now_fuzzed_from(now);
        let request = NtpHeader {
            leap: NtpLeapIndicator::NoWarning,
            version: 4,
            mode: NtpAssociationMode::Client,
            stratum: 0,
            poll: 4,
            precision: -20,
            root_delay: NtpDuration::ZERO,
            root_dispersion: NtpDuration::ZERO,
            reference_id: ReferenceId::from_int(0),
            reference_timestamp: NtpTimestamp::ZERO,
            origin_timestamp: NtpTimestamp::ZERO,
            receive_timestamp: NtpTimestamp::ZERO,
            transmit_timestamp,
        };
        if let Err(error) = socket.send(&request.serialize()) {
            tracing::warn!(%peer, ?error, "acquire: failed to send initial request");
            continue;
        }
        pending.push((socket, transmit_timestamp));
    }

    let observations = collect_replies(clock, &pending)?;
    let Some(best) = observations
        .iter()
        .min_by(|a, b| a.delay.cmp(&b.delay).then(a.stratum.cmp(&b.stratum)))
    else {
        tracing::warn!("acquire: no server replied in time");
        return Ok(None);
    };

    clock
        .step(best.offset)
        .map_err(|e| AcquireError::Clock(format!("{e:?}")))?;
    Ok(Some(best.offset))
}

fn collect_replies<C: LocalClock>(
    clock: &C,
    pending: &[(NtpUdpSocket, NtpTimestamp)],
) -> Result<Vec<Observation>, AcquireError> {
    let mut observations = Vec::new();
    if pending.is_empty() {
        return Ok(observations);
    }

    let deadline = Instant::now() + REPLY_WAIT;
    let mut buf = [0u8; 128];

    while Instant::now() < deadline && observations.len() < pending.len() {
        let mut pollfds: Vec<libc::pollfd> = pending
            .iter()
            .map(|(socket, _)| libc::pollfd {
                fd: socket.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        let remaining_ms = (deadline - Instant::now())
            .as_millis()
            .min(i32::MAX as u128) as libc::c_int;
        let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, remaining_ms) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(AcquireError::Socket(err));
        }
        if rc == 0 {
            break;
        }

        for (index, pfd) in pollfds.iter().enumerate() {
            if pfd.revents & libc::POLLIN == 0 {
                continue;
            }
            let (socket, t1) = &pending[index];
            let result = socket.recv(&mut buf);
            if let AcceptResult::Accept(bytes, t4) = accept_packet(result, &buf, clock) {
                if let Ok(reply) = NtpHeader::parse(bytes) {
                    if reply.mode() == NtpAssociationMode::Server && reply.origin_timestamp == *t1 {
                        let t2 = reply.receive_timestamp;
                        let t3 = reply.transmit_timestamp;
                        // Same sign convention as `engine.rs::handle_reply`: negate
                        // the raw measurement once here so `clock.step` below steps
                        // the same direction the disciplined engine would.
                        let raw_offset = ((t2 - *t1) + (t3 - t4)).divided_by(2);
                        let offset = -raw_offset;
                        let delay = (t4 - *t1) - (t3 - t2);
                        observations.push(Observation {
                            offset,
                            delay,
                            stratum: reply.stratum,
                        });
                    }
                }
            }
        }
    }

    Ok(observations)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_server_list_is_a_no_op() {
        let mut clock = ntp_proto::clock::TestClock::new();
        let result = acquire(&mut clock, &[]).unwrap();
        assert!(result.is_none());
        assert!(!clock.stepped());
    }
}
