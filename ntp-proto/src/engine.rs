//! The per-source NTP protocol state machine (spec §4.7): builds client
//! requests, validates server replies, and turns accepted replies into
//! [`Sample`]s without touching a socket directly. The caller (the
//! daemon's scheduler + source directory) owns the actual I/O and just
//! drives this type with bytes and timestamps.

use md5::{Digest, Md5};

use crate::packet::{
    NtpAssociationMode, NtpHeader, NtpLeapIndicator, PacketParseError, HEADER_LENGTH, MAX_STRATUM,
};
use crate::source::SourceRecord;
use crate::statistics::Sample;
use crate::time::{NtpDuration, NtpTimestamp};

const MAC_TRAILER_LENGTH: usize = 4 + 16;

/// A symmetric (pre-shared) key used for the historical NTP MAC scheme
/// (spec §7.1): `digest = MD5(key || packet)`, trailer is the 4-byte key
/// id followed by the 16-byte digest.
#[derive(Debug, Clone)]
pub struct SymmetricKeyMac {
    pub key_id: u32,
    pub key: Vec<u8>,
}

impl SymmetricKeyMac {
    pub fn new(key_id: u32, key: Vec<u8>) -> Self {
        Self { key_id, key }
    }

    fn digest(&self, packet: &[u8]) -> [u8; 16] {
        let mut hasher = Md5::new();
        hasher.update(&self.key);
        hasher.update(packet);
        hasher.finalize().into()
    }

    fn append_trailer(&self, packet: &mut Vec<u8>) {
        packet.extend_from_slice(&self.key_id.to_be_bytes());
        packet.extend_from_slice(&self.digest(&packet[..HEADER_LENGTH]));
    }

    fn verify(&self, full_packet: &[u8]) -> bool {
        if full_packet.len() < HEADER_LENGTH + MAC_TRAILER_LENGTH {
            return false;
        }
        let trailer_start = full_packet.len() - MAC_TRAILER_LENGTH;
        let key_id = u32::from_be_bytes(full_packet[trailer_start..trailer_start + 4].try_into().unwrap());
        if key_id != self.key_id {
            return false;
        }
        let expected = self.digest(&full_packet[..HEADER_LENGTH]);
        full_packet[trailer_start + 4..] == expected[..]
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub min_poll_exponent: i8,
    pub max_poll_exponent: i8,
    pub initial_poll_exponent: i8,
    pub max_delay: NtpDuration,
    pub max_delay_dev_ratio: f64,
    /// Spec §4.7 sanity test: reject a reply whose delay exceeds
    /// `max_delay_ratio * min_round_trip_delay()` over this source's
    /// window, on top of the flat `max_delay` ceiling.
    pub max_delay_ratio: f64,
    pub max_clock_error_ppm: f64,
    /// Number of consecutive good samples before the poll interval is
    /// allowed to lengthen again (spec §4.7 "poll adaptation").
    pub poll_backoff_streak: u8,
    /// Spacing between requests while a burst is in progress (spec
    /// §4.7 "Burst": "tight intervals").
    pub burst_interval: NtpDuration,
    /// Taking the source online fires an `iburst_n`-long burst instead
    /// of a single poll (spec §4.7 "Online/offline").
    pub iburst: bool,
    pub iburst_n: u8,
    /// Sends each request twice back to back, trading bandwidth for a
    /// better chance of a reply surviving a lossy path (spec §4.7
    /// option flag list).
    pub presend: bool,
    /// Automatically takes the source offline once its path is
    /// reported gone rather than continuing to poll a dead route (spec
    /// §4.7 option flag list).
    pub auto_offline: bool,
    /// `Client` for ordinary server associations, `SymmetricActive` for
    /// peer mode (spec §4.7 "compose header... mode = CLIENT for server
    /// mode / SYMMETRIC_ACTIVE for peer mode").
    pub association_mode: NtpAssociationMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_poll_exponent: 4,  // 16s
            max_poll_exponent: 10, // ~17min
            initial_poll_exponent: 6,
            max_delay: NtpDuration::from_seconds(1.0),
            max_delay_dev_ratio: 3.0,
            max_delay_ratio: 8.0,
            max_clock_error_ppm: 1.0,
            poll_backoff_streak: 4,
            burst_interval: NtpDuration::from_seconds(2.0),
            iburst: false,
            iburst_n: 8,
            presend: false,
            auto_offline: false,
            association_mode: NtpAssociationMode::Client,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Online,
    Offline,
}

/// Tracks an in-progress burst: extra measurements outside the regular
/// polling schedule, requested either by an operator (spec §4.7
/// "Burst") or automatically by `iburst` on going online.
#[derive(Debug, Clone, Copy)]
struct BurstState {
    good_remaining: u8,
    total_remaining: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineAction {
    Transmit(Vec<u8>),
    SetTimer(NtpDuration),
    /// A sample was accumulated into the source's statistics; the caller
    /// should bump the registry's update sequence and consider
    /// re-running the selector.
    Accepted,
    Reset,
    Demobilize,
}

pub struct EngineActionIterator {
    actions: std::vec::IntoIter<EngineAction>,
}

impl Iterator for EngineActionIterator {
    type Item = EngineAction;

    fn next(&mut self) -> Option<Self::Item> {
        self.actions.next()
    }
}

fn actions(v: Vec<EngineAction>) -> EngineActionIterator {
    EngineActionIterator {
        actions: v.into_iter(),
    }
}

/// Drives one source's wire-level conversation. Holds only protocol
/// bookkeeping that doesn't belong in [`SourceRecord`] (the pending
/// request's origin timestamp, the authentication key, poll-rate
/// adaptation state).
pub struct ProtocolEngine {
    config: EngineConfig,
    poll_exponent: i8,
    mode: Mode,
    pending_transmit: Option<NtpTimestamp>,
    mac: Option<SymmetricKeyMac>,
    good_streak: u8,
    burst: Option<BurstState>,
}

impl ProtocolEngine {
    pub fn new(config: EngineConfig, mac: Option<SymmetricKeyMac>) -> Self {
        let poll_exponent = config.initial_poll_exponent;
        Self {
            config,
            poll_exponent,
            mode: Mode::Online,
            pending_transmit: None,
            mac,
            good_streak: 0,
            burst: None,
        }
    }

    pub fn go_offline(&mut self) {
        self.mode = Mode::Offline;
        self.burst = None;
    }

    /// Takes the source online. Per spec §4.7 this "resets counters and
    /// schedules an immediate transmission (optionally a burst of
    /// `iburst_n` back-to-back queries)".
    pub fn go_online(&mut self) {
        self.mode = Mode::Online;
        self.good_streak = 0;
        if self.config.iburst {
            self.request_burst(1, self.config.iburst_n);
        }
    }

    /// Auto-offline hook: called by the caller when the route to this
    /// source is reported gone (spec §4.7 option flag list). A no-op
    /// unless `auto_offline` is configured.
    pub fn note_network_gone(&mut self) {
        if self.config.auto_offline {
            self.go_offline();
        }
    }

    /// Requests extra measurements outside the regular polling
    /// schedule: up to `n_total` attempts, stopping early once
    /// `n_good` of them succeed (spec §4.7 "Burst").
    pub fn request_burst(&mut self, n_good: u8, n_total: u8) {
        self.burst = Some(BurstState {
            good_remaining: n_good.max(1),
            total_remaining: n_total.max(n_good).max(1),
        });
    }

    pub fn is_bursting(&self) -> bool {
        self.burst.is_some()
    }

    /// Command-surface "activity" report (spec §11): whether this
    /// source is currently taking polls at all.
    pub fn is_online(&self) -> bool {
        self.mode == Mode::Online
    }

    pub fn poll_interval(&self) -> NtpDuration {
        if self.burst.is_some() {
            self.config.burst_interval
        } else {
            NtpDuration::from_exponent(self.poll_exponent)
        }
    }

    /// Builds and serializes a client request, remembering its transmit
    /// timestamp so the matching reply can be validated.
    #[tracing::instrument(skip(self, record), fields(id = ?record.id))]
    pub fn poll(&mut self, record: &mut SourceRecord, now: NtpTimestamp) -> EngineActionIterator {
        if self.mode == Mode::Offline {
            return actions(vec![]);
        }

        if self.pending_transmit.is_some() {
            // the previous request's window closed without a reply.
            record.note_poll_sent();
            self.on_miss();
        }

        let transmit_timestamp = NtpTimestamp::now_fuzzed_from(now);
        self.pending_transmit = Some(transmit_timestamp);

        let header = NtpHeader {
            leap: NtpLeapIndicator::NoWarning,
            version: 4,
            mode: self.config.association_mode,
            stratum: 0,
            poll: self.poll_exponent,
            precision: -20,
            root_delay: NtpDuration::ZERO,
            root_dispersion: NtpDuration::ZERO,
            reference_id: record.reference_id,
            reference_timestamp: NtpTimestamp::ZERO,
            origin_timestamp: NtpTimestamp::ZERO,
            receive_timestamp: NtpTimestamp::ZERO,
            transmit_timestamp,
        };

        let mut bytes = header.serialize().to_vec();
        if let Some(mac) = &self.mac {
            mac.append_trailer(&mut bytes);
        }

        let mut out = vec![EngineAction::Transmit(bytes.clone())];
        if self.config.presend {
            out.push(EngineAction::Transmit(bytes));
        }
        out.push(EngineAction::SetTimer(self.poll_interval()));
        actions(out)
    }

    /// Called when a poll's response window elapses with nothing having
    /// arrived: counts as an unreachable slot and speeds up polling.
    #[tracing::instrument(skip(self, record), fields(id = ?record.id))]
    pub fn handle_timeout(&mut self, record: &mut SourceRecord) -> EngineActionIterator {
        if self.pending_transmit.take().is_some() {
            record.note_poll_sent();
            self.on_miss();
        }
        actions(vec![EngineAction::SetTimer(self.poll_interval())])
    }

    #[tracing::instrument(skip(self, record, reply_bytes), fields(id = ?record.id))]
    pub fn handle_reply(
        &mut self,
        record: &mut SourceRecord,
        reply_bytes: &[u8],
        received_at: NtpTimestamp,
    ) -> EngineActionIterator {
        let Some(t1) = self.pending_transmit else {
            tracing::debug!("reply with no outstanding request, ignoring");
            return actions(vec![]);
        };

        if let Some(mac) = &self.mac {
            if !mac.verify(reply_bytes) {
                tracing::warn!("MAC verification failed, discarding reply");
                return actions(vec![]);
            }
        }

        let header = match NtpHeader::parse(reply_bytes) {
            Ok(h) => h,
            Err(PacketParseError::TooShort) => {
                tracing::warn!("reply too short to parse");
                return actions(vec![]);
            }
            Err(PacketParseError::UnsupportedVersion(v)) => {
                tracing::warn!(version = v, "reply has unsupported version");
                return actions(vec![]);
            }
        };

        let expected_reply_mode = match self.config.association_mode {
            NtpAssociationMode::SymmetricActive => NtpAssociationMode::SymmetricPassive,
            _ => NtpAssociationMode::Server,
        };
        if header.mode() != expected_reply_mode {
            tracing::debug!(?header, "reply has unexpected mode, discarding");
            return actions(vec![]);
        }

        if header.origin_timestamp != t1 {
            tracing::debug!("reply origin timestamp does not match last request, discarding");
            return actions(vec![]);
        }

        // From here the reply authenticates and round-trips correctly:
        // the path is confirmed alive even if the payload gets rejected
        // below, so reachability is updated unconditionally past this
        // point.
        self.pending_transmit = None;
        record.note_reply_received();
        record.leap = header.leap;

        if header.stratum == 0 {
            let code = header.reference_id.to_bits();
            return self.handle_kiss(&code);
        }

        if header.stratum >= MAX_STRATUM {
            tracing::debug!(stratum = header.stratum, "reply stratum out of range");
            return actions(vec![EngineAction::SetTimer(self.poll_interval())]);
        }

        let t2 = header.receive_timestamp;
        let t3 = header.transmit_timestamp;
        let t4 = received_at;

        let delay = (t4 - t1) - (t3 - t2);
        // Raw measurement convention here is the mirror image of the
        // statistics layer's (spec §3 data model / §4.7): negate exactly
        // once at ingress so everything downstream of this point agrees
        // that positive means the local clock is slow.
        let raw_offset = ((t2 - t1) + (t3 - t4)).divided_by(2);
        let offset = -raw_offset;

        if delay.is_negative() || delay > self.config.max_delay {
            tracing::debug!(delay = delay.to_seconds(), "reply delay out of bounds");
            self.on_miss();
            return actions(vec![EngineAction::SetTimer(self.poll_interval())]);
        }

        if let Some(min_rtt) = record.stats.min_round_trip_delay() {
            let ratio_ceiling =
                NtpDuration::from_seconds(min_rtt.to_seconds() * self.config.max_delay_ratio);
            if delay > ratio_ceiling {
                tracing::debug!(
                    delay = delay.to_seconds(),
                    min_rtt = min_rtt.to_seconds(),
                    "reply delay exceeds max_delay_ratio * min_round_trip_delay"
                );
                self.on_miss();
                return actions(vec![EngineAction::SetTimer(self.poll_interval())]);
            }
        }

        if !record.stats.is_good_sample(
            offset,
            delay,
            self.config.max_delay_dev_ratio,
            self.config.max_delay_ratio,
            self.config.max_clock_error_ppm,
            t4,
        ) {
            tracing::debug!("reply rejected by outlier test");
            self.on_miss();
            return actions(vec![EngineAction::SetTimer(self.poll_interval())]);
        }

        let sample = Sample {
            time: t4,
            offset,
            peer_delay: delay,
            peer_dispersion: NtpDuration::MIN_DISPERSION,
            root_delay: header.root_delay + delay,
            root_dispersion: header.root_dispersion,
            stratum: header.stratum,
        };
        record.stats.accumulate(sample);

        self.on_hit();

        actions(vec![
            EngineAction::Accepted,
            EngineAction::SetTimer(self.poll_interval()),
        ])
    }

    fn handle_kiss(&mut self, code: &[u8; 4]) -> EngineActionIterator {
        match code {
            b"DENY" | b"RSTR" => {
                self.mode = Mode::Offline;
                actions(vec![EngineAction::Demobilize])
            }
            b"RATE" => {
                self.poll_exponent = (self.poll_exponent + 1).min(self.config.max_poll_exponent);
                self.good_streak = 0;
                actions(vec![EngineAction::SetTimer(self.poll_interval())])
            }
            _ => actions(vec![EngineAction::SetTimer(self.poll_interval())]),
        }
    }

    fn on_hit(&mut self) {
        self.good_streak = self.good_streak.saturating_add(1);
        if self.good_streak >= self.config.poll_backoff_streak {
            self.good_streak = 0;
            self.poll_exponent = (self.poll_exponent + 1).min(self.config.max_poll_exponent);
        }
        self.note_burst_attempt(true);
    }

    fn on_miss(&mut self) {
        self.good_streak = 0;
        self.poll_exponent = (self.poll_exponent - 1).max(self.config.min_poll_exponent);
        self.note_burst_attempt(false);
    }

    /// Counts one burst attempt against `n_total`, and against `n_good`
    /// when it succeeded; ends the burst once either reaches zero
    /// (spec §4.7: "until `n_good` successful samples or `n_total`
    /// attempts").
    fn note_burst_attempt(&mut self, good: bool) {
        let Some(state) = &mut self.burst else {
            return;
        };
        state.total_remaining = state.total_remaining.saturating_sub(1);
        if good {
            state.good_remaining = state.good_remaining.saturating_sub(1);
        }
        if state.good_remaining == 0 || state.total_remaining == 0 {
            self.burst = None;
        }
    }

    pub fn reset(&mut self) -> EngineActionIterator {
        self.pending_transmit = None;
        self.good_streak = 0;
        self.poll_exponent = self.config.initial_poll_exponent;
        actions(vec![EngineAction::Reset])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refid::ReferenceId;
    use crate::source::{SelectOption, SourceId, SourceKind};
    use crate::statistics::Statistics;

    fn record() -> SourceRecord {
        SourceRecord::new(
            SourceId::new(0),
            ReferenceId::from_int(0),
            None,
            SourceKind::Ntp,
            SelectOption::Normal,
            Statistics::for_ntp_source(1.0),
        )
    }

    fn server_reply_to(request: &[u8], t2: NtpTimestamp, t3: NtpTimestamp) -> Vec<u8> {
        let req = NtpHeader::parse(request).unwrap();
        let reply = NtpHeader {
            leap: NtpLeapIndicator::NoWarning,
            version: 4,
            mode: NtpAssociationMode::Server,
            stratum: 2,
            poll: req.poll,
            precision: -20,
            root_delay: NtpDuration::from_seconds(0.005),
            root_dispersion: NtpDuration::from_seconds(0.005),
            reference_id: ReferenceId::from_int(1),
            reference_timestamp: NtpTimestamp::ZERO,
            origin_timestamp: req.transmit_timestamp,
            receive_timestamp: t2,
            transmit_timestamp: t3,
        };
        reply.serialize().to_vec()
    }

    #[test]
    fn accepted_reply_produces_a_sample_and_bumps_reachability() {
        let mut engine = ProtocolEngine::new(EngineConfig::default(), None);
        let mut src = record();

        let now = NtpTimestamp::from_seconds_nanos_since_ntp_era(1000, 0);
        let poll_actions: Vec<_> = engine.poll(&mut src, now).collect();
        let request = match &poll_actions[0] {
            EngineAction::Transmit(bytes) => bytes.clone(),
            other => panic!("expected Transmit, got {other:?}"),
        };

        let t2 = NtpTimestamp::from_seconds_nanos_since_ntp_era(1000, 100_000_000);
        let t3 = NtpTimestamp::from_seconds_nanos_since_ntp_era(1000, 110_000_000);
        let t4 = NtpTimestamp::from_seconds_nanos_since_ntp_era(1000, 200_000_000);
        let reply = server_reply_to(&request, t2, t3);

        let reply_actions: Vec<_> = engine.handle_reply(&mut src, &reply, t4).collect();
        assert!(reply_actions.contains(&EngineAction::Accepted));
        assert_eq!(src.reachability, 1);
        assert_eq!(src.stats.len(), 1);
    }

    #[test]
    fn mismatched_origin_timestamp_is_rejected_without_reachability_credit() {
        let mut engine = ProtocolEngine::new(EngineConfig::default(), None);
        let mut src = record();

        let now = NtpTimestamp::from_seconds_nanos_since_ntp_era(2000, 0);
        let poll_actions: Vec<_> = engine.poll(&mut src, now).collect();
        let request = match &poll_actions[0] {
            EngineAction::Transmit(bytes) => bytes.clone(),
            other => panic!("expected Transmit, got {other:?}"),
        };
        let mut tampered_header = NtpHeader::parse(&request).unwrap();
        tampered_header.transmit_timestamp =
            NtpTimestamp::from_seconds_nanos_since_ntp_era(1, 0);
        let tampered_request = tampered_header.serialize().to_vec();

        let t2 = NtpTimestamp::from_seconds_nanos_since_ntp_era(2000, 50_000_000);
        let t3 = NtpTimestamp::from_seconds_nanos_since_ntp_era(2000, 60_000_000);
        let t4 = NtpTimestamp::from_seconds_nanos_since_ntp_era(2000, 100_000_000);
        let reply = server_reply_to(&tampered_request, t2, t3);

        let reply_actions: Vec<_> = engine.handle_reply(&mut src, &reply, t4).collect();
        assert!(reply_actions.is_empty());
        assert_eq!(src.reachability, 0);
        assert_eq!(src.stats.len(), 0);
    }

    #[test]
    fn timeout_shifts_a_zero_into_reachability_and_speeds_up_polling() {
        let mut engine = ProtocolEngine::new(EngineConfig::default(), None);
        let mut src = record();
        let before = engine.poll_interval();

        let now = NtpTimestamp::from_seconds_nanos_since_ntp_era(3000, 0);
        let _ = engine.poll(&mut src, now).collect::<Vec<_>>();
        let _ = engine.handle_timeout(&mut src).collect::<Vec<_>>();

        assert_eq!(src.reachability, 0);
        assert!(engine.poll_interval() <= before);
    }

    #[test]
    fn deny_kiss_code_demobilizes_the_source() {
        let mut engine = ProtocolEngine::new(EngineConfig::default(), None);
        let mut src = record();

        let now = NtpTimestamp::from_seconds_nanos_since_ntp_era(4000, 0);
        let poll_actions: Vec<_> = engine.poll(&mut src, now).collect();
        let request = match &poll_actions[0] {
            EngineAction::Transmit(bytes) => bytes.clone(),
            other => panic!("expected Transmit, got {other:?}"),
        };

        let req = NtpHeader::parse(&request).unwrap();
        let kiss = NtpHeader {
            leap: NtpLeapIndicator::Unknown,
            version: 4,
            mode: NtpAssociationMode::Server,
            stratum: 0,
            poll: req.poll,
            precision: -20,
            root_delay: NtpDuration::ZERO,
            root_dispersion: NtpDuration::ZERO,
            reference_id: ReferenceId::from_ascii(*b"DENY"),
            reference_timestamp: NtpTimestamp::ZERO,
            origin_timestamp: req.transmit_timestamp,
            receive_timestamp: NtpTimestamp::ZERO,
            transmit_timestamp: NtpTimestamp::ZERO,
        };
        let reply = kiss.serialize().to_vec();

        let reply_actions: Vec<_> = engine
            .handle_reply(&mut src, &reply, NtpTimestamp::from_seconds_nanos_since_ntp_era(4000, 1))
            .collect();
        assert!(reply_actions.contains(&EngineAction::Demobilize));
    }

    #[test]
    fn burst_uses_tight_interval_and_ends_after_n_total_attempts() {
        let mut engine = ProtocolEngine::new(EngineConfig::default(), None);
        let mut src = record();
        engine.request_burst(5, 2);
        assert!(engine.is_bursting());
        assert_eq!(engine.poll_interval(), engine.config.burst_interval);

        let now = NtpTimestamp::from_seconds_nanos_since_ntp_era(6000, 0);
        let _ = engine.poll(&mut src, now).collect::<Vec<_>>();
        let _ = engine.handle_timeout(&mut src).collect::<Vec<_>>();
        assert!(engine.is_bursting(), "one miss out of n_total=2 should not end the burst");

        let _ = engine.poll(&mut src, now).collect::<Vec<_>>();
        let _ = engine.handle_timeout(&mut src).collect::<Vec<_>>();
        assert!(!engine.is_bursting(), "n_total attempts exhausted, burst should end");
    }

    #[test]
    fn burst_ends_early_once_n_good_samples_are_accepted() {
        let mut engine = ProtocolEngine::new(EngineConfig::default(), None);
        let mut src = record();
        engine.request_burst(1, 8);

        let now = NtpTimestamp::from_seconds_nanos_since_ntp_era(7000, 0);
        let poll_actions: Vec<_> = engine.poll(&mut src, now).collect();
        let request = match &poll_actions[0] {
            EngineAction::Transmit(bytes) => bytes.clone(),
            other => panic!("expected Transmit, got {other:?}"),
        };
        let t2 = NtpTimestamp::from_seconds_nanos_since_ntp_era(7000, 10_000_000);
        let t3 = NtpTimestamp::from_seconds_nanos_since_ntp_era(7000, 20_000_000);
        let t4 = NtpTimestamp::from_seconds_nanos_since_ntp_era(7000, 30_000_000);
        let reply = server_reply_to(&request, t2, t3);
        let _ = engine.handle_reply(&mut src, &reply, t4).collect::<Vec<_>>();

        assert!(!engine.is_bursting(), "n_good=1 satisfied by the first accepted sample");
    }

    #[test]
    fn iburst_fires_a_burst_on_going_online() {
        let config = EngineConfig {
            iburst: true,
            iburst_n: 4,
            ..EngineConfig::default()
        };
        let mut engine = ProtocolEngine::new(config, None);
        engine.go_offline();
        assert!(!engine.is_bursting());
        engine.go_online();
        assert!(engine.is_bursting());
    }

    #[test]
    fn presend_transmits_the_request_twice() {
        let config = EngineConfig {
            presend: true,
            ..EngineConfig::default()
        };
        let mut engine = ProtocolEngine::new(config, None);
        let mut src = record();
        let now = NtpTimestamp::from_seconds_nanos_since_ntp_era(8000, 0);
        let sent = engine
            .poll(&mut src, now)
            .filter(|a| matches!(a, EngineAction::Transmit(_)))
            .count();
        assert_eq!(sent, 2);
    }

    #[test]
    fn auto_offline_takes_the_source_offline_on_network_gone() {
        let config = EngineConfig {
            auto_offline: true,
            ..EngineConfig::default()
        };
        let mut engine = ProtocolEngine::new(config, None);
        let mut src = record();
        engine.note_network_gone();

        let now = NtpTimestamp::from_seconds_nanos_since_ntp_era(9000, 0);
        let poll_actions: Vec<_> = engine.poll(&mut src, now).collect();
        assert!(poll_actions.is_empty(), "offline engine must not transmit");
    }

    #[test]
    fn peer_mode_sends_symmetric_active_and_accepts_symmetric_passive() {
        let config = EngineConfig {
            association_mode: NtpAssociationMode::SymmetricActive,
            ..EngineConfig::default()
        };
        let mut engine = ProtocolEngine::new(config, None);
        let mut src = record();

        let now = NtpTimestamp::from_seconds_nanos_since_ntp_era(10_000, 0);
        let poll_actions: Vec<_> = engine.poll(&mut src, now).collect();
        let request = match &poll_actions[0] {
            EngineAction::Transmit(bytes) => bytes.clone(),
            other => panic!("expected Transmit, got {other:?}"),
        };
        assert_eq!(NtpHeader::parse(&request).unwrap().mode(), NtpAssociationMode::SymmetricActive);

        let req = NtpHeader::parse(&request).unwrap();
        let t2 = NtpTimestamp::from_seconds_nanos_since_ntp_era(10_000, 10_000_000);
        let t3 = NtpTimestamp::from_seconds_nanos_since_ntp_era(10_000, 20_000_000);
        let reply = NtpHeader {
            leap: NtpLeapIndicator::NoWarning,
            version: 4,
            mode: NtpAssociationMode::SymmetricPassive,
            stratum: 2,
            poll: req.poll,
            precision: -20,
            root_delay: NtpDuration::from_seconds(0.005),
            root_dispersion: NtpDuration::from_seconds(0.005),
            reference_id: ReferenceId::from_int(1),
            reference_timestamp: NtpTimestamp::ZERO,
            origin_timestamp: req.transmit_timestamp,
            receive_timestamp: t2,
            transmit_timestamp: t3,
        };

        let t4 = NtpTimestamp::from_seconds_nanos_since_ntp_era(10_000, 30_000_000);
        let reply_actions: Vec<_> = engine.handle_reply(&mut src, &reply.serialize(), t4).collect();
        assert!(reply_actions.contains(&EngineAction::Accepted));
    }

    #[test]
    fn mac_verification_rejects_tampered_payloads() {
        let mac = SymmetricKeyMac::new(1, b"a shared secret key".to_vec());
        let mut engine = ProtocolEngine::new(EngineConfig::default(), Some(mac.clone()));
        let mut src = record();

        let now = NtpTimestamp::from_seconds_nanos_since_ntp_era(5000, 0);
        let poll_actions: Vec<_> = engine.poll(&mut src, now).collect();
        let request = match &poll_actions[0] {
            EngineAction::Transmit(bytes) => bytes.clone(),
            other => panic!("expected Transmit, got {other:?}"),
        };

        let t2 = NtpTimestamp::from_seconds_nanos_since_ntp_era(5000, 10_000_000);
        let t3 = NtpTimestamp::from_seconds_nanos_since_ntp_era(5000, 20_000_000);
        let header_only = server_reply_to(&request, t2, t3);
        let mut reply = header_only[..HEADER_LENGTH].to_vec();
        let wrong_mac = SymmetricKeyMac::new(1, b"a different key!!!!".to_vec());
        wrong_mac.append_trailer(&mut reply);

        let t4 = NtpTimestamp::from_seconds_nanos_since_ntp_era(5000, 30_000_000);
        let reply_actions: Vec<_> = engine.handle_reply(&mut src, &reply, t4).collect();
        assert!(reply_actions.is_empty());
        assert_eq!(src.reachability, 0);
    }
}
