//! The reference: the daemon's single current time estimate and the
//! step-vs-slew decision that turns it into clock discipline (spec §4.6).

use crate::clock::{ClockChangeKind, LocalClock};
use crate::packet::NtpLeapIndicator;
use crate::refid::ReferenceId;
use crate::selector::{CombinedEstimate, LeapDecision};
use crate::source::SourceRegistry;
use crate::time::{NtpDuration, NtpTimestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisciplineAction {
    Stepped,
    Slewed,
    Ignored,
}

#[derive(Debug, Clone, Copy)]
pub struct ReferenceConfig {
    /// A correction larger than this is stepped instead of slewed.
    pub make_step_threshold: NtpDuration,
    /// Once this many updates have passed since startup, stepping is
    /// refused even if `make_step_threshold` is exceeded (spec §4.6:
    /// "after the first N updates, a large offset is suspect, not a
    /// legitimate clock jump").
    pub make_step_limit: u32,
    pub max_clock_error_ppm: f64,
    pub local_stratum: u8,
    /// Governs how long a slew is spread over: `|offset| *
    /// correction_time_ratio` seconds (spec §4.6). Surfaced through
    /// [`ObservableTrackingData::slew_remaining_seconds`] rather than
    /// used to shape the frequency term itself — the actual absorption
    /// rate is the `LocalClock` implementation's own contract (the
    /// kernel PLL's time constant for `UnixClock`'s `ADJ_OFFSET`), so
    /// this is the *reported* target duration, not a scheduling knob.
    pub correction_time_ratio: f64,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            make_step_threshold: NtpDuration::from_seconds(0.125),
            make_step_limit: 3,
            max_clock_error_ppm: 1.0,
            local_stratum: 10,
            correction_time_ratio: 3.0,
        }
    }
}

/// A snapshot of the current reference suitable for reporting over the
/// control protocol (spec §4.6, §11 "report" operations).
#[derive(Debug, Clone, Copy)]
pub struct ObservableTrackingData {
    pub stratum: u8,
    pub leap: NtpLeapIndicator,
    pub reference_id: ReferenceId,
    pub reference_time: NtpTimestamp,
    pub offset: NtpDuration,
    pub offset_sd: f64,
    pub frequency: f64,
    pub skew: f64,
    pub root_delay: NtpDuration,
    pub root_dispersion: NtpDuration,
    pub last_discipline: DisciplineAction,
    /// Target duration of the most recent slew (`|offset| *
    /// correction_time_ratio`, spec §4.6), zero after a step or when
    /// nothing has been applied yet.
    pub slew_remaining_seconds: f64,
}

impl Default for ObservableTrackingData {
    fn default() -> Self {
        Self {
            stratum: crate::packet::MAX_STRATUM,
            leap: NtpLeapIndicator::Unknown,
            reference_id: ReferenceId::from_int(0),
            reference_time: NtpTimestamp::ZERO,
            offset: NtpDuration::ZERO,
            offset_sd: 0.0,
            frequency: 0.0,
            skew: f64::INFINITY,
            root_delay: NtpDuration::ZERO,
            root_dispersion: NtpDuration::MAX_DISPERSION,
            last_discipline: DisciplineAction::Ignored,
            slew_remaining_seconds: 0.0,
        }
    }
}

/// Owns the daemon's single current time estimate and steers a
/// [`LocalClock`] toward it. Holds no sockets or scheduling state of its
/// own — it is fed `CombinedEstimate`s by the selector and reacts.
pub struct Reference {
    config: ReferenceConfig,
    updates_since_start: u32,
    tracking: ObservableTrackingData,
    force_next_step: bool,
}

impl Reference {
    pub fn new(config: ReferenceConfig) -> Self {
        Self {
            config,
            updates_since_start: 0,
            tracking: ObservableTrackingData::default(),
            force_next_step: false,
        }
    }

    pub fn tracking(&self) -> ObservableTrackingData {
        self.tracking
    }

    /// Forces the next `apply` to step the clock to the new estimate
    /// regardless of `make_step_threshold`/`make_step_limit` (control
    /// surface "make-step" operation, spec §6).
    pub fn request_step(&mut self) {
        self.force_next_step = true;
    }

    /// Applies a freshly selected estimate: decides step vs slew, steers
    /// the clock, reports the decision back so samples already in flight
    /// across every source's statistics window can be kept consistent
    /// (spec §4.6: "a step invalidates every source's sample window
    /// unless it is adjusted in lockstep").
    pub fn apply<C: LocalClock>(
        &mut self,
        clock: &mut C,
        registry: &mut SourceRegistry,
        winner_stratum: u8,
        winner_reference_id: ReferenceId,
        estimate: &CombinedEstimate,
    ) -> Result<DisciplineAction, C::Error> {
        self.updates_since_start = self.updates_since_start.saturating_add(1);

        let offset_seconds = estimate.offset.to_seconds();
        let may_step = self.updates_since_start <= self.config.make_step_limit;
        let exceeds_threshold = estimate.offset.abs() >= self.config.make_step_threshold;
        let forced_step = std::mem::take(&mut self.force_next_step);

        let slew_seconds = offset_seconds.abs() * self.config.correction_time_ratio;

        let action = if forced_step || (exceeds_threshold && may_step) {
            clock.step(estimate.offset)?;
            for source in registry.iter_mut() {
                source.stats.reset();
            }
            DisciplineAction::Stepped
        } else if exceeds_threshold {
            // Too late in the run to step on this alone; slew toward it
            // instead of silently discarding the estimate.
            clock.steer(0.0, offset_seconds)?;
            let cooked_now = clock.now()?;
            for source in registry.iter_mut() {
                source.stats.slew_samples(cooked_now, 0.0, offset_seconds);
            }
            DisciplineAction::Slewed
        } else {
            clock.steer(estimate.frequency, offset_seconds)?;
            let cooked_now = clock.now()?;
            for source in registry.iter_mut() {
                source
                    .stats
                    .slew_samples(cooked_now, estimate.frequency, offset_seconds);
            }
            DisciplineAction::Slewed
        };

        let change_kind = match action {
            DisciplineAction::Stepped => ClockChangeKind::Step,
            DisciplineAction::Slewed => ClockChangeKind::Adjust,
            DisciplineAction::Ignored => ClockChangeKind::Unknown,
        };
        clock.notify_parameter_change(change_kind);

        self.apply_leap(estimate.leap);

        self.tracking = ObservableTrackingData {
            stratum: winner_stratum.saturating_add(1).max(1),
            leap: self.tracking.leap,
            reference_id: winner_reference_id,
            reference_time: estimate.reference_time,
            offset: estimate.offset,
            offset_sd: estimate.offset_sd,
            frequency: estimate.frequency,
            skew: estimate.skew,
            root_delay: estimate.root_delay,
            root_dispersion: estimate.root_dispersion,
            last_discipline: action,
            slew_remaining_seconds: if action == DisciplineAction::Slewed {
                slew_seconds
            } else {
                0.0
            },
        };

        Ok(action)
    }

    fn apply_leap(&mut self, decision: LeapDecision) {
        self.tracking.leap = match decision {
            LeapDecision::None => NtpLeapIndicator::NoWarning,
            LeapDecision::InsertSecond => NtpLeapIndicator::Leap61,
            LeapDecision::DeleteSecond => NtpLeapIndicator::Leap59,
        };
    }

    /// Called when the selector cannot produce an estimate (no majority,
    /// waiting on stats/sources/update); grows dispersion at the
    /// configured rate so the reported root distance keeps reflecting
    /// reality instead of going stale (spec §4.6).
    pub fn age_without_update(&mut self, elapsed_seconds: f64) {
        let growth =
            NtpDuration::from_seconds((self.config.max_clock_error_ppm * 1e-6 * elapsed_seconds).abs());
        self.tracking.root_dispersion = self.tracking.root_dispersion + growth;
    }

    /// Local-stratum fallback used when nothing is selected at all (spec
    /// §4.6's "orphan mode" / local free-running reference).
    pub fn fall_back_to_local(&mut self, now: NtpTimestamp) {
        self.tracking = ObservableTrackingData {
            stratum: self.config.local_stratum,
            leap: NtpLeapIndicator::NoWarning,
            reference_id: ReferenceId::from_ascii(*b"LOCL"),
            reference_time: now,
            offset: NtpDuration::ZERO,
            offset_sd: 0.0,
            frequency: 0.0,
            skew: f64::INFINITY,
            root_delay: NtpDuration::ZERO,
            root_dispersion: NtpDuration::ZERO,
            last_discipline: DisciplineAction::Ignored,
            slew_remaining_seconds: 0.0,
        };
    }
}
