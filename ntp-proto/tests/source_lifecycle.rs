//! End-to-end exercise of a source's reachability register and what
//! happens to the reference once nothing is left to select (spec §8
//! scenario 6: "reachability after offline").

use ntp_proto::{
    select_source, LeapDecision, NtpDuration, NtpTimestamp, Reference, ReferenceConfig,
    SelectOption, SelectOutcome, SelectionConfig, SelectorState, SourceKind, SourceRecord,
    SourceRegistry,
};

fn now() -> NtpTimestamp {
    NtpTimestamp::from_seconds_nanos_since_ntp_era(100_000, 0)
}

fn refid(n: u32) -> ntp_proto::ReferenceId {
    ntp_proto::ReferenceId::from_int(n)
}

fn with_samples(offset_seconds: f64, root_distance: f64, stratum: u8) -> ntp_proto::Statistics {
    let mut stats = ntp_proto::Statistics::for_ntp_source(1.0);
    for i in 0..4 {
        stats.accumulate(ntp_proto::Sample {
            time: NtpTimestamp::from_seconds_nanos_since_ntp_era(99_900 + i, 0),
            offset: NtpDuration::from_seconds(offset_seconds),
            peer_delay: NtpDuration::from_seconds(0.01),
            peer_dispersion: NtpDuration::from_seconds(0.001),
            root_delay: NtpDuration::from_seconds(root_distance),
            root_dispersion: NtpDuration::from_seconds(root_distance),
            stratum,
        });
    }
    stats
}

#[test]
fn eight_missed_polls_drive_reachability_to_zero() {
    let mut registry = SourceRegistry::new();
    let id = registry.insert(|id| {
        let mut record = SourceRecord::new(
            id,
            refid(1),
            None,
            SourceKind::Ntp,
            SelectOption::Normal,
            with_samples(0.0, 0.010, 2),
        );
        record.reachability = 0xff;
        record
    });

    for _ in 0..8 {
        registry.get_mut(id).unwrap().note_poll_sent();
    }

    assert_eq!(registry.get(id).unwrap().reachability, 0);
    assert!(!registry.get(id).unwrap().is_reachable());
}

/// Once the only source is removed entirely (the daemon's view of "no
/// other survivor exists" — spec §8 scenario 6's closing clause), the
/// selector reports `WaitsSources` and the reference must be pushed to
/// its local fallback explicitly; it does not do so on its own.
#[test]
fn losing_the_only_source_falls_back_to_local_once_told() {
    let mut registry = SourceRegistry::new();
    let id = registry.insert(|id| {
        let mut record = SourceRecord::new(
            id,
            refid(1),
            None,
            SourceKind::Ntp,
            SelectOption::Normal,
            with_samples(0.0, 0.010, 2),
        );
        record.reachability = 0xff;
        record
    });

    let config = SelectionConfig::default();
    let mut state = SelectorState::default();
    let outcome = select_source(&mut registry, now(), None, &config, &mut state);
    assert!(matches!(outcome, SelectOutcome::Applied(_)));

    registry.remove(id);

    let outcome = select_source(&mut registry, now(), None, &config, &mut state);
    assert!(matches!(
        outcome,
        SelectOutcome::WaitsSources
    ));
    assert!(registry.is_empty());

    let mut reference = Reference::new(ReferenceConfig::default());
    reference.fall_back_to_local(now());
    assert_eq!(reference.tracking().stratum, ReferenceConfig::default().local_stratum);
}

/// With two survivors, taking one fully unreachable still leaves the
/// other selectable — reselection runs and a new winner is applied,
/// rather than the reference falling back to local.
#[test]
fn reselection_continues_on_the_remaining_survivor() {
    let mut registry = SourceRegistry::new();
    let going_offline = registry.insert(|id| {
        let mut record = SourceRecord::new(
            id,
            refid(1),
            None,
            SourceKind::Ntp,
            SelectOption::Normal,
            with_samples(0.0, 0.010, 2),
        );
        record.reachability = 0xff;
        record
    });
    let staying_up = registry.insert(|id| {
        let mut record = SourceRecord::new(
            id,
            refid(2),
            None,
            SourceKind::Ntp,
            SelectOption::Normal,
            with_samples(0.0005, 0.010, 2),
        );
        record.reachability = 0xff;
        record
    });

    let config = SelectionConfig::default();
    let mut state = SelectorState::default();
    select_source(&mut registry, now(), None, &config, &mut state);

    for _ in 0..8 {
        registry.get_mut(going_offline).unwrap().note_poll_sent();
    }
    registry.remove(going_offline);

    let outcome = select_source(&mut registry, now(), None, &config, &mut state);
    match outcome {
        SelectOutcome::Applied(estimate) => assert_eq!(estimate.winner, staying_up),
        other => panic!("expected Applied with the surviving source, got {other:?}"),
    }
}

/// `vote_leap` (private) is exercised indirectly: a majority-agreeing
/// leap announcement across survivors should be reflected once applied
/// to the reference.
#[test]
fn majority_leap_announcement_reaches_the_reference() {
    let mut registry = SourceRegistry::new();
    for i in 0..3 {
        registry.insert(|id| {
            let mut record = SourceRecord::new(
                id,
                refid(i + 1),
                None,
                SourceKind::Ntp,
                SelectOption::Normal,
                with_samples(0.0, 0.010, 2),
            );
            record.reachability = 0xff;
            record.leap = ntp_proto::NtpLeapIndicator::Leap61;
            record
        });
    }

    let config = SelectionConfig::default();
    let mut state = SelectorState::default();
    let outcome = select_source(&mut registry, now(), None, &config, &mut state);

    match outcome {
        SelectOutcome::Applied(estimate) => {
            assert_eq!(estimate.leap, LeapDecision::InsertSecond);
        }
        other => panic!("expected Applied, got {other:?}"),
    }
}
