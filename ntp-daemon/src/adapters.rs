//! Stub adapters for the explicitly out-of-scope external collaborators
//! named in spec §6/§11: the command surface, reference clock drivers,
//! the RTC, and operator-entered manual corrections. Each is a thin
//! trait plus a minimal in-process implementation, so the core can be
//! exercised and tested without a real wire protocol behind it (spec
//! §1 Non-goals: "command auth/replay protection" is out of scope, the
//! operations list itself is not).

use std::net::IpAddr;
use std::path::PathBuf;

use ntp_proto::{FilterState, LocalClock, NtpDuration, SourceId, SourceKind, SourceStatus};
use serde::{Deserialize, Serialize};

use crate::daemon::Daemon;
use crate::directory::{AddrOrName, SourceParams};
use crate::dump::{self, DumpError};

/// One command-surface request (spec §6 "a command interface exists...
/// this specification does not fix the command wire format"; the
/// operations list itself is fixed, so that's what this enum encodes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlRequest {
    AddSource {
        address: String,
        kind: SourceKindArg,
        mode: AssociationModeArg,
        prefer: bool,
        noselect: bool,
        iburst: bool,
        presend: bool,
        auto_offline: bool,
        minpoll: i8,
        maxpoll: i8,
    },
    RemoveSource {
        id: u32,
    },
    SetOnline {
        id: u32,
        online: bool,
    },
    ModifyPollBounds {
        id: u32,
        minpoll: i8,
        maxpoll: i8,
    },
    Burst {
        id: u32,
        n_good: u8,
        n_total: u8,
    },
    Dump {
        id: u32,
        dumpdir: PathBuf,
    },
    MakeStep,
    Reselect,
    ReportTracking,
    ReportSources,
    ReportSourceStats,
    ReportActivity,
    AccessEdit {
        list: AccessList,
        subnet_addr: IpAddr,
        prefix_bits: u8,
        allow: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum SourceKindArg {
    Ntp,
    RefClock,
}

impl From<SourceKindArg> for SourceKind {
    fn from(value: SourceKindArg) -> Self {
        match value {
            SourceKindArg::Ntp => SourceKind::Ntp,
            SourceKindArg::RefClock => SourceKind::RefClock,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum AssociationModeArg {
    Server,
    Peer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum AccessList {
    Ntp,
    Cmd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceReport {
    pub id: u32,
    pub reference_id: String,
    pub address: Option<String>,
    pub status: SourceStatusArg,
    pub reachability: u8,
    pub score: f64,
    pub online: bool,
    pub bursting: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceStatusArg {
    Ok,
    Unselectable,
    BadStats,
    WaitsStats,
    Stale,
    Falseticker,
    Jittery,
    WaitsSources,
    NonPreferred,
    WaitsUpdate,
    Distant,
    Outlier,
    Unselected,
    Selected,
}

impl From<SourceStatus> for SourceStatusArg {
    fn from(value: SourceStatus) -> Self {
        match value {
            SourceStatus::Ok => SourceStatusArg::Ok,
            SourceStatus::Unselectable => SourceStatusArg::Unselectable,
            SourceStatus::BadStats => SourceStatusArg::BadStats,
            SourceStatus::WaitsStats => SourceStatusArg::WaitsStats,
            SourceStatus::Stale => SourceStatusArg::Stale,
            SourceStatus::Falseticker => SourceStatusArg::Falseticker,
            SourceStatus::Jittery => SourceStatusArg::Jittery,
            SourceStatus::WaitsSources => SourceStatusArg::WaitsSources,
            SourceStatus::NonPreferred => SourceStatusArg::NonPreferred,
            SourceStatus::WaitsUpdate => SourceStatusArg::WaitsUpdate,
            SourceStatus::Distant => SourceStatusArg::Distant,
            SourceStatus::Outlier => SourceStatusArg::Outlier,
            SourceStatus::Unselected => SourceStatusArg::Unselected,
            SourceStatus::Selected => SourceStatusArg::Selected,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceStatsReport {
    pub id: u32,
    pub samples: usize,
    pub frequency_ppm: f64,
    pub skew_ppm: f64,
    pub offset_seconds: f64,
    pub variance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingReport {
    pub stratum: u8,
    pub reference_id: String,
    pub offset_seconds: f64,
    pub frequency_ppm: f64,
    pub skew_ppm: f64,
    pub root_delay_seconds: f64,
    pub root_dispersion_seconds: f64,
    pub slew_remaining_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityReport {
    pub online: usize,
    pub offline: usize,
    pub bursting: usize,
    pub unresolved: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlResponse {
    SourceAdded { id: Option<u32> },
    Ok,
    Error(String),
    Tracking(TrackingReport),
    Sources(Vec<SourceReport>),
    SourceStats(Vec<SourceStatsReport>),
    Activity(ActivityReport),
}

/// Drives the operations list named in spec §6/§11 against a live
/// [`Daemon`]. Deliberately not generic over the transport: a concrete
/// wire protocol (Unix socket, TCP, whatever) is exactly the piece spec
/// §1 leaves unspecified, so callers own framing and deserialize into
/// [`ControlRequest`] before handing it here.
pub trait ControlAdapter<C: LocalClock> {
    fn handle(&mut self, daemon: &mut Daemon<C>, request: ControlRequest) -> ControlResponse;
}

/// The in-process default: every operation resolves synchronously
/// against the `Daemon` passed in, with no auth/replay protection (spec
/// Non-goals explicitly exclude securing the command channel itself).
#[derive(Debug, Default)]
pub struct InProcessControlAdapter;

impl<C: LocalClock + 'static> ControlAdapter<C> for InProcessControlAdapter {
    fn handle(&mut self, daemon: &mut Daemon<C>, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::AddSource {
                address,
                kind,
                mode,
                prefer,
                noselect,
                iburst,
                presend,
                auto_offline,
                minpoll,
                maxpoll,
            } => {
                let target = match address.parse() {
                    Ok(addr) => AddrOrName::Addr(addr),
                    Err(_) => AddrOrName::Name(address),
                };
                let select_option = if noselect {
                    ntp_proto::SelectOption::NoSelect
                } else if prefer {
                    ntp_proto::SelectOption::Prefer
                } else {
                    ntp_proto::SelectOption::Normal
                };
                let association_mode = match mode {
                    AssociationModeArg::Server => ntp_proto::NtpAssociationMode::Client,
                    AssociationModeArg::Peer => ntp_proto::NtpAssociationMode::SymmetricActive,
                };
                let mut engine_config = ntp_proto::EngineConfig {
                    iburst,
                    presend,
                    auto_offline,
                    association_mode,
                    ..ntp_proto::EngineConfig::default()
                };
                engine_config.min_poll_exponent = minpoll;
                engine_config.max_poll_exponent = maxpoll;
                engine_config.initial_poll_exponent =
                    engine_config.initial_poll_exponent.clamp(minpoll, maxpoll);

                let params = SourceParams {
                    option: select_option,
                    engine_config,
                    ..SourceParams::default()
                };

                match daemon.add_source(target, kind.into(), params) {
                    Ok(id) => ControlResponse::SourceAdded {
                        id: id.map(|id| id.index() as u32),
                    },
                    Err(error) => ControlResponse::Error(error.to_string()),
                }
            }
            ControlRequest::RemoveSource { id } => {
                daemon.remove_source(SourceId::new(id));
                ControlResponse::Ok
            }
            ControlRequest::SetOnline { id, online } => {
                daemon.set_online(SourceId::new(id), online);
                ControlResponse::Ok
            }
            ControlRequest::ModifyPollBounds { .. } => {
                // poll bounds live on the per-source `ProtocolEngine`
                // config and are fixed at `add_source` time; changing
                // them in place would need a setter the engine doesn't
                // expose yet, so this is a recognized no-op rather than
                // a silently-wrong mutation.
                ControlResponse::Error("modifying poll bounds of a live source is not supported; remove and re-add".into())
            }
            ControlRequest::Burst { id, n_good, n_total } => {
                daemon.request_burst(SourceId::new(id), n_good, n_total);
                ControlResponse::Ok
            }
            ControlRequest::Dump { id, dumpdir } => {
                let Some(record) = daemon.registry().get(SourceId::new(id)) else {
                    return ControlResponse::Error("no such source".into());
                };
                match dump::write_dump(&dumpdir, record.reference_id, &record.stats) {
                    Ok(()) => ControlResponse::Ok,
                    Err(error) => ControlResponse::Error(dump_error_string(error)),
                }
            }
            ControlRequest::MakeStep => {
                daemon.make_step();
                ControlResponse::Ok
            }
            ControlRequest::Reselect => {
                daemon.reselect();
                ControlResponse::Ok
            }
            ControlRequest::ReportTracking => {
                let tracking = daemon.reference().tracking();
                ControlResponse::Tracking(TrackingReport {
                    stratum: tracking.stratum,
                    reference_id: tracking.reference_id.to_dotted_quad(),
                    offset_seconds: tracking.offset.to_seconds(),
                    frequency_ppm: tracking.frequency,
                    skew_ppm: tracking.skew,
                    root_delay_seconds: tracking.root_delay.to_seconds(),
                    root_dispersion_seconds: tracking.root_dispersion.to_seconds(),
                    slew_remaining_seconds: tracking.slew_remaining_seconds,
                })
            }
            ControlRequest::ReportSources => {
                let reports = daemon
                    .registry()
                    .iter()
                    .map(|record| SourceReport {
                        id: record.id.index() as u32,
                        reference_id: record.reference_id.to_dotted_quad(),
                        address: record.address.map(|a| a.to_string()),
                        status: record.status.into(),
                        reachability: record.reachability,
                        score: record.score,
                        online: daemon
                            .directory()
                            .engine(record.id)
                            .map(|e| e.is_online())
                            .unwrap_or(false),
                        bursting: daemon
                            .directory()
                            .engine(record.id)
                            .map(|e| e.is_bursting())
                            .unwrap_or(false),
                    })
                    .collect();
                ControlResponse::Sources(reports)
            }
            ControlRequest::ReportSourceStats => {
                let reports = daemon
                    .registry()
                    .iter()
                    .map(|record| {
                        let regression = record.stats.regression();
                        SourceStatsReport {
                            id: record.id.index() as u32,
                            samples: record.stats.len(),
                            frequency_ppm: regression.frequency,
                            skew_ppm: regression.skew,
                            offset_seconds: regression.offset.to_seconds(),
                            variance: regression.variance,
                        }
                    })
                    .collect();
                ControlResponse::SourceStats(reports)
            }
            ControlRequest::ReportActivity => {
                let mut online = 0;
                let mut offline = 0;
                let mut bursting = 0;
                for (_, engine) in daemon.directory().engines() {
                    if engine.is_bursting() {
                        bursting += 1;
                    }
                    if engine.is_online() {
                        online += 1;
                    } else {
                        offline += 1;
                    }
                }
                ControlResponse::Activity(ActivityReport {
                    online,
                    offline,
                    bursting,
                    unresolved: daemon.directory().pending_count(),
                })
            }
            ControlRequest::AccessEdit {
                list,
                subnet_addr,
                prefix_bits,
                allow,
            } => {
                let state = if allow {
                    FilterState::Allow
                } else {
                    FilterState::Deny
                };
                let filter = match list {
                    AccessList::Ntp => &mut daemon.ntp_access,
                    AccessList::Cmd => &mut daemon.cmd_access,
                };
                filter.set(subnet_addr, prefix_bits, state, false);
                ControlResponse::Ok
            }
        }
    }
}

fn dump_error_string(error: DumpError) -> String {
    error.to_string()
}

/// Trait stub for local reference clock drivers (spec §11): the
/// `SourceKind::RefClock` path through statistics/selector/reference is
/// already exercised end to end, only the driver I/O itself — reading a
/// PPS device, GPS NMEA sentences, whatever the hardware is — is out of
/// scope. A driver implementing this feeds samples in the same shape an
/// NTP reply would produce.
pub trait RefClockAdapter {
    fn poll_sample(&mut self, now: NtpDuration) -> Option<ntp_proto::Sample>;
}

/// Trait stub for hardware RTC persistence/trim timer (spec §11).
pub trait RtcAdapter {
    fn read_rtc(&mut self) -> std::io::Result<std::time::SystemTime>;
    fn write_rtc(&mut self, now: std::time::SystemTime) -> std::io::Result<()>;
}

/// Trait for operator-entered one-shot offset corrections (spec §11),
/// feeding the same `LocalClock` notification path sources use.
pub trait ManualInput {
    fn take_offset(&mut self) -> Option<NtpDuration>;
}

/// No-op default: no manual corrections are ever pending. Exists so the
/// daemon binary always has a concrete `ManualInput` to hold even when
/// no interactive front-end is wired up.
#[derive(Debug, Default)]
pub struct NoManualInput;

impl ManualInput for NoManualInput {
    fn take_offset(&mut self) -> Option<NtpDuration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ntp_proto::clock::TestClock;
    use ntp_proto::{ReferenceConfig, SelectionConfig};

    use crate::directory::StdNameResolver;

    fn test_daemon() -> Daemon<TestClock> {
        Daemon::new(
            TestClock::new(),
            ReferenceConfig::default(),
            SelectionConfig::default(),
            8,
            Box::new(StdNameResolver),
        )
        .unwrap()
    }

    #[test]
    fn report_tracking_reflects_fallback_state_when_nothing_is_selected() {
        let mut daemon = test_daemon();
        let mut adapter = InProcessControlAdapter;
        let response = adapter.handle(&mut daemon, ControlRequest::ReportTracking);
        assert!(matches!(response, ControlResponse::Tracking(_)));
    }

    #[test]
    fn report_activity_starts_with_no_sources() {
        let mut daemon = test_daemon();
        let mut adapter = InProcessControlAdapter;
        let response = adapter.handle(&mut daemon, ControlRequest::ReportActivity);
        match response {
            ControlResponse::Activity(report) => {
                assert_eq!(report.online, 0);
                assert_eq!(report.offline, 0);
                assert_eq!(report.unresolved, 0);
            }
            other => panic!("expected Activity, got {other:?}"),
        }
    }

    #[test]
    fn remove_source_on_unknown_id_is_a_harmless_no_op() {
        let mut daemon = test_daemon();
        let mut adapter = InProcessControlAdapter;
        let response = adapter.handle(&mut daemon, ControlRequest::RemoveSource { id: 99 });
        assert!(matches!(response, ControlResponse::Ok));
    }

    #[test]
    fn access_edit_denies_a_subnet() {
        let mut daemon = test_daemon();
        let mut adapter = InProcessControlAdapter;
        let response = adapter.handle(
            &mut daemon,
            ControlRequest::AccessEdit {
                list: AccessList::Ntp,
                subnet_addr: "10.0.0.0".parse().unwrap(),
                prefix_bits: 8,
                allow: false,
            },
        );
        assert!(matches!(response, ControlResponse::Ok));
        assert!(!daemon.ntp_access.is_allowed("10.1.2.3".parse().unwrap()));
    }
}
