//! The event loop binary's library half: the cooperative scheduler, the
//! source directory, the `Daemon` aggregate, drift-file and per-source
//! dump persistence, and the thin adapter traits for the collaborators
//! this rewrite stubs out (config parsing, the command surface, refclock
//! drivers, the RTC, manual time input).

pub mod acquire;
pub mod adapters;
pub mod config;
pub mod daemon;
pub mod directory;
pub mod driftfile;
pub mod dump;
pub mod scheduler;

pub use adapters::{
    AccessList, ActivityReport, AssociationModeArg, ControlAdapter, ControlRequest, ControlResponse,
    InProcessControlAdapter, ManualInput, NoManualInput, RefClockAdapter, RtcAdapter, SourceKindArg,
    SourceReport, SourceStatsReport, SourceStatusArg, TrackingReport,
};
pub use config::{AccessAction, AccessRule, ConfigError, MakeStep, ParsedConfig, SourceDirective, SourceMode};
pub use daemon::{Daemon, DaemonError, DaemonEvent};
pub use directory::{AddrOrName, DirectoryError, NameResolver, SourceDirectory, SourceParams, StdNameResolver};
pub use driftfile::{Drift, DriftFileError};
pub use dump::{DumpError, dump_path, load_dump, write_dump};
pub use scheduler::{Scheduler, SchedulerError, TimeoutId, TimerClassId};
