//! Sans-IO core: wire format, time arithmetic, per-source statistics and
//! protocol state machine, source selection, and the disciplined
//! reference. Nothing in this crate touches a socket, a clock syscall,
//! or a file; see `ntp-udp`, `ntp-os-clock` and `ntp-daemon` for that.

pub mod access;
pub mod clock;
pub mod engine;
pub mod ipsubnet;
pub mod packet;
pub mod refid;
pub mod reference;
pub mod selector;
pub mod source;
pub mod statistics;
pub mod time;

pub use access::{AccessFilter, FilterState};
pub use clock::{ClockChangeKind, LocalClock};
pub use engine::{EngineAction, EngineActionIterator, EngineConfig, ProtocolEngine, SymmetricKeyMac};
pub use ipsubnet::IpSubnet;
pub use packet::{NtpAssociationMode, NtpHeader, NtpLeapIndicator, PacketParseError};
pub use refid::ReferenceId;
pub use reference::{DisciplineAction, ObservableTrackingData, Reference, ReferenceConfig};
pub use selector::{select_source, CombinedEstimate, LeapDecision, SelectOutcome, SelectionConfig, SelectorState};
pub use source::{SelectOption, SourceId, SourceKind, SourceRecord, SourceRegistry, SourceStatus};
pub use statistics::{Sample, Statistics, StatisticsDump};
pub use time::{NtpDuration, NtpShort, NtpTimestamp};
