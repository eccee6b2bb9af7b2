//! The top-level `Daemon` aggregate (spec §9 Design Notes, §11): owns
//! the scheduler, the source directory, the reference, and both access
//! filter instances, constructed once in `main` and torn down at
//! shutdown. There is exactly one per process.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::rc::Rc;

use ntp_proto::{
    AccessFilter, EngineAction, LocalClock, NtpDuration, NtpHeader, NtpTimestamp,
    Reference, ReferenceConfig, SelectOutcome, SelectionConfig, SelectorState,
    SourceId, SourceRegistry,
};
use ntp_udp::{accept_packet, AcceptResult, NtpUdpSocket};

use crate::adapters::{ControlAdapter, ControlRequest, ControlResponse, InProcessControlAdapter};
use crate::directory::{AddrOrName, DirectoryError, NameResolver, SourceDirectory, SourceParams};
use crate::scheduler::{Scheduler, SchedulerError, TimerClassId};

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("local clock operation failed: {0:?}")]
    Clock(String),
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),
}

/// A tagged work item, pushed by scheduler-registered handlers and
/// drained by [`Daemon::step`] with full access to the aggregate (spec
/// §9 Design Notes: "a tagged variant dispatched through a single
/// `fn dispatch`, with no function-pointer indirection").
#[derive(Debug, Clone, Copy)]
pub enum DaemonEvent {
    PollTransmit(SourceId),
    ClientReadable(SourceId),
    ServerReadable(usize),
    NameResolveTick,
    DispersionTick,
    ControlListenerReadable,
    ControlReadable(RawFd),
}

/// One accepted control-socket connection (spec §6/§11): a single
/// line-delimited JSON request is read, dispatched, and answered before
/// the connection is closed — no session state carries across requests.
struct ControlConnection {
    stream: UnixStream,
    buffer: Vec<u8>,
}

const DISPERSION_TICK_SECONDS: f64 = 16.0;
const NAME_RESOLVE_TICK_SECONDS: f64 = 4.0;
const MAX_DATAGRAM: usize = 1500;

/// One process's worth of NTP daemon state. Generic over the
/// [`LocalClock`] implementation so tests run against `TestClock`
/// without touching the kernel.
pub struct Daemon<C: LocalClock> {
    scheduler: Scheduler<C>,
    directory: SourceDirectory,
    registry: SourceRegistry,
    reference: Reference,
    selector_state: SelectorState,
    selection_config: SelectionConfig,
    pub ntp_access: AccessFilter,
    pub cmd_access: AccessFilter,
    resolver: Box<dyn NameResolver>,
    events: Rc<RefCell<VecDeque<DaemonEvent>>>,
    client_sockets: HashMap<SourceId, NtpUdpSocket>,
    server_sockets: Vec<NtpUdpSocket>,
    control_listener: Option<UnixListener>,
    control_streams: HashMap<RawFd, ControlConnection>,
    poll_class: TimerClassId,
}

impl<C: LocalClock + 'static> Daemon<C> {
    pub fn new(
        clock: C,
        reference_config: ReferenceConfig,
        selection_config: SelectionConfig,
        max_sources: usize,
        resolver: Box<dyn NameResolver>,
    ) -> Result<Self, DaemonError> {
        let mut scheduler = Scheduler::new(clock).map_err(|e| DaemonError::Clock(format!("{e:?}")))?;
        let poll_class = scheduler.new_timer_class(NtpDuration::from_seconds(0.1));

        let mut daemon = Self {
            scheduler,
            directory: SourceDirectory::new(max_sources),
            registry: SourceRegistry::new(),
            reference: Reference::new(reference_config),
            selector_state: SelectorState::default(),
            selection_config,
            ntp_access: AccessFilter::new(),
            cmd_access: AccessFilter::new(),
            resolver,
            events: Rc::new(RefCell::new(VecDeque::new())),
            client_sockets: HashMap::new(),
            server_sockets: Vec::new(),
            control_listener: None,
            control_streams: HashMap::new(),
            poll_class,
        };

        daemon.schedule_name_resolve_tick();
        daemon.schedule_dispersion_tick();
        Ok(daemon)
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn directory(&self) -> &SourceDirectory {
        &self.directory
    }

    /// Binds a server socket and registers it for readability, so
    /// inbound client/peer requests reach [`Self::drain_server_socket`].
    pub fn bind_server(&mut self, local: SocketAddr) -> Result<(), DaemonError> {
        let socket = NtpUdpSocket::server(local)?;
        let index = self.server_sockets.len();
        let fd = socket.as_raw_fd();
        self.server_sockets.push(socket);

        let events = self.events.clone();
        self.scheduler
            .add_input_handler(fd, move |_, _, _| events.borrow_mut().push_back(DaemonEvent::ServerReadable(index)));
        Ok(())
    }

    /// Binds the control surface's Unix-domain socket (spec §6/§11): one
    /// line-delimited JSON [`ControlRequest`] per connection, answered
    /// with one line-delimited JSON [`ControlResponse`]. A stale socket
    /// file from an unclean previous shutdown is removed first.
    pub fn bind_control_socket(&mut self, path: &Path) -> Result<(), DaemonError> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        let fd = listener.as_raw_fd();
        self.control_listener = Some(listener);

        let events = self.events.clone();
        self.scheduler
            .add_input_handler(fd, move |_, _, _| events.borrow_mut().push_back(DaemonEvent::ControlListenerReadable));
        Ok(())
    }

    pub fn add_source(
        &mut self,
        target: AddrOrName,
        kind: ntp_proto::SourceKind,
        params: SourceParams,
    ) -> Result<Option<SourceId>, DaemonError> {
        let id = self.directory.add_source(&mut self.registry, kind, target, params)?;
        if let Some(id) = id {
            self.open_client_socket(id)?;
            self.schedule_poll(id, NtpDuration::ZERO);
        }
        Ok(id)
    }

    /// Removes a source, forcing reselection if it was the current
    /// system peer (spec §3 Lifecycle, §11 command surface "remove
    /// source").
    pub fn remove_source(&mut self, id: SourceId) {
        self.registry.clear_selection();
        self.client_sockets.remove(&id);
        self.directory.remove(&mut self.registry, id);
        self.run_selection(None);
    }

    /// Command-surface "online"/"offline" (spec §6, §4.7): offline
    /// sources stop transmitting and their reachability register
    /// decays toward zero; online resumes polling (and fires an
    /// `iburst` if configured).
    pub fn set_online(&mut self, id: SourceId, online: bool) {
        let Some(engine) = self.directory.engine_mut(id) else {
            return;
        };
        if online {
            engine.go_online();
            self.schedule_poll(id, NtpDuration::ZERO);
        } else {
            engine.go_offline();
        }
    }

    /// Command-surface "burst" (spec §4.7): `n_good`/`n_total` extra
    /// measurements outside the regular schedule.
    pub fn request_burst(&mut self, id: SourceId, n_good: u8, n_total: u8) {
        if let Some(engine) = self.directory.engine_mut(id) {
            engine.request_burst(n_good, n_total);
            self.schedule_poll(id, NtpDuration::ZERO);
        }
    }

    /// Command-surface "make-step" (spec §6): forces the next
    /// selection result to be stepped rather than slewed.
    pub fn make_step(&mut self) {
        self.reference.request_step();
    }

    /// Command-surface "reselect" (spec §6): re-runs the selector
    /// immediately rather than waiting for the next triggering event.
    pub fn reselect(&mut self) {
        self.run_selection(None);
    }

    fn open_client_socket(&mut self, id: SourceId) -> Result<(), DaemonError> {
        let Some(record) = self.registry.get(id) else {
            return Ok(());
        };
        let Some(peer) = record.address else {
            return Ok(());
        };
        let local: SocketAddr = if peer.is_ipv6() {
            "[::]:0".parse().unwrap()
        } else {
            "0.0.0.0:0".parse().unwrap()
        };
        let socket = NtpUdpSocket::client(local, peer)?;
        let fd = socket.as_raw_fd();
        self.client_sockets.insert(id, socket);

        let events = self.events.clone();
        self.scheduler
            .add_input_handler(fd, move |_, _, _| events.borrow_mut().push_back(DaemonEvent::ClientReadable(id)));
        Ok(())
    }

    fn schedule_poll(&mut self, id: SourceId, after: NtpDuration) {
        let events = self.events.clone();
        self.scheduler
            .add_timeout_in_class(after, self.poll_class, 0.25, move |_, _, _| {
                events.borrow_mut().push_back(DaemonEvent::PollTransmit(id))
            });
    }

    fn schedule_name_resolve_tick(&mut self) {
        let events = self.events.clone();
        self.scheduler.add_timeout(
            NtpDuration::from_seconds(NAME_RESOLVE_TICK_SECONDS),
            move |_, _, _| events.borrow_mut().push_back(DaemonEvent::NameResolveTick),
        );
    }

    fn schedule_dispersion_tick(&mut self) {
        let events = self.events.clone();
        self.scheduler.add_timeout(
            NtpDuration::from_seconds(DISPERSION_TICK_SECONDS),
            move |_, _, _| events.borrow_mut().push_back(DaemonEvent::DispersionTick),
        );
    }

    /// Runs one scheduler wake plus the dispatch of everything it
    /// queued. This is the whole of the daemon's main-loop body; `main`
    /// just calls this in a loop until shutdown.
    pub fn step(&mut self) -> Result<(), DaemonError> {
        self.scheduler.run_once()?;
        let now = self.scheduler.get_last_event_time();
        while let Some(event) = self.events.borrow_mut().pop_front() {
            self.dispatch(event, now);
        }
        Ok(())
    }

    fn dispatch(&mut self, event: DaemonEvent, now: NtpTimestamp) {
        match event {
            DaemonEvent::PollTransmit(id) => self.poll_transmit(id, now),
            DaemonEvent::ClientReadable(id) => self.drain_client_socket(id, now),
            DaemonEvent::ServerReadable(index) => self.drain_server_socket(index, now),
            DaemonEvent::NameResolveTick => {
                self.run_name_resolution(now);
                self.schedule_name_resolve_tick();
            }
            DaemonEvent::DispersionTick => {
                self.reference.age_without_update(DISPERSION_TICK_SECONDS);
                self.schedule_dispersion_tick();
            }
            DaemonEvent::ControlListenerReadable => self.accept_control_connections(),
            DaemonEvent::ControlReadable(fd) => self.drain_control_socket(fd),
        }
    }

    fn accept_control_connections(&mut self) {
        loop {
            let Some(listener) = &self.control_listener else { return };
            match listener.accept() {
                Ok((stream, _addr)) => {
                    if let Err(error) = stream.set_nonblocking(true) {
                        tracing::warn!(?error, "failed to set control connection nonblocking");
                        continue;
                    }
                    let fd = stream.as_raw_fd();
                    self.control_streams.insert(
                        fd,
                        ControlConnection {
                            stream,
                            buffer: Vec::new(),
                        },
                    );
                    let events = self.events.clone();
                    self.scheduler
                        .add_input_handler(fd, move |_, _, _| events.borrow_mut().push_back(DaemonEvent::ControlReadable(fd)));
                }
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(error) => {
                    tracing::warn!(?error, "control socket accept failed");
                    return;
                }
            }
        }
    }

    /// Reads whatever is available, answers the first complete line, and
    /// closes the connection. One request per connection keeps this
    /// symmetric with how `ntp-ctl` is expected to behave (spec §11: a
    /// thin client, no persistent session).
    fn drain_control_socket(&mut self, fd: RawFd) {
        let mut closed = false;
        if let Some(conn) = self.control_streams.get_mut(&fd) {
            let mut chunk = [0u8; 4096];
            loop {
                match conn.stream.read(&mut chunk) {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(n) => conn.buffer.extend_from_slice(&chunk[..n]),
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(error) => {
                        tracing::warn!(?error, "control socket read failed");
                        closed = true;
                        break;
                    }
                }
            }
        } else {
            return;
        }

        if closed {
            self.close_control_socket(fd);
            return;
        }

        let Some(line) = self.control_streams.get_mut(&fd).and_then(|conn| {
            let newline = conn.buffer.iter().position(|&b| b == b'\n')?;
            Some(conn.buffer.drain(..=newline).collect::<Vec<u8>>())
        }) else {
            return;
        };

        let body = &line[..line.len().saturating_sub(1)];
        let response = match serde_json::from_slice::<ControlRequest>(body) {
            Ok(request) => {
                let mut adapter = InProcessControlAdapter;
                adapter.handle(self, request)
            }
            Err(error) => ControlResponse::Error(format!("malformed request: {error}")),
        };

        let mut payload = serde_json::to_vec(&response).unwrap_or_default();
        payload.push(b'\n');
        if let Some(conn) = self.control_streams.get_mut(&fd) {
            let _ = conn.stream.write_all(&payload);
        }
        self.close_control_socket(fd);
    }

    fn close_control_socket(&mut self, fd: RawFd) {
        self.scheduler.remove_input_handler(fd);
        self.control_streams.remove(&fd);
    }

    fn poll_transmit(&mut self, id: SourceId, now: NtpTimestamp) {
        let Some(engine) = self.directory.engine_mut(id) else {
            return;
        };
        let Some(record) = self.registry.get_mut(id) else {
            return;
        };
        let actions: Vec<EngineAction> = engine.poll(record, now).collect();
        self.apply_engine_actions(id, actions);
    }

    fn drain_client_socket(&mut self, id: SourceId, now: NtpTimestamp) {
        let Some(socket) = self.client_sockets.get(&id) else {
            return;
        };
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let result = socket.recv(&mut buf);
            let accepted = match &result {
                Ok(r) => r.bytes_read > 0,
                Err(_) => false,
            };
            let clock = self.scheduler.clock();
            match accept_packet(result, &buf, clock) {
                AcceptResult::Accept(bytes, receive_time) => {
                    let bytes = bytes.to_vec();
                    self.handle_reply(id, &bytes, receive_time);
                }
                AcceptResult::Ignore => {}
                AcceptResult::NetworkGone => {
                    tracing::warn!(?id, "network unreachable for source");
                    if let Some(engine) = self.directory.engine_mut(id) {
                        engine.note_network_gone();
                    }
                    break;
                }
            }
            if !accepted {
                break;
            }
        }
    }

    fn handle_reply(&mut self, id: SourceId, bytes: &[u8], receive_time: NtpTimestamp) {
        let Some(engine) = self.directory.engine_mut(id) else {
            return;
        };
        let Some(record) = self.registry.get_mut(id) else {
            return;
        };
        let actions: Vec<EngineAction> = engine.handle_reply(record, bytes, receive_time).collect();
        self.apply_engine_actions(id, actions);
    }

    fn apply_engine_actions(&mut self, id: SourceId, actions: Vec<EngineAction>) {
        let mut accepted = false;
        let mut demobilize = false;

        for action in actions {
            match action {
                EngineAction::Transmit(bytes) => {
                    if let Some(socket) = self.client_sockets.get(&id) {
                        if let Err(error) = socket.send(&bytes) {
                            tracing::warn!(?id, ?error, "failed to send NTP request");
                        }
                    }
                }
                EngineAction::SetTimer(after) => self.schedule_poll(id, after),
                EngineAction::Accepted => accepted = true,
                EngineAction::Reset => {}
                EngineAction::Demobilize => demobilize = true,
            }
        }

        if demobilize {
            self.client_sockets.remove(&id);
            self.directory.remove(&mut self.registry, id);
            self.run_selection(None);
            return;
        }

        if accepted {
            self.registry.bump_update_seq(id);
            self.run_selection(Some(id));
        }
    }

    fn run_selection(&mut self, updated: Option<SourceId>) {
        let now = self.scheduler.get_last_event_time();
        let outcome = ntp_proto::select_source(
            &mut self.registry,
            now,
            updated,
            &self.selection_config,
            &mut self.selector_state,
        );

        match outcome {
            SelectOutcome::Applied(estimate) => {
                let winner = estimate.winner;
                let Some(record) = self.registry.get(winner) else {
                    return;
                };
                let reference_id = record.reference_id;
                let stratum = record.stats.get_selection_data(now).stratum;
                let clock = self.scheduler.clock_mut();
                if let Err(error) =
                    self.reference
                        .apply(clock, &mut self.registry, stratum, reference_id, &estimate)
                {
                    tracing::error!(?error, "local clock discipline failed");
                }
            }
            SelectOutcome::NoMajority | SelectOutcome::WaitsSources => {
                if self.registry.selected().is_none() && self.registry.is_empty() {
                    self.reference.fall_back_to_local(now);
                }
            }
            SelectOutcome::WaitsStats | SelectOutcome::WaitsUpdate => {}
        }
    }

    fn run_name_resolution(&mut self, now: NtpTimestamp) {
        let promoted = self
            .directory
            .retry_pending(&mut self.registry, self.resolver.as_ref(), now);
        for id in promoted {
            if let Err(error) = self.open_client_socket(id) {
                tracing::warn!(?id, ?error, "failed to open client socket for resolved source");
                continue;
            }
            self.schedule_poll(id, NtpDuration::ZERO);
        }
    }

    fn drain_server_socket(&mut self, index: usize, now: NtpTimestamp) {
        let Some(socket) = self.server_sockets.get(index) else {
            return;
        };
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let result = socket.recv(&mut buf);
            let had_data = matches!(&result, Ok(r) if r.bytes_read > 0);
            let from = match &result {
                Ok(r) => Some(r.from),
                Err(_) => None,
            };
            let clock = self.scheduler.clock();
            match accept_packet(result, &buf, clock) {
                AcceptResult::Accept(bytes, receive_time) => {
                    if let Some(from) = from {
                        self.answer_client_request(index, from, bytes, receive_time, now);
                    }
                }
                AcceptResult::Ignore => {}
                AcceptResult::NetworkGone => break,
            }
            if !had_data {
                break;
            }
        }
    }

    fn answer_client_request(
        &self,
        socket_index: usize,
        from: SocketAddr,
        bytes: &[u8],
        receive_time: NtpTimestamp,
        now: NtpTimestamp,
    ) {
        if !self.ntp_access.is_allowed(from.ip()) {
            return;
        }
        let Ok(request) = NtpHeader::parse(bytes) else {
            return;
        };
        if !matches!(
            request.mode(),
            ntp_proto::NtpAssociationMode::Client | ntp_proto::NtpAssociationMode::SymmetricActive
        ) {
            return;
        }

        let tracking = self.reference.tracking();
        let reply = NtpHeader {
            leap: tracking.leap,
            version: request.version,
            mode: ntp_proto::NtpAssociationMode::Server,
            stratum: tracking.stratum,
            poll: request.poll,
            precision: -20,
            root_delay: tracking.root_delay,
            root_dispersion: tracking.root_dispersion,
            reference_id: tracking.reference_id,
            reference_timestamp: tracking.reference_time,
            origin_timestamp: request.transmit_timestamp,
            receive_timestamp: receive_time,
            transmit_timestamp: NtpTimestamp::now_fuzzed_from(now),
        };

        if let Some(socket) = self.server_sockets.get(socket_index) {
            let bytes = reply.serialize().to_vec();
            let _ = socket.send_to(&bytes, from);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StdNameResolver;
    use ntp_proto::clock::TestClock;
    use std::io::{Read as _, Write as _};
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

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
    fn control_socket_answers_activity_report() {
        let mut daemon = test_daemon();
        let path = std::env::temp_dir().join(format!(
            "ntp-daemon-control-test-{}-{}",
            std::process::id(),
            line!()
        ));
        daemon.bind_control_socket(&path).unwrap();

        let mut client = UnixStream::connect(&path).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let mut request = serde_json::to_vec(&ControlRequest::ReportActivity).unwrap();
        request.push(b'\n');
        client.write_all(&request).unwrap();

        for _ in 0..10 {
            daemon.step().unwrap();
        }

        let mut buf = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            match client.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if buf.contains(&b'\n') {
                        break;
                    }
                }
                Err(_) => break,
            }
        }

        let response: ControlResponse = serde_json::from_slice(&buf[..buf.len().saturating_sub(1)]).unwrap();
        assert!(matches!(response, ControlResponse::Activity(_)));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn bind_control_socket_removes_a_stale_socket_file() {
        let mut daemon = test_daemon();
        let path = std::env::temp_dir().join(format!(
            "ntp-daemon-control-stale-{}-{}",
            std::process::id(),
            line!()
        ));
        std::fs::write(&path, b"not a socket").unwrap();

        daemon.bind_control_socket(&path).unwrap();
        std::fs::remove_file(&path).ok();
    }
}
