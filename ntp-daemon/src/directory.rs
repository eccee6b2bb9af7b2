//! Maps remote address to protocol engine instance, resolves pending
//! names on a backoff schedule, and enforces the configured maximum
//! source count (spec §4.9).

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};

use ntp_proto::{
    EngineConfig, NtpDuration, NtpTimestamp, ProtocolEngine, ReferenceId, SelectOption,
    SourceId, SourceKind, SourceRecord, SourceRegistry, Statistics, SymmetricKeyMac,
};

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("maximum source count ({0}) reached")]
    MaxSourcesReached(usize),
    #[error("address {0} is already registered")]
    DuplicateAddress(SocketAddr),
}

/// Either a resolved address or a name still waiting on DNS (spec §9
/// Open Questions: one unified add-source entry point, not the two
/// historical pre/post-IPv6 generations).
#[derive(Debug, Clone)]
pub enum AddrOrName {
    Addr(SocketAddr),
    Name(String),
}

#[derive(Debug, Clone)]
pub struct SourceParams {
    pub option: SelectOption,
    pub mac: Option<SymmetricKeyMac>,
    pub engine_config: EngineConfig,
    pub min_round_trip_seed: f64,
}

impl Default for SourceParams {
    fn default() -> Self {
        Self {
            option: SelectOption::Normal,
            mac: None,
            engine_config: EngineConfig::default(),
            min_round_trip_seed: 1.0,
        }
    }
}

/// Delegates name → address lookup so the retry queue is testable
/// without touching a real resolver (spec Non-goals: the core does not
/// implement DNS itself).
pub trait NameResolver {
    fn resolve(&self, name: &str) -> std::io::Result<Vec<SocketAddr>>;
}

/// `ToSocketAddrs`-backed default resolver.
#[derive(Debug, Default)]
pub struct StdNameResolver;

impl NameResolver for StdNameResolver {
    fn resolve(&self, name: &str) -> std::io::Result<Vec<SocketAddr>> {
        // port 123 is a placeholder for the lookup call; only the
        // resolved IP is used, the directory already knows the port.
        (name, 123u16).to_socket_addrs().map(|iter| iter.collect())
    }
}

struct PendingName {
    name: String,
    port: u16,
    kind: SourceKind,
    params: SourceParams,
    attempt: u32,
    next_attempt: NtpTimestamp,
}

const BACKOFF_BASE: f64 = 2.0;
const BACKOFF_CAP_SECONDS: f64 = 3600.0;

impl PendingName {
    fn schedule_next(&mut self, now: NtpTimestamp) {
        let delay_seconds = (BACKOFF_BASE.powi(self.attempt.min(16) as i32)).min(BACKOFF_CAP_SECONDS);
        self.attempt += 1;
        self.next_attempt = now + NtpDuration::from_seconds(delay_seconds);
    }
}

/// Address → protocol engine instance, plus the unresolved-name queue.
/// Does not own the [`SourceRegistry`]; every method that creates or
/// removes a source is handed the registry explicitly so the
/// directory stays a thin bookkeeping layer over it.
pub struct SourceDirectory {
    by_address: HashMap<SocketAddr, SourceId>,
    engines: HashMap<SourceId, ProtocolEngine>,
    pending: Vec<PendingName>,
    max_sources: usize,
    answer_unknown_clients: bool,
}

impl SourceDirectory {
    pub fn new(max_sources: usize) -> Self {
        Self {
            by_address: HashMap::new(),
            engines: HashMap::new(),
            pending: Vec::new(),
            max_sources,
            answer_unknown_clients: false,
        }
    }

    pub fn set_answer_unknown_clients(&mut self, answer: bool) {
        self.answer_unknown_clients = answer;
    }

    pub fn should_answer_unknown(&self, _addr: SocketAddr) -> bool {
        self.answer_unknown_clients
    }

    pub fn len(&self) -> usize {
        self.by_address.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn at_capacity(&self) -> bool {
        self.len() >= self.max_sources
    }

    pub fn lookup(&self, addr: SocketAddr) -> Option<SourceId> {
        self.by_address.get(&addr).copied()
    }

    pub fn engine_mut(&mut self, id: SourceId) -> Option<&mut ProtocolEngine> {
        self.engines.get_mut(&id)
    }

    pub fn engine(&self, id: SourceId) -> Option<&ProtocolEngine> {
        self.engines.get(&id)
    }

    /// Command-surface "activity" report (spec §11): iterates every live
    /// source's protocol engine alongside its id.
    pub fn engines(&self) -> impl Iterator<Item = (SourceId, &ProtocolEngine)> {
        self.engines.iter().map(|(id, engine)| (*id, engine))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn add_source(
        &mut self,
        registry: &mut SourceRegistry,
        kind: SourceKind,
        target: AddrOrName,
        params: SourceParams,
    ) -> Result<Option<SourceId>, DirectoryError> {
        if self.at_capacity() {
            return Err(DirectoryError::MaxSourcesReached(self.max_sources));
        }

        match target {
            AddrOrName::Addr(addr) => Ok(Some(self.add_resolved(registry, kind, addr, params)?)),
            AddrOrName::Name(name) => {
                let port = 123;
                self.pending.push(PendingName {
                    name,
                    port,
                    kind,
                    params,
                    attempt: 0,
                    next_attempt: NtpTimestamp::ZERO,
                });
                Ok(None)
            }
        }
    }

    fn add_resolved(
        &mut self,
        registry: &mut SourceRegistry,
        kind: SourceKind,
        addr: SocketAddr,
        params: SourceParams,
    ) -> Result<SourceId, DirectoryError> {
        if self.by_address.contains_key(&addr) {
            return Err(DirectoryError::DuplicateAddress(addr));
        }
        let reference_id = ReferenceId::from_ip(addr.ip());
        let stats = Statistics::for_ntp_source(params.min_round_trip_seed);
        let id = registry.insert(|id| {
            SourceRecord::new(id, reference_id, Some(addr), kind, params.option, stats)
        });
        let engine = ProtocolEngine::new(params.engine_config, params.mac);
        self.engines.insert(id, engine);
        self.by_address.insert(addr, id);
        Ok(id)
    }

    pub fn remove(&mut self, registry: &mut SourceRegistry, id: SourceId) {
        self.engines.remove(&id);
        self.by_address.retain(|_, v| *v != id);
        registry.remove(id);
    }

    /// Tries every name whose backoff has elapsed. Successes are
    /// promoted into the live registry; failures reschedule with the
    /// next backoff step (spec §7 "name resolution failure").
    pub fn retry_pending(
        &mut self,
        registry: &mut SourceRegistry,
        resolver: &dyn NameResolver,
        now: NtpTimestamp,
    ) -> Vec<SourceId> {
        let mut promoted = Vec::new();
        let mut still_pending = Vec::new();

        for mut entry in std::mem::take(&mut self.pending) {
            if entry.next_attempt > now {
                still_pending.push(entry);
                continue;
            }

            match resolver.resolve(&entry.name) {
                Ok(addrs) if !addrs.is_empty() => {
                    let addr = SocketAddr::new(addrs[0].ip(), entry.port);
                    if self.at_capacity() {
                        entry.schedule_next(now);
                        still_pending.push(entry);
                        continue;
                    }
                    match self.add_resolved(registry, entry.kind, addr, entry.params.clone()) {
                        Ok(id) => promoted.push(id),
                        Err(_) => {
                            entry.schedule_next(now);
                            still_pending.push(entry);
                        }
                    }
                }
                _ => {
                    tracing::warn!(name = %entry.name, attempt = entry.attempt, "name resolution failed, backing off");
                    entry.schedule_next(now);
                    still_pending.push(entry);
                }
            }
        }

        self.pending = still_pending;
        promoted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingResolver;
    impl NameResolver for FailingResolver {
        fn resolve(&self, _name: &str) -> std::io::Result<Vec<SocketAddr>> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no such host"))
        }
    }

    struct FixedResolver(SocketAddr);
    impl NameResolver for FixedResolver {
        fn resolve(&self, _name: &str) -> std::io::Result<Vec<SocketAddr>> {
            Ok(vec![self.0])
        }
    }

    #[test]
    fn resolved_address_is_added_directly() {
        let mut registry = SourceRegistry::new();
        let mut directory = SourceDirectory::new(10);
        let addr: SocketAddr = "127.0.0.1:123".parse().unwrap();
        let id = directory
            .add_source(&mut registry, SourceKind::Ntp, AddrOrName::Addr(addr), SourceParams::default())
            .unwrap()
            .unwrap();
        assert_eq!(directory.lookup(addr), Some(id));
    }

    #[test]
    fn name_resolution_failure_backs_off_and_does_not_promote() {
        let mut registry = SourceRegistry::new();
        let mut directory = SourceDirectory::new(10);
        directory
            .add_source(
                &mut registry,
                SourceKind::Ntp,
                AddrOrName::Name("pool.example".into()),
                SourceParams::default(),
            )
            .unwrap();

        let promoted = directory.retry_pending(&mut registry, &FailingResolver, NtpTimestamp::ZERO);
        assert!(promoted.is_empty());
        assert_eq!(directory.len(), 1);
        assert_eq!(directory.pending[0].attempt, 1);
    }

    #[test]
    fn name_resolution_success_promotes_into_registry() {
        let mut registry = SourceRegistry::new();
        let mut directory = SourceDirectory::new(10);
        directory
            .add_source(
                &mut registry,
                SourceKind::Ntp,
                AddrOrName::Name("server.example".into()),
                SourceParams::default(),
            )
            .unwrap();

        let addr: SocketAddr = "10.0.0.5:123".parse().unwrap();
        let promoted = directory.retry_pending(&mut registry, &FixedResolver(addr), NtpTimestamp::ZERO);
        assert_eq!(promoted.len(), 1);
        assert_eq!(directory.lookup(addr), Some(promoted[0]));
        assert!(directory.pending.is_empty());
    }

    #[test]
    fn max_sources_cap_is_enforced() {
        let mut registry = SourceRegistry::new();
        let mut directory = SourceDirectory::new(1);
        directory
            .add_source(
                &mut registry,
                SourceKind::Ntp,
                AddrOrName::Addr("127.0.0.1:123".parse().unwrap()),
                SourceParams::default(),
            )
            .unwrap();

        let result = directory.add_source(
            &mut registry,
            SourceKind::Ntp,
            AddrOrName::Addr("127.0.0.2:123".parse().unwrap()),
            SourceParams::default(),
        );
        assert!(matches!(result, Err(DirectoryError::MaxSourcesReached(1))));
    }
}
