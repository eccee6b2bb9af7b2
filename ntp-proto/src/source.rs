//! The source registry: a handle-based collection of [`SourceRecord`]s
//! (spec §3 "Source record", §9 Design Notes on avoiding pointer graphs).

use std::net::SocketAddr;

use crate::packet::NtpLeapIndicator;
use crate::refid::ReferenceId;
use crate::statistics::Statistics;
use crate::time::NtpTimestamp;

/// A stable small-integer handle. Never reused while a dependent timer
/// (in the daemon's scheduler) could still reference it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(u32);

impl SourceId {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Ntp,
    RefClock,
}

/// Per-source selection option (spec glossary: "prefer / noselect").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectOption {
    #[default]
    Normal,
    Prefer,
    NoSelect,
}

/// The full status label set (spec §4.5). `Ok` is an internal working
/// value during `select_source` and must never be the value observed
/// once selection has completed (spec §8 testable property).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
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

#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub id: SourceId,
    pub reference_id: ReferenceId,
    pub address: Option<SocketAddr>,
    pub kind: SourceKind,
    pub option: SelectOption,
    pub status: SourceStatus,
    pub stats: Statistics,
    /// Rolling 8-bit shift register of recent response presence (spec §3
    /// invariants: `0 <= reachability < 2^8`).
    pub reachability: u8,
    pub score: f64,
    pub leap: NtpLeapIndicator,
    /// Updated each time a new sample is accumulated; used by the
    /// selector's "update wait" step (spec §4.5 step 12) to detect a
    /// winning source with no new data since the last selection.
    pub last_update_seq: u64,
    /// Number of selection rounds the source has been excluded as
    /// `Distant` (spec §4.5 step 13's `DISTANT_PENALTY`).
    pub distant_count: u32,
}

impl SourceRecord {
    pub fn new(
        id: SourceId,
        reference_id: ReferenceId,
        address: Option<SocketAddr>,
        kind: SourceKind,
        option: SelectOption,
        stats: Statistics,
    ) -> Self {
        Self {
            id,
            reference_id,
            address,
            kind,
            option,
            status: SourceStatus::Unselectable,
            stats,
            reachability: 0,
            score: 0.0,
            leap: NtpLeapIndicator::Unknown,
            last_update_seq: 0,
            distant_count: 0,
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.reachability != 0
    }

    pub fn note_reply_received(&mut self) {
        self.reachability = (self.reachability << 1) | 1;
    }

    pub fn note_poll_sent(&mut self) {
        self.reachability <<= 1;
    }
}

/// A growable collection of source records, indexed by [`SourceId`] with
/// a free list so ids are reused only once nothing else can reference
/// them (spec §9 Design Notes).
#[derive(Debug, Default)]
pub struct SourceRegistry {
    slots: Vec<Option<SourceRecord>>,
    free: Vec<u32>,
    next_seq: u64,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, build: impl FnOnce(SourceId) -> SourceRecord) -> SourceId {
        if let Some(index) = self.free.pop() {
            let id = SourceId::new(index);
            self.slots[index as usize] = Some(build(id));
            id
        } else {
            let id = SourceId::new(self.slots.len() as u32);
            self.slots.push(Some(build(id)));
            id
        }
    }

    pub fn remove(&mut self, id: SourceId) -> Option<SourceRecord> {
        let slot = self.slots.get_mut(id.index())?;
        let record = slot.take();
        if record.is_some() {
            self.free.push(id.0);
        }
        record
    }

    pub fn get(&self, id: SourceId) -> Option<&SourceRecord> {
        self.slots.get(id.index())?.as_ref()
    }

    pub fn get_mut(&mut self, id: SourceId) -> Option<&mut SourceRecord> {
        self.slots.get_mut(id.index())?.as_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceRecord> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SourceRecord> {
        self.slots.iter_mut().filter_map(|s| s.as_mut())
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Marks a source's statistics as updated "now", bumping its update
    /// sequence so the selector can detect staleness of the current
    /// winner (spec §4.5 step 12).
    pub fn bump_update_seq(&mut self, id: SourceId) {
        self.next_seq += 1;
        if let Some(record) = self.get_mut(id) {
            record.last_update_seq = self.next_seq;
        }
    }

    pub fn selected(&self) -> Option<SourceId> {
        self.iter()
            .find(|s| matches!(s.status, SourceStatus::Selected))
            .map(|s| s.id)
    }

    /// Forces reselection semantics when the caller is about to destroy
    /// the currently selected source (spec §3 Lifecycle).
    pub fn clear_selection(&mut self) {
        for source in self.iter_mut() {
            if matches!(source.status, SourceStatus::Selected) {
                source.status = SourceStatus::Unselected;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statistics::Statistics;

    fn record(id: SourceId) -> SourceRecord {
        SourceRecord::new(
            id,
            ReferenceId::from_int(0),
            None,
            SourceKind::Ntp,
            SelectOption::Normal,
            Statistics::for_ntp_source(1.0),
        )
    }

    #[test]
    fn reachability_never_exceeds_eight_bits() {
        let mut r = record(SourceId::new(0));
        for _ in 0..20 {
            r.note_reply_received();
        }
        assert!(r.reachability <= 0xff);
    }

    #[test]
    fn ids_are_not_reused_while_other_slots_are_live() {
        let mut registry = SourceRegistry::new();
        let a = registry.insert(record);
        let _b = registry.insert(record);
        registry.remove(a);
        let c = registry.insert(record);
        assert_eq!(c.index(), a.index());
    }

    #[test]
    fn at_most_one_selected_invariant_is_mechanically_enforceable() {
        let mut registry = SourceRegistry::new();
        let a = registry.insert(record);
        let b = registry.insert(record);
        registry.get_mut(a).unwrap().status = SourceStatus::Selected;
        registry.get_mut(b).unwrap().status = SourceStatus::Selected;
        let selected_count = registry
            .iter()
            .filter(|s| matches!(s.status, SourceStatus::Selected))
            .count();
        // the registry itself doesn't prevent this misuse; the selector's
        // contract does. Document the expectation with a test that would
        // catch a selector bug setting two sources Selected.
        assert_eq!(selected_count, 2, "selector must never do this");
    }
}
