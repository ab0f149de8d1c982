//! The preemptive circuit pool, and the bookkeeping for reusing
//! open circuits.

use crate::usage::{SupportedCircUsage, TargetCircUsage};
use or_proto::circuit::ClientCirc;
use std::time::{Duration, Instant};

/// An open circuit that the manager is willing to hand out.
pub(crate) struct OpenEntry {
    /// The circuit itself.
    pub(crate) circ: ClientCirc,
    /// What the circuit can be used for.
    pub(crate) usage: SupportedCircUsage,
    /// When did this circuit first carry a stream, if ever?
    ///
    /// A circuit that has carried traffic is "dirty"; after a
    /// configured horizon it is not handed to any new stream, and it
    /// survives only as long as its existing streams do.
    pub(crate) dirty_since: Option<Instant>,
    /// When was this circuit built?
    pub(crate) created_at: Instant,
}

impl OpenEntry {
    /// Return true if this entry may be handed to a new request with
    /// the given target usage at time `now`.
    fn usable_for(&self, target: &TargetCircUsage, now: Instant, max_dirtiness: Duration) -> bool {
        if self.circ.is_closing() {
            return false;
        }
        if !self.usage.supports(target) {
            return false;
        }
        match self.dirty_since {
            None => true,
            Some(dirty) => now.saturating_duration_since(dirty) < max_dirtiness,
        }
    }

    /// Return true if this entry is clean: open and never used.
    fn is_clean(&self) -> bool {
        self.dirty_since.is_none() && !self.circ.is_closing()
    }
}

/// The set of open circuits that the manager knows about.
#[derive(Default)]
pub(crate) struct Pool {
    /// The circuits themselves.
    entries: Vec<OpenEntry>,
}

impl Pool {
    /// Add a new entry to the pool.
    pub(crate) fn insert(&mut self, entry: OpenEntry) {
        self.entries.push(entry);
    }

    /// Find a circuit suitable for `target`, mark it dirty, and
    /// return it.
    pub(crate) fn claim(
        &mut self,
        target: &TargetCircUsage,
        now: Instant,
        max_dirtiness: Duration,
    ) -> Option<ClientCirc> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.usable_for(target, now, max_dirtiness))?;
        entry.dirty_since.get_or_insert(now);
        Some(entry.circ.clone())
    }

    /// Take a clean entry that `predicate` matches out of the pool,
    /// for cannibalization.
    pub(crate) fn take_clean_matching<P>(&mut self, predicate: P) -> Option<OpenEntry>
    where
        P: Fn(&OpenEntry) -> bool,
    {
        let idx = self
            .entries
            .iter()
            .position(|e| e.is_clean() && predicate(e))?;
        Some(self.entries.swap_remove(idx))
    }

    /// Count the clean general-purpose circuits in the pool.
    pub(crate) fn n_clean(&self) -> usize {
        self.entries.iter().filter(|e| e.is_clean()).count()
    }

    /// Drop every entry that can no longer be handed out: closed
    /// circuits, circuits dirty beyond the horizon, and clean
    /// circuits that have gone unused for too long.
    ///
    /// Dropping our handle does not tear down a circuit that still
    /// has live streams: each stream holds its own reference, and the
    /// circuit lives until the last one ends.  Clean unused circuits
    /// have no other references, so dropping them retires them.
    pub(crate) fn sweep(&mut self, now: Instant, max_dirtiness: Duration, max_unused_age: Duration) {
        self.entries.retain(|e| {
            if e.circ.is_closing() {
                return false;
            }
            match e.dirty_since {
                Some(dirty) => now.saturating_duration_since(dirty) < max_dirtiness,
                None => now.saturating_duration_since(e.created_at) < max_unused_age,
            }
        });
    }

    /// Drop the entry for one particular circuit, if present.
    ///
    /// (Used when a circuit turns out to be lying about what it
    /// supports, e.g. an exit that rejects a connection its policy
    /// advertised.)
    pub(crate) fn retire_circuit(&mut self, circ: &ClientCirc) {
        self.entries
            .retain(|e| e.circ.unique_id() != circ.unique_id());
    }

    /// Drop every entry, so that no new stream is handed an old
    /// circuit.
    ///
    /// Existing streams keep their circuits alive; everything else is
    /// retired immediately.
    pub(crate) fn retire_all(&mut self) {
        self.entries.clear();
    }

}
