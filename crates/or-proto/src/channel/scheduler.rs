//! Fair scheduling of outbound cells across the circuits on a
//! channel.
//!
//! Every circuit on a channel has its own queue of cells waiting to
//! be written, along with an exponentially-decaying count of its
//! recent activity.  Whenever the TLS connection can accept another
//! cell, we flush from the *least* recently busy circuit, so that
//! loud circuits cannot starve quiet ones, while adapting over
//! minutes to sustained load.
//!
//! DESTROY cells and channel-level cells bypass the fair queues:
//! tearing a circuit down must not be delayed behind its own
//! backlog.

use or_cell::chancell::{AnyChanCell, CircId};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Upper bound on the number of cells we keep queued for a channel
/// before we stop accepting new cells from circuits.
///
/// When the queues are full, we stop pulling from the circuits'
/// senders, which (since those senders are bounded) blocks the
/// circuit reactors, which in turn lets SENDME-based flow control
/// push back through the tunnels.
pub(super) const MAX_QUEUED_CELLS: usize = 256;

/// A single circuit's outbound queue.
struct CircQueue {
    /// Cells waiting to be written for this circuit.
    cells: VecDeque<AnyChanCell>,
    /// Exponentially-decaying count of cells recently queued on this
    /// circuit.
    cell_count: f64,
    /// When `cell_count` was last rescaled.
    last_adjusted: Instant,
}

impl CircQueue {
    /// Construct a new empty queue.
    fn new(now: Instant) -> Self {
        CircQueue {
            cells: VecDeque::new(),
            cell_count: 0.0,
            last_adjusted: now,
        }
    }

    /// Decay `cell_count` to its value as of `now`.
    fn age(&mut self, now: Instant, halflife: Duration) {
        let elapsed = now.saturating_duration_since(self.last_adjusted);
        if elapsed.is_zero() {
            return;
        }
        if !halflife.is_zero() {
            let halflives = elapsed.as_secs_f64() / halflife.as_secs_f64();
            self.cell_count *= 0.5_f64.powf(halflives);
        }
        self.last_adjusted = now;
    }
}

/// The set of outbound cell queues for one channel.
pub(super) struct CellQueues {
    /// Cells that bypass fairness: DESTROYs and channel-level cells.
    priority: VecDeque<AnyChanCell>,
    /// Per-circuit queues, including the decaying activity counters
    /// of circuits whose queues are currently empty.
    queues: HashMap<CircId, CircQueue>,
    /// Circuit IDs whose queues are nonempty.
    ///
    /// Invariant: `id` is in this list iff `queues[id].cells` is
    /// nonempty.
    active: Vec<CircId>,
    /// Total number of cells queued, across `priority` and all
    /// circuits.
    n_queued: usize,
    /// Halflife for the decay of the activity counters.
    halflife: Duration,
}

impl CellQueues {
    /// Construct a new empty set of queues.
    pub(super) fn new(halflife: Duration) -> Self {
        CellQueues {
            priority: VecDeque::new(),
            queues: HashMap::new(),
            active: Vec::new(),
            n_queued: 0,
            halflife,
        }
    }

    /// Add a cell to the appropriate queue.
    ///
    /// Cells with no circuit ID go into the priority queue.
    pub(super) fn push(&mut self, cell: AnyChanCell, now: Instant) {
        match cell.circid() {
            None => self.priority.push_back(cell),
            Some(id) => {
                let halflife = self.halflife;
                let queue = self.queues.entry(id).or_insert_with(|| CircQueue::new(now));
                queue.age(now, halflife);
                queue.cell_count += 1.0;
                queue.cells.push_back(cell);
                if !self.active.contains(&id) {
                    self.active.push(id);
                }
            }
        }
        self.n_queued += 1;
    }

    /// Add a cell that must not wait behind fair queuing (such as a
    /// DESTROY).
    pub(super) fn push_priority(&mut self, cell: AnyChanCell) {
        self.priority.push_back(cell);
        self.n_queued += 1;
    }

    /// Remove and return the next cell to write, if any: first
    /// anything in the priority queue, then the head cell of the
    /// least-busy active circuit.
    pub(super) fn pop(&mut self, now: Instant) -> Option<AnyChanCell> {
        if let Some(cell) = self.priority.pop_front() {
            self.n_queued -= 1;
            return Some(cell);
        }

        // Find the active circuit with the lowest decayed cell count.
        let halflife = self.halflife;
        let mut best: Option<(usize, f64)> = None;
        for (pos, id) in self.active.iter().enumerate() {
            let queue = self
                .queues
                .get_mut(id)
                .expect("active circuit had no queue");
            queue.age(now, halflife);
            match best {
                Some((_, best_count)) if best_count <= queue.cell_count => {}
                _ => best = Some((pos, queue.cell_count)),
            }
        }

        let (pos, _) = best?;
        let id = self.active[pos];
        let queue = self
            .queues
            .get_mut(&id)
            .expect("active circuit had no queue");
        let cell = queue.cells.pop_front();
        debug_assert!(cell.is_some());
        if queue.cells.is_empty() {
            self.active.swap_remove(pos);
        }
        self.n_queued -= 1;
        cell
    }

    /// Forget about a circuit, dropping any cells it still has
    /// queued.
    pub(super) fn remove_circ(&mut self, id: CircId) {
        if let Some(queue) = self.queues.remove(&id) {
            self.n_queued -= queue.cells.len();
        }
        if let Some(pos) = self.active.iter().position(|a| *a == id) {
            self.active.swap_remove(pos);
        }
    }

    /// Change the halflife used for decaying the activity counters.
    ///
    /// (The consensus can retune this while channels are running.)
    pub(super) fn set_halflife(&mut self, halflife: Duration) {
        self.halflife = halflife;
    }

    /// Return true if any cell is waiting to be written.
    pub(super) fn has_cells(&self) -> bool {
        self.n_queued > 0
    }

    /// Return the total number of queued cells.
    pub(super) fn n_queued(&self) -> usize {
        self.n_queued
    }

    /// Testing only: return whether `id` is on the active list.
    #[cfg(test)]
    fn is_active(&self, id: CircId) -> bool {
        self.active.contains(&id)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use or_cell::chancell::msg::{AnyChanMsg, Relay};

    /// Helper: a relay cell for a given circuit.
    fn cell(id: u16) -> AnyChanCell {
        AnyChanCell::new(CircId::new(id), Relay::new(&[id as u8][..]).into())
    }

    /// Helper: which circuit is a cell for?
    fn circ_of(cell: &AnyChanCell) -> u16 {
        CircId::get_or_zero(cell.circid())
    }

    #[test]
    fn fairness_prefers_quiet_circuits() {
        let now = Instant::now();
        let mut q = CellQueues::new(Duration::from_secs(10));

        // Circuit 1 queues eight cells; circuit 2 queues two.
        for _ in 0..8 {
            q.push(cell(1), now);
        }
        for _ in 0..2 {
            q.push(cell(2), now);
        }
        assert_eq!(q.n_queued(), 10);

        // Circuit 2 has the lower cell count, so it gets to go first,
        // and keeps going until its count catches up.
        let first = q.pop(now).unwrap();
        assert_eq!(circ_of(&first), 2);
        let second = q.pop(now).unwrap();
        assert_eq!(circ_of(&second), 2);
        // Now only circuit 1 is active.
        let third = q.pop(now).unwrap();
        assert_eq!(circ_of(&third), 1);
    }

    #[test]
    fn counts_decay_over_time() {
        let now = Instant::now();
        let halflife = Duration::from_secs(10);
        let mut q = CellQueues::new(halflife);

        // Circuit 1 was busy in the past...
        for _ in 0..64 {
            q.push(cell(1), now);
        }
        while q.pop(now).is_some() {}

        // ...and six halflives later its count has decayed from 64 to 1.
        let later = now + Duration::from_secs(60);
        q.push(cell(1), later);
        q.push(cell(2), later);
        q.push(cell(2), later);

        // Circuit 1's decayed count (64/64 + 1 = 2) equals circuit
        // 2's (2), so either may win; pop everything and make sure
        // both circuits drain.
        let mut seen = [0_u32; 3];
        while let Some(c) = q.pop(later) {
            seen[circ_of(&c) as usize] += 1;
        }
        assert_eq!(seen[1], 1);
        assert_eq!(seen[2], 2);
        assert!(!q.has_cells());
    }

    #[test]
    fn active_list_tracks_queues() {
        // Invariant: a circuit is on the active list iff it has cells
        // queued.
        let now = Instant::now();
        let mut q = CellQueues::new(Duration::from_secs(10));
        let id = CircId::new(7).unwrap();

        assert!(!q.is_active(id));
        q.push(cell(7), now);
        assert!(q.is_active(id));
        let _ = q.pop(now).unwrap();
        assert!(!q.is_active(id));

        q.push(cell(7), now);
        q.remove_circ(id);
        assert!(!q.is_active(id));
        assert_eq!(q.n_queued(), 0);
    }

    #[test]
    fn priority_queue_bypasses_fairness() {
        let now = Instant::now();
        let mut q = CellQueues::new(Duration::from_secs(10));
        q.push(cell(1), now);
        q.push_priority(cell(9));
        // The priority cell wins even though circuit 1 queued first.
        assert_eq!(circ_of(&q.pop(now).unwrap()), 9);
        assert_eq!(circ_of(&q.pop(now).unwrap()), 1);
    }
}
