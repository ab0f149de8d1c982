//! Unique identifiers for channels.

use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counter for allocating unique-ish identifiers for channels.
static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

/// Process-unique identifier for a channel.
///
/// This is used for logging and debugging only: it has no protocol
/// meaning, and is not sent over the wire.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct UniqId(usize);

impl UniqId {
    /// Construct a new UniqId.
    pub(crate) fn new() -> Self {
        // Relaxed ordering is fine; we just want a unique value.
        UniqId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for UniqId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Chan {}", self.0)
    }
}

/// Counter for allocating circuit unique IDs within a channel.
///
/// (This doesn't need to be atomic, since it's only used within the
/// reactor.)
pub(crate) struct CircUniqIdContext {
    /// Next value to hand out.
    next_circ_id: usize,
}

impl CircUniqIdContext {
    /// Create a new CircUniqIdContext.
    pub(super) fn new() -> Self {
        CircUniqIdContext { next_circ_id: 0 }
    }
    /// Construct a new, unique-ish circuit UniqId.
    pub(super) fn next(&mut self, unique_id: UniqId) -> crate::circuit::UniqId {
        let circ_unique_id = self.next_circ_id;
        self.next_circ_id += 1;
        crate::circuit::UniqId::new(unique_id.0, circ_unique_id)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn chan_unique_ids_are_unique() {
        let ids: Vec<UniqId> = (0..10).map(|_| UniqId::new()).collect();
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                assert_ne!(a, b);
            }
        }
        let display = format!("{}", ids[0]);
        assert!(display.starts_with("Chan "));
    }

    #[test]
    fn circ_unique_ids_count_up() {
        let chan_id = UniqId::new();
        let mut ctx = CircUniqIdContext::new();
        let a = ctx.next(chan_id);
        let b = ctx.next(chan_id);
        assert_ne!(format!("{}", a), format!("{}", b));
    }
}
