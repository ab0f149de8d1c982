//! Unique identifiers for circuits.

use std::fmt::{Display, Formatter};

/// Process-unique identifier for a circuit.
///
/// We could use channel_id.circid here, but the circid can be reused
/// over time.  This is a persistently unique identifier, for
/// logging and debugging only.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct UniqId {
    /// Which channel this circuit is on.
    chan: usize,
    /// An identifier for this circuit within its channel
    circ: usize,
}

impl UniqId {
    /// Construct a new circuit UniqId from its parts.
    pub(crate) fn new(chan: usize, circ: usize) -> Self {
        UniqId { chan, circ }
    }
}

impl Display for UniqId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Circ {}.{}", self.chan, self.circ)
    }
}
