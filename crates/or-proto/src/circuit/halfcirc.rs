//! Type and code for handling a "half-closed" circuit.

use crate::{Error, Result};

/// A circuit that we have sent a DESTROY for, but where we might
/// still receive some cells from the other side that hasn't noticed
/// yet.
///
/// We track these, instead of dropping the circuit ID immediately,
/// for two reasons: the ID may not be reused until both sides have
/// observed the DESTROY, and an unbounded stream of cells for a
/// destroyed circuit is a protocol violation that we want to detect.
pub(crate) struct HalfCirc {
    /// How many more relay cells will we accept for this circuit
    /// before we declare that the other side is misbehaving?
    allow_relay_cells: u16,
}

impl HalfCirc {
    /// Create a new HalfCirc that will allow `total_windows` more
    /// relay cells.
    pub(crate) fn new(total_windows: u16) -> Self {
        HalfCirc {
            allow_relay_cells: total_windows,
        }
    }

    /// Try to receive another relay cell on this circuit.
    pub(crate) fn receive_cell(&mut self) -> Result<()> {
        if let Some(n) = self.allow_relay_cells.checked_sub(1) {
            self.allow_relay_cells = n;
            Ok(())
        } else {
            Err(Error::ChanProto(
                "Too many cells received on destroyed circuit".into(),
            ))
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn halfcirc_countdown() {
        let mut hc = HalfCirc::new(3);
        assert!(hc.receive_cell().is_ok());
        assert!(hc.receive_cell().is_ok());
        assert!(hc.receive_cell().is_ok());
        let e = hc.receive_cell().unwrap_err();
        assert_eq!(
            e.to_string(),
            "channel protocol violation: Too many cells received on destroyed circuit"
        );
    }
}
