//! Implementation for flow control windows.
//!
//! Each hop on a circuit, and each stream, has a pair of windows: a
//! "send" window bounding how many DATA cells we may send before
//! receiving a SENDME acknowledgment, and a "receive" window
//! bounding how many DATA cells the other side may deliver to us
//! before we owe it a SENDME.

use crate::{Error, Result};
use std::marker::PhantomData;

/// Largest number of SENDME-counted cells that can be in flight at
/// once, and the size of the increment, for some window type.
pub(crate) trait WindowParams {
    /// The largest allowable value for this window.
    fn maximum() -> u16;
    /// The number of cells to increment the window by on each SENDME.
    fn increment() -> u16;
}

/// Parameters used for SENDME windows on circuits: start at 1000,
/// and add 100 whenever an acknowledgment arrives.
#[derive(Clone)]
pub(crate) struct CircParams;
impl WindowParams for CircParams {
    fn maximum() -> u16 {
        1000
    }
    fn increment() -> u16 {
        100
    }
}

/// Parameters used for SENDME windows on streams: start at 500, and
/// add 50 whenever an acknowledgment arrives.
#[derive(Clone)]
pub(crate) struct StreamParams;
impl WindowParams for StreamParams {
    fn maximum() -> u16 {
        500
    }
    fn increment() -> u16 {
        50
    }
}

/// A window for counting the data cells we can send.
///
/// When this window reaches zero, the reactor stops pulling bytes to
/// package from the corresponding source until a SENDME arrives.
#[derive(Clone)]
pub(crate) struct SendWindow<P: WindowParams> {
    /// Current value of the window, in cells.
    window: u16,
    /// Marker for the window parameters.
    _dummy: PhantomData<P>,
}

impl<P: WindowParams> SendWindow<P> {
    /// Construct a new SendWindow starting at `window` cells.
    pub(crate) fn new(window: u16) -> Self {
        SendWindow {
            window,
            _dummy: PhantomData,
        }
    }

    /// Return the current size of this window.
    pub(crate) fn window(&self) -> u16 {
        self.window
    }

    /// Record that a data cell has been sent.
    ///
    /// It is a programming error to call this when the window is
    /// empty: callers must check [`SendWindow::window`] first.
    pub(crate) fn take(&mut self) -> Result<()> {
        self.window = self
            .window
            .checked_sub(1)
            .ok_or_else(|| Error::from(or_error::internal!("sent a cell with no window")))?;
        Ok(())
    }

    /// Handle an incoming SENDME, incrementing the window.
    ///
    /// Getting a SENDME when the window is already at its maximum is
    /// a protocol violation.
    pub(crate) fn put(&mut self) -> Result<()> {
        let new_window = self.window.saturating_add(P::increment());
        if new_window > P::maximum() {
            return Err(Error::CircProto(
                "Received a SENDME when none was expected".into(),
            ));
        }
        self.window = new_window;
        Ok(())
    }
}

/// A window for counting the data cells the other side may send us.
#[derive(Clone)]
pub(crate) struct RecvWindow<P: WindowParams> {
    /// Current value of the window, in cells.
    window: u16,
    /// Marker for the window parameters.
    _dummy: PhantomData<P>,
}

impl<P: WindowParams> RecvWindow<P> {
    /// Construct a new RecvWindow starting at `window` cells.
    pub(crate) fn new(window: u16) -> Self {
        RecvWindow {
            window,
            _dummy: PhantomData,
        }
    }

    /// Return the current size of this window.
    pub(crate) fn window(&self) -> u16 {
        self.window
    }

    /// Record that a data cell was delivered to us.
    ///
    /// Returns true if it is now time to send a SENDME (and then call
    /// [`RecvWindow::put`]).  Returns an error if the window was
    /// empty, i.e. the other side sent data in violation of flow
    /// control.
    pub(crate) fn take(&mut self) -> Result<bool> {
        let v = self.window.checked_sub(1);
        if let Some(x) = v {
            self.window = x;
            // We send a SENDME each time the window falls a full
            // increment below the maximum.
            Ok(x == P::maximum() - P::increment())
        } else {
            Err(Error::CircProto(
                "Received a data cell in violation of a window".into(),
            ))
        }
    }

    /// Record that we have sent a SENDME, and increment the window.
    pub(crate) fn put(&mut self) {
        self.window = self.window.saturating_add(P::increment());
        debug_assert!(self.window <= P::maximum());
    }

    /// Reduce this window by `n`; give an error if this is not
    /// possible.
    ///
    /// (Used to account for cells that were dropped because their
    /// stream went away after we had already counted them.)
    pub(crate) fn decrement_n(&mut self, n: u16) -> Result<()> {
        self.window = self.window.checked_sub(n).ok_or_else(|| {
            Error::CircProto("Received too many cells on a closing stream".into())
        })?;
        Ok(())
    }
}

/// Send window for a whole circuit (at one hop).
pub(crate) type CircSendWindow = SendWindow<CircParams>;
/// Receive window for a whole circuit (at one hop).
pub(crate) type CircRecvWindow = RecvWindow<CircParams>;
/// Send window for a stream.
pub(crate) type StreamSendWindow = SendWindow<StreamParams>;
/// Receive window for a stream.
pub(crate) type StreamRecvWindow = RecvWindow<StreamParams>;

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn send_windows() {
        let mut w = CircSendWindow::new(10);
        for _ in 0..10 {
            assert!(w.take().is_ok());
        }
        assert_eq!(w.window(), 0);
        // Taking past zero is a bug, not a protocol error.
        assert!(w.take().is_err());

        // A sendme brings us back up...
        assert!(w.put().is_ok());
        assert_eq!(w.window(), 100);
        // ...but too many sendmes are a protocol violation.
        for _ in 0..9 {
            assert!(w.put().is_ok());
        }
        assert_eq!(w.window(), 1000);
        let e = w.put().unwrap_err();
        assert_eq!(
            e.to_string(),
            "circuit protocol violation: Received a SENDME when none was expected"
        );
    }

    #[test]
    fn recv_window_thresholds() {
        // 100 deliveries on a circuit window produce exactly one
        // "send a sendme now" signal.
        let mut w = CircRecvWindow::new(1000);
        let mut signals = 0;
        for _ in 0..100 {
            if w.take().unwrap() {
                signals += 1;
            }
        }
        assert_eq!(signals, 1);
        assert_eq!(w.window(), 900);
        w.put();
        assert_eq!(w.window(), 1000);
    }

    #[test]
    fn stream_recv_window_thresholds() {
        // 50 deliveries on a stream window produce exactly one
        // signal.
        let mut w = StreamRecvWindow::new(500);
        let mut signals = 0;
        for _ in 0..50 {
            if w.take().unwrap() {
                signals += 1;
            }
        }
        assert_eq!(signals, 1);
    }

    #[test]
    fn recv_window_violation() {
        let mut w = StreamRecvWindow::new(1);
        assert!(w.take().is_ok());
        let e = w.take().unwrap_err();
        assert_eq!(
            e.to_string(),
            "circuit protocol violation: Received a data cell in violation of a window"
        );
    }

    #[test]
    fn decrement_n() {
        let mut w = StreamRecvWindow::new(100);
        assert!(w.decrement_n(50).is_ok());
        assert!(w.decrement_n(51).is_err());
    }
}
