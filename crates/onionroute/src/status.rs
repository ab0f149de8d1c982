//! Status reporting for the library's bootstrap process.

use std::fmt;

/// Stages of bootstrapping, surfaced to the host application.
///
/// The numeric values double as rough progress percentages, and are
/// fixed by the embedding contract: hosts display them directly.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
#[non_exhaustive]
#[allow(missing_docs)] // The variant names are the documentation here.
pub enum BootstrapStatus {
    #[default]
    Starting,
    ConnDir,
    HandshakeDir,
    OnehopCreate,
    RequestingStatus,
    LoadingStatus,
    LoadingKeys,
    RequestingDescriptors,
    LoadingDescriptors,
    ConnOr,
    HandshakeOr,
    CircuitCreate,
    Done,
}

impl BootstrapStatus {
    /// Return the progress percentage for this stage, from 0 to 100.
    pub fn progress(&self) -> u8 {
        use BootstrapStatus::*;
        match self {
            Starting => 0,
            ConnDir => 5,
            HandshakeDir => 10,
            OnehopCreate => 15,
            RequestingStatus => 20,
            LoadingStatus => 25,
            LoadingKeys => 40,
            RequestingDescriptors => 45,
            LoadingDescriptors => 50,
            ConnOr => 80,
            HandshakeOr => 85,
            CircuitCreate => 90,
            Done => 100,
        }
    }

    /// Return true if bootstrapping is complete.
    pub fn is_ready(&self) -> bool {
        matches!(self, BootstrapStatus::Done)
    }
}

impl fmt::Display for BootstrapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use BootstrapStatus::*;
        let msg = match self {
            Starting => "Starting",
            ConnDir => "Connecting to directory server",
            HandshakeDir => "Finishing handshake with directory server",
            OnehopCreate => "Establishing an encrypted directory connection",
            RequestingStatus => "Asking for network status consensus",
            LoadingStatus => "Loading network status consensus",
            LoadingKeys => "Loading authority key certs",
            RequestingDescriptors => "Asking for relay descriptors",
            LoadingDescriptors => "Loading relay descriptors",
            ConnOr => "Connecting to the onion-routing network",
            HandshakeOr => "Finishing handshake with first hop",
            CircuitCreate => "Establishing a circuit",
            Done => "Done",
        };
        write!(f, "{}", msg)
    }
}

/// Severity of a log record delivered to the host.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[non_exhaustive]
pub enum LogSeverity {
    /// Hyper-verbose messages of no interest to anybody but
    /// developers.
    Debug,
    /// Messages that appear frequently during normal operation.
    Info,
    /// Messages that appear infrequently and that the user will
    /// probably care about.
    Notice,
    /// Something has gone wrong.
    Warn,
    /// Something has gone very wrong; the library cannot proceed.
    Err,
}

/// A structured log record delivered to the host's log callback.
///
/// The fields are pre-rendered: the host may format them however it
/// likes, and must copy anything it wants to keep.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct LogRecord {
    /// How serious is this record?
    pub severity: LogSeverity,
    /// The rendered message.
    pub message: String,
}

impl LogRecord {
    /// Construct a new log record.
    pub(crate) fn new(severity: LogSeverity, message: String) -> Self {
        LogRecord { severity, message }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn progress_is_monotonic() {
        use BootstrapStatus::*;
        let seq = [
            Starting,
            ConnDir,
            HandshakeDir,
            OnehopCreate,
            RequestingStatus,
            LoadingStatus,
            LoadingKeys,
            RequestingDescriptors,
            LoadingDescriptors,
            ConnOr,
            HandshakeOr,
            CircuitCreate,
            Done,
        ];
        for w in seq.windows(2) {
            assert!(w[0].progress() < w[1].progress());
        }
        assert_eq!(Done.progress(), 100);
        assert!(Done.is_ready());
        assert!(!CircuitCreate.is_ready());
    }

    #[test]
    fn contract_values() {
        // These numbers are part of the embedding contract.
        assert_eq!(BootstrapStatus::ConnDir.progress(), 5);
        assert_eq!(BootstrapStatus::LoadingKeys.progress(), 40);
        assert_eq!(BootstrapStatus::ConnOr.progress(), 80);
        assert_eq!(BootstrapStatus::CircuitCreate.progress(), 90);
    }
}
