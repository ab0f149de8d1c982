//! Helpers for reporting errors (and their causes) in log messages.

use std::fmt::{self, Debug, Display};

/// Extension trait for formatting an error together with its sources.
///
/// The standard `Display` for most errors shows only the outermost
/// layer; this trait walks `Error::source()` and joins the chain with
/// colons, which is what we want in a log line.
pub trait ErrorReport {
    /// Return an object that displays this error along with its chain
    /// of causes.
    fn report(&self) -> Report<'_>;
}

impl<E: std::error::Error> ErrorReport for E {
    fn report(&self) -> Report<'_> {
        Report(self)
    }
}

impl ErrorReport for dyn std::error::Error {
    fn report(&self) -> Report<'_> {
        Report(self)
    }
}

/// Wrapper returned by [`ErrorReport::report`].
pub struct Report<'a>(&'a dyn std::error::Error);

impl<'a> Display for Report<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error: {}", self.0)?;
        let mut source = self.0.source();
        while let Some(e) = source {
            write!(f, ": {}", e)?;
            source = e.source();
        }
        Ok(())
    }
}

impl<'a> Debug for Report<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// Log a report for `err` at WARN level, with optional formatted context.
#[macro_export]
macro_rules! warn_report {
    ( $err:expr, $($rest:expr),+ $(,)? ) => {
        tracing::warn!("{}: {}", format_args!($($rest),+),
                       $crate::ErrorReport::report(&$err))
    }
}

/// Log a report for `err` at ERROR level, with optional formatted context.
#[macro_export]
macro_rules! error_report {
    ( $err:expr, $($rest:expr),+ $(,)? ) => {
        tracing::error!("{}: {}", format_args!($($rest),+),
                        $crate::ErrorReport::report(&$err))
    }
}

/// Log a report for `err` at DEBUG level, with optional formatted context.
#[macro_export]
macro_rules! debug_report {
    ( $err:expr, $($rest:expr),+ $(,)? ) => {
        tracing::debug!("{}: {}", format_args!($($rest),+),
                        $crate::ErrorReport::report(&$err))
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn chain() {
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "inner problem");
        let outer = anyhow::Error::from(inner).context("outer problem");
        let outer_ref: &dyn std::error::Error = outer.as_ref();
        let report = format!("{}", outer_ref.report());
        assert_eq!(report, "error: outer problem: inner problem");
    }
}
