//! The [`Bug`] type, macros for generating it, etc.

use std::fmt::{self, Debug, Display};
use std::panic;
use std::sync::Arc;

use super::{ErrorKind, HasKind};

/// An error of an impossible kind: a violated internal invariant.
///
/// A `Bug` never represents a failure of the network or of a remote
/// party; it means that *our own* code did something it promised not to
/// do.  Construct these with [`internal!`], which captures the call
/// site, or wrap a causal error with [`into_internal!`].
//
// Boxed because it is fairly large, and will be in a variant in many
// other errors.
#[derive(Debug, Clone)]
pub struct Bug(Box<BugRepr>);

/// The contents of a [`Bug`].
#[derive(Debug, Clone)]
struct BugRepr {
    /// Message, usually from `internal!()`, like `format!`.
    message: String,

    /// File and line number of the call site.
    location: &'static panic::Location<'static>,

    /// The error that turned out to be impossible, if any.
    source: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Bug {
    /// Create a bug error, capturing this call site.
    ///
    /// Prefer to use [`internal!`], as that makes it easy to add
    /// additional information via format parameters.
    #[track_caller]
    pub fn new<S: Into<String>>(message: S) -> Self {
        Bug::new_inner(message.into(), None)
    }

    /// Create a bug error from a message and an underlying error.
    #[track_caller]
    pub fn from_error<E, S>(err: E, message: S) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Bug::new_inner(message.into(), Some(Arc::new(err)))
    }

    /// Helper for the constructors.
    #[track_caller]
    fn new_inner(
        message: String,
        source: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        Bug(BugRepr {
            message,
            location: panic::Location::caller(),
            source,
        }
        .into())
    }
}

impl std::error::Error for Bug {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0
            .source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl Display for Bug {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "internal error (bug) at {}: {}",
            &self.0.location, &self.0.message
        )
    }
}

/// Create a [`Bug`], including a message like `format!`, and capturing
/// this call site.
///
/// # Examples
///
/// ```
/// use or_error::internal;
///
/// # fn main() -> Result<(), or_error::Bug> {
/// # let mut cells = [()].iter();
/// let need_cell = cells.next().ok_or_else(|| internal!("no cells"))?;
/// # Ok(())
/// # }
/// ```
#[macro_export]
macro_rules! internal {
    { $( $arg:tt )* } => {
        $crate::Bug::new(format!($($arg)*))
    }
}

/// Helper for converting an error into a [`Bug`].
///
/// Returns a closure suitable for use with `map_err`, which wraps its
/// argument error along with a message like `format!`.
///
/// # Examples
///
/// ```
/// use or_error::into_internal;
///
/// # fn main() -> Result<(), or_error::Bug> {
/// # let s = b"1234";
/// let a: [u8; 4] = s[..]
///     .try_into()
///     .map_err(into_internal!("slice was wrong length"))?;
/// # Ok(())
/// # }
/// ```
#[macro_export]
macro_rules! into_internal {
    { $( $arg:tt )* } => {
        move |source| $crate::Bug::from_error(source, format!($($arg)*))
    }
}

impl HasKind for Bug {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Internal
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn internal_macro() {
        let bug = internal!("unexpected {}", "wombat");
        let s = bug.to_string();
        assert!(s.starts_with("internal error (bug) at "));
        assert!(s.ends_with(": unexpected wombat"));
        assert_eq!(bug.kind(), ErrorKind::Internal);
    }

    #[test]
    fn into_internal_macro() {
        let r: Result<[u8; 2], _> = b"abc"[..].try_into();
        let bug = r.map_err(into_internal!("len is wrong")).unwrap_err();
        assert!(bug.to_string().contains("len is wrong"));
        assert!(std::error::Error::source(&bug).is_some());
    }
}
