#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::missing_docs_in_private_items)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)]
#![allow(clippy::uninlined_format_args)]

use rand::distr::uniform::{SampleRange, SampleUniform};
use rand::Rng;

pub mod retry;
pub mod test_rng;

/// Extension trait for [`Rng`].
pub trait RngExt: Rng {
    /// As `Rng::random_range`, but returns `None` instead of panicking
    /// when the range is empty.
    ///
    /// (Panicking is usually not what we want when handling network
    /// input.)
    fn gen_range_checked<T, R>(&mut self, range: R) -> Option<T>
    where
        T: SampleUniform,
        R: SampleRange<T>,
    {
        if range.is_empty() {
            None
        } else {
            Some(self.random_range(range))
        }
    }
}

impl<T: Rng> RngExt for T {}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn range_checked() {
        let mut rng = test_rng::testing_rng();
        let v: u32 = rng.gen_range_checked(5..10).unwrap();
        assert!((5..10).contains(&v));
        assert_eq!(rng.gen_range_checked::<u32, _>(10..10), None);
        #[allow(clippy::reversed_empty_ranges)]
        let empty = rng.gen_range_checked::<u32, _>(10..5);
        assert_eq!(empty, None);
    }
}
