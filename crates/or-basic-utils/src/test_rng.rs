//! Code for deterministic and/or reproducible use of PRNGs in tests.
//!
//! Often in testing we want to test a random scenario, but we want to be
//! sure of our ability to reproduce the scenario if the test fails.
//!
//! To achieve this, just have your test use [`testing_rng()`] in place of
//! [`rand::rng()`].  Then the test will (by default) choose a new random
//! seed for every run, and print that seed to standard output.  If the
//! test fails, the seed will be displayed as part of the failure message,
//! and you will be able to use it to recreate the same PRNG seed as the
//! one that caused the failure.
//!
//! The run-time behavior is controlled using the `OR_TEST_PRNG`
//! environment variable; you can set it to any of the following:
//!   * `random` for a randomly seeded PRNG. (This is the default.)
//!   * `deterministic` for an arbitrary seed that is the same on every
//!     run of the program.
//!   * A hexadecimal string, to specify a given seed to re-use from a
//!     previous test run.
//!
//! # WARNING
//!
//! This is for testing only!  Never ever use it in non-testing code.
//! Doing so may compromise your security.

// We allow printing to stdout in this module, since it's intended to be
// used by tests, where stdout printing is what we actually want.
#![allow(clippy::print_stdout)]

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// The seed type for the RNG we're returning.
type Seed = <StdRng as SeedableRng>::Seed;

/// Default seed used by the `Deterministic` configuration.
///
/// (There is nothing special about this value; it was chosen only to be
/// printable and distinctive.)
const DETERMINISTIC_SEED: &[u8] = b"a pseudorandomly chosen seed now!";

/// Configuration for how to seed a testing RNG.
#[derive(Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum Config {
    /// Use a completely random seed, and print it to stdout.
    Random,
    /// Use a fixed seed that stays the same on every run.
    Deterministic,
    /// Use a given seed from a previous test run.
    Seeded(Seed),
}

impl Config {
    /// Read the RNG configuration from the environment, if it is set.
    ///
    /// Returns `None` if the variable is unset or unparsable.
    pub fn from_env() -> Option<Self> {
        let var = std::env::var("OR_TEST_PRNG").ok()?;
        match var.to_ascii_lowercase().as_str() {
            "random" => Some(Config::Random),
            "deterministic" => Some(Config::Deterministic),
            other => {
                let mut seed = Seed::default();
                let decoded = decode_hex(other, &mut seed)?;
                if decoded == seed.len() {
                    Some(Config::Seeded(seed))
                } else {
                    None
                }
            }
        }
    }

    /// Convert this configuration into a seeded RNG, printing the seed
    /// if appropriate.
    pub fn into_rng(self) -> StdRng {
        let seed = match self {
            Config::Random => {
                let mut seed = Seed::default();
                rand::rng().fill_bytes(&mut seed);
                println!("OR_TEST_PRNG={}", encode_hex(&seed));
                seed
            }
            Config::Deterministic => {
                let mut seed = Seed::default();
                let n = std::cmp::min(seed.len(), DETERMINISTIC_SEED.len());
                seed[..n].copy_from_slice(&DETERMINISTIC_SEED[..n]);
                seed
            }
            Config::Seeded(seed) => seed,
        };
        StdRng::from_seed(seed)
    }
}

/// Return a new, possibly deterministic, RNG for use in tests.
///
/// See the module documentation for how to control its behavior.
pub fn testing_rng() -> StdRng {
    Config::from_env().unwrap_or(Config::Random).into_rng()
}

/// Helper: lowercase-hex-encode `bytes`.
fn encode_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

/// Helper: decode hex from `s` into `out`, returning how many bytes were
/// written, or None if `s` was not well-formed hex that fits in `out`.
fn decode_hex(s: &str, out: &mut [u8]) -> Option<usize> {
    if s.len() % 2 != 0 || s.len() / 2 > out.len() {
        return None;
    }
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        out[i] = ((hi << 4) | lo) as u8;
    }
    Some(s.len() / 2)
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let mut buf = [0_u8; 4];
        assert_eq!(decode_hex("01ff00a7", &mut buf), Some(4));
        assert_eq!(buf, [0x01, 0xff, 0x00, 0xa7]);
        assert_eq!(encode_hex(&buf), "01ff00a7");

        assert_eq!(decode_hex("01f", &mut buf), None);
        assert_eq!(decode_hex("0102030405", &mut buf), None);
        assert_eq!(decode_hex("zzzz", &mut buf), None);
    }

    #[test]
    fn deterministic_is_deterministic() {
        let mut rng1 = Config::Deterministic.into_rng();
        let mut rng2 = Config::Deterministic.into_rng();
        assert_eq!(rng1.next_u64(), rng2.next_u64());
    }

    #[test]
    fn seeded_matches() {
        let seed = [17_u8; 32];
        let mut rng1 = Config::Seeded(seed).into_rng();
        let mut rng2 = StdRng::from_seed(seed);
        assert_eq!(rng1.next_u64(), rng2.next_u64());
    }
}
