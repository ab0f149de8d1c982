//! Exit port policies.
//!
//! The consensus summarizes each relay's exit policy as a list of
//! accepted (or rejected) ports, e.g. `accept 80,443,8000-8999`.
//! That summary is all a client needs: given a target port, would
//! this relay be willing to connect?

use std::fmt;
use std::str::FromStr;

/// An inclusive range of ports.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct PortRange {
    /// Lowest port in this range.
    lo: u16,
    /// Highest port in this range.
    hi: u16,
}

impl PortRange {
    /// Construct a new range, returning None if it is invalid.
    fn new(lo: u16, hi: u16) -> Option<Self> {
        if lo == 0 || lo > hi {
            None
        } else {
            Some(PortRange { lo, hi })
        }
    }
    /// Return true if `port` is in this range.
    fn contains(&self, port: u16) -> bool {
        (self.lo..=self.hi).contains(&port)
    }
}

impl FromStr for PortRange {
    type Err = PolicyError;
    fn from_str(s: &str) -> Result<Self, PolicyError> {
        let (lo, hi) = match s.split_once('-') {
            Some((lo, hi)) => (
                lo.parse().map_err(|_| PolicyError::InvalidPort)?,
                hi.parse().map_err(|_| PolicyError::InvalidPort)?,
            ),
            None => {
                let v = s.parse().map_err(|_| PolicyError::InvalidPort)?;
                (v, v)
            }
        };
        PortRange::new(lo, hi).ok_or(PolicyError::InvalidRange)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lo == self.hi {
            write!(f, "{}", self.lo)
        } else {
            write!(f, "{}-{}", self.lo, self.hi)
        }
    }
}

/// An error from parsing a port policy summary.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum PolicyError {
    /// The summary didn't start with "accept" or "reject".
    #[error("unrecognized policy keyword")]
    InvalidKeyword,
    /// A port was zero or unparsable.
    #[error("invalid port")]
    InvalidPort,
    /// A port range had its ends out of order.
    #[error("invalid port range")]
    InvalidRange,
}

/// A relay's exit policy, summarized as the set of ports it will
/// connect to.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PortPolicy {
    /// The ports this relay accepts.
    allowed: Vec<PortRange>,
}

impl PortPolicy {
    /// Return a policy that rejects every port.
    pub fn new_reject_all() -> Self {
        PortPolicy::default()
    }

    /// Return a policy that accepts every port.
    pub fn new_accept_all() -> Self {
        PortPolicy {
            allowed: vec![PortRange { lo: 1, hi: 65535 }],
        }
    }

    /// Return true if this policy allows connections to `port`.
    pub fn allows_port(&self, port: u16) -> bool {
        self.allowed.iter().any(|r| r.contains(port))
    }

    /// Return true if this policy allows no port at all.
    pub fn allows_nothing(&self) -> bool {
        self.allowed.is_empty()
    }

    /// Helper: replace this policy with its complement over the full
    /// port range.
    fn invert(&mut self) {
        let mut inverted = Vec::new();
        let mut next_lo = 1_u16;
        // self.allowed is sorted and non-overlapping by construction.
        for range in &self.allowed {
            if range.lo > next_lo {
                inverted.push(PortRange {
                    lo: next_lo,
                    hi: range.lo - 1,
                });
            }
            next_lo = match range.hi.checked_add(1) {
                Some(v) => v,
                None => {
                    self.allowed = inverted;
                    return;
                }
            };
        }
        if next_lo <= 65535 {
            inverted.push(PortRange {
                lo: next_lo,
                hi: 65535,
            });
        }
        self.allowed = inverted;
    }

    /// Helper: sort and merge the ranges in this policy.
    fn normalize(&mut self) {
        self.allowed.sort_by_key(|r| r.lo);
        let mut merged: Vec<PortRange> = Vec::with_capacity(self.allowed.len());
        for r in &self.allowed {
            match merged.last_mut() {
                Some(last) if u32::from(last.hi) + 1 >= u32::from(r.lo) => {
                    last.hi = std::cmp::max(last.hi, r.hi);
                }
                _ => merged.push(*r),
            }
        }
        self.allowed = merged;
    }
}

impl FromStr for PortPolicy {
    type Err = PolicyError;
    /// Parse a policy summary as it appears in the consensus: the
    /// keyword `accept` or `reject`, then a comma-separated list of
    /// ports and port ranges.
    fn from_str(s: &str) -> Result<Self, PolicyError> {
        let (kwd, ports) = s.split_once(' ').ok_or(PolicyError::InvalidKeyword)?;
        let invert = match kwd {
            "accept" => false,
            "reject" => true,
            _ => return Err(PolicyError::InvalidKeyword),
        };
        let mut policy = PortPolicy::default();
        for item in ports.split(',') {
            policy.allowed.push(item.parse()?);
        }
        policy.normalize();
        if invert {
            policy.invert();
        }
        Ok(policy)
    }
}

impl fmt::Display for PortPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.allowed.is_empty() {
            return write!(f, "reject 1-65535");
        }
        write!(f, "accept ")?;
        let mut first = true;
        for r in &self.allowed {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}", r)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn parse_accept() {
        let p: PortPolicy = "accept 80,443,8000-8999".parse().unwrap();
        assert!(p.allows_port(80));
        assert!(p.allows_port(443));
        assert!(p.allows_port(8500));
        assert!(!p.allows_port(25));
        assert!(!p.allows_port(9000));
        assert_eq!(p.to_string(), "accept 80,443,8000-8999");
    }

    #[test]
    fn parse_reject() {
        let p: PortPolicy = "reject 25,119,135-139".parse().unwrap();
        assert!(p.allows_port(80));
        assert!(p.allows_port(140));
        assert!(!p.allows_port(25));
        assert!(!p.allows_port(137));
        assert!(p.allows_port(65535));
    }

    #[test]
    fn reject_all_accept_all() {
        let p = PortPolicy::new_reject_all();
        assert!(!p.allows_port(80));
        assert!(p.allows_nothing());

        let p = PortPolicy::new_accept_all();
        assert!(p.allows_port(1));
        assert!(p.allows_port(65535));

        // "reject 1-65535" allows nothing.
        let p: PortPolicy = "reject 1-65535".parse().unwrap();
        assert!(p.allows_nothing());
    }

    #[test]
    fn merging() {
        let p: PortPolicy = "accept 80-90,85-100,101-110".parse().unwrap();
        assert_eq!(p.to_string(), "accept 80-110");
    }

    #[test]
    fn errors() {
        assert!("frobnicate 80".parse::<PortPolicy>().is_err());
        assert!("accept 80-".parse::<PortPolicy>().is_err());
        assert!("accept 0".parse::<PortPolicy>().is_err());
        assert!("accept 9-5".parse::<PortPolicy>().is_err());
        assert!("accept".parse::<PortPolicy>().is_err());
    }
}
