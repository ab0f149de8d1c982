//! Configuration for the onionroute client.
//!
//! Besides the typed configuration structs, this module understands
//! the line-oriented configuration format of the original
//! implementation (`set_conf`), so that an embedding host can feed us
//! the knobs it already has.

use crate::{Error, Result};
use or_circmgr::CircMgrConfig;
use or_hsclient::HsId;
use or_llcrypto::pk::rsa::RsaIdentity;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Configuration for an [`OnionRouteClient`](crate::OnionRouteClient).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OnionRouteConfig {
    /// Circuit-manager configuration (path rules, timing, preemptive
    /// pool, guards).
    pub circmgr: CircMgrConfig,
    /// Client-authorization entries for hidden services
    /// ("HidServAuth"): pairs of onion address and descriptor
    /// cookie.
    pub hidserv_auth: Vec<HidServAuth>,
}

/// One "HidServAuth" entry: authorization to reach a restricted
/// hidden service.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HidServAuth {
    /// The service this cookie is for.
    pub onion: String,
    /// The descriptor cookie, still in its textual form.
    pub cookie: String,
}

impl HidServAuth {
    /// Return the parsed service identifier for this entry.
    pub fn hsid(&self) -> Result<HsId> {
        self.onion
            .parse()
            .map_err(|_| Error::Address(format!("bad HidServAuth address {:?}", self.onion)))
    }
}

impl OnionRouteConfig {
    /// Apply a body of line-oriented configuration, as the original
    /// implementation's `setconf` did.
    ///
    /// When `use_defaults` is true, start from the default
    /// configuration rather than amending the current one.
    ///
    /// Unknown keywords are an error; knobs that belong to surfaces
    /// we deliberately don't implement (SOCKS, the control port) are
    /// recognized and ignored.
    pub fn apply_text(&mut self, body: &str, use_defaults: bool) -> Result<()> {
        if use_defaults {
            *self = OnionRouteConfig::default();
        }
        for line in body.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (keyword, value) = match line.split_once(char::is_whitespace) {
                Some((k, v)) => (k, v.trim()),
                None => (line, ""),
            };
            self.apply_option(keyword, value)?;
        }
        Ok(())
    }

    /// Apply a single configuration option.
    fn apply_option(&mut self, keyword: &str, value: &str) -> Result<()> {
        match keyword.to_ascii_lowercase().as_str() {
            // Presentation-layer knobs: recognized, not ours.
            "socksport" | "controlport" => {
                debug!("Ignoring {}: not an embedded-library concern", keyword);
            }
            "excludenodes" => {
                self.circmgr.path_rules.exclude_nodes = parse_node_list(value)?;
            }
            "exitnodes" => {
                self.circmgr.path_rules.exit_nodes = parse_node_list(value)?;
            }
            "strictnodes" => {
                self.circmgr.path_rules.strict_nodes = parse_bool(value)?;
            }
            "maxcircuitdirtiness" => {
                self.circmgr.circuit_timing.max_dirtiness =
                    Duration::from_secs(parse_number(value)?);
            }
            "numentryguards" => {
                self.circmgr.n_guards = parse_number(value)? as usize;
            }
            "circuitbuildtimeout" => {
                // A seed value only: the estimator adapts from here.
                self.circmgr.circuit_timing.request_timeout =
                    Duration::from_secs(parse_number(value)?);
            }
            "longlivedports" => {
                self.circmgr.path_rules.long_lived_ports = parse_port_list(value)?;
            }
            "hidservauth" => {
                let (onion, cookie) = value
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| Error::Address("HidServAuth needs an address and a cookie".into()))?;
                self.hidserv_auth.push(HidServAuth {
                    onion: onion.trim().to_string(),
                    cookie: cookie.trim().to_string(),
                });
            }
            _ => {
                return Err(Error::Address(format!(
                    "Unrecognized configuration option {:?}",
                    keyword
                )));
            }
        }
        Ok(())
    }
}

/// Parse a comma-separated list of relay fingerprints
/// (`$HEXHEXHEX...`, with or without the dollar sign).
fn parse_node_list(value: &str) -> Result<Vec<RsaIdentity>> {
    value
        .split(',')
        .map(|item| {
            let item = item.trim().trim_start_matches('$');
            RsaIdentity::from_hex(item)
                .ok_or_else(|| Error::Address(format!("bad relay fingerprint {:?}", item)))
        })
        .collect()
}

/// Parse a comma-separated list of ports.
fn parse_port_list(value: &str) -> Result<Vec<u16>> {
    value
        .split(',')
        .map(|item| {
            item.trim()
                .parse()
                .map_err(|_| Error::Address(format!("bad port {:?}", item)))
        })
        .collect()
}

/// Parse a 0/1 boolean.
fn parse_bool(value: &str) -> Result<bool> {
    match value.trim() {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(Error::Address(format!("bad boolean {:?}", value))),
    }
}

/// Parse a nonnegative number.
fn parse_number(value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Address(format!("bad number {:?}", value)))
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn parse_torrc_style() {
        let mut cfg = OnionRouteConfig::default();
        cfg.apply_text(
            "# a comment\n\
             MaxCircuitDirtiness 300\n\
             NumEntryGuards 5\n\
             StrictNodes 1\n\
             LongLivedPorts 22,6667\n\
             ExcludeNodes $AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA\n\
             SocksPort 9050\n",
            false,
        )
        .unwrap();
        assert_eq!(
            cfg.circmgr.circuit_timing.max_dirtiness,
            Duration::from_secs(300)
        );
        assert_eq!(cfg.circmgr.n_guards, 5);
        assert!(cfg.circmgr.path_rules.strict_nodes);
        assert_eq!(cfg.circmgr.path_rules.long_lived_ports, vec![22, 6667]);
        assert_eq!(
            cfg.circmgr.path_rules.exclude_nodes,
            vec![RsaIdentity::from([0xaa; 20])]
        );
    }

    #[test]
    fn use_defaults_resets() {
        let mut cfg = OnionRouteConfig::default();
        cfg.apply_text("NumEntryGuards 7", false).unwrap();
        assert_eq!(cfg.circmgr.n_guards, 7);
        cfg.apply_text("StrictNodes 1", true).unwrap();
        assert_eq!(cfg.circmgr.n_guards, 0); // back to default
        assert!(cfg.circmgr.path_rules.strict_nodes);
    }

    #[test]
    fn hidserv_auth() {
        let mut cfg = OnionRouteConfig::default();
        cfg.apply_text("HidServAuth duskgytldkxiuqc6.onion c00k13", false)
            .unwrap();
        assert_eq!(cfg.hidserv_auth.len(), 1);
        assert!(cfg.hidserv_auth[0].hsid().is_ok());
        assert_eq!(cfg.hidserv_auth[0].cookie, "c00k13");
    }

    #[test]
    fn rejected_lines() {
        let mut cfg = OnionRouteConfig::default();
        assert!(cfg.apply_text("NoSuchOption 1", false).is_err());
        assert!(cfg.apply_text("StrictNodes maybe", false).is_err());
        assert!(cfg.apply_text("ExcludeNodes $nothex", false).is_err());
        assert!(cfg.apply_text("HidServAuth onlyanaddress", false).is_err());
    }
}
