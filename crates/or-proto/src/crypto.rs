//! Cryptographic code for the onion-routing protocol.
//!
//! There are three sub-modules here: the relay-cell cryptography
//! (layered encryption with rolling digests), the circuit-extension
//! handshakes (TAP and CREATE_FAST), and the legacy KDF they share.

pub(crate) mod cell;
pub(crate) mod handshake;
pub(crate) mod ll;
