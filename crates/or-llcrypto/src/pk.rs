//! Public-key cryptography for the onion-routing protocol.
//!
//! In this protocol era there are only two public-key systems in
//! play, both ancient: RSA-1024 (for relay identities, onion keys,
//! and hidden-service keys) and Diffie-Hellman over a fixed 1024-bit
//! group (for the TAP circuit-extension handshake and the
//! hidden-service rendezvous handshake).

pub mod dh;
pub mod rsa;
