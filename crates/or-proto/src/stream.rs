//! Implements streams: the byte channels that clients tunnel through
//! circuits.
//!
//! # Overview
//!
//! A stream is an anonymized conversation over the network; multiple
//! streams can be multiplexed over a single circuit.  Each stream
//! rides over the circuit as a numbered sub-channel of RELAY cells.
//!
//! The central types are [`DataStream`] (a TCP-like byte stream,
//! implementing AsyncRead and AsyncWrite), and [`ResolveStream`] (a
//! single-shot DNS request).  Both are built on [`StreamReader`],
//! which receives the stream's raw relay cells from the circuit
//! reactor.

mod data;
mod params;
mod raw;
mod resolve;

pub use data::{DataReader, DataStream, DataWriter};
pub use params::StreamParameters;
pub use raw::StreamReader;
pub use resolve::ResolveStream;
