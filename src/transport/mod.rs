//! Transport layer modules for veiltun
//!
//! TLS setup, packet framing on the secure stream, and the HTTP camouflage
//! applied to freshly accepted connections.

pub mod framing;
pub mod sniff;
pub mod tls;

pub use sniff::{serve_decoy, sniff, Classification, PeekedStream};
