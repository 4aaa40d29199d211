//! veiltun tunnel relay library
//!
//! Relays raw IP packets between a virtual interface and TLS connections,
//! with optional obfuscation and compression of every packet and an HTTP
//! decoy for connections that are not tunnel clients.

pub mod client;
pub mod config;
pub mod constants;
pub mod device;
pub mod logging;
pub mod obfuscation;
pub mod packet;
pub mod relay;
pub mod server;
pub mod session;
pub mod stats;
pub mod transport;
