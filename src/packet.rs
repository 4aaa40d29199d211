//! IP header inspection for routing
//!
//! The relay never parses more than the fixed header prefix of a packet. The
//! version nibble selects the layout and the source or destination address is
//! rendered as the textual peer key used by the session cache.

use crate::constants::{
    IPV4_DST_OFFSET, IPV4_HEADER_LEN, IPV4_SIZE, IPV4_SRC_OFFSET, IPV6_DST_OFFSET,
    IPV6_HEADER_LEN, IPV6_SIZE, IPV6_SRC_OFFSET,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// IP version declared in the high nibble of the first byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

/// Which address of the header a key is derived from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Source,
    Destination,
}

/// Read the version nibble. Unknown versions and empty input yield `None`.
pub fn ip_version(packet: &[u8]) -> Option<IpVersion> {
    match packet.first()? >> 4 {
        4 => Some(IpVersion::V4),
        6 => Some(IpVersion::V6),
        _ => None,
    }
}

pub fn is_ipv4(packet: &[u8]) -> bool {
    ip_version(packet) == Some(IpVersion::V4)
}

pub fn is_ipv6(packet: &[u8]) -> bool {
    ip_version(packet) == Some(IpVersion::V6)
}

/// Extract the requested address, provided the packet holds a full header
/// for its declared version.
pub fn address(packet: &[u8], endpoint: Endpoint) -> Option<IpAddr> {
    match ip_version(packet)? {
        IpVersion::V4 => {
            if packet.len() < IPV4_HEADER_LEN {
                return None;
            }
            let offset = match endpoint {
                Endpoint::Source => IPV4_SRC_OFFSET,
                Endpoint::Destination => IPV4_DST_OFFSET,
            };
            let mut octets = [0u8; IPV4_SIZE];
            octets.copy_from_slice(&packet[offset..offset + IPV4_SIZE]);
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        IpVersion::V6 => {
            if packet.len() < IPV6_HEADER_LEN {
                return None;
            }
            let offset = match endpoint {
                Endpoint::Source => IPV6_SRC_OFFSET,
                Endpoint::Destination => IPV6_DST_OFFSET,
            };
            let mut octets = [0u8; IPV6_SIZE];
            octets.copy_from_slice(&packet[offset..offset + IPV6_SIZE]);
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
    }
}

/// Derive the peer key of a packet.
///
/// Returns the textual address, or an empty string when the packet is too
/// short for its declared version or the version is unrecognized. Callers
/// treat the empty key as undeliverable. IPv4-mapped IPv6 addresses are keyed
/// in dotted IPv4 form.
pub fn key(packet: &[u8], endpoint: Endpoint) -> String {
    address(packet, endpoint)
        .map(|addr| addr.to_canonical().to_string())
        .unwrap_or_default()
}

/// Key of the sending host, used by the ingress path to refresh sessions
pub fn src_key(packet: &[u8]) -> String {
    key(packet, Endpoint::Source)
}

/// Key of the receiving host, used by the egress path to pick a connection
pub fn dst_key(packet: &[u8]) -> String {
    key(packet, Endpoint::Destination)
}
