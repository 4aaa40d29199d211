//! Global constants for the veiltun relay

use std::time::Duration;

// ============================================================================
// BUFFER SIZES
// ============================================================================

/// Default interface read buffer size (one maximum-size IP packet)
pub const DEFAULT_BUFFER_SIZE: usize = 65535;

/// Largest IP packet the relay will ever reconstruct (IPv4/IPv6 without jumbograms)
pub const MAX_PACKET_SIZE: usize = 65535;

/// Largest encoded frame payload on the secure stream (u16 length prefix)
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Length prefix size for transport frames
pub const FRAME_HEADER_SIZE: usize = 2;

/// Encoded packets queued per peer before egress starts dropping
pub const PEER_QUEUE_DEPTH: usize = 256;

// ============================================================================
// IP HEADER LAYOUT
// ============================================================================

/// Minimum IPv4 header length
pub const IPV4_HEADER_LEN: usize = 20;

/// Fixed IPv6 header length
pub const IPV6_HEADER_LEN: usize = 40;

/// IPv4 address size (32 bits)
pub const IPV4_SIZE: usize = 4;

/// IPv6 address size (128 bits)
pub const IPV6_SIZE: usize = 16;

/// Offset of the IPv4 source address
pub const IPV4_SRC_OFFSET: usize = 12;

/// Offset of the IPv4 destination address
pub const IPV4_DST_OFFSET: usize = 16;

/// Offset of the IPv6 source address
pub const IPV6_SRC_OFFSET: usize = 8;

/// Offset of the IPv6 destination address
pub const IPV6_DST_OFFSET: usize = 24;

// ============================================================================
// TIMEOUTS
// ============================================================================

/// Lifetime of a session entry since its last refresh
pub const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// How often the background sweeper drops expired sessions
pub const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Upper bound for the server-side TLS handshake
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay between client reconnection attempts
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Upper bound for flushing and closing a peer's write half
pub const PEER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval of the verbose traffic report
pub const STATS_REPORT_INTERVAL: Duration = Duration::from_secs(30);

// ============================================================================
// OBFUSCATION
// ============================================================================

/// Obfuscation key used when none is configured
pub const DEFAULT_OBFS_KEY: &str = "freedom@2023";
