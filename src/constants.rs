//! Wire constants from RFC 8831/8832 and the fixed SCTP port used by this endpoint.

/// Both sides bind/connect SCTP on this port; matches the `sctpmap` SDP attribute.
pub const SCTP_PORT: u16 = 5000;

/// Default max message size advertised in offers (`a=sctpmap:5000 webrtc-datachannel 262144`).
pub const DEFAULT_SCTP_MAX_MESSAGE_SIZE: usize = 262_144;

/// Max message size advertised in answers (`a=sctpmap:5000 webrtc-datachannel 1024`).
pub const ANSWER_SCTP_MAX_MESSAGE_SIZE: usize = 1024;

/// DCEP control message type bytes (RFC 8832).
pub const DCEP_MSG_ACK: u8 = 0x02;
pub const DCEP_MSG_OPEN: u8 = 0x03;
pub const DCEP_MSG_CLOSE: u8 = 0x04;

/// PPID values (RFC 8831 section 8).
pub const PPID_CONTROL: u32 = 50;
pub const PPID_STRING: u32 = 51;
pub const PPID_BINARY: u32 = 53;
pub const PPID_STRING_EMPTY: u32 = 56;
pub const PPID_BINARY_EMPTY: u32 = 57;

/// SCTP send retry policy: up to 3000 retries at 1ms apart (~3s worst case).
pub const SEND_RETRY_ATTEMPTS: u32 = 3000;
pub const SEND_RETRY_DELAY_MS: u64 = 1;

pub const SCTP_MAX_STREAMS: u16 = 1024;
pub const SCTP_PATH_MTU: usize = 1200;
