//! Protocol constants shared by both peers.

/// Target name addressing every endpoint on the link.
pub const BROADCAST_TARGET: &str = "broadcast";

/// Heartbeat probe action.
pub const PING_ACTION: &str = "ping";
/// Heartbeat reply action.
pub const PONG_ACTION: &str = "pong";

/// Action used by the state-sync convenience call.
pub const STATE_SYNC_ACTION: &str = "state-sync";
/// Action used by the full-resync convenience call.
pub const FULL_SYNC_ACTION: &str = "full-sync";

/// Clean close (RFC 6455 normal closure).
pub const CLOSE_NORMAL: u16 = 1000;
/// Close frame without a status code.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Abnormal close: the transport went away without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Application close code used when liveness probing gave up on the peer.
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4000;
