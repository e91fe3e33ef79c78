//! Centralized configuration constants for roomdrop.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format constants (frame field names, channel
//! labels) stay in their respective modules.

use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Fixed chunk size for bulk file transfer (16 KiB).
///
/// Chunks are sent as raw binary data-channel messages; 16 KiB stays well
/// under the lowest common SCTP message-size denominator across WebRTC
/// implementations, so no fragmentation is needed on either side.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// High water mark for the data channel's SCTP send buffer (bytes).
///
/// When `buffered_amount` would exceed this value, the sender pauses chunk
/// transmission until the buffer drains. 16 MiB bounds sender-side memory
/// when the receiver or network is slower than the disk.
pub const DC_BUFFERED_AMOUNT_HIGH: usize = 16 * 1024 * 1024;

/// Interval (in frames) at which the chunk sender yields to the scheduler
/// so a large transfer cannot monopolize the event loop.
pub const SEND_YIELD_EVERY: usize = 10;

/// Poll interval while waiting for the send buffer to drain.
pub const BACKPRESSURE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound on one backpressure wait before the send is abandoned.
pub const BACKPRESSURE_MAX_WAIT: Duration = Duration::from_secs(30);

/// SCTP retransmission cap for the file-transfer channel.
///
/// Bounded (not unlimited) so a truly dead link cannot grow the
/// retransmission queue without limit. The chat channel has no cap.
pub const FILE_CHANNEL_MAX_RETRANSMITS: u16 = 30;

// ── Negotiation ──────────────────────────────────────────────────────────────

/// Timeout for ICE candidate gathering before an offer/answer ships with
/// whatever candidates are ready (non-trickle fallback; later candidates
/// still trickle as they arrive).
pub const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(5);

/// Negotiation stall timeout: no transport-connected signal within this
/// window tears the session down for a rebuild.
pub const NEGOTIATION_STALL_TIMEOUT: Duration = Duration::from_secs(20);

/// Maximum ICE-restart attempts after a transport failure.
pub const RECONNECT_MAX_ATTEMPTS: u32 = 5;

/// First reconnect backoff delay; doubles per attempt.
pub const RECONNECT_BACKOFF_BASE: Duration = Duration::from_secs(2);

/// Cap on the reconnect backoff delay.
pub const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(20);

// ── Signaling relay ──────────────────────────────────────────────────────────

/// Maximum signaling frames buffered while the relay link is down.
/// Oldest frames are dropped first once the cap is reached.
pub const SIGNAL_BUFFER_CAP: usize = 64;

/// Heartbeat interval for the relay liveness probe.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Delays between relay reconnect attempts, then the last value repeats.
pub const RELAY_RECONNECT_DELAYS: [u64; 4] = [1, 2, 5, 10];

// ── Peer liveness ────────────────────────────────────────────────────────────

/// Timeout for the probe sent on the chat channel before a file transfer.
/// A peer that does not acknowledge within this window is considered dead.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// ── Channel labels ───────────────────────────────────────────────────────────

/// Label of the bulk file-transfer data channel.
pub const FILE_CHANNEL_LABEL: &str = "file-transfer";

/// Label of the chat data channel.
pub const CHAT_CHANNEL_LABEL: &str = "chat";
