//! Bulk-transfer and chat wire protocol.
//!
//! # Protocol overview
//!
//! The file-transfer channel multiplexes three message kinds, all ordered:
//! a JSON `file-info` record (text frame) announcing name/size/mime, then
//! `ceil(size / 16 KiB)` raw binary chunk frames in strict order, then a
//! JSON `file-complete` sentinel (text frame). No file data ever touches
//! the relay. The chat channel carries one JSON record per message, plus
//! the liveness probe and display-name announcements.

pub mod receiver;
pub mod sender;

use crate::core::config::CHUNK_SIZE;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── File-transfer channel frames ─────────────────────────────────────────────

/// Control frames on the file-transfer channel. Chunk data itself is sent
/// as raw binary frames between `FileInfo` and `FileComplete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransferFrame {
    /// Announces the transfer; resets any receiver-side accumulator.
    #[serde(rename_all = "camelCase")]
    FileInfo {
        name: String,
        size: u64,
        mime_type: String,
    },
    /// Sent after the final chunk.
    FileComplete,
}

// ── Chat channel frames ──────────────────────────────────────────────────────

/// Frames on the chat channel: one JSON record per send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChatFrame {
    /// A chat message.
    #[serde(rename_all = "camelCase")]
    Chat {
        content: String,
        sender_identity: String,
        /// RFC 3339 wall-clock timestamp.
        timestamp: String,
    },
    /// Display name announcement, sent once after the channel opens.
    DisplayName { name: String },
    /// Liveness probe; the peer must reply with `ProbeAck`.
    Probe,
    /// Reply to `Probe`.
    ProbeAck,
}

// ── Transfer bookkeeping ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Sending,
    Receiving,
    Completed,
    /// Completed with a byte-count mismatch; data delivered best-effort.
    CompletedSuspect,
    Error,
}

/// One in-flight file, per direction.
#[derive(Debug, Clone)]
pub struct TransferSession {
    pub file_id: Uuid,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub total_chunks: u64,
    pub transferred_chunks: u64,
    pub status: TransferStatus,
}

impl TransferSession {
    fn new(name: String, size: u64, mime_type: String, status: TransferStatus) -> Self {
        Self {
            file_id: Uuid::new_v4(),
            name,
            size,
            mime_type,
            total_chunks: chunk_count(size),
            transferred_chunks: 0,
            status,
        }
    }

    pub fn sending(name: String, size: u64, mime_type: String) -> Self {
        Self::new(name, size, mime_type, TransferStatus::Sending)
    }

    pub fn receiving(name: String, size: u64, mime_type: String) -> Self {
        Self::new(name, size, mime_type, TransferStatus::Receiving)
    }
}

/// Number of chunk frames for a blob of `size` bytes.
///
/// An empty blob produces zero chunk frames (just info + complete).
pub fn chunk_count(size: u64) -> u64 {
    size.div_ceil(CHUNK_SIZE as u64)
}

/// Progress in `[0.0, 1.0]`, clamped, so a peer over-reporting bytes must
/// not push progress past 100%.
pub fn progress(received_bytes: u64, size: u64) -> f64 {
    if size == 0 {
        return 1.0;
    }
    (received_bytes as f64 / size as f64).min(1.0)
}

// ── Events ───────────────────────────────────────────────────────────────────

/// Transfer lifecycle events surfaced to the application.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    SendProgress {
        name: String,
        sent_chunks: u64,
        total_chunks: u64,
    },
    SendComplete {
        name: String,
    },
    SendFailed {
        name: String,
        reason: String,
    },
    /// A second send was attempted while one is in flight; frames must
    /// never interleave on the channel, so the caller sees a rejection.
    SendRejected {
        name: String,
    },
    ReceiveStarted {
        name: String,
        size: u64,
        mime_type: String,
    },
    ReceiveProgress {
        name: String,
        received_bytes: u64,
        size: u64,
        progress: f64,
    },
    /// An inbound transfer was abandoned (channel error or teardown).
    ReceiveFailed {
        name: String,
        reason: String,
    },
    /// Reassembled blob. `suspect` marks a byte-count mismatch against the
    /// declared size (data delivered anyway, flagged).
    Received {
        name: String,
        mime_type: String,
        data: Vec<u8>,
        suspect: bool,
    },
}
