//! File reassembly.
//!
//! One inbound transfer per channel at a time: `file-info` opens a fresh
//! accumulator (discarding any stale one), binary frames append in arrival
//! order (the channel guarantees ordering), `file-complete` concatenates
//! and delivers. A byte-count mismatch against the declared size is
//! reported as a warning but the assembled data is still delivered.

use super::{progress, TransferEvent, TransferFrame, TransferSession, TransferStatus};
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

struct ActiveReceive {
    session: TransferSession,
    chunks: Vec<Bytes>,
    received_bytes: u64,
}

/// Receiver-side state for the file-transfer channel.
pub struct TransferReceiver {
    active: Option<ActiveReceive>,
    events: mpsc::UnboundedSender<TransferEvent>,
}

impl TransferReceiver {
    pub fn new(events: mpsc::UnboundedSender<TransferEvent>) -> Self {
        Self {
            active: None,
            events,
        }
    }

    /// Handle a text (control) frame from the file-transfer channel.
    pub fn on_text(&mut self, text: &str) {
        match serde_json::from_str::<TransferFrame>(text) {
            Ok(TransferFrame::FileInfo {
                name,
                size,
                mime_type,
            }) => self.on_file_info(name, size, mime_type),
            Ok(TransferFrame::FileComplete) => self.on_file_complete(),
            Err(e) => {
                warn!(event = "transfer_frame_unparsed", error = %e, "Dropping malformed control frame");
            }
        }
    }

    fn on_file_info(&mut self, name: String, size: u64, mime_type: String) {
        if let Some(stale) = self.active.take() {
            warn!(
                event = "transfer_superseded",
                stale = %stale.session.name,
                "New file-info while a transfer was open; discarding accumulator"
            );
        }
        let session = TransferSession::receiving(name.clone(), size, mime_type.clone());
        info!(
            event = "file_recv_start",
            file_id = %session.file_id,
            name = %name,
            size,
            mime = %mime_type
        );
        self.active = Some(ActiveReceive {
            session,
            chunks: Vec::new(),
            received_bytes: 0,
        });
        let _ = self.events.send(TransferEvent::ReceiveStarted {
            name,
            size,
            mime_type,
        });
    }

    /// Handle a binary chunk frame.
    pub fn on_binary(&mut self, data: Bytes) {
        let Some(active) = self.active.as_mut() else {
            // Chunk with no open transfer: protocol violation from the
            // peer; drop the frame rather than guessing an owner.
            warn!(
                event = "orphan_chunk_dropped",
                bytes = data.len(),
                "Binary frame with no open transfer"
            );
            return;
        };

        active.received_bytes += data.len() as u64;
        active.chunks.push(data);
        // Counter stays within the declared chunk budget even if the peer
        // over-sends; the byte mismatch is caught at completion.
        active.session.transferred_chunks =
            (active.chunks.len() as u64).min(active.session.total_chunks);

        let _ = self.events.send(TransferEvent::ReceiveProgress {
            name: active.session.name.clone(),
            received_bytes: active.received_bytes,
            size: active.session.size,
            progress: progress(active.received_bytes, active.session.size),
        });
    }

    fn on_file_complete(&mut self) {
        let Some(mut active) = self.active.take() else {
            warn!(event = "orphan_complete_dropped", "file-complete with no open transfer");
            return;
        };

        let suspect = active.received_bytes != active.session.size;
        if suspect {
            warn!(
                event = "transfer_size_mismatch",
                name = %active.session.name,
                declared = active.session.size,
                received = active.received_bytes,
                "Byte count differs from declared size; delivering anyway"
            );
        }

        let mut data = Vec::with_capacity(active.received_bytes as usize);
        for chunk in active.chunks.drain(..) {
            data.extend_from_slice(&chunk);
        }

        active.session.status = if suspect {
            TransferStatus::CompletedSuspect
        } else {
            TransferStatus::Completed
        };
        debug!(
            event = "file_recv_done",
            name = %active.session.name,
            bytes = data.len(),
            chunks = active.session.transferred_chunks,
            status = ?active.session.status
        );
        let _ = self.events.send(TransferEvent::Received {
            name: active.session.name,
            mime_type: active.session.mime_type,
            data,
            suspect,
        });
    }

    /// Abandon any in-flight transfer (channel error or session teardown).
    /// The transfer is surfaced as failed, never silently dropped.
    pub fn abort(&mut self, reason: &str) {
        if let Some(mut active) = self.active.take() {
            active.session.status = TransferStatus::Error;
            warn!(
                event = "transfer_aborted",
                name = %active.session.name,
                reason,
                "In-flight transfer abandoned"
            );
            let _ = self.events.send(TransferEvent::ReceiveFailed {
                name: active.session.name,
                reason: reason.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CHUNK_SIZE;

    fn collect(rx: &mut mpsc::UnboundedReceiver<TransferEvent>) -> Vec<TransferEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn info_json(name: &str, size: u64) -> String {
        serde_json::to_string(&TransferFrame::FileInfo {
            name: name.into(),
            size,
            mime_type: "application/octet-stream".into(),
        })
        .unwrap()
    }

    fn complete_json() -> String {
        serde_json::to_string(&TransferFrame::FileComplete).unwrap()
    }

    /// Feed a blob through info/chunks/complete and return the delivery.
    fn round_trip(size: usize) -> (Vec<u8>, Vec<u8>, bool) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut recv = TransferReceiver::new(tx);

        let blob: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        recv.on_text(&info_json("blob.bin", size as u64));
        for chunk in blob.chunks(CHUNK_SIZE) {
            recv.on_binary(Bytes::copy_from_slice(chunk));
        }
        recv.on_text(&complete_json());

        for ev in collect(&mut rx) {
            if let TransferEvent::Received { data, suspect, .. } = ev {
                return (blob, data, suspect);
            }
        }
        panic!("no Received event for size {size}");
    }

    #[test]
    fn round_trip_boundary_sizes() {
        for size in [0usize, 1, 16_384, 16_385, 1_000_000] {
            let (blob, data, suspect) = round_trip(size);
            assert_eq!(blob, data, "size {size} not byte-identical");
            assert!(!suspect, "size {size} flagged suspect");
        }
    }

    #[test]
    fn million_byte_blob_spans_62_chunks() {
        let blob = vec![7u8; 1_000_000];
        assert_eq!(blob.chunks(CHUNK_SIZE).count(), 62);
    }

    #[test]
    fn orphan_chunk_is_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut recv = TransferReceiver::new(tx);

        recv.on_binary(Bytes::from_static(b"stray"));
        assert!(collect(&mut rx).is_empty());

        // A proper transfer afterwards is unaffected.
        recv.on_text(&info_json("a.bin", 3));
        recv.on_binary(Bytes::from_static(b"abc"));
        recv.on_text(&complete_json());
        let events = collect(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, TransferEvent::Received { data, .. } if data == b"abc")));
    }

    #[test]
    fn size_mismatch_delivers_flagged_data() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut recv = TransferReceiver::new(tx);

        recv.on_text(&info_json("short.bin", 10));
        recv.on_binary(Bytes::from_static(b"abc"));
        recv.on_text(&complete_json());

        let delivered = collect(&mut rx).into_iter().find_map(|e| match e {
            TransferEvent::Received { data, suspect, .. } => Some((data, suspect)),
            _ => None,
        });
        let (data, suspect) = delivered.expect("data delivered despite mismatch");
        assert_eq!(data, b"abc");
        assert!(suspect);
    }

    #[test]
    fn new_file_info_resets_stale_accumulator() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut recv = TransferReceiver::new(tx);

        recv.on_text(&info_json("first.bin", 100));
        recv.on_binary(Bytes::from_static(b"junk"));
        // Sender restarted: fresh info supersedes the stale transfer.
        recv.on_text(&info_json("second.bin", 3));
        recv.on_binary(Bytes::from_static(b"xyz"));
        recv.on_text(&complete_json());

        let events = collect(&mut rx);
        let delivered = events.iter().find_map(|e| match e {
            TransferEvent::Received { name, data, suspect, .. } => {
                Some((name.clone(), data.clone(), *suspect))
            }
            _ => None,
        });
        assert_eq!(
            delivered,
            Some(("second.bin".to_string(), b"xyz".to_vec(), false))
        );
    }

    #[test]
    fn completion_fires_exactly_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut recv = TransferReceiver::new(tx);

        recv.on_text(&info_json("a.bin", 2));
        recv.on_binary(Bytes::from_static(b"ab"));
        recv.on_text(&complete_json());
        // Relay-style redelivery of the sentinel.
        recv.on_text(&complete_json());

        let received = collect(&mut rx)
            .iter()
            .filter(|e| matches!(e, TransferEvent::Received { .. }))
            .count();
        assert_eq!(received, 1);
    }
}
