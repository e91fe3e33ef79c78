//! Chunked file sender.
//!
//! Emits `file-info`, then fixed-size binary frames in strict order, then
//! `file-complete`. Between frames the sender awaits backpressure drain so
//! the channel's send buffer never exceeds the high water mark by more
//! than one in-flight frame, and yields to the scheduler periodically so a
//! large transfer cannot starve the event loop.

use super::{TransferEvent, TransferFrame, TransferSession, TransferStatus};
use crate::core::channel::{wait_for_buffer_space, MessageChannel};
use crate::core::config::{CHUNK_SIZE, SEND_YIELD_EVERY};
use anyhow::{Context, Result};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Send one blob over the file-transfer channel.
///
/// The caller must guarantee a single transfer in flight per channel;
/// frames from two files must never interleave.
pub async fn send_blob(
    channel: &Arc<dyn MessageChannel>,
    name: &str,
    mime_type: &str,
    data: Bytes,
    events: &mpsc::UnboundedSender<TransferEvent>,
) -> Result<()> {
    let size = data.len() as u64;
    let mut session = TransferSession::sending(name.to_string(), size, mime_type.to_string());
    let total_chunks = session.total_chunks;
    info!(
        event = "file_send_start",
        file_id = %session.file_id,
        name, size, total_chunks, "Starting file send"
    );

    let info = TransferFrame::FileInfo {
        name: name.to_string(),
        size,
        mime_type: mime_type.to_string(),
    };
    channel
        .send_text(serde_json::to_string(&info)?)
        .await
        .context("ship file-info")?;

    let mut sent_chunks = 0u64;
    for chunk in data.chunks(CHUNK_SIZE) {
        wait_for_buffer_space(channel, chunk.len()).await?;
        channel
            .send_binary(data.slice_ref(chunk))
            .await
            .with_context(|| format!("ship chunk {sent_chunks}"))?;
        sent_chunks += 1;

        if sent_chunks % SEND_YIELD_EVERY as u64 == 0 {
            let _ = events.send(TransferEvent::SendProgress {
                name: name.to_string(),
                sent_chunks,
                total_chunks,
            });
            // Keep the host event loop responsive under a long burst.
            tokio::task::yield_now().await;
        }
    }

    channel
        .send_text(serde_json::to_string(&TransferFrame::FileComplete)?)
        .await
        .context("ship file-complete")?;

    session.transferred_chunks = sent_chunks;
    session.status = TransferStatus::Completed;
    debug!(
        event = "file_send_done",
        file_id = %session.file_id,
        chunks = session.transferred_chunks,
        status = ?session.status
    );
    let _ = events.send(TransferEvent::SendProgress {
        name: name.to_string(),
        sent_chunks,
        total_chunks,
    });
    let _ = events.send(TransferEvent::SendComplete {
        name: name.to_string(),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::DC_BUFFERED_AMOUNT_HIGH;
    use crate::core::sim::BackpressureChannel;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[tokio::test]
    async fn frames_are_info_then_chunks_then_complete() {
        let channel = BackpressureChannel::new();
        let handle: Arc<dyn MessageChannel> = channel.clone();
        let (tx, _rx) = mpsc::unbounded_channel();

        let blob = Bytes::from(vec![5u8; 40_000]); // 16384 + 16384 + 7232
        send_blob(&handle, "a.bin", "application/octet-stream", blob, &tx)
            .await
            .unwrap();

        let frames = channel.frames.lock().unwrap();
        assert_eq!(frames.len(), 5);

        let info: TransferFrame = serde_json::from_slice(&frames[0]).unwrap();
        assert_eq!(
            info,
            TransferFrame::FileInfo {
                name: "a.bin".into(),
                size: 40_000,
                mime_type: "application/octet-stream".into(),
            }
        );
        assert_eq!(frames[1].len(), CHUNK_SIZE);
        assert_eq!(frames[2].len(), CHUNK_SIZE);
        assert_eq!(frames[3].len(), 40_000 - 2 * CHUNK_SIZE);
        let done: TransferFrame = serde_json::from_slice(&frames[4]).unwrap();
        assert_eq!(done, TransferFrame::FileComplete);
    }

    #[tokio::test]
    async fn empty_blob_sends_info_and_complete_only() {
        let channel = BackpressureChannel::new();
        let handle: Arc<dyn MessageChannel> = channel.clone();
        let (tx, _rx) = mpsc::unbounded_channel();

        send_blob(&handle, "empty", "application/octet-stream", Bytes::new(), &tx)
            .await
            .unwrap();
        assert_eq!(channel.frames.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn buffered_bytes_stay_under_the_high_watermark() {
        let channel = BackpressureChannel::new();
        let handle: Arc<dyn MessageChannel> = channel.clone();
        let (tx, _rx) = mpsc::unbounded_channel();

        // Drain slower than the sender produces, so backpressure engages.
        let drainer = channel.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                drainer.drain(512 * 1024);
            }
        });

        // Well past the 16 MiB mark.
        let blob = Bytes::from(vec![0u8; 24 * 1024 * 1024]);
        send_blob(&handle, "big.bin", "application/octet-stream", blob, &tx)
            .await
            .unwrap();

        let max = channel.max_buffered.load(Ordering::SeqCst);
        assert!(
            max <= DC_BUFFERED_AMOUNT_HIGH + CHUNK_SIZE,
            "buffered peaked at {max}"
        );
        // Sanity: the watermark was actually approached, so the bound above
        // tested something.
        assert!(max > DC_BUFFERED_AMOUNT_HIGH / 2);
    }
}
