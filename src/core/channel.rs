//! Data-channel abstraction.
//!
//! One [`MessageChannel`] wraps one bidirectional, ordered, reliable
//! message stream. Sends fail when the channel is not open; callers
//! decide whether to buffer or drop. Bulk senders must go through
//! [`wait_for_buffer_space`] so the SCTP send buffer never grows past the
//! high water mark by more than one in-flight frame.

use crate::core::config::{
    BACKPRESSURE_MAX_WAIT, BACKPRESSURE_POLL_INTERVAL, DC_BUFFERED_AMOUNT_HIGH,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::info;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

// ── States & events ──────────────────────────────────────────────────────────

/// Data channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Per-channel events, delivered to the engine loop tagged with the
/// channel label. `Error` is a side-channel and does not imply `Closed`.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Open,
    Text(String),
    Binary(Bytes),
    Closed,
    Error(String),
}

// ── Seam ─────────────────────────────────────────────────────────────────────

/// A bidirectional, ordered, reliable message channel.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    fn label(&self) -> &str;
    fn ready_state(&self) -> ChannelState;
    /// Bytes queued in the transport's send buffer, for backpressure.
    async fn buffered_amount(&self) -> usize;
    async fn send_binary(&self, data: Bytes) -> Result<()>;
    async fn send_text(&self, text: String) -> Result<()>;
    async fn close(&self);
}

/// Poll until the send buffer has room for `next_msg_size` more bytes.
///
/// Pauses while `buffered + next_msg_size` would exceed the high water
/// mark and resumes as the buffer drains; gives up if the channel leaves
/// `Open` or the buffer refuses to drain within [`BACKPRESSURE_MAX_WAIT`].
pub async fn wait_for_buffer_space(
    channel: &Arc<dyn MessageChannel>,
    next_msg_size: usize,
) -> Result<()> {
    if channel.ready_state() != ChannelState::Open {
        return Err(anyhow!("Channel '{}' not open", channel.label()));
    }
    if channel.buffered_amount().await + next_msg_size <= DC_BUFFERED_AMOUNT_HIGH {
        return Ok(());
    }

    let buffered = channel.buffered_amount().await;
    info!(
        channel = channel.label(),
        buffered = buffered,
        high_watermark = DC_BUFFERED_AMOUNT_HIGH,
        "Applying backpressure - waiting for buffer to drain"
    );

    let deadline = tokio::time::Instant::now() + BACKPRESSURE_MAX_WAIT;
    loop {
        if channel.ready_state() != ChannelState::Open {
            return Err(anyhow!(
                "Channel '{}' closed during backpressure wait",
                channel.label()
            ));
        }
        if channel.buffered_amount().await + next_msg_size <= DC_BUFFERED_AMOUNT_HIGH {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!(
                "Channel '{}' send buffer refused to drain",
                channel.label()
            ));
        }
        tokio::time::sleep(BACKPRESSURE_POLL_INTERVAL).await;
    }
}

// ── WebRTC implementation ────────────────────────────────────────────────────

/// [`MessageChannel`] over a WebRTC data channel.
pub struct RtcChannel {
    label: String,
    dc: Arc<RTCDataChannel>,
}

impl RtcChannel {
    /// Wrap a data channel and wire its callbacks into `events`.
    pub fn attach(
        dc: Arc<RTCDataChannel>,
        events: tokio::sync::mpsc::UnboundedSender<(String, ChannelEvent)>,
    ) -> Arc<dyn MessageChannel> {
        let label = dc.label().to_string();

        {
            let tx = events.clone();
            let label = label.clone();
            dc.on_open(Box::new(move || {
                let _ = tx.send((label.clone(), ChannelEvent::Open));
                Box::pin(async {})
            }));
        }
        {
            let tx = events.clone();
            let label = label.clone();
            dc.on_message(Box::new(move |msg: DataChannelMessage| {
                let event = if msg.is_string {
                    match String::from_utf8(msg.data.to_vec()) {
                        Ok(text) => ChannelEvent::Text(text),
                        Err(_) => ChannelEvent::Error("non-UTF-8 text frame".into()),
                    }
                } else {
                    ChannelEvent::Binary(msg.data)
                };
                let _ = tx.send((label.clone(), event));
                Box::pin(async {})
            }));
        }
        {
            let tx = events.clone();
            let label = label.clone();
            dc.on_close(Box::new(move || {
                let _ = tx.send((label.clone(), ChannelEvent::Closed));
                Box::pin(async {})
            }));
        }
        {
            let tx = events;
            let label = label.clone();
            dc.on_error(Box::new(move |err| {
                let _ = tx.send((label.clone(), ChannelEvent::Error(err.to_string())));
                Box::pin(async {})
            }));
        }

        Arc::new(Self { label, dc })
    }

    fn assert_open(&self) -> Result<()> {
        let state = self.dc.ready_state();
        if state == RTCDataChannelState::Open {
            Ok(())
        } else {
            Err(anyhow!("Channel '{}' not open: {:?}", self.label, state))
        }
    }
}

#[async_trait]
impl MessageChannel for RtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ChannelState {
        match self.dc.ready_state() {
            RTCDataChannelState::Connecting => ChannelState::Connecting,
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing => ChannelState::Closing,
            _ => ChannelState::Closed,
        }
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.assert_open()?;
        self.dc.send(&data).await?;
        Ok(())
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.assert_open()?;
        self.dc.send_text(text).await?;
        Ok(())
    }

    async fn close(&self) {
        let _ = self.dc.close().await;
    }
}
