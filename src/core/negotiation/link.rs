//! The peer-transport seam.
//!
//! [`PeerLink`] is the RTCPeerConnection-equivalent the state-machine
//! driver executes actions against; production is the WebRTC
//! implementation in [`super::webrtc`], tests substitute a loopback pair.

use super::DescriptionKind;
use crate::core::channel::{ChannelEvent, MessageChannel};
use crate::core::rendezvous::Role;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Transport-level connectivity, as reported by the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    /// Transient; ICE may still recover without intervention.
    Disconnected,
    Failed,
    Closed,
}

/// Events a link pushes into the engine loop.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    StateChanged(LinkState),
    /// A locally gathered ICE candidate to trickle to the peer
    /// (JSON-encoded candidate init).
    LocalCandidate(String),
    /// A data-channel event, tagged with the channel label.
    Channel { label: String, event: ChannelEvent },
}

/// One peer transport. All methods are driven from the single engine
/// task; results feed back into the state machine as events.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Create and set the local offer, waiting for ICE gathering to finish
    /// or the gather timeout to elapse, whichever comes first. Returns the
    /// SDP to ship; late candidates still trickle via
    /// [`LinkEvent::LocalCandidate`].
    async fn create_offer(&self, ice_restart: bool) -> Result<String>;

    /// Create and set the local answer (remote offer must be applied).
    async fn create_answer(&self) -> Result<String>;

    async fn apply_remote_description(&self, kind: DescriptionKind, sdp: String) -> Result<()>;

    /// Apply one remote candidate. Only valid after the remote description
    /// is set; the state machine guarantees the ordering.
    async fn add_remote_candidate(&self, candidate: String) -> Result<()>;

    /// Look up a data channel by label once it has been announced.
    fn channel(&self, label: &str) -> Option<Arc<dyn MessageChannel>>;

    /// `IP:port` of the selected candidate pair's remote end, once
    /// connected. Opaque side-channel metadata; never used for
    /// negotiation decisions.
    async fn remote_address(&self) -> Option<String>;

    /// Tear the transport down, closing all channels synchronously.
    async fn close(&self);
}

/// Builds fresh links; owns the ICE configuration, which is fixed at
/// construction time and never re-fetched mid-session.
#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    async fn create(
        &self,
        role: Role,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>>;
}
