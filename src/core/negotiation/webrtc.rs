//! WebRTC implementation of the peer-transport seam.
//!
//! Owns one `RTCPeerConnection` per link. The initiator creates both data
//! channels before offering; the receiver collects them from
//! `on_data_channel`. Offers and answers wait for ICE gathering to finish
//! or the gather timeout, then ship whatever candidates are ready; later
//! candidates still trickle through [`LinkEvent::LocalCandidate`].

use super::link::{LinkEvent, LinkState, PeerLink, PeerLinkFactory};
use super::DescriptionKind;
use crate::core::channel::{MessageChannel, RtcChannel};
use crate::core::config::{
    CHAT_CHANNEL_LABEL, FILE_CHANNEL_LABEL, FILE_CHANNEL_MAX_RETRANSMITS, ICE_GATHER_TIMEOUT,
};
use crate::core::rendezvous::Role;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

// ── ICE configuration ────────────────────────────────────────────────────────

/// One STUN/TURN endpoint with optional short-lived credentials.
#[derive(Debug, Clone)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

/// Static ICE server list, fixed at link construction.
#[derive(Debug, Clone)]
pub struct IceConfig {
    pub servers: Vec<IceServerConfig>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            servers: vec![IceServerConfig {
                urls: vec!["stun:stun.l.google.com:19302".into()],
                username: String::new(),
                credential: String::new(),
            }],
        }
    }
}

impl IceConfig {
    fn to_rtc(&self) -> Vec<RTCIceServer> {
        self.servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone(),
                credential: s.credential.clone(),
                ..Default::default()
            })
            .collect()
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

pub struct WebRtcLinkFactory {
    ice: IceConfig,
}

impl WebRtcLinkFactory {
    pub fn new(ice: IceConfig) -> Self {
        Self { ice }
    }
}

#[async_trait]
impl PeerLinkFactory for WebRtcLinkFactory {
    async fn create(
        &self,
        role: Role,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>> {
        let link = WebRtcLink::connect(&self.ice, role, events).await?;
        Ok(Arc::new(link))
    }
}

// ── Link ─────────────────────────────────────────────────────────────────────

pub struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    channels: Arc<Mutex<HashMap<String, Arc<dyn MessageChannel>>>>,
}

impl WebRtcLink {
    async fn connect(
        ice: &IceConfig,
        role: Role,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Self> {
        let mut media = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: ice.to_rtc(),
                ..Default::default()
            })
            .await?,
        );

        let channels: Arc<Mutex<HashMap<String, Arc<dyn MessageChannel>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        // Connectivity events.
        {
            let tx = events.clone();
            pc.on_peer_connection_state_change(Box::new(move |state| {
                let mapped = match state {
                    RTCPeerConnectionState::Connected => {
                        info!(event = "webrtc_connected", "Peer connection established");
                        Some(LinkState::Connected)
                    }
                    RTCPeerConnectionState::Failed => {
                        warn!(event = "webrtc_failed", "Peer connection failed");
                        Some(LinkState::Failed)
                    }
                    RTCPeerConnectionState::Disconnected => {
                        warn!(
                            event = "webrtc_disconnected",
                            "Transient disconnect (ICE may recover)"
                        );
                        Some(LinkState::Disconnected)
                    }
                    RTCPeerConnectionState::Closed => {
                        info!(event = "webrtc_closed", "Peer connection closed");
                        Some(LinkState::Closed)
                    }
                    _ => None,
                };
                if let Some(state) = mapped {
                    let _ = tx.send(LinkEvent::StateChanged(state));
                }
                Box::pin(async {})
            }));
        }

        // Trickle locally gathered candidates as they appear.
        {
            let tx = events.clone();
            pc.on_ice_candidate(Box::new(move |candidate| {
                if let Some(candidate) = candidate {
                    match candidate
                        .to_json()
                        .map_err(anyhow::Error::from)
                        .and_then(|init| serde_json::to_string(&init).map_err(Into::into))
                    {
                        Ok(json) => {
                            let _ = tx.send(LinkEvent::LocalCandidate(json));
                        }
                        Err(e) => debug!(event = "candidate_encode_failed", error = %e),
                    }
                }
                Box::pin(async {})
            }));
        }

        let channel_tx = channel_events(&events);
        match role {
            Role::Initiator => {
                // The initiator creates both channels before offering so
                // they ride the first SDP round-trip.
                let file_init = RTCDataChannelInit {
                    ordered: Some(true),
                    // Bounded retransmission: a dead link must not grow the
                    // retransmit queue without limit.
                    max_retransmits: Some(FILE_CHANNEL_MAX_RETRANSMITS),
                    ..Default::default()
                };
                let dc = pc
                    .create_data_channel(FILE_CHANNEL_LABEL, Some(file_init))
                    .await?;
                channels.lock().unwrap().insert(
                    FILE_CHANNEL_LABEL.to_string(),
                    RtcChannel::attach(dc, channel_tx.clone()),
                );

                let chat_init = RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                };
                let dc = pc
                    .create_data_channel(CHAT_CHANNEL_LABEL, Some(chat_init))
                    .await?;
                channels.lock().unwrap().insert(
                    CHAT_CHANNEL_LABEL.to_string(),
                    RtcChannel::attach(dc, channel_tx),
                );
            }
            _ => {
                // The receiver collects whatever the initiator announces.
                let registry = channels.clone();
                pc.on_data_channel(Box::new(move |dc| {
                    let label = dc.label().to_string();
                    debug!(event = "data_channel_announced", label = %label);
                    let channel = RtcChannel::attach(dc, channel_tx.clone());
                    registry.lock().unwrap().insert(label, channel);
                    Box::pin(async {})
                }));
            }
        }

        Ok(Self { pc, channels })
    }

    /// Wait for ICE gathering to complete, or give up after the gather
    /// timeout and ship what we have (late candidates still trickle).
    async fn wait_gathering(&self) {
        let mut done = self.pc.gathering_complete_promise().await;
        if timeout(ICE_GATHER_TIMEOUT, done.recv()).await.is_err() {
            debug!(
                event = "ice_gather_timeout",
                "Shipping description with partially gathered candidates"
            );
        }
    }

    async fn local_description_json(&self) -> Result<String> {
        let desc = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| anyhow!("No local description set"))?;
        Ok(serde_json::to_string(&desc)?)
    }
}

/// Adapter: per-channel events → link event stream.
fn channel_events(
    events: &mpsc::UnboundedSender<LinkEvent>,
) -> mpsc::UnboundedSender<(String, crate::core::channel::ChannelEvent)> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let events = events.clone();
    tokio::spawn(async move {
        while let Some((label, event)) = rx.recv().await {
            if events.send(LinkEvent::Channel { label, event }).is_err() {
                break;
            }
        }
    });
    tx
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_offer(&self, ice_restart: bool) -> Result<String> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self.pc.create_offer(Some(options)).await?;
        self.pc.set_local_description(offer).await?;
        self.wait_gathering().await;
        self.local_description_json().await
    }

    async fn create_answer(&self) -> Result<String> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        self.wait_gathering().await;
        self.local_description_json().await
    }

    async fn apply_remote_description(&self, kind: DescriptionKind, sdp: String) -> Result<()> {
        let desc: RTCSessionDescription = serde_json::from_str(&sdp)?;
        debug!(event = "remote_description_apply", kind = ?kind);
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: String) -> Result<()> {
        let init: RTCIceCandidateInit = serde_json::from_str(&candidate)?;
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    fn channel(&self, label: &str) -> Option<Arc<dyn MessageChannel>> {
        self.channels.lock().unwrap().get(label).cloned()
    }

    async fn remote_address(&self) -> Option<String> {
        if self.pc.connection_state() != RTCPeerConnectionState::Connected {
            return None;
        }
        let pair = self
            .pc
            .sctp()
            .transport()
            .ice_transport()
            .get_selected_candidate_pair()
            .await?;
        (!pair.remote.address.is_empty())
            .then(|| format!("{}:{}", pair.remote.address, pair.remote.port))
    }

    async fn close(&self) {
        let channels: Vec<_> = {
            let mut guard = self.channels.lock().unwrap();
            guard.drain().map(|(_, channel)| channel).collect()
        };
        for channel in channels {
            channel.close().await;
        }
        if let Err(e) = self.pc.close().await {
            debug!(event = "pc_close_failed", error = %e);
        }
    }
}
