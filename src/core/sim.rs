//! In-memory simulation doubles for tests: a two-member-room relay, a
//! loopback peer-link pair, and a drainable backpressure channel.
//!
//! These mirror the production seams exactly (same traits, same event
//! types), so the engine under test runs the identical code path it runs
//! against the real relay and WebRTC stack.

use crate::core::channel::{ChannelEvent, ChannelState, MessageChannel};
use crate::core::config::{CHAT_CHANNEL_LABEL, FILE_CHANNEL_LABEL};
use crate::core::negotiation::link::{LinkEvent, LinkState, PeerLink, PeerLinkFactory};
use crate::core::negotiation::DescriptionKind;
use crate::core::rendezvous::Role;
use crate::core::signaling::{RelayEvent, SignalEnvelope, Signaling};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;

// ── Relay ────────────────────────────────────────────────────────────────────

/// In-memory relay with the production room semantics: two members per
/// room, third entrant rejected, departure notifies the remaining member.
#[derive(Default)]
pub struct SimRelay {
    inner: Mutex<RelayInner>,
}

#[derive(Default)]
struct RelayInner {
    rooms: HashMap<String, Vec<String>>,
    clients: HashMap<String, mpsc::UnboundedSender<RelayEvent>>,
    memberships: HashMap<String, String>,
}

impl SimRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a client and return its signaling handle.
    pub fn client(
        self: &Arc<Self>,
        identity: &str,
        events: mpsc::UnboundedSender<RelayEvent>,
    ) -> Arc<SimSignaling> {
        self.inner
            .lock()
            .unwrap()
            .clients
            .insert(identity.to_string(), events);
        Arc::new(SimSignaling {
            relay: self.clone(),
            identity: identity.to_string(),
        })
    }

    fn deliver(inner: &RelayInner, identity: &str, event: RelayEvent) {
        if let Some(tx) = inner.clients.get(identity) {
            let _ = tx.send(event);
        }
    }

    fn join(&self, room_id: &str, identity: &str) {
        let mut inner = self.inner.lock().unwrap();
        let members = inner.rooms.entry(room_id.to_string()).or_default();
        let full = members.len() >= 2 && !members.iter().any(|m| m == identity);
        if full {
            Self::deliver(&inner, identity, RelayEvent::RoomFull);
            return;
        }
        let members = inner.rooms.get_mut(room_id).expect("room exists");
        if !members.iter().any(|m| m == identity) {
            members.push(identity.to_string());
        }
        let snapshot = members.clone();
        inner
            .memberships
            .insert(identity.to_string(), room_id.to_string());

        Self::deliver(
            &inner,
            identity,
            RelayEvent::Joined {
                members: snapshot.clone(),
                is_first_joiner: snapshot.len() == 1,
            },
        );
        for member in snapshot.iter().filter(|m| *m != identity) {
            Self::deliver(
                &inner,
                member,
                RelayEvent::PeerJoined {
                    identity: identity.to_string(),
                },
            );
        }
    }

    fn send(&self, from: &str, envelope: SignalEnvelope, to: Option<String>) {
        let inner = self.inner.lock().unwrap();
        let Some(room) = inner.memberships.get(from) else {
            return;
        };
        let Some(members) = inner.rooms.get(room) else {
            return;
        };
        let target = to.or_else(|| members.iter().find(|m| *m != from).cloned());
        if let Some(target) = target {
            Self::deliver(&inner, &target, RelayEvent::Signal(envelope));
        }
    }

    fn leave(&self, identity: &str) {
        let mut inner = self.inner.lock().unwrap();
        let Some(room) = inner.memberships.remove(identity) else {
            return;
        };
        let remaining = match inner.rooms.get_mut(&room) {
            Some(members) => {
                members.retain(|m| m != identity);
                members.clone()
            }
            None => return,
        };
        for member in remaining {
            Self::deliver(
                &inner,
                &member,
                RelayEvent::PeerLeft {
                    identity: identity.to_string(),
                },
            );
        }
    }
}

pub struct SimSignaling {
    relay: Arc<SimRelay>,
    identity: String,
}

#[async_trait]
impl Signaling for SimSignaling {
    async fn join(&self, room_id: &str) -> Result<()> {
        self.relay.join(room_id, &self.identity);
        Ok(())
    }

    async fn send(&self, envelope: SignalEnvelope, to: Option<String>) -> Result<()> {
        self.relay.send(&self.identity, envelope, to);
        Ok(())
    }

    async fn leave(&self) {
        self.relay.leave(&self.identity);
    }

    fn identity(&self) -> String {
        self.identity.clone()
    }
}

// ── Loopback peer links ──────────────────────────────────────────────────────

/// Pairs up consecutively created links, like two clients meeting on the
/// same network path.
#[derive(Default)]
pub struct SimNet {
    pending: Mutex<Option<Arc<SimLink>>>,
}

pub struct SimLinkFactory {
    pub net: Arc<SimNet>,
}

#[async_trait]
impl PeerLinkFactory for SimLinkFactory {
    async fn create(
        &self,
        role: Role,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>> {
        let link = Arc::new(SimLink {
            role,
            events,
            peer: Mutex::new(Weak::new()),
            channels: Mutex::new(HashMap::new()),
            established: AtomicBool::new(false),
        });
        let mut pending = self.net.pending.lock().unwrap();
        if let Some(other) = pending.take() {
            *link.peer.lock().unwrap() = Arc::downgrade(&other);
            *other.peer.lock().unwrap() = Arc::downgrade(&link);
        } else {
            *pending = Some(link.clone());
        }
        Ok(link)
    }
}

pub struct SimLink {
    role: Role,
    events: mpsc::UnboundedSender<LinkEvent>,
    peer: Mutex<Weak<SimLink>>,
    channels: Mutex<HashMap<String, Arc<dyn MessageChannel>>>,
    established: AtomicBool,
}

impl SimLink {
    /// Bring up both data channels and report connectivity, once.
    fn establish(&self) {
        if self.established.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(peer) = self.peer.lock().unwrap().upgrade() else {
            return;
        };
        {
            let mut channels = self.channels.lock().unwrap();
            for label in [FILE_CHANNEL_LABEL, CHAT_CHANNEL_LABEL] {
                channels.insert(
                    label.to_string(),
                    Arc::new(SimChannel {
                        label: label.to_string(),
                        peer_events: peer.events.clone(),
                        closed: AtomicBool::new(false),
                    }) as Arc<dyn MessageChannel>,
                );
            }
        }
        for label in [FILE_CHANNEL_LABEL, CHAT_CHANNEL_LABEL] {
            let _ = self.events.send(LinkEvent::Channel {
                label: label.to_string(),
                event: ChannelEvent::Open,
            });
        }
        let _ = self
            .events
            .send(LinkEvent::StateChanged(LinkState::Connected));
    }
}

#[async_trait]
impl PeerLink for SimLink {
    async fn create_offer(&self, ice_restart: bool) -> Result<String> {
        Ok(format!(
            "sdp-offer:{:?}:{}:{}",
            self.role,
            ice_restart,
            uuid::Uuid::new_v4()
        ))
    }

    async fn create_answer(&self) -> Result<String> {
        Ok(format!("sdp-answer:{:?}:{}", self.role, uuid::Uuid::new_v4()))
    }

    async fn apply_remote_description(&self, kind: DescriptionKind, _sdp: String) -> Result<()> {
        // The offerer applying the answer completes the exchange; both
        // sides come up, like DTLS finishing on a real transport.
        if kind == DescriptionKind::Answer {
            self.establish();
            if let Some(peer) = self.peer.lock().unwrap().upgrade() {
                peer.establish();
            }
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, _candidate: String) -> Result<()> {
        Ok(())
    }

    fn channel(&self, label: &str) -> Option<Arc<dyn MessageChannel>> {
        self.channels.lock().unwrap().get(label).cloned()
    }

    async fn remote_address(&self) -> Option<String> {
        None
    }

    async fn close(&self) {
        self.channels.lock().unwrap().clear();
    }
}

/// One direction of a loopback channel pair: frames land in the remote
/// engine's link-event stream, in send order.
pub struct SimChannel {
    label: String,
    peer_events: mpsc::UnboundedSender<LinkEvent>,
    closed: AtomicBool,
}

impl SimChannel {
    fn forward(&self, event: ChannelEvent) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(anyhow!("Channel '{}' not open", self.label));
        }
        self.peer_events
            .send(LinkEvent::Channel {
                label: self.label.clone(),
                event,
            })
            .map_err(|_| anyhow!("peer gone"))
    }
}

#[async_trait]
impl MessageChannel for SimChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ChannelState {
        if self.closed.load(Ordering::SeqCst) {
            ChannelState::Closed
        } else {
            ChannelState::Open
        }
    }

    async fn buffered_amount(&self) -> usize {
        0
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.forward(ChannelEvent::Binary(data))
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.forward(ChannelEvent::Text(text))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ── Backpressure double ──────────────────────────────────────────────────────

/// Channel with a synthetic send buffer that only shrinks when the test
/// drains it; records the high-water mark actually reached.
pub struct BackpressureChannel {
    pub buffered: Arc<AtomicUsize>,
    pub max_buffered: Arc<AtomicUsize>,
    pub frames: Arc<Mutex<Vec<Bytes>>>,
}

impl BackpressureChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            buffered: Arc::new(AtomicUsize::new(0)),
            max_buffered: Arc::new(AtomicUsize::new(0)),
            frames: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Drain up to `amount` bytes from the synthetic buffer.
    pub fn drain(&self, amount: usize) {
        let _ = self
            .buffered
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| {
                Some(b.saturating_sub(amount))
            });
    }
}

#[async_trait]
impl MessageChannel for BackpressureChannel {
    fn label(&self) -> &str {
        FILE_CHANNEL_LABEL
    }

    fn ready_state(&self) -> ChannelState {
        ChannelState::Open
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        let now = self.buffered.fetch_add(data.len(), Ordering::SeqCst) + data.len();
        self.max_buffered.fetch_max(now, Ordering::SeqCst);
        self.frames.lock().unwrap().push(data);
        Ok(())
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.frames.lock().unwrap().push(Bytes::from(text));
        Ok(())
    }

    async fn close(&self) {}
}
