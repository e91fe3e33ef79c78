//! Signaling types and the relay-client seam.
//!
//! Everything that crosses the relay websocket is defined here as an
//! internally-tagged JSON enum, so unrecognized payload shapes fail at the
//! parse boundary instead of falling through a string-typed dispatch.

pub mod client;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Envelope ─────────────────────────────────────────────────────────────────

/// Payload variants relayed between peers during negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum SignalKind {
    /// SDP offer from the initiating peer.
    Offer(String),
    /// SDP answer from the responding peer.
    Answer(String),
    /// ICE candidate (JSON-encoded candidate init).
    Candidate(String),
}

impl SignalKind {
    pub fn name(&self) -> &'static str {
        match self {
            SignalKind::Offer(_) => "offer",
            SignalKind::Answer(_) => "answer",
            SignalKind::Candidate(_) => "candidate",
        }
    }
}

/// One relayed signaling message.
///
/// The relay may redeliver envelopes on reconnect and does not preserve
/// ordering across a reconnect boundary; consumers must be idempotent and
/// must discard envelopes whose `from` equals the local identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    #[serde(flatten)]
    pub kind: SignalKind,
    /// Sender identity.
    pub from: String,
    /// Addressed recipient; `None` means "the other room member".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

// ── Relay wire protocol ──────────────────────────────────────────────────────

/// Frames sent from the client to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    /// Register an identity into a room. Idempotent; re-sent after every
    /// reconnect so a relay-side reconnection never mints a new logical
    /// participant.
    Join { room_id: String, identity: String },
    /// Relay a signaling envelope, optionally addressed.
    Signal {
        envelope: SignalEnvelope,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },
    /// Explicit departure (socket close is an implicit leave).
    Leave,
    /// Liveness probe; the relay echoes the nonce back in a `pong`.
    Ping { nonce: u64 },
}

/// Frames sent from the relay to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    /// Join acknowledgment with the current membership snapshot.
    Joined {
        members: Vec<String>,
        is_first_joiner: bool,
    },
    /// Another identity entered the room.
    PeerJoined { identity: String },
    /// The other member departed (explicit leave or socket close).
    PeerLeft { identity: String },
    /// A relayed envelope addressed to us (or broadcast to "the other").
    Signal { envelope: SignalEnvelope },
    /// Third entrant rejected.
    RoomFull,
    /// The relay no longer knows our session handle; the identity is gone
    /// server-side and must not be retried.
    UnknownSession,
    /// Heartbeat reply.
    Pong { nonce: u64 },
}

// ── Engine-facing events ─────────────────────────────────────────────────────

/// Events the relay client delivers to the engine.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// Joined (or re-joined) a room; carries the membership snapshot.
    Joined {
        members: Vec<String>,
        is_first_joiner: bool,
    },
    PeerJoined {
        identity: String,
    },
    PeerLeft {
        identity: String,
    },
    Signal(SignalEnvelope),
    /// The room already had two members.
    RoomFull,
    /// The relay discarded our session; a fresh identity has been minted
    /// and all cached remote-identity state must be dropped. The caller
    /// must rejoin from scratch.
    IdentityLost {
        new_identity: String,
    },
    /// The relay link dropped; outgoing signals buffer until reconnect.
    Disconnected,
    /// Heartbeat round-trip measurement (advisory only).
    HeartbeatRtt(Duration),
}

// ── Seam ─────────────────────────────────────────────────────────────────────

/// The signaling surface the engine depends on.
///
/// Production is [`client::RelayClient`]; tests substitute an in-memory
/// relay with the same room semantics.
#[async_trait]
pub trait Signaling: Send + Sync {
    /// Register the local identity into `room_id`. Safe to call again
    /// after a reconnect.
    async fn join(&self, room_id: &str) -> Result<()>;

    /// Ship an envelope, best-effort. No delivery confirmation: callers
    /// rely on protocol-level retries, not transport acks.
    async fn send(&self, envelope: SignalEnvelope, to: Option<String>) -> Result<()>;

    /// Leave the current room.
    async fn leave(&self);

    /// Current local identity (may change after [`RelayEvent::IdentityLost`]).
    fn identity(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wire_shape() {
        let env = SignalEnvelope {
            kind: SignalKind::Offer("v=0 sdp".into()),
            from: "alice".into(),
            to: Some("bob".into()),
        };
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"kind\":\"offer\""));
        assert!(json.contains("\"payload\":\"v=0 sdp\""));

        let back: SignalEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn unaddressed_envelope_omits_to() {
        let env = SignalEnvelope {
            kind: SignalKind::Candidate("{}".into()),
            from: "alice".into(),
            to: None,
        };
        let json = serde_json::to_string(&env).unwrap();
        assert!(!json.contains("\"to\""));
    }

    #[test]
    fn server_frame_tags_are_kebab_case() {
        let frame: ServerFrame =
            serde_json::from_str(r#"{"type":"peer-left","identity":"bob"}"#).unwrap();
        assert_eq!(
            frame,
            ServerFrame::PeerLeft {
                identity: "bob".into()
            }
        );

        let full: ServerFrame = serde_json::from_str(r#"{"type":"room-full"}"#).unwrap();
        assert_eq!(full, ServerFrame::RoomFull);
    }

    #[test]
    fn client_join_round_trip() {
        let frame = ClientFrame::Join {
            room_id: "1234".into(),
            identity: "alice".into(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        let back: ClientFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
    }
}
