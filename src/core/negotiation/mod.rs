//! Peer negotiation: the connection state machine and its transport seam.
//!
//! The state machine itself ([`session::NegotiationSession`]) is pure: it
//! consumes an enumerated event set and returns declarative actions; all
//! async/network work (the WebRTC peer connection, timers, the relay) is
//! executed by the engine, which feeds results back in as further events.
//! This keeps every transition on one event loop and makes the
//! reorder/duplicate/self-echo handling directly testable.

pub mod link;
pub mod session;
pub mod webrtc;

use crate::core::signaling::SignalKind;
use std::time::Duration;

// ── Phases ───────────────────────────────────────────────────────────────────

/// Lifecycle of one negotiation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Created, nothing sent yet.
    New,
    /// Offer/answer exchange in flight. `ice_restart` marks the transient
    /// recovery sub-state entered from `Connected`/`Failed`.
    Negotiating { ice_restart: bool },
    /// Transport-level connected (or a data channel opened, which is
    /// treated as an equally authoritative signal).
    Connected,
    /// Transport failure; retry may be scheduled.
    Failed,
    /// Terminal. The session must be discarded and rebuilt wholesale.
    Closed,
}

/// Which side of the offer/answer pair a description is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// Tracks a description through its apply cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescState {
    Idle,
    /// Creation/application has been requested from the transport.
    Pending,
    Set,
}

// ── Events ───────────────────────────────────────────────────────────────────

/// Everything that can drive the state machine forward.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Begin negotiation for the role assigned at construction.
    Start,
    /// An envelope arrived from the relay.
    Envelope(crate::core::signaling::SignalEnvelope),
    /// The transport finished creating our local description.
    LocalDescriptionReady { kind: DescriptionKind, sdp: String },
    /// The transport finished applying a remote description.
    RemoteDescriptionApplied { kind: DescriptionKind },
    /// Transport-level connectivity signals.
    TransportConnected,
    TransportDisconnected,
    TransportFailed,
    TransportClosed,
    /// A data channel reached `open`; authoritative connected signal even
    /// when the transport-level event is delayed or missed.
    ChannelOpen { label: String },
    /// No connected signal within the stall window.
    StallTimeout,
    /// A scheduled reconnect delay elapsed.
    RetryDue,
}

// ── Actions ──────────────────────────────────────────────────────────────────

/// Declarative side-effects for the engine to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// Create (and set) a local offer on the transport, then feed back
    /// `LocalDescriptionReady`.
    CreateOffer { ice_restart: bool },
    /// Create (and set) a local answer, then feed back `LocalDescriptionReady`.
    CreateAnswer,
    /// Apply a remote description, then feed back `RemoteDescriptionApplied`.
    ApplyRemoteDescription { kind: DescriptionKind, sdp: String },
    /// Apply buffered remote candidates, in original arrival order.
    ApplyCandidates(Vec<String>),
    /// Ship a signaling payload to the peer via the relay.
    ShipSignal(SignalKind),
    /// Discard the underlying transport and build a fresh one before the
    /// next retry (stall recovery; an ICE restart alone is not enough).
    ResetLink,
    /// Arm the negotiation stall timer.
    ScheduleStallTimeout,
    /// Arm a reconnect retry after `delay`.
    ScheduleRetry { delay: Duration },
    /// Surface a status change to the caller.
    EmitStatus(SessionStatus),
}

/// Externally-visible session status changes.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStatus {
    Connected,
    /// Recovery scheduled; `attempt` is 1-based.
    Reconnecting { attempt: u32, delay: Duration },
    /// Retries exhausted; only the manual initiator override escapes this.
    Terminal { reason: String },
    /// Orderly close (remote left or explicit disconnect). Upper layers
    /// restart the whole rendezvous rather than resuming mid-negotiation.
    Closed,
}

/// Exponential reconnect backoff: `base * 2^(attempt-1)`, capped.
///
/// `attempt` is 1-based; values above the cap saturate.
pub fn reconnect_backoff(attempt: u32) -> Duration {
    use crate::core::config::{RECONNECT_BACKOFF_BASE, RECONNECT_BACKOFF_CAP};
    let exp = attempt.saturating_sub(1).min(16);
    let delay = RECONNECT_BACKOFF_BASE.saturating_mul(1u32 << exp);
    delay.min(RECONNECT_BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{RECONNECT_BACKOFF_CAP, RECONNECT_MAX_ATTEMPTS};

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let mut last = Duration::ZERO;
        for attempt in 1..=RECONNECT_MAX_ATTEMPTS {
            let delay = reconnect_backoff(attempt);
            assert!(delay >= last, "attempt {attempt} regressed");
            assert!(delay <= RECONNECT_BACKOFF_CAP, "attempt {attempt} over cap");
            last = delay;
        }
    }
}
