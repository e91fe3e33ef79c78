//! The peer negotiation state machine.
//!
//! One [`NegotiationSession`] exists per active peer pairing and owns all
//! mutable negotiation state: description progress, the pending-candidate
//! queue, and the reconnect counter. It is destroyed and recreated
//! wholesale on hard failure or role override, never partially mutated
//! across a role flip.
//!
//! Ordering rule: the relay may reorder or redeliver envelopes, but WebRTC
//! requires the remote description to be applied before any of its
//! candidates. Candidates arriving early are queued and drained, in
//! original arrival order, immediately after the remote description lands.

use super::{
    reconnect_backoff, DescState, DescriptionKind, Phase, SessionAction, SessionEvent,
    SessionStatus,
};
use crate::core::config::RECONNECT_MAX_ATTEMPTS;
use crate::core::rendezvous::Role;
use crate::core::signaling::{SignalEnvelope, SignalKind};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

pub struct NegotiationSession {
    self_id: String,
    role: Role,
    phase: Phase,
    local_desc: DescState,
    remote_desc: DescState,
    /// Remote candidates waiting for the remote description, arrival order.
    pending_remote_candidates: VecDeque<String>,
    /// Content of the last applied remote descriptions, for duplicate
    /// rejection (relay redelivery must not trigger renegotiation).
    last_remote_offer: Option<String>,
    last_remote_answer: Option<String>,
    reconnect_attempts: u32,
    /// Set when the next retry must run on a fresh transport (stall path).
    needs_fresh_link: bool,
    /// Candidates accepted for processing (queued or applied).
    candidates_seen: usize,
}

impl NegotiationSession {
    /// `role` must be an active role; callers never build a session while
    /// still waiting for a peer.
    pub fn new(self_id: &str, role: Role) -> Self {
        debug_assert!(role.is_active());
        Self {
            self_id: self_id.to_string(),
            role,
            phase: Phase::New,
            local_desc: DescState::Idle,
            remote_desc: DescState::Idle,
            pending_remote_candidates: VecDeque::new(),
            last_remote_offer: None,
            last_remote_answer: None,
            reconnect_attempts: 0,
            needs_fresh_link: false,
            candidates_seen: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn role(&self) -> Role {
        self.role
    }

    #[cfg(test)]
    pub(crate) fn candidates_seen(&self) -> usize {
        self.candidates_seen
    }

    #[cfg(test)]
    pub(crate) fn pending_candidates(&self) -> usize {
        self.pending_remote_candidates.len()
    }

    /// Advance the machine by one event, returning the side-effects the
    /// driver must execute.
    pub fn handle(&mut self, event: SessionEvent) -> Vec<SessionAction> {
        if self.phase == Phase::Closed {
            debug!(event = "session_event_after_close", ?event);
            return Vec::new();
        }
        match event {
            SessionEvent::Start => self.on_start(),
            SessionEvent::Envelope(env) => self.on_envelope(env),
            SessionEvent::LocalDescriptionReady { kind, sdp } => self.on_local_ready(kind, sdp),
            SessionEvent::RemoteDescriptionApplied { kind } => self.on_remote_applied(kind),
            SessionEvent::TransportConnected => self.on_connected("transport"),
            SessionEvent::ChannelOpen { label } => {
                // Observed skew: a data channel can open before (or instead
                // of) the transport-level connected event. Either one is
                // authoritative.
                self.on_connected(&format!("channel:{label}"))
            }
            SessionEvent::TransportDisconnected => {
                warn!(event = "transport_disconnected", "Transient disconnect (ICE may recover)");
                Vec::new()
            }
            SessionEvent::TransportFailed => self.on_failure("transport failed", false),
            SessionEvent::StallTimeout => self.on_stall(),
            SessionEvent::TransportClosed => self.on_closed(),
            SessionEvent::RetryDue => self.on_retry_due(),
        }
    }

    // ── Start / descriptions ─────────────────────────────────────────────

    fn on_start(&mut self) -> Vec<SessionAction> {
        self.phase = Phase::Negotiating { ice_restart: false };
        match self.role {
            Role::Initiator => {
                self.local_desc = DescState::Pending;
                vec![
                    SessionAction::CreateOffer { ice_restart: false },
                    SessionAction::ScheduleStallTimeout,
                ]
            }
            // The receiver arms the stall timer and waits for the offer.
            _ => vec![SessionAction::ScheduleStallTimeout],
        }
    }

    fn on_local_ready(&mut self, kind: DescriptionKind, sdp: String) -> Vec<SessionAction> {
        self.local_desc = DescState::Set;
        let signal = match kind {
            DescriptionKind::Offer => SignalKind::Offer(sdp),
            DescriptionKind::Answer => SignalKind::Answer(sdp),
        };
        vec![SessionAction::ShipSignal(signal)]
    }

    fn on_remote_applied(&mut self, kind: DescriptionKind) -> Vec<SessionAction> {
        self.remote_desc = DescState::Set;
        let mut actions = Vec::new();

        // Drain queued candidates now that the transport can accept them.
        if !self.pending_remote_candidates.is_empty() {
            let drained: Vec<String> = self.pending_remote_candidates.drain(..).collect();
            debug!(event = "candidate_queue_drained", count = drained.len());
            actions.push(SessionAction::ApplyCandidates(drained));
        }

        if kind == DescriptionKind::Offer {
            self.local_desc = DescState::Pending;
            actions.push(SessionAction::CreateAnswer);
        }
        actions
    }

    // ── Envelopes ────────────────────────────────────────────────────────

    fn on_envelope(&mut self, env: SignalEnvelope) -> Vec<SessionAction> {
        // Relay echo defense: unconditionally discard our own envelopes
        // before touching any state.
        if env.from == self.self_id {
            debug!(event = "self_signal_dropped", kind = env.kind.name());
            return Vec::new();
        }

        match env.kind {
            SignalKind::Offer(sdp) => self.on_remote_offer(sdp),
            SignalKind::Answer(sdp) => self.on_remote_answer(sdp),
            SignalKind::Candidate(candidate) => self.on_remote_candidate(candidate),
        }
    }

    fn on_remote_offer(&mut self, sdp: String) -> Vec<SessionAction> {
        if self.role == Role::Initiator {
            // Role resolution guarantees a single offerer; an offer here
            // means a stale or confused peer, not a negotiation we joined.
            warn!(event = "offer_while_initiator", "Ignoring offer received in initiator role");
            return Vec::new();
        }
        if self.last_remote_offer.as_deref() == Some(sdp.as_str()) {
            debug!(event = "duplicate_offer_ignored");
            return Vec::new();
        }
        if self.remote_desc == DescState::Pending {
            debug!(event = "offer_while_applying", "Offer ignored, a remote description is mid-apply");
            return Vec::new();
        }

        // A different offer while connected/failed is the initiator's
        // ICE-restart; a first offer is plain negotiation.
        let restart = matches!(self.phase, Phase::Connected | Phase::Failed);
        self.phase = Phase::Negotiating {
            ice_restart: restart,
        };
        self.last_remote_offer = Some(sdp.clone());
        self.remote_desc = DescState::Pending;
        vec![
            SessionAction::ApplyRemoteDescription {
                kind: DescriptionKind::Offer,
                sdp,
            },
            SessionAction::ScheduleStallTimeout,
        ]
    }

    fn on_remote_answer(&mut self, sdp: String) -> Vec<SessionAction> {
        if self.role != Role::Initiator {
            warn!(event = "answer_while_receiver", "Ignoring answer received in receiver role");
            return Vec::new();
        }
        if self.last_remote_answer.as_deref() == Some(sdp.as_str()) {
            debug!(event = "duplicate_answer_ignored");
            return Vec::new();
        }
        if self.local_desc != DescState::Set {
            // An answer cannot be applied before our own offer is in place;
            // the stall-timeout re-offer path recovers if this was real.
            warn!(event = "answer_before_offer", "Answer arrived before local offer was set");
            return Vec::new();
        }
        if self.remote_desc == DescState::Set && !self.restart_in_progress() {
            debug!(event = "stale_answer_ignored");
            return Vec::new();
        }

        self.last_remote_answer = Some(sdp.clone());
        self.remote_desc = DescState::Pending;
        vec![SessionAction::ApplyRemoteDescription {
            kind: DescriptionKind::Answer,
            sdp,
        }]
    }

    fn on_remote_candidate(&mut self, candidate: String) -> Vec<SessionAction> {
        self.candidates_seen += 1;
        if self.remote_desc == DescState::Set {
            vec![SessionAction::ApplyCandidates(vec![candidate])]
        } else {
            self.pending_remote_candidates.push_back(candidate);
            debug!(
                event = "candidate_queued",
                queued = self.pending_remote_candidates.len()
            );
            Vec::new()
        }
    }

    fn restart_in_progress(&self) -> bool {
        matches!(self.phase, Phase::Negotiating { ice_restart: true })
    }

    // ── Connectivity ─────────────────────────────────────────────────────

    fn on_connected(&mut self, source: &str) -> Vec<SessionAction> {
        if self.phase == Phase::Connected {
            return Vec::new();
        }
        info!(event = "session_connected", source, "Peer connection established");
        self.phase = Phase::Connected;
        self.reconnect_attempts = 0;
        self.needs_fresh_link = false;
        vec![SessionAction::EmitStatus(SessionStatus::Connected)]
    }

    fn on_stall(&mut self) -> Vec<SessionAction> {
        // The timer is only meaningful while a negotiation is in flight.
        if !matches!(self.phase, Phase::Negotiating { .. }) {
            return Vec::new();
        }
        warn!(event = "negotiation_stalled", "No connected signal within the stall window");
        // A stalled exchange gets a full teardown + rebuild, not just an
        // ICE restart: the transport may be wedged beyond candidate repair.
        self.on_failure("negotiation stalled", true)
    }

    fn on_failure(&mut self, reason: &str, fresh_link: bool) -> Vec<SessionAction> {
        if self.reconnect_attempts >= RECONNECT_MAX_ATTEMPTS {
            warn!(
                event = "session_terminal",
                reason, attempts = self.reconnect_attempts, "Reconnect attempts exhausted"
            );
            self.phase = Phase::Closed;
            return vec![SessionAction::EmitStatus(SessionStatus::Terminal {
                reason: format!("{reason} after {} attempts", self.reconnect_attempts),
            })];
        }

        self.reconnect_attempts += 1;
        self.needs_fresh_link = self.needs_fresh_link || fresh_link;
        self.phase = Phase::Failed;
        // Negotiation state is rebuilt from scratch on the retry.
        self.local_desc = DescState::Idle;
        self.remote_desc = DescState::Idle;
        self.pending_remote_candidates.clear();
        self.last_remote_offer = None;
        self.last_remote_answer = None;

        let delay = reconnect_backoff(self.reconnect_attempts);
        info!(
            event = "reconnect_scheduled",
            reason,
            attempt = self.reconnect_attempts,
            delay_ms = delay.as_millis() as u64
        );
        let mut actions = Vec::new();
        if self.needs_fresh_link {
            actions.push(SessionAction::ResetLink);
        }
        actions.push(SessionAction::EmitStatus(SessionStatus::Reconnecting {
            attempt: self.reconnect_attempts,
            delay,
        }));
        actions.push(SessionAction::ScheduleRetry { delay });
        actions
    }

    fn on_retry_due(&mut self) -> Vec<SessionAction> {
        if self.phase != Phase::Failed {
            return Vec::new();
        }
        let fresh = std::mem::take(&mut self.needs_fresh_link);
        self.phase = Phase::Negotiating { ice_restart: true };
        match self.role {
            Role::Initiator => {
                self.local_desc = DescState::Pending;
                vec![
                    SessionAction::CreateOffer {
                        // A fresh link negotiates from scratch; an intact
                        // one gets an ICE-restart offer.
                        ice_restart: !fresh,
                    },
                    SessionAction::ScheduleStallTimeout,
                ]
            }
            // Only the original initiator re-offers; the receiver re-arms
            // its stall timer and waits for the restart offer.
            _ => vec![SessionAction::ScheduleStallTimeout],
        }
    }

    fn on_closed(&mut self) -> Vec<SessionAction> {
        info!(event = "session_closed", "Peer connection closed");
        self.phase = Phase::Closed;
        vec![SessionAction::EmitStatus(SessionStatus::Closed)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{RECONNECT_BACKOFF_CAP, RECONNECT_MAX_ATTEMPTS};

    fn envelope(kind: SignalKind, from: &str) -> SessionEvent {
        SessionEvent::Envelope(SignalEnvelope {
            kind,
            from: from.to_string(),
            to: None,
        })
    }

    fn receiver() -> NegotiationSession {
        NegotiationSession::new("alice", Role::Receiver)
    }

    fn initiator() -> NegotiationSession {
        NegotiationSession::new("bob", Role::Initiator)
    }

    #[test]
    fn initiator_start_creates_offer() {
        let mut s = initiator();
        let actions = s.handle(SessionEvent::Start);
        assert!(actions.contains(&SessionAction::CreateOffer { ice_restart: false }));
        assert_eq!(s.phase(), Phase::Negotiating { ice_restart: false });
    }

    #[test]
    fn candidates_buffer_until_remote_description_then_drain_in_order() {
        let mut s = receiver();
        s.handle(SessionEvent::Start);

        // Relay delivered two candidates ahead of the offer.
        assert!(s
            .handle(envelope(SignalKind::Candidate("c1".into()), "bob"))
            .is_empty());
        assert!(s
            .handle(envelope(SignalKind::Candidate("c2".into()), "bob"))
            .is_empty());
        assert_eq!(s.pending_candidates(), 2);

        let actions = s.handle(envelope(SignalKind::Offer("offer-sdp".into()), "bob"));
        assert!(matches!(
            actions[0],
            SessionAction::ApplyRemoteDescription {
                kind: DescriptionKind::Offer,
                ..
            }
        ));

        // Queue drains only once the transport reports the description set,
        // strictly after the offer and in arrival order.
        let actions = s.handle(SessionEvent::RemoteDescriptionApplied {
            kind: DescriptionKind::Offer,
        });
        assert_eq!(
            actions[0],
            SessionAction::ApplyCandidates(vec!["c1".into(), "c2".into()])
        );
        assert_eq!(actions[1], SessionAction::CreateAnswer);
        assert_eq!(s.pending_candidates(), 0);

        // Late candidate applies immediately, exactly once.
        let actions = s.handle(envelope(SignalKind::Candidate("c3".into()), "bob"));
        assert_eq!(actions, vec![SessionAction::ApplyCandidates(vec!["c3".into()])]);
        assert_eq!(s.candidates_seen(), 3);
    }

    #[test]
    fn self_echoed_envelopes_mutate_nothing() {
        let mut s = receiver();
        s.handle(SessionEvent::Start);

        let before = (s.candidates_seen(), s.pending_candidates(), s.phase());
        assert!(s
            .handle(envelope(SignalKind::Candidate("c1".into()), "alice"))
            .is_empty());
        assert!(s
            .handle(envelope(SignalKind::Offer("sdp".into()), "alice"))
            .is_empty());
        assert_eq!(
            before,
            (s.candidates_seen(), s.pending_candidates(), s.phase())
        );
    }

    #[test]
    fn duplicate_offer_yields_a_single_answer() {
        let mut s = receiver();
        s.handle(SessionEvent::Start);

        let mut answers = 0;
        for _ in 0..2 {
            let actions = s.handle(envelope(SignalKind::Offer("same-sdp".into()), "bob"));
            if actions
                .iter()
                .any(|a| matches!(a, SessionAction::ApplyRemoteDescription { .. }))
            {
                let follow = s.handle(SessionEvent::RemoteDescriptionApplied {
                    kind: DescriptionKind::Offer,
                });
                answers += follow
                    .iter()
                    .filter(|a| **a == SessionAction::CreateAnswer)
                    .count();
            }
        }
        assert_eq!(answers, 1);
    }

    #[test]
    fn backoff_is_bounded_and_sixth_attempt_never_scheduled() {
        let mut s = initiator();
        s.handle(SessionEvent::Start);
        s.handle(SessionEvent::LocalDescriptionReady {
            kind: DescriptionKind::Offer,
            sdp: "o".into(),
        });
        s.handle(envelope(SignalKind::Answer("a".into()), "alice"));
        s.handle(SessionEvent::RemoteDescriptionApplied {
            kind: DescriptionKind::Answer,
        });
        s.handle(SessionEvent::TransportConnected);

        let mut last_delay = std::time::Duration::ZERO;
        for attempt in 1..=RECONNECT_MAX_ATTEMPTS {
            let actions = s.handle(SessionEvent::TransportFailed);
            let delay = actions
                .iter()
                .find_map(|a| match a {
                    SessionAction::ScheduleRetry { delay } => Some(*delay),
                    _ => None,
                })
                .unwrap_or_else(|| panic!("attempt {attempt} scheduled no retry"));
            assert!(delay >= last_delay);
            assert!(delay <= RECONNECT_BACKOFF_CAP);
            last_delay = delay;
            s.handle(SessionEvent::RetryDue);
        }

        // Sixth failure: terminal, no retry scheduled.
        let actions = s.handle(SessionEvent::TransportFailed);
        assert!(!actions
            .iter()
            .any(|a| matches!(a, SessionAction::ScheduleRetry { .. })));
        assert!(actions
            .iter()
            .any(|a| matches!(a, SessionAction::EmitStatus(SessionStatus::Terminal { .. }))));
        assert_eq!(s.phase(), Phase::Closed);
    }

    #[test]
    fn only_the_initiator_reoffers_after_failure() {
        let mut s = receiver();
        s.handle(SessionEvent::Start);
        s.handle(SessionEvent::TransportFailed);
        let actions = s.handle(SessionEvent::RetryDue);
        assert!(!actions
            .iter()
            .any(|a| matches!(a, SessionAction::CreateOffer { .. })));
        assert_eq!(actions, vec![SessionAction::ScheduleStallTimeout]);
    }

    #[test]
    fn channel_open_is_an_authoritative_connected_signal() {
        let mut s = initiator();
        s.handle(SessionEvent::Start);
        let actions = s.handle(SessionEvent::ChannelOpen {
            label: "chat".into(),
        });
        assert!(actions.contains(&SessionAction::EmitStatus(SessionStatus::Connected)));
        assert_eq!(s.phase(), Phase::Connected);

        // The late transport event is a no-op.
        assert!(s.handle(SessionEvent::TransportConnected).is_empty());
    }

    #[test]
    fn stall_resets_the_link_before_retrying() {
        let mut s = initiator();
        s.handle(SessionEvent::Start);
        let actions = s.handle(SessionEvent::StallTimeout);
        assert_eq!(actions[0], SessionAction::ResetLink);
        // The rebuilt link negotiates from scratch rather than restarting ICE.
        let retry = s.handle(SessionEvent::RetryDue);
        assert!(retry.contains(&SessionAction::CreateOffer { ice_restart: false }));
    }

    #[test]
    fn transport_failure_retries_with_ice_restart() {
        let mut s = initiator();
        s.handle(SessionEvent::Start);
        s.handle(SessionEvent::ChannelOpen {
            label: "chat".into(),
        });
        s.handle(SessionEvent::TransportFailed);
        let retry = s.handle(SessionEvent::RetryDue);
        assert!(retry.contains(&SessionAction::CreateOffer { ice_restart: true }));
    }

    #[test]
    fn stale_answer_after_stable_is_ignored() {
        let mut s = initiator();
        s.handle(SessionEvent::Start);
        s.handle(SessionEvent::LocalDescriptionReady {
            kind: DescriptionKind::Offer,
            sdp: "o".into(),
        });
        s.handle(envelope(SignalKind::Answer("a1".into()), "alice"));
        s.handle(SessionEvent::RemoteDescriptionApplied {
            kind: DescriptionKind::Answer,
        });
        // Redelivered duplicate and a stray different answer: both ignored.
        assert!(s.handle(envelope(SignalKind::Answer("a1".into()), "alice")).is_empty());
        assert!(s.handle(envelope(SignalKind::Answer("a2".into()), "alice")).is_empty());
    }

    #[test]
    fn closed_session_ignores_everything() {
        let mut s = initiator();
        s.handle(SessionEvent::Start);
        s.handle(SessionEvent::TransportClosed);
        assert_eq!(s.phase(), Phase::Closed);
        assert!(s.handle(SessionEvent::Start).is_empty());
        assert!(s
            .handle(envelope(SignalKind::Offer("sdp".into()), "bob"))
            .is_empty());
    }
}
