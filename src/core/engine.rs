//! Engine: sole coordinator of rendezvous, negotiation, and transfer.
//!
//! One engine task owns every piece of mutable protocol state (the
//! negotiation session, the peer link, channel handles, timers, transfer
//! bookkeeping) and advances it exclusively from its own select loop.
//! Relay events, link events, commands, and timer firings all funnel into
//! this loop; slow link operations (offer/answer creation) run in spawned
//! tasks that feed their results back in as events, so no arm ever blocks
//! the loop.
//!
//! **Architecture rule**: no negotiation or transfer logic may exist
//! outside `core`. The front-end sends commands and renders events.

use crate::core::channel::{ChannelEvent, MessageChannel};
use crate::core::config::{
    CHAT_CHANNEL_LABEL, FILE_CHANNEL_LABEL, NEGOTIATION_STALL_TIMEOUT, PROBE_TIMEOUT,
};
use crate::core::negotiation::link::{LinkEvent, LinkState, PeerLink, PeerLinkFactory};
use crate::core::negotiation::session::NegotiationSession;
use crate::core::negotiation::{DescriptionKind, SessionAction, SessionEvent, SessionStatus};
use crate::core::rendezvous::{resolve, Role};
use crate::core::signaling::{RelayEvent, SignalEnvelope, SignalKind, Signaling};
use crate::core::transfer::receiver::TransferReceiver;
use crate::core::transfer::{sender, ChatFrame, TransferEvent};
use crate::utils::sos::SignalOfStop;
use anyhow::Result;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};

// ── Commands & events ────────────────────────────────────────────────────────

/// Commands from the front-end.
#[derive(Debug, Clone)]
pub enum EngineCommand {
    Join {
        room: String,
    },
    SendFile {
        name: String,
        mime_type: String,
        data: Bytes,
    },
    SendChat {
        content: String,
    },
    /// Manual escape hatch: discard the session and negotiate again as
    /// the forced initiator.
    ForceInitiator,
    Leave,
}

/// Events to the front-end.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    RoomJoined {
        members: Vec<String>,
    },
    RoomFull,
    PeerJoined {
        identity: String,
    },
    PeerLeft {
        identity: String,
    },
    RoleAssigned(Role),
    PeerConnected {
        identity: String,
        /// `IP:port` of the selected candidate pair, when the transport
        /// exposes it. Informational only.
        endpoint: Option<String>,
    },
    PeerDisconnected,
    Reconnecting {
        attempt: u32,
    },
    /// Retries exhausted; `ForceInitiator` is the only escape.
    TerminalError {
        reason: String,
    },
    IdentityLost {
        new_identity: String,
    },
    RelayDisconnected,
    Chat {
        content: String,
        sender: String,
        timestamp: String,
    },
    PeerDisplayName {
        name: String,
    },
    Transfer(TransferEvent),
}

/// Loop-internal feedback (results of spawned link operations, deferred
/// rendezvous restarts).
enum InternalEvent {
    Session(SessionEvent),
    Rendezvous,
}

/// Handle returned by [`Engine::spawn`].
pub struct EngineHandle {
    pub commands: mpsc::UnboundedSender<EngineCommand>,
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct Engine {
    signaling: Arc<dyn Signaling>,
    link_factory: Arc<dyn PeerLinkFactory>,
    display_name: Option<String>,
    sos: SignalOfStop,

    events_out: mpsc::UnboundedSender<EngineEvent>,
    cmd_rx: mpsc::UnboundedReceiver<EngineCommand>,
    relay_rx: mpsc::UnboundedReceiver<RelayEvent>,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    internal_rx: mpsc::UnboundedReceiver<InternalEvent>,
    transfer_tx: mpsc::UnboundedSender<TransferEvent>,
    transfer_rx: mpsc::UnboundedReceiver<TransferEvent>,

    members: Vec<String>,
    remote_peer: Option<String>,
    force_initiator: bool,

    session: Option<NegotiationSession>,
    link: Option<Arc<dyn PeerLink>>,
    link_rx: Option<mpsc::UnboundedReceiver<LinkEvent>>,

    stall_deadline: Option<tokio::time::Instant>,
    retry_deadline: Option<tokio::time::Instant>,

    channels: HashMap<String, Arc<dyn MessageChannel>>,
    file_receiver: TransferReceiver,
    send_in_flight: bool,
    probe_ack: Arc<Notify>,
}

impl Engine {
    pub fn spawn(
        signaling: Arc<dyn Signaling>,
        relay_rx: mpsc::UnboundedReceiver<RelayEvent>,
        link_factory: Arc<dyn PeerLinkFactory>,
        display_name: Option<String>,
        sos: SignalOfStop,
    ) -> EngineHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events_out, events) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (transfer_tx, transfer_rx) = mpsc::unbounded_channel();

        let engine = Self {
            signaling,
            link_factory,
            display_name,
            sos,
            events_out,
            cmd_rx,
            relay_rx,
            internal_tx,
            internal_rx,
            file_receiver: TransferReceiver::new(transfer_tx.clone()),
            transfer_tx,
            transfer_rx,
            members: Vec::new(),
            remote_peer: None,
            force_initiator: false,
            session: None,
            link: None,
            link_rx: None,
            stall_deadline: None,
            retry_deadline: None,
            channels: HashMap::new(),
            send_in_flight: false,
            probe_ack: Arc::new(Notify::new()),
        };
        tokio::spawn(engine.run());

        EngineHandle {
            commands: cmd_tx,
            events,
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events_out.send(event);
    }

    fn identity(&self) -> String {
        self.signaling.identity()
    }

    // ── Main loop ────────────────────────────────────────────────────────

    async fn run(mut self) {
        // Far-future placeholder so disabled timer arms stay inert.
        let idle = || tokio::time::Instant::now() + Duration::from_secs(86_400);
        loop {
            let stall_at = self.stall_deadline.unwrap_or_else(idle);
            let retry_at = self.retry_deadline.unwrap_or_else(idle);
            tokio::select! {
                _ = self.sos.wait() => {
                    self.teardown_session("shutting down").await;
                    self.signaling.leave().await;
                    return;
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    None => {
                        self.teardown_session("command channel closed").await;
                        return;
                    }
                    Some(cmd) => self.on_command(cmd).await,
                },
                ev = self.relay_rx.recv() => match ev {
                    None => return,
                    Some(ev) => self.on_relay_event(ev).await,
                },
                ev = recv_link(&mut self.link_rx) => self.on_link_event(ev).await,
                ev = self.internal_rx.recv() => match ev {
                    None => return,
                    Some(InternalEvent::Session(ev)) => self.dispatch(ev).await,
                    Some(InternalEvent::Rendezvous) => self.maybe_start_session().await,
                },
                ev = self.transfer_rx.recv() => {
                    if let Some(ev) = ev {
                        self.on_transfer_event(ev);
                    }
                }
                _ = tokio::time::sleep_until(stall_at), if self.stall_deadline.is_some() => {
                    self.stall_deadline = None;
                    self.dispatch(SessionEvent::StallTimeout).await;
                }
                _ = tokio::time::sleep_until(retry_at), if self.retry_deadline.is_some() => {
                    self.retry_deadline = None;
                    self.dispatch(SessionEvent::RetryDue).await;
                }
            }
        }
    }

    // ── Commands ─────────────────────────────────────────────────────────

    async fn on_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Join { room } => {
                info!(event = "room_join", room = %room);
                if let Err(e) = self.signaling.join(&room).await {
                    warn!(event = "room_join_failed", error = %e);
                }
            }
            EngineCommand::SendChat { content } => self.send_chat(content).await,
            EngineCommand::SendFile {
                name,
                mime_type,
                data,
            } => self.start_send(name, mime_type, data),
            EngineCommand::ForceInitiator => {
                info!(event = "force_initiator", "Manual initiator override");
                self.teardown_session("manual initiator override").await;
                self.force_initiator = true;
                self.maybe_start_session().await;
            }
            EngineCommand::Leave => {
                self.teardown_session("left room").await;
                self.members.clear();
                self.remote_peer = None;
                self.signaling.leave().await;
            }
        }
    }

    async fn send_chat(&mut self, content: String) {
        let Some(chat) = self.channels.get(CHAT_CHANNEL_LABEL).cloned() else {
            warn!(event = "chat_not_open", "Chat channel not open, message dropped");
            return;
        };
        let frame = ChatFrame::Chat {
            content,
            sender_identity: self.identity(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        match serde_json::to_string(&frame) {
            Ok(json) => {
                if let Err(e) = chat.send_text(json).await {
                    warn!(event = "chat_send_failed", error = %e);
                }
            }
            Err(e) => warn!(event = "chat_encode_failed", error = %e),
        }
    }

    /// Start a file send in a worker task. A single transfer per channel:
    /// a second request is rejected rather than interleaved.
    fn start_send(&mut self, name: String, mime_type: String, data: Bytes) {
        if self.send_in_flight {
            warn!(event = "send_rejected", name = %name, "A transfer is already in flight");
            let _ = self.transfer_tx.send(TransferEvent::SendRejected { name });
            return;
        }
        let Some(file) = self.channels.get(FILE_CHANNEL_LABEL).cloned() else {
            let _ = self.transfer_tx.send(TransferEvent::SendFailed {
                name,
                reason: "file-transfer channel not open".into(),
            });
            return;
        };

        self.send_in_flight = true;
        let chat = self.channels.get(CHAT_CHANNEL_LABEL).cloned();
        let events = self.transfer_tx.clone();
        let probe_ack = self.probe_ack.clone();
        tokio::spawn(async move {
            // Cheap liveness probe before committing megabytes to a peer
            // that may have silently gone away.
            if let Some(chat) = chat {
                if let Ok(json) = serde_json::to_string(&ChatFrame::Probe) {
                    if chat.send_text(json).await.is_ok()
                        && timeout(PROBE_TIMEOUT, probe_ack.notified()).await.is_err()
                    {
                        warn!(event = "probe_timeout", "Peer did not acknowledge probe");
                        let _ = events.send(TransferEvent::SendFailed {
                            name,
                            reason: "peer not responding to liveness probe".into(),
                        });
                        return;
                    }
                }
            }
            if let Err(e) = sender::send_blob(&file, &name, &mime_type, data, &events).await {
                warn!(event = "file_send_failed", name = %name, error = %e);
                let _ = events.send(TransferEvent::SendFailed {
                    name,
                    reason: e.to_string(),
                });
            }
        });
    }

    fn on_transfer_event(&mut self, event: TransferEvent) {
        if matches!(
            event,
            TransferEvent::SendComplete { .. } | TransferEvent::SendFailed { .. }
        ) {
            self.send_in_flight = false;
        }
        self.emit(EngineEvent::Transfer(event));
    }

    // ── Relay events ─────────────────────────────────────────────────────

    async fn on_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Joined { members, .. } => {
                self.members = members;
                self.emit(EngineEvent::RoomJoined {
                    members: self.members.clone(),
                });
                self.maybe_start_session().await;
            }
            RelayEvent::PeerJoined { identity } => {
                if identity != self.identity() && !self.members.contains(&identity) {
                    self.members.push(identity.clone());
                }
                self.emit(EngineEvent::PeerJoined { identity });
                self.maybe_start_session().await;
            }
            RelayEvent::PeerLeft { identity } => {
                self.members.retain(|m| *m != identity);
                if self.remote_peer.as_deref() == Some(identity.as_str()) {
                    self.remote_peer = None;
                }
                self.emit(EngineEvent::PeerLeft { identity });
                // Mid-negotiation resumption is not attempted; the whole
                // rendezvous restarts when a peer joins again.
                self.teardown_session("peer left").await;
            }
            RelayEvent::Signal(envelope) => self.on_signal(envelope).await,
            RelayEvent::RoomFull => {
                warn!(event = "room_full", "Room already has two members");
                self.emit(EngineEvent::RoomFull);
            }
            RelayEvent::IdentityLost { new_identity } => {
                self.teardown_session("relay identity lost").await;
                self.members.clear();
                self.remote_peer = None;
                self.emit(EngineEvent::IdentityLost { new_identity });
            }
            RelayEvent::Disconnected => {
                // Advisory: an established peer session keeps running; a
                // completed negotiation resumes without a fresh dance.
                debug!(
                    event = "relay_down",
                    session_phase = ?self.session.as_ref().map(|s| s.phase())
                );
                self.emit(EngineEvent::RelayDisconnected);
            }
            RelayEvent::HeartbeatRtt(rtt) => {
                debug!(event = "relay_rtt", rtt_ms = rtt.as_millis() as u64);
            }
        }
    }

    async fn on_signal(&mut self, envelope: SignalEnvelope) {
        let me = self.identity();
        // Relay echo defense, before any state is touched.
        if envelope.from == me {
            debug!(event = "self_signal_dropped", kind = envelope.kind.name());
            return;
        }
        if let Some(to) = &envelope.to {
            if *to != me {
                debug!(event = "misaddressed_signal_dropped", to = %to);
                return;
            }
        }
        if self.remote_peer.is_none() {
            self.remote_peer = Some(envelope.from.clone());
        }

        if self.session.is_none() {
            match envelope.kind {
                // A signal racing ahead of the membership snapshot:
                // negotiate as receiver; someone out there is offering.
                SignalKind::Offer(_) | SignalKind::Candidate(_) => {
                    info!(
                        event = "session_from_signal",
                        kind = envelope.kind.name(),
                        "Signal before membership settled; starting receiver session"
                    );
                    self.start_session(Role::Receiver).await;
                }
                SignalKind::Answer(_) => {
                    debug!(event = "stray_answer_dropped", "Answer with no active session");
                    return;
                }
            }
        }
        self.dispatch(SessionEvent::Envelope(envelope)).await;
    }

    // ── Session lifecycle ────────────────────────────────────────────────

    async fn maybe_start_session(&mut self) {
        if self.session.is_some() {
            return;
        }
        let me = self.identity();
        let role = resolve(&me, &self.members, self.force_initiator);
        self.emit(EngineEvent::RoleAssigned(role));
        if !role.is_active() {
            return;
        }
        self.force_initiator = false;
        if let Some(other) = self.members.iter().find(|m| **m != me).cloned() {
            self.remote_peer = Some(other);
        }
        self.start_session(role).await;
    }

    async fn start_session(&mut self, role: Role) {
        info!(event = "session_start", role = ?role);
        let mut session = NegotiationSession::new(&self.identity(), role);
        let actions = session.handle(SessionEvent::Start);
        self.session = Some(session);
        self.execute(actions).await;
    }

    async fn dispatch(&mut self, event: SessionEvent) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let actions = session.handle(event);
        self.execute(actions).await;
    }

    async fn teardown_session(&mut self, reason: &str) {
        if self.session.is_some() {
            info!(event = "session_teardown", reason);
        }
        self.session = None;
        self.close_link().await;
        self.stall_deadline = None;
        self.retry_deadline = None;
        self.channels.clear();
        self.file_receiver.abort(reason);
        self.send_in_flight = false;
    }

    async fn close_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.close().await;
        }
        self.link_rx = None;
    }

    async fn ensure_link(&mut self) -> Result<Arc<dyn PeerLink>> {
        if let Some(link) = &self.link {
            return Ok(link.clone());
        }
        let role = self
            .session
            .as_ref()
            .map(|s| s.role())
            .unwrap_or(Role::Receiver);
        let (tx, rx) = mpsc::unbounded_channel();
        let link = self.link_factory.create(role, tx).await?;
        self.link = Some(link.clone());
        self.link_rx = Some(rx);
        Ok(link)
    }

    // ── Action execution ─────────────────────────────────────────────────

    async fn execute(&mut self, actions: Vec<SessionAction>) {
        for action in actions {
            match action {
                SessionAction::CreateOffer { ice_restart } => {
                    self.spawn_description(DescriptionKind::Offer, ice_restart)
                        .await;
                }
                SessionAction::CreateAnswer => {
                    self.spawn_description(DescriptionKind::Answer, false).await;
                }
                SessionAction::ApplyRemoteDescription { kind, sdp } => {
                    let link = match self.ensure_link().await {
                        Ok(link) => link,
                        Err(e) => {
                            warn!(event = "link_create_failed", error = %e);
                            let _ = self
                                .internal_tx
                                .send(InternalEvent::Session(SessionEvent::TransportFailed));
                            continue;
                        }
                    };
                    match link.apply_remote_description(kind, sdp).await {
                        Ok(()) => {
                            let _ = self.internal_tx.send(InternalEvent::Session(
                                SessionEvent::RemoteDescriptionApplied { kind },
                            ));
                        }
                        Err(e) => {
                            warn!(event = "remote_description_failed", error = %e);
                            let _ = self
                                .internal_tx
                                .send(InternalEvent::Session(SessionEvent::TransportFailed));
                        }
                    }
                }
                SessionAction::ApplyCandidates(candidates) => {
                    let Some(link) = self.link.clone() else {
                        continue;
                    };
                    for candidate in candidates {
                        // A single malformed candidate is logged and
                        // skipped; it does not advance the state machine.
                        if let Err(e) = link.add_remote_candidate(candidate).await {
                            warn!(event = "candidate_apply_failed", error = %e, "Skipping bad candidate");
                        }
                    }
                }
                SessionAction::ShipSignal(kind) => {
                    let envelope = SignalEnvelope {
                        kind,
                        from: self.identity(),
                        to: self.remote_peer.clone(),
                    };
                    if let Err(e) = self.signaling.send(envelope, self.remote_peer.clone()).await {
                        warn!(event = "signal_ship_failed", error = %e);
                    }
                }
                SessionAction::ResetLink => self.close_link().await,
                SessionAction::ScheduleStallTimeout => {
                    self.stall_deadline =
                        Some(tokio::time::Instant::now() + NEGOTIATION_STALL_TIMEOUT);
                }
                SessionAction::ScheduleRetry { delay } => {
                    self.retry_deadline = Some(tokio::time::Instant::now() + delay);
                }
                SessionAction::EmitStatus(status) => self.on_status(status).await,
            }
        }
    }

    /// Create a local offer/answer off-loop; gathering can take seconds.
    async fn spawn_description(&mut self, kind: DescriptionKind, ice_restart: bool) {
        let link = match self.ensure_link().await {
            Ok(link) => link,
            Err(e) => {
                warn!(event = "link_create_failed", error = %e);
                let _ = self
                    .internal_tx
                    .send(InternalEvent::Session(SessionEvent::TransportFailed));
                return;
            }
        };
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = match kind {
                DescriptionKind::Offer => link.create_offer(ice_restart).await,
                DescriptionKind::Answer => link.create_answer().await,
            };
            match result {
                Ok(sdp) => {
                    let _ = internal.send(InternalEvent::Session(
                        SessionEvent::LocalDescriptionReady { kind, sdp },
                    ));
                }
                Err(e) => {
                    warn!(event = "description_create_failed", error = %e);
                    let _ = internal.send(InternalEvent::Session(SessionEvent::TransportFailed));
                }
            }
        });
    }

    async fn on_status(&mut self, status: SessionStatus) {
        match status {
            SessionStatus::Connected => {
                self.stall_deadline = None;
                self.retry_deadline = None;
                let identity = self.remote_peer.clone().unwrap_or_default();
                let endpoint = match &self.link {
                    Some(link) => link.remote_address().await,
                    None => None,
                };
                self.emit(EngineEvent::PeerConnected { identity, endpoint });
            }
            SessionStatus::Reconnecting { attempt, .. } => {
                self.emit(EngineEvent::Reconnecting { attempt });
            }
            SessionStatus::Terminal { reason } => {
                self.teardown_session("terminal negotiation failure").await;
                self.emit(EngineEvent::TerminalError { reason });
            }
            SessionStatus::Closed => {
                self.teardown_session("connection closed").await;
                self.emit(EngineEvent::PeerDisconnected);
                // Restart the rendezvous from role resolution (deferred to
                // the next loop turn; we may be mid-action here).
                let _ = self.internal_tx.send(InternalEvent::Rendezvous);
            }
        }
    }

    // ── Link & channel events ────────────────────────────────────────────

    async fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::StateChanged(state) => {
                let event = match state {
                    LinkState::Connected => SessionEvent::TransportConnected,
                    LinkState::Failed => SessionEvent::TransportFailed,
                    LinkState::Disconnected => SessionEvent::TransportDisconnected,
                    LinkState::Closed => SessionEvent::TransportClosed,
                };
                self.dispatch(event).await;
            }
            LinkEvent::LocalCandidate(candidate) => {
                if self.session.is_none() {
                    return;
                }
                let envelope = SignalEnvelope {
                    kind: SignalKind::Candidate(candidate),
                    from: self.identity(),
                    to: self.remote_peer.clone(),
                };
                if let Err(e) = self.signaling.send(envelope, self.remote_peer.clone()).await {
                    debug!(event = "candidate_ship_failed", error = %e);
                }
            }
            LinkEvent::Channel { label, event } => self.on_channel_event(label, event).await,
        }
    }

    async fn on_channel_event(&mut self, label: String, event: ChannelEvent) {
        match event {
            ChannelEvent::Open => {
                if let Some(link) = &self.link {
                    if let Some(channel) = link.channel(&label) {
                        self.channels.insert(label.clone(), channel);
                    }
                }
                info!(event = "channel_open", label = %label);
                if label == CHAT_CHANNEL_LABEL {
                    self.announce_display_name().await;
                }
                self.dispatch(SessionEvent::ChannelOpen { label }).await;
            }
            ChannelEvent::Text(text) => {
                if label == FILE_CHANNEL_LABEL {
                    self.file_receiver.on_text(&text);
                } else if label == CHAT_CHANNEL_LABEL {
                    self.on_chat_text(&text).await;
                }
            }
            ChannelEvent::Binary(data) => {
                if label == FILE_CHANNEL_LABEL {
                    self.file_receiver.on_binary(data);
                } else {
                    debug!(event = "unexpected_binary", label = %label);
                }
            }
            ChannelEvent::Closed => {
                debug!(event = "channel_closed", label = %label);
                self.channels.remove(&label);
                if label == FILE_CHANNEL_LABEL {
                    self.file_receiver.abort("channel closed");
                }
            }
            ChannelEvent::Error(error) => {
                // Logged only: a channel fault does not by itself end the
                // negotiation unless connectivity collapses with it.
                warn!(event = "channel_error", label = %label, error = %error);
            }
        }
    }

    async fn on_chat_text(&mut self, text: &str) {
        match serde_json::from_str::<ChatFrame>(text) {
            Ok(ChatFrame::Chat {
                content,
                sender_identity,
                timestamp,
            }) => self.emit(EngineEvent::Chat {
                content,
                sender: sender_identity,
                timestamp,
            }),
            Ok(ChatFrame::DisplayName { name }) => {
                self.emit(EngineEvent::PeerDisplayName { name });
            }
            Ok(ChatFrame::Probe) => {
                if let Some(chat) = self.channels.get(CHAT_CHANNEL_LABEL) {
                    if let Ok(json) = serde_json::to_string(&ChatFrame::ProbeAck) {
                        let _ = chat.send_text(json).await;
                    }
                }
            }
            Ok(ChatFrame::ProbeAck) => self.probe_ack.notify_one(),
            Err(e) => {
                debug!(event = "chat_frame_unparsed", error = %e, "Dropping malformed chat frame");
            }
        }
    }

    async fn announce_display_name(&mut self) {
        let Some(name) = self.display_name.clone() else {
            return;
        };
        if let Some(chat) = self.channels.get(CHAT_CHANNEL_LABEL) {
            if let Ok(json) = serde_json::to_string(&ChatFrame::DisplayName { name }) {
                let _ = chat.send_text(json).await;
            }
        }
    }
}

/// Receive from the current link's event stream, or park when no link
/// exists (a fresh link brings a fresh stream).
async fn recv_link(rx: &mut Option<mpsc::UnboundedReceiver<LinkEvent>>) -> LinkEvent {
    match rx {
        Some(rx) => match rx.recv().await {
            Some(event) => event,
            None => futures_util::future::pending().await,
        },
        None => futures_util::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sim::{SimLinkFactory, SimNet, SimRelay};

    async fn next_matching<T>(
        rx: &mut mpsc::UnboundedReceiver<EngineEvent>,
        mut pred: impl FnMut(&EngineEvent) -> Option<T>,
    ) -> T {
        timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.expect("event stream ended");
                if let Some(out) = pred(&event) {
                    return out;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    fn spawn_client(
        relay: &Arc<SimRelay>,
        net: &Arc<SimNet>,
        identity: &str,
        display_name: Option<&str>,
    ) -> EngineHandle {
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let signaling = relay.client(identity, relay_tx);
        Engine::spawn(
            signaling,
            relay_rx,
            Arc::new(SimLinkFactory { net: net.clone() }),
            display_name.map(String::from),
            SignalOfStop::new(),
        )
    }

    #[tokio::test]
    async fn two_clients_connect_transfer_and_chat() {
        let relay = SimRelay::new();
        let net = Arc::new(SimNet::default());

        let mut alice = spawn_client(&relay, &net, "alice", Some("Alice"));
        let mut bob = spawn_client(&relay, &net, "bob", None);

        alice
            .commands
            .send(EngineCommand::Join {
                room: "1234".into(),
            })
            .unwrap();
        bob.commands
            .send(EngineCommand::Join {
                room: "1234".into(),
            })
            .unwrap();

        // "bob" sorts after "alice" (odd index): bob initiates.
        let bob_role = next_matching(&mut bob.events, |e| match e {
            EngineEvent::RoleAssigned(role) if role.is_active() => Some(*role),
            _ => None,
        })
        .await;
        assert_eq!(bob_role, Role::Initiator);
        let alice_role = next_matching(&mut alice.events, |e| match e {
            EngineEvent::RoleAssigned(role) if role.is_active() => Some(*role),
            _ => None,
        })
        .await;
        assert_eq!(alice_role, Role::Receiver);

        // Alice's display name announcement can land anywhere relative to
        // bob's own connectivity events; stash it wherever it shows up.
        let mut display_name: Option<String> = None;
        next_matching(&mut bob.events, |e| match e {
            EngineEvent::PeerDisplayName { name } => {
                display_name = Some(name.clone());
                None
            }
            EngineEvent::PeerConnected { .. } => Some(()),
            _ => None,
        })
        .await;
        next_matching(&mut alice.events, |e| {
            matches!(e, EngineEvent::PeerConnected { .. }).then_some(())
        })
        .await;

        // Bob ships a 50 KB file; alice reassembles it byte-for-byte.
        let blob: Vec<u8> = (0..50_000).map(|i| (i * 31 % 251) as u8).collect();
        bob.commands
            .send(EngineCommand::SendFile {
                name: "photo.bin".into(),
                mime_type: "application/octet-stream".into(),
                data: Bytes::from(blob.clone()),
            })
            .unwrap();

        let (data, suspect) = next_matching(&mut alice.events, |e| match e {
            EngineEvent::Transfer(TransferEvent::Received { data, suspect, .. }) => {
                Some((data.clone(), *suspect))
            }
            _ => None,
        })
        .await;
        assert_eq!(data, blob);
        assert!(!suspect);

        next_matching(&mut bob.events, |e| match e {
            EngineEvent::PeerDisplayName { name } => {
                display_name = Some(name.clone());
                None
            }
            EngineEvent::Transfer(TransferEvent::SendComplete { .. }) => Some(()),
            _ => None,
        })
        .await;

        // Alice chats back.
        alice
            .commands
            .send(EngineCommand::SendChat { content: "hi".into() })
            .unwrap();
        let (content, sender) = next_matching(&mut bob.events, |e| match e {
            EngineEvent::PeerDisplayName { name } => {
                display_name = Some(name.clone());
                None
            }
            EngineEvent::Chat {
                content, sender, ..
            } => Some((content.clone(), sender.clone())),
            _ => None,
        })
        .await;
        assert_eq!(content, "hi");
        assert_eq!(sender, "alice");

        // The announcement travels on the ordered chat channel ahead of
        // the chat message, so it must have arrived by now.
        assert_eq!(display_name.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn third_entrant_is_rejected() {
        let relay = SimRelay::new();
        let net = Arc::new(SimNet::default());

        let mut alice = spawn_client(&relay, &net, "alice", None);
        let mut bob = spawn_client(&relay, &net, "bob", None);
        let mut carol = spawn_client(&relay, &net, "carol", None);

        for client in [&alice, &bob] {
            client
                .commands
                .send(EngineCommand::Join {
                    room: "1234".into(),
                })
                .unwrap();
        }
        next_matching(&mut alice.events, |e| {
            matches!(e, EngineEvent::PeerConnected { .. }).then_some(())
        })
        .await;
        next_matching(&mut bob.events, |e| {
            matches!(e, EngineEvent::PeerConnected { .. }).then_some(())
        })
        .await;

        carol
            .commands
            .send(EngineCommand::Join {
                room: "1234".into(),
            })
            .unwrap();
        next_matching(&mut carol.events, |e| {
            matches!(e, EngineEvent::RoomFull).then_some(())
        })
        .await;
    }

    #[tokio::test]
    async fn second_send_while_in_flight_is_rejected() {
        let relay = SimRelay::new();
        let net = Arc::new(SimNet::default());

        let mut alice = spawn_client(&relay, &net, "alice", None);
        let mut bob = spawn_client(&relay, &net, "bob", None);
        for client in [&alice, &bob] {
            client
                .commands
                .send(EngineCommand::Join {
                    room: "1234".into(),
                })
                .unwrap();
        }
        next_matching(&mut bob.events, |e| {
            matches!(e, EngineEvent::PeerConnected { .. }).then_some(())
        })
        .await;

        // Large enough that the first transfer is still in flight when the
        // second command lands on the engine loop.
        let blob = Bytes::from(vec![9u8; 4 * 1024 * 1024]);
        for name in ["first.bin", "second.bin"] {
            bob.commands
                .send(EngineCommand::SendFile {
                    name: name.into(),
                    mime_type: "application/octet-stream".into(),
                    data: blob.clone(),
                })
                .unwrap();
        }

        let rejected = next_matching(&mut bob.events, |e| match e {
            EngineEvent::Transfer(TransferEvent::SendRejected { name }) => Some(name.clone()),
            _ => None,
        })
        .await;
        assert_eq!(rejected, "second.bin");
    }
}
