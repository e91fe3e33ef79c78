//! Relay client: maintains the websocket session against the signaling
//! relay, re-registering the same identity and room across reconnects.
//!
//! Outgoing frames are buffered (bounded, oldest dropped first) while the
//! link is down and flushed after the re-join. Ordering across a reconnect
//! boundary is NOT preserved; the negotiation layer de-duplicates by
//! envelope content instead of trusting transport order.

use crate::core::config::{HEARTBEAT_INTERVAL, RELAY_RECONNECT_DELAYS, SIGNAL_BUFFER_CAP};
use crate::core::identity::ParticipantIdentity;
use crate::core::signaling::{ClientFrame, RelayEvent, ServerFrame, Signaling, SignalEnvelope};
use crate::utils::sos::SignalOfStop;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

// ── Connection seam ──────────────────────────────────────────────────────────

/// One live, bidirectional text-frame connection to the relay.
#[async_trait]
pub trait RelayConn: Send {
    async fn send(&mut self, text: String) -> Result<()>;
    /// `None` signals an orderly close; `Some(Err)` a transport fault.
    async fn recv(&mut self) -> Option<Result<String>>;
}

/// Dials new relay connections. Production is [`WsDial`]; tests swap in an
/// in-memory pipe.
#[async_trait]
pub trait RelayDial: Send + Sync {
    async fn dial(&self) -> Result<Box<dyn RelayConn>>;
}

/// Websocket dialer over tokio-tungstenite.
pub struct WsDial {
    url: String,
}

impl WsDial {
    pub fn new(url: &str) -> Result<Self> {
        url::Url::parse(url).with_context(|| format!("Invalid relay URL: {url}"))?;
        Ok(Self {
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl RelayDial for WsDial {
    async fn dial(&self) -> Result<Box<dyn RelayConn>> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .context("connect signaling websocket")?;
        Ok(Box::new(WsConn { ws }))
    }
}

struct WsConn {
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
}

#[async_trait]
impl RelayConn for WsConn {
    async fn send(&mut self, text: String) -> Result<()> {
        self.ws.send(Message::Text(text)).await.map_err(Into::into)
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.ws.next().await {
                None => return None,
                Some(Ok(Message::Text(text))) => return Some(Ok(text)),
                Some(Ok(Message::Close(_))) => return None,
                // Control frames are answered by tungstenite itself.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Some(Err(e.into())),
            }
        }
    }
}

// ── Client ───────────────────────────────────────────────────────────────────

enum Cmd {
    Join(String),
    Send(ClientFrame),
    Leave,
}

/// Handle to the relay session task.
pub struct RelayClient {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    identity: Arc<RwLock<ParticipantIdentity>>,
}

impl RelayClient {
    /// Load (or mint) the durable identity and spawn the session task.
    pub fn spawn(
        dial: Arc<dyn RelayDial>,
        identity_path: PathBuf,
        events: mpsc::UnboundedSender<RelayEvent>,
        sos: SignalOfStop,
    ) -> Result<Self> {
        let identity = Arc::new(RwLock::new(ParticipantIdentity::load_or_create(
            &identity_path,
        )?));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let task = SessionTask {
            dial,
            identity: identity.clone(),
            identity_path,
            events,
            sos,
            cmd_rx,
            desired_room: None,
            pending: VecDeque::new(),
            ping_nonce: 0,
            pings_in_flight: HashMap::new(),
        };
        tokio::spawn(task.run());

        Ok(Self { cmd_tx, identity })
    }
}

#[async_trait]
impl Signaling for RelayClient {
    async fn join(&self, room_id: &str) -> Result<()> {
        self.cmd_tx
            .send(Cmd::Join(room_id.to_string()))
            .map_err(|_| anyhow::anyhow!("Relay session task is gone"))
    }

    async fn send(&self, envelope: SignalEnvelope, to: Option<String>) -> Result<()> {
        self.cmd_tx
            .send(Cmd::Send(ClientFrame::Signal { envelope, to }))
            .map_err(|_| anyhow::anyhow!("Relay session task is gone"))
    }

    async fn leave(&self) {
        let _ = self.cmd_tx.send(Cmd::Leave);
    }

    fn identity(&self) -> String {
        self.identity.read().unwrap().as_str().to_string()
    }
}

// ── Session task ─────────────────────────────────────────────────────────────

struct SessionTask {
    dial: Arc<dyn RelayDial>,
    identity: Arc<RwLock<ParticipantIdentity>>,
    identity_path: PathBuf,
    events: mpsc::UnboundedSender<RelayEvent>,
    sos: SignalOfStop,
    cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    /// Room to re-join on every reconnect; cleared on leave/identity-lost.
    desired_room: Option<String>,
    /// Frames waiting for the link to come back, oldest first.
    pending: VecDeque<ClientFrame>,
    ping_nonce: u64,
    pings_in_flight: HashMap<u64, Instant>,
}

/// Append to a bounded queue, dropping the oldest entry once full.
fn push_bounded(queue: &mut VecDeque<ClientFrame>, frame: ClientFrame, cap: usize) {
    if queue.len() >= cap {
        queue.pop_front();
        warn!(
            event = "signal_buffer_overflow",
            cap, "Outgoing signal buffer full, dropping oldest frame"
        );
    }
    queue.push_back(frame);
}

impl SessionTask {
    fn identity_str(&self) -> String {
        self.identity.read().unwrap().as_str().to_string()
    }

    fn emit(&self, event: RelayEvent) {
        let _ = self.events.send(event);
    }

    async fn run(mut self) {
        let mut delay_idx = 0usize;
        'session: loop {
            if self.sos.cancelled() {
                return;
            }

            let mut conn = match self.dial.dial().await {
                Ok(conn) => {
                    delay_idx = 0;
                    conn
                }
                Err(e) => {
                    let secs = RELAY_RECONNECT_DELAYS
                        [delay_idx.min(RELAY_RECONNECT_DELAYS.len() - 1)];
                    delay_idx += 1;
                    warn!(event = "relay_dial_failed", error = %e, retry_in_s = secs);
                    // Jitter keeps two clients from re-dialing in lockstep.
                    let jitter = rand::Rng::gen_range(&mut rand::thread_rng(), 0..500u64);
                    let deadline = tokio::time::Instant::now()
                        + Duration::from_secs(secs)
                        + Duration::from_millis(jitter);
                    loop {
                        tokio::select! {
                            _ = tokio::time::sleep_until(deadline) => break,
                            _ = self.sos.wait() => return,
                            cmd = self.cmd_rx.recv() => {
                                let Some(cmd) = cmd else { return };
                                self.buffer_cmd(cmd);
                            }
                        }
                    }
                    continue 'session;
                }
            };

            info!(event = "relay_connected", "Relay link established");

            // Re-register the same identity into the last known room before
            // anything else, so relay-side reconnection never mints a new
            // logical participant.
            if let Some(room) = self.desired_room.clone() {
                let frame = ClientFrame::Join {
                    room_id: room,
                    identity: self.identity_str(),
                };
                if self.send_frame(&mut conn, frame).await.is_err() {
                    self.emit(RelayEvent::Disconnected);
                    continue 'session;
                }
            }

            // Flush frames buffered while the link was down.
            while let Some(frame) = self.pending.pop_front() {
                if let Err(frame) = self.try_send(&mut conn, frame).await {
                    self.pending.push_front(frame);
                    self.emit(RelayEvent::Disconnected);
                    continue 'session;
                }
            }

            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            heartbeat.tick().await; // immediate first tick

            loop {
                tokio::select! {
                    _ = self.sos.wait() => {
                        let _ = self.send_frame(&mut conn, ClientFrame::Leave).await;
                        return;
                    }
                    cmd = self.cmd_rx.recv() => {
                        let Some(cmd) = cmd else { return };
                        if self.handle_cmd(&mut conn, cmd).await.is_err() {
                            self.emit(RelayEvent::Disconnected);
                            continue 'session;
                        }
                    }
                    _ = heartbeat.tick() => {
                        self.ping_nonce += 1;
                        self.pings_in_flight.insert(self.ping_nonce, Instant::now());
                        let frame = ClientFrame::Ping { nonce: self.ping_nonce };
                        if self.send_frame(&mut conn, frame).await.is_err() {
                            self.emit(RelayEvent::Disconnected);
                            continue 'session;
                        }
                    }
                    msg = conn.recv() => {
                        match msg {
                            None => {
                                info!(event = "relay_closed", "Relay link closed");
                                self.emit(RelayEvent::Disconnected);
                                continue 'session;
                            }
                            Some(Err(e)) => {
                                warn!(event = "relay_read_error", error = %e);
                                self.emit(RelayEvent::Disconnected);
                                continue 'session;
                            }
                            Some(Ok(text)) => self.handle_server_text(&text),
                        }
                    }
                }
            }
        }
    }

    /// Absorb a command while the link is down.
    fn buffer_cmd(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::Join(room_id) => self.desired_room = Some(room_id),
            Cmd::Send(frame) => push_bounded(&mut self.pending, frame, SIGNAL_BUFFER_CAP),
            Cmd::Leave => self.desired_room = None,
        }
    }

    async fn handle_cmd(&mut self, conn: &mut Box<dyn RelayConn>, cmd: Cmd) -> Result<()> {
        match cmd {
            Cmd::Join(room_id) => {
                self.desired_room = Some(room_id.clone());
                let frame = ClientFrame::Join {
                    room_id,
                    identity: self.identity_str(),
                };
                self.send_frame(conn, frame).await
            }
            Cmd::Send(frame) => {
                if let Err(frame) = self.try_send(conn, frame).await {
                    push_bounded(&mut self.pending, frame, SIGNAL_BUFFER_CAP);
                    return Err(anyhow::anyhow!("relay send failed"));
                }
                Ok(())
            }
            Cmd::Leave => {
                self.desired_room = None;
                self.send_frame(conn, ClientFrame::Leave).await
            }
        }
    }

    /// Send, returning the frame for re-buffering on failure.
    async fn try_send(
        &mut self,
        conn: &mut Box<dyn RelayConn>,
        frame: ClientFrame,
    ) -> std::result::Result<(), ClientFrame> {
        match serde_json::to_string(&frame) {
            Ok(text) => match conn.send(text).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    warn!(event = "relay_send_failed", error = %e);
                    Err(frame)
                }
            },
            Err(e) => {
                // Unserializable frames are a programming error; drop them.
                warn!(event = "frame_encode_failed", error = %e);
                Ok(())
            }
        }
    }

    async fn send_frame(&mut self, conn: &mut Box<dyn RelayConn>, frame: ClientFrame) -> Result<()> {
        self.try_send(conn, frame)
            .await
            .map_err(|_| anyhow::anyhow!("relay send failed"))
    }

    fn handle_server_text(&mut self, text: &str) {
        let frame: ServerFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(event = "relay_frame_unparsed", error = %e, "Ignoring malformed relay frame");
                return;
            }
        };

        match frame {
            ServerFrame::Joined {
                members,
                is_first_joiner,
            } => self.emit(RelayEvent::Joined {
                members,
                is_first_joiner,
            }),
            ServerFrame::PeerJoined { identity } => self.emit(RelayEvent::PeerJoined { identity }),
            ServerFrame::PeerLeft { identity } => self.emit(RelayEvent::PeerLeft { identity }),
            ServerFrame::Signal { envelope } => self.emit(RelayEvent::Signal(envelope)),
            ServerFrame::RoomFull => self.emit(RelayEvent::RoomFull),
            ServerFrame::UnknownSession => self.handle_identity_lost(),
            ServerFrame::Pong { nonce } => {
                if let Some(sent) = self.pings_in_flight.remove(&nonce) {
                    let rtt = sent.elapsed();
                    debug!(event = "heartbeat_rtt", rtt_ms = rtt.as_millis() as u64);
                    self.emit(RelayEvent::HeartbeatRtt(rtt));
                }
            }
        }
    }

    /// The relay has discarded our session handle. Retrying the old
    /// identity is disallowed: mint a new one, drop buffered frames that
    /// carry the dead identity, and force the caller to rejoin from scratch.
    fn handle_identity_lost(&mut self) {
        let new_identity = match ParticipantIdentity::reset(&self.identity_path) {
            Ok(id) => id,
            Err(e) => {
                warn!(event = "identity_persist_failed", error = %e, "Using unpersisted identity");
                ParticipantIdentity::generate()
            }
        };
        warn!(
            event = "relay_identity_lost",
            new_identity = %new_identity,
            "Relay discarded our session; minted a fresh identity"
        );
        *self.identity.write().unwrap() = new_identity.clone();
        self.desired_room = None;
        self.pending.clear();
        self.pings_in_flight.clear();
        self.emit(RelayEvent::IdentityLost {
            new_identity: new_identity.as_str().to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::signaling::SignalKind;

    struct ChanConn {
        tx: mpsc::UnboundedSender<String>,
        rx: mpsc::UnboundedReceiver<String>,
    }

    #[async_trait]
    impl RelayConn for ChanConn {
        async fn send(&mut self, text: String) -> Result<()> {
            self.tx
                .send(text)
                .map_err(|_| anyhow::anyhow!("conn closed"))
        }

        async fn recv(&mut self) -> Option<Result<String>> {
            self.rx.recv().await.map(Ok)
        }
    }

    /// Dialer that hands out a single scripted connection, then pends.
    struct OnceDial {
        conn: std::sync::Mutex<Option<Box<dyn RelayConn>>>,
    }

    #[async_trait]
    impl RelayDial for OnceDial {
        async fn dial(&self) -> Result<Box<dyn RelayConn>> {
            if let Some(conn) = self.conn.lock().unwrap().take() {
                return Ok(conn);
            }
            futures_util::future::pending().await
        }
    }

    struct Harness {
        client: RelayClient,
        events: mpsc::UnboundedReceiver<RelayEvent>,
        to_client: mpsc::UnboundedSender<String>,
        from_client: mpsc::UnboundedReceiver<String>,
        _dir: PathBuf,
    }

    fn harness() -> Harness {
        let (to_client, client_rx) = mpsc::unbounded_channel();
        let (client_tx, from_client) = mpsc::unbounded_channel();
        let dial = Arc::new(OnceDial {
            conn: std::sync::Mutex::new(Some(Box::new(ChanConn {
                tx: client_tx,
                rx: client_rx,
            }) as Box<dyn RelayConn>)),
        });

        let dir = std::env::temp_dir().join(format!("roomdrop-relay-{}", uuid::Uuid::new_v4()));
        let (events_tx, events) = mpsc::unbounded_channel();
        let client = RelayClient::spawn(
            dial,
            dir.join("identity"),
            events_tx,
            SignalOfStop::new(),
        )
        .unwrap();

        Harness {
            client,
            events,
            to_client,
            from_client,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn join_then_signal_reach_the_relay() {
        let mut h = harness();
        let me = h.client.identity();

        h.client.join("1234").await.unwrap();
        let frame: ClientFrame =
            serde_json::from_str(&h.from_client.recv().await.unwrap()).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Join {
                room_id: "1234".into(),
                identity: me.clone(),
            }
        );

        let env = SignalEnvelope {
            kind: SignalKind::Offer("sdp".into()),
            from: me,
            to: None,
        };
        h.client.send(env.clone(), Some("bob".into())).await.unwrap();
        let frame: ClientFrame =
            serde_json::from_str(&h.from_client.recv().await.unwrap()).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Signal {
                envelope: env,
                to: Some("bob".into()),
            }
        );
    }

    #[tokio::test]
    async fn unknown_session_mints_a_fresh_identity() {
        let mut h = harness();
        let old = h.client.identity();

        h.to_client
            .send(r#"{"type":"unknown-session"}"#.to_string())
            .unwrap();

        loop {
            match h.events.recv().await.expect("event stream ended") {
                RelayEvent::IdentityLost { new_identity } => {
                    assert_ne!(new_identity, old);
                    assert_eq!(h.client.identity(), new_identity);
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn inbound_frames_become_events() {
        let mut h = harness();

        h.to_client
            .send(r#"{"type":"joined","members":["alice","bob"],"is_first_joiner":false}"#.into())
            .unwrap();

        loop {
            match h.events.recv().await.expect("event stream ended") {
                RelayEvent::Joined {
                    members,
                    is_first_joiner,
                } => {
                    assert_eq!(members, vec!["alice".to_string(), "bob".to_string()]);
                    assert!(!is_first_joiner);
                    break;
                }
                _ => continue,
            }
        }
    }

    #[test]
    fn bounded_buffer_drops_oldest() {
        let mut queue = VecDeque::new();
        for i in 0..5u64 {
            push_bounded(&mut queue, ClientFrame::Ping { nonce: i }, 3);
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.front(), Some(&ClientFrame::Ping { nonce: 2 }));
        assert_eq!(queue.back(), Some(&ClientFrame::Ping { nonce: 4 }));
    }
}
