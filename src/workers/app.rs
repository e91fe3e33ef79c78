//! CLI front-end: wires the relay client, link factory, and engine
//! together, renders engine events as log lines, and turns stdin into
//! chat messages and slash commands.

use crate::core::engine::{Engine, EngineCommand, EngineEvent, EngineHandle};
use crate::core::identity::ParticipantIdentity;
use crate::core::negotiation::webrtc::WebRtcLinkFactory;
use crate::core::persistence::SessionRecord;
use crate::core::rendezvous::Role;
use crate::core::signaling::client::{RelayClient, WsDial};
use crate::core::signaling::Signaling;
use crate::core::transfer::TransferEvent;
use crate::utils::sos::SignalOfStop;
use crate::workers::args::Args;
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::warn;

pub async fn run(args: Args, sos: SignalOfStop) -> Result<()> {
    let mut record = SessionRecord::load().unwrap_or_default();
    let room = match (&args.room, args.resume) {
        (Some(room), _) => room.clone(),
        (None, true) => record
            .last_room
            .clone()
            .context("No previous room to resume")?,
        (None, false) => bail!("Room ID required (pass a room, or --resume)"),
    };
    let display_name = args.name.clone().or_else(|| record.display_name.clone());

    let (relay_tx, relay_rx) = mpsc::unbounded_channel();
    let dial = Arc::new(WsDial::new(&args.relay)?);
    let signaling: Arc<dyn Signaling> = Arc::new(RelayClient::spawn(
        dial,
        ParticipantIdentity::default_path(),
        relay_tx,
        sos.clone(),
    )?);
    let link_factory = Arc::new(WebRtcLinkFactory::new(args.ice_config()));

    let mut handle = Engine::spawn(
        signaling,
        relay_rx,
        link_factory,
        display_name.clone(),
        sos.clone(),
    );

    record.last_room = Some(room.clone());
    record.display_name = display_name;
    if let Err(e) = record.save() {
        warn!(event = "session_record_save_failed", error = %e);
    }

    log_line("room", &room);
    handle
        .commands
        .send(EngineCommand::Join { room: room.clone() })
        .ok();

    let mut pending_send = args.send.clone();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = sos.wait() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => on_input(line.trim(), &handle).await,
                _ => break,
            },
            event = handle.events.recv() => match event {
                None => break,
                Some(event) => {
                    let connected = on_event(&event);
                    if connected {
                        if let Some(path) = pending_send.take() {
                            queue_file(&path, &handle).await;
                        }
                    }
                }
            },
        }
    }
    Ok(())
}

async fn on_input(line: &str, handle: &EngineHandle) {
    if line.is_empty() {
        return;
    }
    if let Some(path) = line.strip_prefix("/send ") {
        queue_file(Path::new(path.trim()), handle).await;
    } else if line == "/retry" {
        let _ = handle.commands.send(EngineCommand::ForceInitiator);
    } else if line == "/quit" {
        let _ = handle.commands.send(EngineCommand::Leave);
    } else if line.starts_with('/') {
        log_line("help", "commands: /send <path>, /retry, /quit; anything else is chat");
    } else {
        let _ = handle.commands.send(EngineCommand::SendChat {
            content: line.to_string(),
        });
    }
}

async fn queue_file(path: &Path, handle: &EngineHandle) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let mime_type = mime_guess::from_path(path).first_or_octet_stream().to_string();
    match tokio::fs::read(path).await {
        Ok(data) => {
            let _ = handle.commands.send(EngineCommand::SendFile {
                name,
                mime_type,
                data: Bytes::from(data),
            });
        }
        Err(e) => log_line("error", &format!("cannot read {}: {e}", path.display())),
    }
}

/// Render one engine event; returns whether the peer just connected.
fn on_event(event: &EngineEvent) -> bool {
    match event {
        EngineEvent::RoomJoined { members } => {
            log_line("joined", &format!("{} member(s) present", members.len()));
        }
        EngineEvent::RoomFull => log_line("error", "room already has two members"),
        EngineEvent::PeerJoined { identity } => log_line("peer", &format!("{identity} joined")),
        EngineEvent::PeerLeft { identity } => log_line("peer", &format!("{identity} left")),
        EngineEvent::RoleAssigned(role) => match role {
            Role::Waiting => log_line("role", "waiting for a peer"),
            Role::Initiator => log_line("role", "initiator"),
            Role::Receiver => log_line("role", "receiver"),
        },
        EngineEvent::PeerConnected { identity, endpoint } => {
            match endpoint {
                Some(endpoint) => log_line("connected", &format!("{identity} via {endpoint}")),
                None => log_line("connected", identity),
            }
            return true;
        }
        EngineEvent::PeerDisconnected => log_line("peer", "disconnected"),
        EngineEvent::Reconnecting { attempt } => {
            log_line("reconnect", &format!("attempt {attempt}"));
        }
        EngineEvent::TerminalError { reason } => {
            log_line("error", &format!("{reason}; type /retry to force a fresh attempt"));
        }
        EngineEvent::IdentityLost { .. } => {
            log_line("error", "relay lost our session; restart to rejoin with the new identity");
        }
        EngineEvent::RelayDisconnected => log_line("relay", "link down, reconnecting"),
        EngineEvent::Chat {
            content, sender, ..
        } => log_line("chat", &format!("<{sender}> {content}")),
        EngineEvent::PeerDisplayName { name } => log_line("peer", &format!("is known as {name}")),
        EngineEvent::Transfer(event) => on_transfer_event(event),
    }
    false
}

fn on_transfer_event(event: &TransferEvent) {
    match event {
        TransferEvent::SendProgress {
            name,
            sent_chunks,
            total_chunks,
        } => log_line("send", &format!("{name}: {sent_chunks}/{total_chunks} chunks")),
        TransferEvent::SendComplete { name } => log_line("send", &format!("{name}: done")),
        TransferEvent::SendFailed { name, reason } => {
            log_line("error", &format!("send {name} failed: {reason}"));
        }
        TransferEvent::SendRejected { name } => {
            log_line("error", &format!("{name}: a transfer is already in flight"));
        }
        TransferEvent::ReceiveStarted { name, size, .. } => {
            log_line("recv", &format!("{name} ({size} bytes) incoming"));
        }
        TransferEvent::ReceiveProgress { name, progress, .. } => {
            log_line("recv", &format!("{name}: {:.0}%", progress * 100.0));
        }
        TransferEvent::ReceiveFailed { name, reason } => {
            log_line("error", &format!("receive {name} failed: {reason}"));
        }
        TransferEvent::Received {
            name,
            data,
            suspect,
            ..
        } => {
            let safe = sanitize_file_name(name);
            match std::fs::write(&safe, data) {
                Ok(()) => log_line(
                    "recv",
                    &format!(
                        "{safe}: saved{}",
                        if *suspect { " (size mismatch, flagged)" } else { "" }
                    ),
                ),
                Err(e) => log_line("error", &format!("cannot save {safe}: {e}")),
            }
        }
    }
}

/// Reduce a peer-supplied file name to one safe path component.
fn sanitize_file_name(name: &str) -> String {
    let candidate = name.rsplit(['/', '\\']).next().unwrap_or("file");
    let safe: String = candidate
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
        .collect();
    if safe.is_empty() || safe.chars().all(|c| c == '.') {
        "file".to_string()
    } else {
        safe.trim_start_matches('.').to_string()
    }
}

fn log_line(label: &str, value: &str) {
    let now = chrono::Utc::now().format("%H:%M:%S%.3f");
    println!("[{now}] {label}: {value}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_from_peers_lose_path_components() {
        assert_eq!(sanitize_file_name("photo.png"), "photo.png");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\x\\y.txt"), "y.txt");
        assert_eq!(sanitize_file_name(".."), "file");
        assert_eq!(sanitize_file_name(""), "file");
        assert_eq!(sanitize_file_name(".hidden"), "hidden");
    }
}
