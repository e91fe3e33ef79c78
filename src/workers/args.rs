//! Command-line surface.

use crate::core::negotiation::webrtc::{IceConfig, IceServerConfig};
use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "roomdrop")]
#[command(about = "Room-based peer-to-peer file drop and chat over WebRTC")]
pub struct Args {
    /// Room to join (any shared string). Omit with --resume to rejoin the
    /// last room.
    #[arg(value_name = "ROOM")]
    pub room: Option<String>,

    /// Signaling relay endpoint.
    #[arg(long, value_name = "URL", default_value = "wss://relay.roomdrop.net/ws")]
    pub relay: String,

    /// File to send once the peer connection is up.
    #[arg(long, value_name = "PATH")]
    pub send: Option<PathBuf>,

    /// Display name announced to the peer.
    #[arg(long, value_name = "NAME")]
    pub name: Option<String>,

    /// Rejoin the room from the previous session.
    #[arg(long)]
    pub resume: bool,

    /// Override the data directory (default: ~/.roomdrop).
    #[arg(long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Additional STUN server (repeatable), e.g. stun:stun.example.com:3478.
    #[arg(long, value_name = "URL")]
    pub stun: Vec<String>,

    /// TURN server with credentials (repeatable), as URL,USERNAME,PASSWORD.
    #[arg(long, value_name = "URL,USER,PASS")]
    pub turn: Vec<String>,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    pub fn load() -> Self {
        Self::parse()
    }

    /// Static ICE configuration for every negotiation session.
    pub fn ice_config(&self) -> IceConfig {
        let mut config = IceConfig::default();
        for url in &self.stun {
            config.servers.push(IceServerConfig {
                urls: vec![url.clone()],
                username: String::new(),
                credential: String::new(),
            });
        }
        for entry in &self.turn {
            let mut parts = entry.splitn(3, ',');
            let (Some(url), Some(user), Some(pass)) =
                (parts.next(), parts.next(), parts.next())
            else {
                tracing::warn!(event = "turn_flag_malformed", entry = %entry, "Expected URL,USER,PASS");
                continue;
            };
            config.servers.push(IceServerConfig {
                urls: vec![url.to_string()],
                username: user.to_string(),
                credential: pass.to_string(),
            });
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_flag_parses_credentials() {
        let args = Args::parse_from([
            "roomdrop",
            "1234",
            "--turn",
            "turn:turn.example.com:3478,alice,s3cret",
        ]);
        let config = args.ice_config();
        let turn = config.servers.last().unwrap();
        assert_eq!(turn.urls, vec!["turn:turn.example.com:3478".to_string()]);
        assert_eq!(turn.username, "alice");
        assert_eq!(turn.credential, "s3cret");
    }

    #[test]
    fn malformed_turn_flag_is_skipped() {
        let args = Args::parse_from(["roomdrop", "1234", "--turn", "no-credentials"]);
        let config = args.ice_config();
        // Only the default STUN entry remains.
        assert_eq!(config.servers.len(), IceConfig::default().servers.len());
    }
}
