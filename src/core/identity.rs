//! Durable participant identity.
//!
//! Each browser-context equivalent (here: data directory) holds one opaque
//! identity string, minted once and reused across relay reconnects so the
//! relay and the remote peer keep seeing the same logical participant.
//! The identity is only replaced when the relay reports the session handle
//! unknown; retrying with a discarded identity is disallowed.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Opaque, durable participant identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantIdentity(String);

impl ParticipantIdentity {
    /// Mint a brand-new random identity.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Load the identity stored at `path`, or mint and persist a new one.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Err(anyhow!("Identity file is empty: {}", path.display()));
            }
            return Ok(Self(trimmed.to_string()));
        }

        let identity = Self::generate();
        identity.persist(path)?;
        Ok(identity)
    }

    /// Discard the stored identity and mint a fresh one in its place.
    ///
    /// Used on the relay-identity-lost path; the caller must clear all
    /// cached remote-identity state and rejoin from scratch afterwards.
    pub fn reset(path: &Path) -> Result<Self> {
        let identity = Self::generate();
        identity.persist(path)?;
        Ok(identity)
    }

    fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.0.as_bytes())?;
        // Owner read/write only on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }
        Ok(())
    }

    /// Default identity file path.
    pub fn default_path() -> PathBuf {
        crate::utils::data_dir::get().join("identity")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ParticipantIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantIdentity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_or_create_is_stable() {
        let dir = std::env::temp_dir().join(format!("roomdrop-id-{}", Uuid::new_v4()));
        let path = dir.join("identity");

        let first = ParticipantIdentity::load_or_create(&path).unwrap();
        let second = ParticipantIdentity::load_or_create(&path).unwrap();
        assert_eq!(first, second);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn reset_mints_a_different_identity() {
        let dir = std::env::temp_dir().join(format!("roomdrop-id-{}", Uuid::new_v4()));
        let path = dir.join("identity");

        let first = ParticipantIdentity::load_or_create(&path).unwrap();
        let reset = ParticipantIdentity::reset(&path).unwrap();
        assert_ne!(first, reset);

        // The reset identity is what subsequent loads see.
        let reloaded = ParticipantIdentity::load_or_create(&path).unwrap();
        assert_eq!(reset, reloaded);

        std::fs::remove_dir_all(&dir).ok();
    }
}
