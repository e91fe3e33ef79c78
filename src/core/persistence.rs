//! Session-continuity persistence.
//!
//! A small JSON record in the data directory remembering the last room and
//! display name, so a restarted client can splice itself back into its
//! prior membership with the same identity.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct SessionRecord {
    /// Room the client was last registered to, if any.
    pub last_room: Option<String>,
    /// Display name announced on the chat channel.
    #[serde(default)]
    pub display_name: Option<String>,
}

impl SessionRecord {
    pub fn load() -> Result<Self> {
        let path = Self::path();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::path();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn path() -> PathBuf {
        crate::utils::data_dir::get().join("session.json")
    }
}
