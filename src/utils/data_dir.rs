//! Global data directory for durable state (identity, session record).
//!
//! Resolved once at startup from `--data-dir` or the `~/.roomdrop`
//! default, then read-only for the rest of the process.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

fn default_dir() -> PathBuf {
    dirs::home_dir()
        .expect("No home directory found")
        .join(".roomdrop")
}

/// Resolve and pin the data directory. Panics if called twice.
pub fn init(custom: Option<&Path>) {
    let dir = custom.map(Path::to_path_buf).unwrap_or_else(default_dir);
    DATA_DIR
        .set(dir)
        .expect("data_dir::init() called more than once");
}

/// The pinned data directory. Panics before `init()`.
pub fn get() -> &'static Path {
    DATA_DIR
        .get()
        .expect("data_dir not initialized, call data_dir::init() first")
}
