use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

/// Marker directory used to find the project root.
pub const ROLLOUT_DIR: &str = ".rollout";
pub const CONFIG_FILE: &str = ".rollout/config.yaml";
pub const SESSIONS_DB: &str = ".rollout/sessions.db";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn sessions_db_path(root: &Path) -> PathBuf {
    root.join(SESSIONS_DB)
}
