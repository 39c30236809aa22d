//! Cross-Platform Path Utilities
//!
//! Functions for resolving application directories across platforms.
//! Everything lives under ~/.agent-chat/.

use std::path::{Path, PathBuf};

use crate::utils::error::{AppError, AppResult};

/// Get the user's home directory
pub fn home_dir() -> AppResult<PathBuf> {
    dirs::home_dir().ok_or_else(|| AppError::config("Could not determine home directory"))
}

/// Get the Agent Chat directory (~/.agent-chat/)
pub fn agent_chat_dir() -> AppResult<PathBuf> {
    Ok(home_dir()?.join(".agent-chat"))
}

/// Get the config file path (~/.agent-chat/config.json)
pub fn config_path() -> AppResult<PathBuf> {
    Ok(agent_chat_dir()?.join("config.json"))
}

/// Get the default history directory (~/.agent-chat/history/)
pub fn history_dir() -> AppResult<PathBuf> {
    Ok(agent_chat_dir()?.join("history"))
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(path: &Path) -> AppResult<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Get the Agent Chat directory, creating if it doesn't exist
pub fn ensure_agent_chat_dir() -> AppResult<PathBuf> {
    let path = agent_chat_dir()?;
    ensure_dir(&path)?;
    Ok(path)
}

/// Encode an id as a single file name component.
///
/// Agent and session ids come from the backend and end up as path segments.
/// Percent-encoding is reversible, so distinct ids never share a file.
pub fn encode_component(raw: &str) -> String {
    let encoded = urlencoding::encode(raw).into_owned();
    if encoded.chars().all(|c| c == '.') {
        // "", "." and ".." are not usable as names
        return format!("%{}", encoded.replace('.', "%2E"));
    }
    encoded
}
