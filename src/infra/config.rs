use dirs::{config_dir, home_dir};
use std::ffi::OsString;
use std::path::PathBuf;

pub const DB_FILE_NAME: &str = "db.etilqs";
pub const DEFAULT_OPENCODE_BIN: &str = "opencode";

#[derive(Debug, thiserror::Error)]
pub enum ResolveConfigDirError {
    #[error("config directory not found")]
    ConfigDirNotFound,
}

pub fn resolve_config_dir() -> Result<PathBuf, ResolveConfigDirError> {
    if let Some(override_dir) = std::env::var_os("JAGMAN_CONFIG_DIR") {
        return Ok(PathBuf::from(override_dir));
    }

    let Some(config) = config_dir() else {
        return Err(ResolveConfigDirError::ConfigDirNotFound);
    };

    Ok(config.join("jagman"))
}

pub fn resolve_db_path() -> Result<PathBuf, ResolveConfigDirError> {
    Ok(resolve_config_dir()?.join(DB_FILE_NAME))
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveClaudeProjectsDirError {
    #[error("home directory not found")]
    HomeDirNotFound,
}

pub fn resolve_claude_projects_dir() -> Result<PathBuf, ResolveClaudeProjectsDirError> {
    if let Some(override_dir) = std::env::var_os("CLAUDE_PROJECTS_DIR") {
        return Ok(PathBuf::from(override_dir));
    }

    let Some(home) = home_dir() else {
        return Err(ResolveClaudeProjectsDirError::HomeDirNotFound);
    };

    Ok(home.join(".claude").join("projects"))
}

pub fn resolve_opencode_bin() -> OsString {
    std::env::var_os("JAGMAN_OPENCODE_BIN")
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| OsString::from(DEFAULT_OPENCODE_BIN))
}
