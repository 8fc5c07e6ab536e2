// ABOUTME: XDG Base Directory paths for the bridge's config, identity database and logs
// ABOUTME: Falls back to the working directory when no home directory can be determined

use directories::ProjectDirs;
use std::path::PathBuf;

const QUALIFIER: &str = "io";
const ORGANIZATION: &str = "slackord";
const APPLICATION: &str = "slackord";

pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
}

/// Data directory (e.g., ~/.local/share/slackord/), or ./data
pub fn data_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./data"))
}

/// Config directory (e.g., ~/.config/slackord/), or the working directory
pub fn config_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Log directory inside a data directory
pub fn log_dir(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("logs")
}

/// Attachment staging root inside a data directory
pub fn staging_dir(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("staging")
}
