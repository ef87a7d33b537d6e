/// Canonical file paths for the notification daemon.
///
/// Runtime state lives under /var/run/vmnotification/ and logs under
/// /var/log/vmnotification/:
///   - token_file         Registration token of the running daemon.
///   - vmnotification.log Service log.
///   - vmotion.log        One line per migration start and end.
///   - timeout.log        One line per stale start or timeout change.
use std::io;
use std::path::{Path, PathBuf};

pub const DEFAULT_TOKEN_FILE: &str = "/var/run/vmnotification/token_file";
const DEFAULT_LOG_DIR: &str = "/var/log/vmnotification";
pub const SERVICE_LOG_FILE_NAME: &str = "vmnotification.log";
pub const VMOTION_LOG_FILE_NAME: &str = "vmotion.log";
pub const TIMEOUT_LOG_FILE_NAME: &str = "timeout.log";

/// Returns the default log directory: /var/log/vmnotification/
pub fn default_log_dir() -> PathBuf {
    PathBuf::from(DEFAULT_LOG_DIR)
}

/// Creates the directory that will hold `file`, returning it.
/// A bare file name resolves against the working directory.
pub fn ensure_parent_dir(file: &Path) -> io::Result<PathBuf> {
    let dir = match file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
