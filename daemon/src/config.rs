use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::hook::HookCommand;
use crate::paths;
use crate::rpc::{ProcessTransport, DEFAULT_TRANSPORT_COMMAND};

pub const DEFAULT_APP_NAME: &str = "my_app";
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 1;
pub const DEFAULT_LOG_LEVEL: &str = "DEBUG";
pub const DEFAULT_CONSOLE_LEVEL: &str = "WARNING";
pub const DEFAULT_LOGFILE_MAXSIZE_BYTES: u64 = 20 * 1024 * 1024;
pub const DEFAULT_LOGFILE_COUNT: usize = 10;
pub const MIN_LOGFILE_MAXSIZE_BYTES: u64 = 1024;
pub const MIN_LOGFILE_COUNT: usize = 2;

/// Root configuration structure, deserialized from the file given with `--config`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    #[serde(default)]
    pub token: TokenConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// What to register as, how often to poll, and what to run around a migration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    /// Seconds between two check-for-event calls.  Must be at least 1.
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: u64,
    /// Shell-style command line run before the migration is acknowledged.
    pub pre_vmotion_cmd: String,
    /// Shell-style command line run after the migration ends.
    pub post_vmotion_cmd: String,
    /// Transport executable and leading arguments; the RPC payload is appended.
    #[serde(default = "default_rpc_command")]
    pub rpc_command: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    #[serde(default = "default_token_file")]
    pub token_file: PathBuf,
    /// Keep a durable copy of the registration token for crash recovery.
    #[serde(default = "default_true")]
    pub token_file_create: bool,
    /// Mask the registration token in every log line.
    #[serde(default)]
    pub token_obfuscate_logfile: bool,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            token_file: default_token_file(),
            token_file_create: true,
            token_obfuscate_logfile: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_service_logfile")]
    pub service_logfile: PathBuf,
    /// DEBUG, INFO, WARNING, ERROR or CRITICAL (case-insensitive).
    #[serde(default = "default_log_level")]
    pub service_logfile_level: String,
    #[serde(default = "default_console_level")]
    pub service_console_level: String,
    #[serde(default = "default_maxsize")]
    pub service_logfile_maxsize_bytes: u64,
    #[serde(default = "default_count")]
    pub service_logfile_count: usize,

    #[serde(default = "default_vmotion_logfile")]
    pub vmotion_logfile: PathBuf,
    #[serde(default = "default_maxsize")]
    pub vmotion_logfile_maxsize_bytes: u64,
    #[serde(default = "default_count")]
    pub vmotion_logfile_count: usize,

    #[serde(default = "default_timeout_logfile")]
    pub timeout_logfile: PathBuf,
    #[serde(default = "default_maxsize")]
    pub timeout_logfile_maxsize_bytes: u64,
    #[serde(default = "default_count")]
    pub timeout_logfile_count: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            service_logfile: default_service_logfile(),
            service_logfile_level: DEFAULT_LOG_LEVEL.to_string(),
            service_console_level: DEFAULT_CONSOLE_LEVEL.to_string(),
            service_logfile_maxsize_bytes: DEFAULT_LOGFILE_MAXSIZE_BYTES,
            service_logfile_count: DEFAULT_LOGFILE_COUNT,
            vmotion_logfile: default_vmotion_logfile(),
            vmotion_logfile_maxsize_bytes: DEFAULT_LOGFILE_MAXSIZE_BYTES,
            vmotion_logfile_count: DEFAULT_LOGFILE_COUNT,
            timeout_logfile: default_timeout_logfile(),
            timeout_logfile_maxsize_bytes: DEFAULT_LOGFILE_MAXSIZE_BYTES,
            timeout_logfile_count: DEFAULT_LOGFILE_COUNT,
        }
    }
}

/// One size-rotated log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    pub path: PathBuf,
    pub max_bytes: u64,
    pub count: usize,
}

impl LoggingConfig {
    pub fn service_file(&self) -> LogFile {
        LogFile {
            path: self.service_logfile.clone(),
            max_bytes: self.service_logfile_maxsize_bytes,
            count: self.service_logfile_count,
        }
    }

    pub fn vmotion_file(&self) -> LogFile {
        LogFile {
            path: self.vmotion_logfile.clone(),
            max_bytes: self.vmotion_logfile_maxsize_bytes,
            count: self.vmotion_logfile_count,
        }
    }

    pub fn timeout_file(&self) -> LogFile {
        LogFile {
            path: self.timeout_logfile.clone(),
            max_bytes: self.timeout_logfile_maxsize_bytes,
            count: self.timeout_logfile_count,
        }
    }

    fn files(&self) -> [(&'static str, LogFile); 3] {
        [
            ("service_logfile", self.service_file()),
            ("vmotion_logfile", self.vmotion_file()),
            ("timeout_logfile", self.timeout_file()),
        ]
    }
}

impl Config {
    /// Checks every constraint that serde cannot express.  Hook and transport
    /// command lines must tokenize.
    pub fn validate(&self) -> Result<()> {
        if self.service.app_name.is_empty() {
            bail!("app_name must be at least 1 character");
        }
        if self.service.check_interval_seconds < 1 {
            bail!(
                "check_interval_seconds must be greater than 0 (was {})",
                self.service.check_interval_seconds
            );
        }
        HookCommand::parse(&self.service.pre_vmotion_cmd)
            .context("pre_vmotion_cmd is not a valid command line")?;
        HookCommand::parse(&self.service.post_vmotion_cmd)
            .context("post_vmotion_cmd is not a valid command line")?;
        ProcessTransport::from_command_line(&self.service.rpc_command)
            .context("rpc_command is not a valid command line")?;

        if self.token.token_file.as_os_str().is_empty() {
            bail!("token_file must be at least 1 character");
        }

        for (name, file) in self.logging.files() {
            if file.path.as_os_str().is_empty() {
                bail!("{name} must be at least 1 character");
            }
            if file.max_bytes < MIN_LOGFILE_MAXSIZE_BYTES {
                bail!(
                    "{name}_maxsize_bytes must be greater than or equal to {MIN_LOGFILE_MAXSIZE_BYTES} (was {})",
                    file.max_bytes
                );
            }
            if file.count < MIN_LOGFILE_COUNT {
                bail!("{name}_count must be greater than 1 (was {})", file.count);
            }
        }
        Ok(())
    }

    /// Every file the daemon writes, for directory bootstrap.
    pub fn output_files(&self) -> Vec<&Path> {
        vec![
            self.logging.service_logfile.as_path(),
            self.logging.vmotion_logfile.as_path(),
            self.logging.timeout_logfile.as_path(),
            self.token.token_file.as_path(),
        ]
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.service;
        let t = &self.token;
        let l = &self.logging;
        writeln!(f, "App name             : {}", s.app_name)?;
        writeln!(f, "Check interval       : {} seconds", s.check_interval_seconds)?;
        writeln!(f, "Pre vMotion command  : {}", s.pre_vmotion_cmd)?;
        writeln!(f, "Post vMotion command : {}", s.post_vmotion_cmd)?;
        writeln!(f, "RPC command          : {}", s.rpc_command)?;
        writeln!(f, "Token file           : {}", t.token_file.display())?;
        writeln!(f, "Token file create    : {}", t.token_file_create)?;
        writeln!(f, "Token obfuscation    : {}", t.token_obfuscate_logfile)?;
        writeln!(f, "Log level            : {}", l.service_logfile_level)?;
        writeln!(f, "Console level        : {}", l.service_console_level)?;
        for (name, file) in l.files() {
            writeln!(
                f,
                "{:<21}: {} ({} bytes x {})",
                name,
                file.path.display(),
                file.max_bytes,
                file.count
            )?;
        }
        Ok(())
    }
}

/// Loads and validates the config file at `path`.
/// Unlike most settings files a missing config is an error: the hook commands
/// have no sensible default.
pub fn load(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config file: {}", path.display()))?;
    Ok(config)
}

fn default_app_name() -> String {
    DEFAULT_APP_NAME.to_string()
}

fn default_check_interval() -> u64 {
    DEFAULT_CHECK_INTERVAL_SECS
}

fn default_rpc_command() -> String {
    DEFAULT_TRANSPORT_COMMAND.to_string()
}

fn default_true() -> bool {
    true
}

fn default_token_file() -> PathBuf {
    PathBuf::from(paths::DEFAULT_TOKEN_FILE)
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_console_level() -> String {
    DEFAULT_CONSOLE_LEVEL.to_string()
}

fn default_maxsize() -> u64 {
    DEFAULT_LOGFILE_MAXSIZE_BYTES
}

fn default_count() -> usize {
    DEFAULT_LOGFILE_COUNT
}

fn default_service_logfile() -> PathBuf {
    paths::default_log_dir().join(paths::SERVICE_LOG_FILE_NAME)
}

fn default_vmotion_logfile() -> PathBuf {
    paths::default_log_dir().join(paths::VMOTION_LOG_FILE_NAME)
}

fn default_timeout_logfile() -> PathBuf {
    paths::default_log_dir().join(paths::TIMEOUT_LOG_FILE_NAME)
}
