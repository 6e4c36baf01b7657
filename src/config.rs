use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::net::{Ipv6Addr, SocketAddr};
use std::path::PathBuf;

use crate::error::{Result, TftpError};
use crate::session::{MAX_RETRIES, TIMEOUT_SECONDS};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TftpConfig {
    pub root_dir: PathBuf,
    pub bind_addr: SocketAddr,
    pub logging: LoggingConfig,
    /// Maximum file size in bytes that can be served (default: 100MB).
    /// Set to 0 for unlimited.
    pub max_file_size_bytes: u64,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for TftpConfig {
    fn default() -> Self {
        Self {
            root_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            bind_addr: SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 69),
            logging: LoggingConfig::default(),
            max_file_size_bytes: 104_857_600,
            timeout_secs: TIMEOUT_SECONDS,
            max_retries: MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// JSON structured logging for log aggregation
    Json,
}

pub fn load_config(path: &std::path::Path) -> Result<TftpConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: TftpConfig = toml::from_str(&contents)
        .map_err(|e| TftpError::Tftp(format!("Invalid config file {}: {}", path.display(), e)))?;
    Ok(config)
}

pub fn write_default_config(path: &std::path::Path) -> Result<()> {
    write_config(path, &TftpConfig::default())
}

pub fn write_config(path: &std::path::Path, config: &TftpConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config)
        .map_err(|e| TftpError::Tftp(format!("Failed to serialize default config: {}", e)))?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// §10.2: checked before the server binds a socket.
pub fn validate_config(config: &TftpConfig, validate_bind: bool) -> Result<()> {
    if !config.root_dir.is_absolute() {
        return Err(TftpError::Tftp(
            "root_dir must be an absolute path".to_string(),
        ));
    }

    match std::fs::metadata(&config.root_dir) {
        Ok(meta) => {
            if !meta.is_dir() {
                return Err(TftpError::Tftp("root_dir must be a directory".to_string()));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TftpError::Tftp(
                "root_dir does not exist; create it or adjust config".to_string(),
            ));
        }
        Err(e) => return Err(TftpError::Io(e)),
    }

    if let Err(e) = std::fs::read_dir(&config.root_dir) {
        return Err(TftpError::Tftp(format!("root_dir is not readable: {}", e)));
    }

    if config.bind_addr.port() == 0 {
        return Err(TftpError::Tftp(
            "bind_addr port must be non-zero".to_string(),
        ));
    }

    if validate_bind && let Err(e) = std::net::UdpSocket::bind(config.bind_addr) {
        return Err(TftpError::Tftp(format!(
            "bind_addr is not available: {}",
            e
        )));
    }

    if let Some(ref log_file) = config.logging.file {
        let parent = log_file.parent().ok_or_else(|| {
            TftpError::Tftp("logging.file must include a parent directory".to_string())
        })?;
        match std::fs::metadata(parent) {
            Ok(meta) => {
                if !meta.is_dir() {
                    return Err(TftpError::Tftp(
                        "logging.file parent must be a directory".to_string(),
                    ));
                }
            }
            Err(e) => return Err(TftpError::Tftp(format!("logging.file parent error: {}", e))),
        }
        let _ = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .map_err(|e| TftpError::Tftp(format!("logging.file not writable: {}", e)))?;
    }

    Ok(())
}
