//! Configuration management for veiltun
//!
//! Loads the relay configuration from a YAML file. Every field has a default,
//! so a partial file (or no file at all) yields a usable configuration.

use crate::constants::{DEFAULT_BUFFER_SIZE, DEFAULT_OBFS_KEY, MAX_PACKET_SIZE};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::warn;

/// TLS material and client verification settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to the server certificate chain (PEM)
    #[serde(default)]
    pub cert_path: Option<String>,
    /// Path to the server private key (PEM)
    #[serde(default)]
    pub key_path: Option<String>,
    /// Extra trust anchor for the client (PEM)
    #[serde(default)]
    pub ca_path: Option<String>,
    /// Server name presented by the client; defaults to the host of `server_addr`
    #[serde(default)]
    pub sni: Option<String>,
    /// Accept any server certificate (client only)
    #[serde(default)]
    pub insecure_skip_verify: bool,
    /// Serve a generated self-signed certificate when no pair is configured
    #[serde(default)]
    pub self_signed: bool,
}

/// Virtual interface settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunConfig {
    #[serde(default = "default_tun_address")]
    pub address: Ipv4Addr,
    #[serde(default = "default_tun_netmask")]
    pub netmask: Ipv4Addr,
    #[serde(default = "default_tun_mtu")]
    pub mtu: u16,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            address: default_tun_address(),
            netmask: default_tun_netmask(),
            mtu: default_tun_mtu(),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to logging theme configuration file
    #[serde(default = "default_log_theme_path")]
    pub theme_path: String,
    /// Whether to log to file
    #[serde(default)]
    pub to_file: bool,
    /// Log file path (used when to_file is true)
    #[serde(default = "default_log_file_path")]
    pub file_path: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            theme_path: default_log_theme_path(),
            to_file: false,
            file_path: default_log_file_path(),
        }
    }
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listener bind address (server role)
    #[serde(default = "default_local_addr")]
    pub local_addr: String,
    /// Address to dial (client role)
    #[serde(default)]
    pub server_addr: String,
    /// Interface read buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Idle read timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Enable the XOR obfuscation stage
    #[serde(default)]
    pub obfs: bool,
    /// Enable the compression stage
    #[serde(default)]
    pub compress: bool,
    /// Obfuscation key
    #[serde(default = "default_key")]
    pub key: String,
    /// Report transient relay errors
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub tun: TunConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_addr: default_local_addr(),
            server_addr: String::new(),
            buffer_size: default_buffer_size(),
            timeout: default_timeout(),
            obfs: false,
            compress: false,
            key: default_key(),
            verbose: false,
            tls: TlsConfig::default(),
            tun: TunConfig::default(),
            log: LogConfig::default(),
        }
    }
}

fn default_local_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_timeout() -> u64 {
    30
}

fn default_key() -> String {
    DEFAULT_OBFS_KEY.to_string()
}

fn default_tun_address() -> Ipv4Addr {
    Ipv4Addr::new(172, 16, 0, 1)
}

fn default_tun_netmask() -> Ipv4Addr {
    Ipv4Addr::new(255, 255, 255, 0)
}

fn default_tun_mtu() -> u16 {
    1500
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_log_theme_path() -> String {
    "config/logging_theme.yml".to_string()
}

fn default_log_file_path() -> String {
    "logs/veiltun.log".to_string()
}

impl Config {
    /// Load configuration from a YAML file
    pub async fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        match fs::read_to_string(&path).await {
            Ok(contents) => {
                let config = Self::from_yaml(&contents)?;
                config.validate()?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "Configuration file not found at '{}', using default configuration",
                    path.as_ref().display()
                );
                let config = Config::default();
                config.validate()?;
                Ok(config)
            }
            Err(e) => Err(anyhow::anyhow!(
                "Failed to read configuration file '{}': {}",
                path.as_ref().display(),
                e
            )),
        }
    }

    /// Parse configuration from YAML text without validating it
    pub fn from_yaml(contents: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse YAML configuration: {}", e))
    }

    /// Save configuration to a YAML file
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml).await?;
        Ok(())
    }

    /// Validate fields shared by both roles
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.log.level.to_uppercase().as_str()) {
            return Err(anyhow::anyhow!("Invalid log level: {}", self.log.level));
        }
        if self.log.to_file && self.log.file_path.trim().is_empty() {
            return Err(anyhow::anyhow!("Log file path cannot be empty when log.to_file is true"));
        }

        if self.buffer_size == 0 || self.buffer_size > MAX_PACKET_SIZE {
            return Err(anyhow::anyhow!(
                "Buffer size must be between 1 and {} bytes",
                MAX_PACKET_SIZE
            ));
        }
        if self.timeout == 0 {
            return Err(anyhow::anyhow!("Timeout must be greater than 0"));
        }
        if self.obfs && self.key.is_empty() {
            return Err(anyhow::anyhow!("Obfuscation key cannot be empty when obfs is enabled"));
        }

        let has_cert = self.tls.cert_path.as_ref().is_some_and(|p| !p.trim().is_empty());
        let has_key = self.tls.key_path.as_ref().is_some_and(|p| !p.trim().is_empty());
        if has_cert != has_key {
            return Err(anyhow::anyhow!(
                "TLS certificate and private key paths must be configured together"
            ));
        }

        if self.tun.mtu == 0 {
            return Err(anyhow::anyhow!("TUN MTU must be greater than 0"));
        }

        Ok(())
    }

    /// Validate the fields the server role depends on
    pub fn validate_server(&self) -> anyhow::Result<()> {
        self.validate()?;
        self.bind_addr()?;
        if self.tls.cert_path.is_none() && self.tls.key_path.is_none() && !self.tls.self_signed {
            return Err(anyhow::anyhow!(
                "tls.cert_path and tls.key_path are required in server mode"
            ));
        }
        Ok(())
    }

    /// Validate the fields the client role depends on
    pub fn validate_client(&self) -> anyhow::Result<()> {
        self.validate()?;
        if self.server_addr.trim().is_empty() {
            return Err(anyhow::anyhow!("server_addr is required in client mode"));
        }
        if !self.server_addr.contains(':') {
            return Err(anyhow::anyhow!(
                "Invalid server address '{}'. Expected 'host:port'",
                self.server_addr
            ));
        }
        Ok(())
    }

    /// Parsed listener address
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.local_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid local address '{}': {}", self.local_addr, e))
    }

    /// Idle read timeout
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}
