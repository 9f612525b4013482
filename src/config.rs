// src/config.rs

//! Manages server configuration: loading, defaults, validation, and the
//! typed key/value surface used by runtime configuration updates.

use crate::core::ServerError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// TLS material for the control channel. Mumble control is always TLS.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TlsConfig {
    #[serde(default = "default_cert_path")]
    pub cert_path: String,
    #[serde(default = "default_key_path")]
    pub key_path: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: default_cert_path(),
            key_path: default_key_path(),
        }
    }
}

fn default_cert_path() -> String {
    "cert.pem".to_string()
}
fn default_key_path() -> String {
    "key.pem".to_string()
}

/// Snapshot/op-log ("freezer") settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PersistenceConfig {
    /// Full snapshot after this many logged mutations.
    #[serde(default = "default_snapshot_ops")]
    pub snapshot_ops: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            snapshot_ops: default_snapshot_ops(),
        }
    }
}

fn default_snapshot_ops() -> u32 {
    100
}

/// Public-server registration. Disabled unless both `url` and `name` are
/// set.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RegisterConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub name: String,
    /// Hostname to advertise; falls back to the bind address.
    #[serde(default)]
    pub host: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_server_id")]
    pub server_id: u32,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_max_users")]
    pub max_users: u32,
    /// Per-client voice bandwidth cap in bits per second.
    #[serde(default = "default_max_bandwidth")]
    pub max_bandwidth: u32,
    #[serde(default = "default_welcome_text")]
    pub welcome_text: String,
    #[serde(default = "default_allow_html")]
    pub allow_html: bool,
    #[serde(default = "default_max_text_message_length")]
    pub max_text_message_length: usize,
    #[serde(default = "default_max_image_message_length")]
    pub max_image_message_length: usize,
    /// `sha1$<hex-salt>$<hex-digest>` record; empty disables SuperUser.
    #[serde(default)]
    pub super_user_password: String,

    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub register: RegisterConfig,
}

fn default_server_id() -> u32 {
    1
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    64738
}
fn default_data_dir() -> String {
    ".".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_users() -> u32 {
    100
}
fn default_max_bandwidth() -> u32 {
    72_000
}
fn default_welcome_text() -> String {
    "Welcome to this server.".to_string()
}
fn default_allow_html() -> bool {
    true
}
fn default_max_text_message_length() -> usize {
    5_000
}
fn default_max_image_message_length() -> usize {
    131_072
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_id: default_server_id(),
            host: default_host(),
            port: default_port(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            max_users: default_max_users(),
            max_bandwidth: default_max_bandwidth(),
            welcome_text: default_welcome_text(),
            allow_html: default_allow_html(),
            max_text_message_length: default_max_text_message_length(),
            max_image_message_length: default_max_image_message_length(),
            super_user_password: String::new(),
            tls: TlsConfig::default(),
            persistence: PersistenceConfig::default(),
            register: RegisterConfig::default(),
        }
    }
}

impl Config {
    /// Loads and validates a TOML configuration file.
    pub fn from_file(path: &str) -> Result<Self, ServerError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("cannot read {path}: {e}")))?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| ServerError::Config(format!("cannot parse {path}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.port == 0 {
            return Err(ServerError::Config("port must not be 0".into()));
        }
        if self.max_users == 0 {
            return Err(ServerError::Config("max_users must be at least 1".into()));
        }
        if self.persistence.snapshot_ops == 0 {
            return Err(ServerError::Config("snapshot_ops must be at least 1".into()));
        }
        Ok(())
    }

    pub fn snapshot_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("timbre.snapshot")
    }

    pub fn log_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("timbre.oplog")
    }

    pub fn registration_enabled(&self) -> bool {
        !self.register.url.is_empty() && !self.register.name.is_empty()
    }

    /// Applies one typed configuration update, as carried on the control
    /// loop's configuration queue and in replayed `ConfigSet` ops.
    pub fn set_key(&mut self, key: &str, value: &str) -> Result<(), ServerError> {
        let bad = |key: &str, value: &str| {
            ServerError::Config(format!("invalid value {value:?} for key {key:?}"))
        };
        match key {
            "Address" => self.host = value.to_string(),
            "Port" => self.port = value.parse().map_err(|_| bad(key, value))?,
            "MaxUsers" => self.max_users = value.parse().map_err(|_| bad(key, value))?,
            "MaxBandwidth" => self.max_bandwidth = value.parse().map_err(|_| bad(key, value))?,
            "MaxTextMessageLength" => {
                self.max_text_message_length = value.parse().map_err(|_| bad(key, value))?
            }
            "MaxImageMessageLength" => {
                self.max_image_message_length = value.parse().map_err(|_| bad(key, value))?
            }
            "WelcomeText" => self.welcome_text = value.to_string(),
            "AllowHTML" => self.allow_html = value.parse().map_err(|_| bad(key, value))?,
            "SuperUserPassword" => self.super_user_password = value.to_string(),
            other => {
                return Err(ServerError::Config(format!("unknown configuration key {other:?}")));
            }
        }
        Ok(())
    }

    /// Reads one typed configuration value by key name.
    pub fn get_key(&self, key: &str) -> Option<String> {
        let value = match key {
            "Address" => self.host.clone(),
            "Port" => self.port.to_string(),
            "MaxUsers" => self.max_users.to_string(),
            "MaxBandwidth" => self.max_bandwidth.to_string(),
            "MaxTextMessageLength" => self.max_text_message_length.to_string(),
            "MaxImageMessageLength" => self.max_image_message_length.to_string(),
            "WelcomeText" => self.welcome_text.clone(),
            "AllowHTML" => self.allow_html.to_string(),
            "SuperUserPassword" => self.super_user_password.clone(),
            _ => return None,
        };
        Some(value)
    }
}
