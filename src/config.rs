//! Connection configuration
//!
//! A [`ConnectionConfig`] is the typed form of the `open` argument list.
//! It can also be read from a TOML profile file:
//!
//! ```toml
//! [profiles.local]
//! dbtype = "yottadb"
//! path = "/usr/local/lib/yottadb/r130"
//!
//! [profiles.remote]
//! dbtype = "iris"
//! host = "10.0.0.12"
//! port = 7041
//! namespace = "USER"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use dbx_protocol::{leading_int, Argument};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::driver::DbType;
use crate::error::{DbxError, DbxResult};

/// Timeout applied when none (or a non-positive one) is given
pub const DEFAULT_TIMEOUT: u64 = 30;

/// Legacy gateway defaults
pub const DEFAULT_GATEWAY_SERVER: &str = "LOCAL";
pub const DEFAULT_GATEWAY_UCI: &str = "USER";
pub const DEFAULT_GATEWAY_HOST: &str = "127.0.0.1";
pub const DEFAULT_GATEWAY_PORT: u16 = 7041;

/// Server software tag that selects the legacy gateway protocol
const GATEWAY_SOFTWARE_TAG: &str = "zmgwsi";

/// How a connection reaches its database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// In-process calls into the vendor library
    Native,
    /// The primary TCP protocol
    Network,
    /// The legacy MGWSI gateway
    Gateway,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(rename = "dbtype")]
    pub db_type: DbType,
    /// Install (or shared library) directory of the database
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Namespace (Cache/IRIS) or UCI (legacy gateway)
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub input_device: String,
    #[serde(default)]
    pub output_device: String,
    #[serde(default)]
    pub debug: String,
    /// Newline separated `KEY=VALUE` lines exported before connecting
    #[serde(default)]
    pub env: String,
    /// Server name used by the legacy gateway
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub server_software: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT
}

/// Layout of a profile file
#[derive(Debug, Default, Deserialize)]
struct ProfileFile {
    #[serde(default)]
    profiles: HashMap<String, ConnectionConfig>,
}

impl ConnectionConfig {
    pub fn new(db_type: DbType) -> Self {
        Self {
            db_type,
            path: None,
            host: None,
            port: None,
            username: String::new(),
            password: String::new(),
            namespace: String::new(),
            input_device: String::new(),
            output_device: String::new(),
            debug: String::new(),
            env: String::new(),
            server: String::new(),
            server_software: String::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Build a configuration from the decoded `open` arguments.
    ///
    /// Positions: 0 dbtype, 1 path, 2 host, 3 port, 4 user, 5 password,
    /// 6 namespace, 7 input device, 8 output device, 9 debug, 10 environment
    /// block, 11 server name, 12 server software, 13 timeout.
    pub fn from_arguments(args: &[Argument<'_>]) -> DbxResult<Self> {
        let text = |n: usize| -> String {
            args.get(n)
                .map(|a| a.as_str().trim().to_string())
                .unwrap_or_default()
        };
        let non_empty = |n: usize| -> Option<String> { Some(text(n)).filter(|s| !s.is_empty()) };

        let db_type: DbType = text(0).parse()?;
        let mut config = Self::new(db_type);
        config.path = non_empty(1).map(PathBuf::from);
        config.host = non_empty(2);
        config.port = non_empty(3).map(|p| leading_int(p.as_bytes()).clamp(0, u16::MAX as i64) as u16);
        config.username = text(4);
        config.password = args.get(5).map(|a| a.as_str().into_owned()).unwrap_or_default();
        config.namespace = text(6);
        config.input_device = text(7);
        config.output_device = text(8);
        config.debug = text(9);
        config.env = args.get(10).map(|a| a.as_str().into_owned()).unwrap_or_default();
        config.server = text(11);
        config.server_software = text(12);
        config.timeout = normalise_timeout(leading_int(text(13).as_bytes()));
        Ok(config)
    }

    /// The argument list `from_arguments` reads, for building `open` requests.
    pub fn to_arguments(&self) -> Vec<String> {
        vec![
            self.db_type.to_string(),
            self.path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
            self.host.clone().unwrap_or_default(),
            self.port.map(|p| p.to_string()).unwrap_or_default(),
            self.username.clone(),
            self.password.clone(),
            self.namespace.clone(),
            self.input_device.clone(),
            self.output_device.clone(),
            self.debug.clone(),
            self.env.clone(),
            self.server.clone(),
            self.server_software.clone(),
            self.timeout.to_string(),
        ]
    }

    /// Load `[profiles.<name>]` from a TOML file.
    pub fn load_profile(path: &Path, name: &str) -> DbxResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: ProfileFile = toml::from_str(&content)?;
        let mut config = file
            .profiles
            .get(name)
            .cloned()
            .ok_or_else(|| DbxError::Config(format!("Profile not found: {}", name)))?;
        config.timeout = normalise_timeout(config.timeout as i64);
        Ok(config)
    }

    /// Derive the transport from the fields that are present.
    pub fn transport(&self) -> DbxResult<Transport> {
        if self.path.is_some() {
            return Ok(Transport::Native);
        }
        if self.host.is_some() && self.port.is_some() {
            if self.server_software.to_ascii_lowercase().contains(GATEWAY_SOFTWARE_TAG) {
                return Ok(Transport::Gateway);
            }
            return Ok(Transport::Network);
        }
        Err(DbxError::UnknownPath)
    }

    /// Export the environment block, one `KEY=VALUE` per line. A line
    /// without `=` ends the block.
    pub fn apply_environment(&self) {
        for line in self.env.lines() {
            let Some((key, value)) = line.trim_end_matches('\r').split_once('=') else {
                break;
            };
            if key.is_empty() {
                break;
            }
            debug!("Setting environment variable {}", key);
            std::env::set_var(key, value);
        }
    }

    pub fn host_or_default(&self) -> &str {
        self.host
            .as_deref()
            .filter(|h| !h.is_empty())
            .unwrap_or(DEFAULT_GATEWAY_HOST)
    }

    pub fn gateway_port(&self) -> u16 {
        self.port.filter(|p| *p != 0).unwrap_or(DEFAULT_GATEWAY_PORT)
    }

    pub fn gateway_server(&self) -> &str {
        if self.server.is_empty() {
            DEFAULT_GATEWAY_SERVER
        } else {
            &self.server
        }
    }

    pub fn gateway_uci(&self) -> &str {
        if self.namespace.is_empty() {
            DEFAULT_GATEWAY_UCI
        } else {
            &self.namespace
        }
    }
}

fn normalise_timeout(value: i64) -> u64 {
    if value < 1 {
        DEFAULT_TIMEOUT
    } else {
        value as u64
    }
}
