//! Configuration types

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Address, License, PayPipeError, Result};

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Account address
    #[serde(default)]
    pub addr: String,

    /// Locked seed (base58)
    #[serde(default)]
    pub cipher: String,

    /// Local SOCKS5 listen address
    #[serde(default = "default_local_server")]
    pub local_server: String,

    /// License text (JSON or base58 JSON)
    #[serde(default)]
    pub license: String,

    /// Relay candidates (format: "address@host:port")
    #[serde(default)]
    pub services: Vec<String>,

    /// Per-candidate probe bound
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Receipt cadence on the pay channel
    #[serde(default = "default_receipt_interval_secs")]
    pub receipt_interval_secs: u64,
}

fn default_local_server() -> String {
    "127.0.0.1:1080".to_string()
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_receipt_interval_secs() -> u64 {
    30
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: String::new(),
            cipher: String::new(),
            local_server: default_local_server(),
            license: String::new(),
            services: Vec::new(),
            probe_timeout_secs: default_probe_timeout_secs(),
            receipt_interval_secs: default_receipt_interval_secs(),
        }
    }
}

impl ClientConfig {
    /// Check the fields a client cannot start without
    pub fn validate(&self) -> Result<()> {
        if self.addr.is_empty() {
            return Err(PayPipeError::InvalidConfig("address is empty".to_string()));
        }
        Address::parse(&self.addr)?;
        if self.cipher.is_empty() {
            return Err(PayPipeError::InvalidConfig("cipher is empty".to_string()));
        }
        if self.local_server.is_empty() {
            return Err(PayPipeError::InvalidConfig(
                "local server address is empty".to_string(),
            ));
        }
        License::parse(&self.license)?;
        if self.services.is_empty() {
            return Err(PayPipeError::InvalidConfig(
                "at least one service is required".to_string(),
            ));
        }
        if self.receipt_interval_secs == 0 {
            return Err(PayPipeError::InvalidConfig(
                "receipt interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn receipt_interval(&self) -> Duration {
        Duration::from_secs(self.receipt_interval_secs)
    }
}

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,

    /// Per-read idle bound on pipes; `None` disables it
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: Option<u64>,

    /// Expected client receipt cadence; a channel silent for three intervals
    /// is dropped
    #[serde(default = "default_receipt_interval_secs")]
    pub receipt_interval_secs: u64,

    /// Bytes a customer may use beyond its last receipt
    #[serde(default = "default_unpaid_allowance_bytes")]
    pub unpaid_allowance_bytes: u64,

    /// Serve pipes only for addresses with an open pay channel
    #[serde(default = "default_require_pay_channel")]
    pub require_pay_channel: bool,
}

fn default_listen_addr() -> String {
    "0.0.0.0:7788".to_string()
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_dial_timeout_secs() -> u64 {
    10
}

fn default_idle_timeout_secs() -> Option<u64> {
    Some(300)
}

fn default_unpaid_allowance_bytes() -> u64 {
    8 * 1024 * 1024
}

fn default_require_pay_channel() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            dial_timeout_secs: default_dial_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            receipt_interval_secs: default_receipt_interval_secs(),
            unpaid_allowance_bytes: default_unpaid_allowance_bytes(),
            require_pay_channel: default_require_pay_channel(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(PayPipeError::InvalidConfig("listen address is empty".to_string()));
        }
        if self.handshake_timeout_secs == 0 || self.dial_timeout_secs == 0 {
            return Err(PayPipeError::InvalidConfig(
                "timeouts must be positive".to_string(),
            ));
        }
        if self.receipt_interval_secs == 0 {
            return Err(PayPipeError::InvalidConfig(
                "receipt interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    /// Bound on each receipt read
    pub fn receipt_deadline(&self) -> Duration {
        Duration::from_secs(self.receipt_interval_secs.saturating_mul(3))
    }
}
