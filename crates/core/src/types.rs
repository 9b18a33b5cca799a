//! Identity, license and service types

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

use crate::{PayPipeError, Result};

/// 32-byte public key (X25519 or Ed25519)
pub type PublicKey = [u8; 32];

/// 64-byte Ed25519 signature
pub type Signature = [u8; 64];

/// Prefix of every textual address
pub const ADDRESS_PREFIX: &str = "PP";

/// Account identity: `"PP" + base58(x25519_public || ed25519_public)`.
///
/// Both public keys are recoverable from the text, which is what lets a relay
/// derive a session key for, and verify signatures from, any caller that
/// presents an address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    text: String,
    agreement: PublicKey,
    signing: PublicKey,
}

impl Address {
    /// Build the address of a key pair
    pub fn from_keys(agreement: &PublicKey, signing: &PublicKey) -> Self {
        let mut raw = [0u8; 64];
        raw[..32].copy_from_slice(agreement);
        raw[32..].copy_from_slice(signing);
        Self {
            text: format!("{}{}", ADDRESS_PREFIX, bs58::encode(raw).into_string()),
            agreement: *agreement,
            signing: *signing,
        }
    }

    /// Parse and validate an address string
    pub fn parse(text: &str) -> Result<Self> {
        let body = text
            .strip_prefix(ADDRESS_PREFIX)
            .ok_or_else(|| PayPipeError::InvalidAddress(format!("missing prefix: {}", text)))?;

        let raw = bs58::decode(body)
            .into_vec()
            .map_err(|e| PayPipeError::InvalidAddress(e.to_string()))?;
        if raw.len() != 64 {
            return Err(PayPipeError::InvalidAddress(format!(
                "expected 64 key bytes, got {}",
                raw.len()
            )));
        }

        let mut agreement = [0u8; 32];
        let mut signing = [0u8; 32];
        agreement.copy_from_slice(&raw[..32]);
        signing.copy_from_slice(&raw[32..]);
        Ok(Self {
            text: text.to_string(),
            agreement,
            signing,
        })
    }

    /// X25519 public key (session key agreement)
    pub fn agreement_key(&self) -> &PublicKey {
        &self.agreement
    }

    /// Ed25519 public key (signature verification)
    pub fn signing_key(&self) -> &PublicKey {
        &self.signing
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl TryFrom<String> for Address {
    type Error = PayPipeError;

    fn try_from(text: String) -> Result<Self> {
        Self::parse(&text)
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        addr.text
    }
}

impl std::str::FromStr for Address {
    type Err = PayPipeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Externally issued usage license.
///
/// The license authority is outside this workspace; `issuer_sig` is carried
/// opaquely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct License {
    pub user_addr: Address,
    /// Unix seconds
    pub start: u64,
    /// Unix seconds
    pub end: u64,
    #[serde(default)]
    pub issuer_sig: String,
}

impl License {
    /// Parse a license from raw JSON or from base58-encoded JSON
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if let Ok(license) = serde_json::from_str(text) {
            return Ok(license);
        }
        let raw = bs58::decode(text)
            .into_vec()
            .map_err(|e| PayPipeError::InvalidLicense(e.to_string()))?;
        serde_json::from_slice(&raw).map_err(|e| PayPipeError::InvalidLicense(e.to_string()))
    }

    /// Base58 text form, accepted by [`License::parse`]
    pub fn encode(&self) -> Result<String> {
        Ok(bs58::encode(self.signable_bytes()?).into_string())
    }

    /// Bytes the user signs when opening a pay channel
    pub fn signable_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| PayPipeError::SerializationError(e.to_string()))
    }

    pub fn is_valid_at(&self, now: u64) -> bool {
        self.start <= now && now < self.end
    }

    /// Fails unless the license was issued to `account`
    pub fn check_owner(&self, account: &Address) -> Result<()> {
        if self.user_addr != *account {
            return Err(PayPipeError::AddressMismatch {
                license: self.user_addr.to_string(),
                account: account.to_string(),
            });
        }
        Ok(())
    }
}

/// A relay candidate, parsed from `"<address>@<host>:<port>"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub id: Address,
    pub host: String,
    pub port: u16,
    /// Measured once by the endpoint probe
    pub latency: Option<Duration>,
    pub reachable: bool,
}

impl ServiceDescriptor {
    pub fn parse(text: &str) -> Result<Self> {
        let (id, host_port) = text
            .split_once('@')
            .ok_or_else(|| PayPipeError::InvalidService(format!("missing '@': {}", text)))?;
        let (host, port) = host_port
            .rsplit_once(':')
            .ok_or_else(|| PayPipeError::InvalidService(format!("missing port: {}", text)))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(PayPipeError::InvalidService(format!("empty host: {}", text)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| PayPipeError::InvalidService(format!("bad port {}: {}", port, e)))?;

        Ok(Self {
            id: Address::parse(id)?,
            host: host.to_string(),
            port,
            latency: None,
            reachable: false,
        })
    }

    /// `host:port` suitable for `TcpStream::connect`
    pub fn net_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.net_addr())
    }
}

/// Signed consumption receipt, sent by the user over the pay channel.
///
/// `consumed` is the cumulative byte count the user acknowledges; `seq` is
/// strictly increasing per channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayReceipt {
    pub user: Address,
    pub relay: Address,
    pub seq: u64,
    pub consumed: u64,
    pub timestamp: u64,
    #[serde(with = "BigArray")]
    pub signature: Signature,
}

impl PayReceipt {
    /// Layout: `user_signing(32) || relay_signing(32) || seq || consumed || timestamp`,
    /// integers little-endian.
    pub fn signable_data(
        user: &PublicKey,
        relay: &PublicKey,
        seq: u64,
        consumed: u64,
        timestamp: u64,
    ) -> Vec<u8> {
        let mut data = Vec::with_capacity(32 + 32 + 8 + 8 + 8);
        data.extend_from_slice(user);
        data.extend_from_slice(relay);
        data.extend_from_slice(&seq.to_le_bytes());
        data.extend_from_slice(&consumed.to_le_bytes());
        data.extend_from_slice(&timestamp.to_le_bytes());
        data
    }
}
