//! On-disk account record

use std::path::Path;

use paypipe_crypto::KdfParams;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::paths::expand_path;
use crate::{KeystoreError, Result};

/// Current account file format version
pub const ACCOUNT_VERSION: u32 = 1;

/// Persisted account: the address and the password-locked seed.
///
/// `kdf` is absent in records written with default parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub version: u32,
    pub address: String,
    /// Locked seed, base58
    pub cipher: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kdf: Option<KdfParams>,
}

impl AccountRecord {
    /// Load a record from disk.
    ///
    /// A missing file is an empty account (`Ok(None)`); a file that exists but
    /// does not parse is [`KeystoreError::Corrupted`].
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let path = expand_path(path);
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path).map_err(KeystoreError::ReadError)?;
        let record: AccountRecord = serde_json::from_str(&content)
            .map_err(|e| KeystoreError::Corrupted(e.to_string()))?;
        if record.address.is_empty() || record.cipher.is_empty() {
            return Err(KeystoreError::Corrupted(
                "address or cipher is empty".to_string(),
            ));
        }

        info!("Loaded account {} from {:?}", record.address, path);
        Ok(Some(record))
    }

    /// Write the record, creating parent directories as needed
    pub fn save(&self, path: &Path) -> Result<()> {
        let path = expand_path(path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(KeystoreError::CreateDirError)?;
            }
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| KeystoreError::Corrupted(e.to_string()))?;
        std::fs::write(&path, content).map_err(KeystoreError::WriteError)?;

        info!("Saved account {} to {:?}", self.address, path);
        Ok(())
    }

    pub fn kdf_params(&self) -> KdfParams {
        self.kdf.unwrap_or_default()
    }
}
