//! PayPipe Keystore
//!
//! Account storage and the password-gated key vault.
//!
//! ## Features
//!
//! - `KeyVault`: locked/unlocked account keys, session-key derivation, signing
//! - `AccountRecord`: the on-disk account file
//! - Cross-platform path expansion (`~`) and default locations

mod account;
mod paths;
mod vault;

pub use account::{AccountRecord, ACCOUNT_VERSION};
pub use paths::{default_account_path, default_config_dir, expand_path};
pub use vault::KeyVault;

use paypipe_core::{ErrorClass, PayPipeError};
use paypipe_crypto::{EncryptError, KdfError, KeyError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("Vault is locked")]
    Locked,

    #[error("Account file is corrupted: {0}")]
    Corrupted(String),

    #[error("Failed to read account file: {0}")]
    ReadError(std::io::Error),

    #[error("Failed to write account file: {0}")]
    WriteError(std::io::Error),

    #[error("Failed to create directory: {0}")]
    CreateDirError(std::io::Error),

    #[error("Invalid locked key: {0}")]
    InvalidCipher(String),

    #[error("Unlocked keys do not match address {0}")]
    AddressMismatch(String),

    #[error("Key derivation error: {0}")]
    Kdf(#[from] KdfError),

    #[error("Encryption error: {0}")]
    Encrypt(#[from] EncryptError),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error(transparent)]
    Core(#[from] PayPipeError),
}

impl KeystoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Locked | Self::AddressMismatch(_) | Self::Encrypt(_) => {
                ErrorClass::Authorization
            }
            Self::Core(e) => e.class(),
            _ => ErrorClass::Startup,
        }
    }
}

pub type Result<T> = std::result::Result<T, KeystoreError>;
