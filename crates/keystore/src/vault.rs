//! Password-gated account keys

use paypipe_core::{Address, Signature};
use paypipe_crypto::{
    derive_session_key, generate_seed, open_seed, password_key, seal_seed, sign_data, KdfParams,
    KeyMaterial, SessionKey,
};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::account::{AccountRecord, ACCOUNT_VERSION};
use crate::{KeystoreError, Result};

enum VaultState {
    Locked,
    Unlocked(KeyMaterial),
}

/// An account's keys, locked until the right password is presented.
///
/// Locked: address, locked seed and KDF parameters only. Unlocked: also the
/// live keypairs rebuilt from the seed. Only [`KeyVault::unlock`] moves a
/// vault to the unlocked state.
pub struct KeyVault {
    address: Address,
    locked_seed: Vec<u8>,
    kdf: KdfParams,
    state: VaultState,
}

impl KeyVault {
    /// Open a locked vault from a stored record
    pub fn from_record(record: &AccountRecord) -> Result<Self> {
        let address = Address::parse(&record.address)?;
        let locked_seed = bs58::decode(&record.cipher)
            .into_vec()
            .map_err(|e| KeystoreError::InvalidCipher(e.to_string()))?;
        Ok(Self {
            address,
            locked_seed,
            kdf: record.kdf_params(),
            state: VaultState::Locked,
        })
    }

    /// Open a locked vault from an address and base58 locked seed
    pub fn from_strings(address: &str, cipher: &str) -> Result<Self> {
        Self::from_record(&AccountRecord {
            version: ACCOUNT_VERSION,
            address: address.to_string(),
            cipher: cipher.to_string(),
            kdf: None,
        })
    }

    /// Generate a fresh account. The returned vault is already unlocked.
    pub fn create_account(password: &str, kdf: KdfParams) -> Result<(Self, AccountRecord)> {
        let seed = generate_seed();
        let keys = KeyMaterial::from_seed(&seed)?;
        let address = Address::from_keys(&keys.agreement_public(), &keys.signing_public());

        let key = password_key(password, address.agreement_key(), &kdf)?;
        let locked_seed = seal_seed(&key, &seed)?;

        let record = AccountRecord {
            version: ACCOUNT_VERSION,
            address: address.to_string(),
            cipher: bs58::encode(&locked_seed).into_string(),
            kdf: (kdf != KdfParams::default()).then_some(kdf),
        };
        debug!("Created account {}", address);

        let vault = Self {
            address,
            locked_seed,
            kdf,
            state: VaultState::Unlocked(keys),
        };
        Ok((vault, record))
    }

    /// Try the password. Returns `false` and stays locked on any failure.
    pub fn unlock(&mut self, password: &str) -> bool {
        match self.open(password) {
            Ok(keys) => {
                self.state = VaultState::Unlocked(keys);
                debug!("Unlocked account {}", self.address);
                true
            }
            Err(e) => {
                warn!("Failed to unlock account {}: {}", self.address, e);
                false
            }
        }
    }

    fn open(&self, password: &str) -> Result<KeyMaterial> {
        let key = password_key(password, self.address.agreement_key(), &self.kdf)?;
        let seed: Zeroizing<[u8; 32]> = open_seed(&key, &self.locked_seed)?;
        let keys = KeyMaterial::from_seed(&seed)?;

        if keys.agreement_public() != *self.address.agreement_key()
            || keys.signing_public() != *self.address.signing_key()
        {
            return Err(KeystoreError::AddressMismatch(self.address.to_string()));
        }
        Ok(keys)
    }

    /// Drop the live keypairs
    pub fn lock(&mut self) {
        self.state = VaultState::Locked;
    }

    pub fn is_unlocked(&self) -> bool {
        matches!(self.state, VaultState::Unlocked(_))
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Record that persists this vault
    pub fn record(&self) -> AccountRecord {
        AccountRecord {
            version: ACCOUNT_VERSION,
            address: self.address.to_string(),
            cipher: bs58::encode(&self.locked_seed).into_string(),
            kdf: (self.kdf != KdfParams::default()).then_some(self.kdf),
        }
    }

    fn keys(&self) -> Result<&KeyMaterial> {
        match &self.state {
            VaultState::Unlocked(keys) => Ok(keys),
            VaultState::Locked => Err(KeystoreError::Locked),
        }
    }

    /// Session key shared with the owner of `peer_public`
    pub fn derive_session_key(&self, peer_public: &[u8; 32]) -> Result<SessionKey> {
        let keys = self.keys()?;
        Ok(derive_session_key(&keys.agreement, peer_public)?)
    }

    /// Session key shared with a peer address
    pub fn session_key_for(&self, peer: &Address) -> Result<SessionKey> {
        self.derive_session_key(peer.agreement_key())
    }

    /// Sign with the account's Ed25519 key
    pub fn sign(&self, payload: &[u8]) -> Result<Signature> {
        let keys = self.keys()?;
        Ok(sign_data(&keys.signing, payload))
    }
}

impl std::fmt::Debug for KeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyVault")
            .field("address", &self.address.as_str())
            .field("unlocked", &self.is_unlocked())
            .finish()
    }
}
