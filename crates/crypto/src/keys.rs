use ed25519_dalek::{SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// HKDF salt for deriving both long-term keypairs from a seed
const IDENTITY_SALT: &[u8] = b"paypipe-identity-v1";
const KEY_AGREEMENT_INFO: &[u8] = b"key-agreement";
const SIGNING_INFO: &[u8] = b"signing";

/// HKDF salt for pairwise session keys
const SESSION_SALT: &[u8] = b"paypipe-session-v1";

/// 32-byte secret seed both keypairs are derived from
pub type Seed = Zeroizing<[u8; 32]>;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid public key length")]
    InvalidPublicKey,
    #[error("Invalid secret key length")]
    InvalidSecretKey,
    #[error("Key derivation failed")]
    DerivationFailed,
}

/// Keypair for signing (Ed25519)
pub struct SigningKeypair {
    pub signing_key: SigningKey,
    pub verifying_key: VerifyingKey,
}

impl Clone for SigningKeypair {
    fn clone(&self) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&self.signing_key.to_bytes()),
            verifying_key: self.verifying_key,
        }
    }
}

impl SigningKeypair {
    /// Generate a new random signing keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Get the public key as bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Create from raw secret key bytes
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }
}

/// Keypair for key agreement (X25519). Never used to sign.
pub struct EncryptionKeypair {
    pub secret: StaticSecret,
    pub public: X25519PublicKey,
}

impl Clone for EncryptionKeypair {
    fn clone(&self) -> Self {
        let secret = StaticSecret::from(*self.secret.as_bytes());
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }
}

impl EncryptionKeypair {
    /// Generate a new random key-agreement keypair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Get the public key as bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Create from raw secret key bytes
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let secret = StaticSecret::from(*secret);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Perform Diffie-Hellman key exchange
    pub fn diffie_hellman(&self, their_public: &[u8; 32]) -> Zeroizing<[u8; 32]> {
        let their_public = X25519PublicKey::from(*their_public);
        let shared = self.secret.diffie_hellman(&their_public);
        Zeroizing::new(*shared.as_bytes())
    }
}

/// Both long-term keypairs of an account, rebuilt from its seed.
#[derive(Clone)]
pub struct KeyMaterial {
    pub agreement: EncryptionKeypair,
    pub signing: SigningKeypair,
}

impl KeyMaterial {
    /// Derive both keypairs from a seed under independent HKDF labels.
    pub fn from_seed(seed: &[u8; 32]) -> Result<Self, KeyError> {
        let agreement_secret = hkdf32(IDENTITY_SALT, seed, KEY_AGREEMENT_INFO)?;
        let signing_secret = hkdf32(IDENTITY_SALT, seed, SIGNING_INFO)?;
        Ok(Self {
            agreement: EncryptionKeypair::from_secret_bytes(&agreement_secret),
            signing: SigningKeypair::from_secret_bytes(&signing_secret),
        })
    }

    pub fn agreement_public(&self) -> [u8; 32] {
        self.agreement.public_key_bytes()
    }

    pub fn signing_public(&self) -> [u8; 32] {
        self.signing.public_key_bytes()
    }
}

/// Symmetric key shared by exactly two peers.
///
/// Zeroized on drop; `Debug` never prints the key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Derive the session key between our key-agreement keypair and a peer's
/// public key. Both ends obtain the same key.
pub fn derive_session_key(
    ours: &EncryptionKeypair,
    peer_public: &[u8; 32],
) -> Result<SessionKey, KeyError> {
    let shared = ours.diffie_hellman(peer_public);
    let key = hkdf32(SESSION_SALT, &shared[..], &[])?;
    Ok(SessionKey(*key))
}

/// Generate a fresh random seed
pub fn generate_seed() -> Seed {
    let mut seed = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(&mut seed[..]);
    seed
}

/// Hash data using SHA-256
pub fn hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn hkdf32(salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<Zeroizing<[u8; 32]>, KeyError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(info, &mut okm[..])
        .map_err(|_| KeyError::DerivationFailed)?;
    Ok(okm)
}
