use aes_gcm::Aes256Gcm;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::keys::SessionKey;

/// Nonce length shared by both AEADs
pub const NONCE_LEN: usize = 12;

/// Poly1305 / GCM tag length
pub const TAG_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum EncryptError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Invalid key")]
    InvalidKey,
    #[error("Ciphertext too short")]
    CiphertextTooShort,
    #[error("Invalid seed length: {0}")]
    InvalidSeedLength(usize),
}

/// Lock a 32-byte seed under a password-derived key (AES-256-GCM).
///
/// Output layout: `nonce(12) || ciphertext || tag(16)`.
pub fn seal_seed(key: &[u8; 32], seed: &[u8; 32]) -> Result<Vec<u8>, EncryptError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncryptError::InvalidKey)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(aes_gcm::Nonce::from_slice(&nonce_bytes), seed.as_slice())
        .map_err(|_| EncryptError::EncryptionFailed)?;

    let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Open a seed locked by [`seal_seed`]. Fails on a wrong key.
pub fn open_seed(key: &[u8; 32], locked: &[u8]) -> Result<Zeroizing<[u8; 32]>, EncryptError> {
    if locked.len() < NONCE_LEN + TAG_LEN {
        return Err(EncryptError::CiphertextTooShort);
    }

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncryptError::InvalidKey)?;
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(aes_gcm::Nonce::from_slice(&locked[..NONCE_LEN]), &locked[NONCE_LEN..])
            .map_err(|_| EncryptError::DecryptionFailed)?,
    );

    if plaintext.len() != 32 {
        return Err(EncryptError::InvalidSeedLength(plaintext.len()));
    }
    let mut seed = Zeroizing::new([0u8; 32]);
    seed.copy_from_slice(&plaintext);
    Ok(seed)
}

/// Seal one pipe frame under a session key (ChaCha20-Poly1305).
///
/// Output layout: `nonce(12) || ciphertext || tag(16)`.
pub fn seal_frame(key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>, EncryptError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|_| EncryptError::InvalidKey)?;

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| EncryptError::EncryptionFailed)?;

    let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Open a frame sealed by [`seal_frame`]
pub fn open_frame(key: &SessionKey, sealed: &[u8]) -> Result<Vec<u8>, EncryptError> {
    if sealed.len() < NONCE_LEN {
        return Err(EncryptError::CiphertextTooShort);
    }

    let nonce = Nonce::from_slice(&sealed[..NONCE_LEN]);
    let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|_| EncryptError::InvalidKey)?;

    cipher
        .decrypt(nonce, &sealed[NONCE_LEN..])
        .map_err(|_| EncryptError::DecryptionFailed)
}
