//! PayPipe Cryptography
//!
//! Primitives shared by every PayPipe component:
//!
//! - Ed25519 signing keypairs and X25519 key-agreement keypairs
//! - Seed-based derivation of both keypairs from one 32-byte secret
//! - Pairwise session keys (X25519 + HKDF-SHA256)
//! - Password locking of the seed (Argon2id + AES-256-GCM)
//! - Frame sealing for tunneled pipes (ChaCha20-Poly1305)

mod encrypt;
mod kdf;
mod keys;
mod sign;

pub use encrypt::*;
pub use kdf::*;
pub use keys::*;
pub use sign::*;
