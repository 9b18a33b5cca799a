//! Signing and verification for pay-channel structures

use paypipe_crypto::verify_signature;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{Address, License, PayReceipt, Signature};

/// Current unix time in seconds
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Build and sign a receipt acknowledging `consumed` bytes.
///
/// `sign` receives the signable bytes; callers pass their keypair or vault.
pub fn sign_pay_receipt<F, E>(
    user: &Address,
    relay: &Address,
    seq: u64,
    consumed: u64,
    sign: F,
) -> Result<PayReceipt, E>
where
    F: FnOnce(&[u8]) -> Result<Signature, E>,
{
    let timestamp = unix_now();
    let data = PayReceipt::signable_data(
        user.signing_key(),
        relay.signing_key(),
        seq,
        consumed,
        timestamp,
    );
    let signature = sign(&data)?;
    Ok(PayReceipt {
        user: user.clone(),
        relay: relay.clone(),
        seq,
        consumed,
        timestamp,
        signature,
    })
}

/// Verify a receipt's signature against the user address it names
pub fn verify_pay_receipt(receipt: &PayReceipt) -> bool {
    let data = PayReceipt::signable_data(
        receipt.user.signing_key(),
        receipt.relay.signing_key(),
        receipt.seq,
        receipt.consumed,
        receipt.timestamp,
    );
    verify_signature(receipt.user.signing_key(), &data, &receipt.signature)
}

/// Verify the proof a user attaches when opening a pay channel: a signature
/// by the license owner over the license's serialized form.
pub fn verify_license_proof(license: &License, sig: &Signature) -> bool {
    let Ok(data) = license.signable_bytes() else {
        return false;
    };
    verify_signature(license.user_addr.signing_key(), &data, sig)
}
