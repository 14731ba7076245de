//! Request signatures: HMAC-SHA256 over the request digest, hex-encoded.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-sovereign-signature";
/// Carries the hex cache-key digest the signature covers.
pub const DIGEST_HEADER: &str = "x-sovereign-digest";

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("invalid signing key")]
    InvalidKey,
}

pub fn sign(secret: &[u8], digest: &str) -> Result<String, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::InvalidKey)?;
    mac.update(digest.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a hex signature against `digest`.
pub fn verify(secret: &[u8], digest: &str, signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(digest.as_bytes());
    mac.verify_slice(&expected).is_ok()
}
