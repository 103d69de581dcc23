//! Webhook payload signing
//!
//! HMAC-SHA256 signatures over the exact payload bytes. Receivers verify the
//! `X-Signature` header against the subscription secret within a 5-minute
//! timestamp skew window.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Create an HMAC-SHA256 signature for a webhook payload
///
/// Returns the lowercase hex digest. The wire header carries it as
/// `X-Signature: sha256=<hex>`.
pub fn sign_hmac(payload: &[u8], secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");

    mac.update(payload);
    let result = mac.finalize();

    hex::encode(result.into_bytes())
}

/// Verify an HMAC-SHA256 signature
///
/// Constant-time comparison to prevent timing attacks.
pub fn verify_hmac(payload: &[u8], signature_hex: &str, secret: &str) -> bool {
    let computed = sign_hmac(payload, secret);

    computed.as_bytes().len() == signature_hex.as_bytes().len()
        && computed
            .as_bytes()
            .iter()
            .zip(signature_hex.as_bytes())
            .all(|(a, b)| a == b)
}
