//! HMAC-SHA256 request signing.
//!
//! Outbound webhook callbacks carry `X-Signature: sha256=<hex>`; inbound
//! webhooks are checked against the same scheme.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Signature";

/// Sign `payload`, returning `sha256=<hex digest>`.
pub fn sign(secret: &str, payload: &[u8]) -> String {
    // HMAC accepts keys of any length, so this never fails in practice.
    let digest = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mut mac) => {
            mac.update(payload);
            mac.finalize().into_bytes().to_vec()
        }
        Err(_) => Vec::new(),
    };
    format!("sha256={}", hex::encode(digest))
}

/// Check a signature in `sha256=<hex>` or bare `<hex>` form.
///
/// An empty secret disables verification. Comparison is constant-time.
pub fn verify(secret: &str, payload: &[u8], signature: &str) -> bool {
    if secret.is_empty() {
        return true;
    }
    let sig_hex = signature.trim().strip_prefix("sha256=").unwrap_or(signature.trim());
    let Ok(provided) = hex::decode(sig_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&provided).is_ok()
}

/// Lark/Feishu event signature: hex `sha256(timestamp + nonce + encrypt_key + body)`.
pub fn lark_signature(timestamp: &str, nonce: &str, encrypt_key: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(timestamp.as_bytes());
    hasher.update(nonce.as_bytes());
    hasher.update(encrypt_key.as_bytes());
    hasher.update(body);
    hex::encode(hasher.finalize())
}

pub fn verify_lark(timestamp: &str, nonce: &str, encrypt_key: &str, body: &[u8], signature: &str) -> bool {
    lark_signature(timestamp, nonce, encrypt_key, body).eq_ignore_ascii_case(signature.trim())
}
