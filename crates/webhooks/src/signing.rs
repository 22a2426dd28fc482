//! Payload signing.
//!
//! Receivers authenticate a delivery by recomputing the tag over the exact body
//! bytes they received and comparing it to the `X-Webhook-Signature` header.
//! The header value is `sha256=` followed by the lowercase hex HMAC-SHA256 of
//! the body, keyed by the endpoint's shared secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Prefix of every signature header value.
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// The secret could not be used as an HMAC key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid signing key: {0}")]
pub struct SigningError(String);

fn mac_for(secret: &str) -> Result<HmacSha256, SigningError> {
    <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .map_err(|e| SigningError(e.to_string()))
}

/// Signature header value for `payload` under `secret`.
pub fn sign(payload: &[u8], secret: &str) -> Result<String, SigningError> {
    let mut mac = mac_for(secret)?;
    mac.update(payload);
    Ok(format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes())))
}

/// Check a received signature header against `payload` in constant time.
///
/// Returns `false` for headers without the `sha256=` prefix, with invalid hex,
/// or for a secret that is not a usable key.
pub fn verify(payload: &[u8], secret: &str, header: &str) -> bool {
    let Some(hex_tag) = header.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(tag) = hex::decode(hex_tag) else {
        return false;
    };
    let Ok(mut mac) = mac_for(secret) else {
        return false;
    };

    mac.update(payload);
    mac.verify_slice(&tag).is_ok()
}
