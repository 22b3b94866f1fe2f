use crate::{Error, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-tidewater-signature";
pub const EVENT_HEADER: &str = "x-tidewater-event";
pub const DELIVERY_HEADER: &str = "x-tidewater-delivery";

/// Compute the signature header value for `body`.
///
/// Format: `sha256=<hex>`
#[tracing::instrument(level = "debug", skip_all)]
pub fn sign_body(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| Error::Webhook("invalid signing key".to_string()))?;
    mac.update(body);
    let bytes = mac.finalize().into_bytes();
    Ok(format!("sha256={}", hex::encode(bytes)))
}

/// Verify a signature header against `body`, for subscribers.
///
/// Accepts raw hex or `sha256=<hex>`. The comparison is constant-time.
#[tracing::instrument(level = "debug", skip_all)]
pub fn verify_signature(secret: &str, signature_header: &str, body: &[u8]) -> Result<()> {
    let sig = signature_header.trim();
    let sig_hex = sig.strip_prefix("sha256=").unwrap_or(sig);
    let provided =
        hex::decode(sig_hex).map_err(|_| Error::Webhook("signature is not hex".to_string()))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| Error::Webhook("invalid signing key".to_string()))?;
    mac.update(body);
    mac.verify_slice(&provided)
        .map_err(|_| Error::Webhook("signature mismatch".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify() {
        let body = br#"{"event":"refresh.completed"}"#;
        let sig = sign_body("s3cret", body).unwrap();
        assert!(sig.starts_with("sha256="));
        verify_signature("s3cret", &sig, body).unwrap();
        verify_signature("s3cret", sig.trim_start_matches("sha256="), body).unwrap();
        assert!(verify_signature("other", &sig, body).is_err());
        assert!(verify_signature("s3cret", &sig, b"tampered").is_err());
    }
}
