//! HMAC-SHA256 signing for inbound verification and outbound delivery.

use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_PREFIX: &str = "sha256=";

/// `sha256=<hex>` header value for `body`.
pub fn sign_body(secret: &[u8], body: &[u8]) -> Result<String, hmac::digest::InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret)?;
    mac.update(body);
    Ok(format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes())))
}

/// Verify a `sha256=<hex>` header (GitHub/Stripe-relay style).
pub fn verify_hex_signature(secret: &[u8], body: &[u8], header: &str) -> bool {
    let Some(expected_hex) = header.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(expected_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Verify a Standard Webhooks signature.
///
/// Signed content is `<msg-id>.<timestamp>.<body>`; the header holds one or
/// more space separated `v1,<base64>` entries. Secrets may carry a `whsec_`
/// prefix and are base64 when they decode as such.
pub fn verify_standard_webhooks(
    secret: &str,
    body: &[u8],
    msg_id: &str,
    timestamp: &str,
    signature_header: &str,
) -> bool {
    let secret = secret.strip_prefix("whsec_").unwrap_or(secret);
    let key = base64::engine::general_purpose::STANDARD
        .decode(secret)
        .unwrap_or_else(|_| secret.as_bytes().to_vec());

    signature_header
        .split_whitespace()
        .filter_map(|entry| entry.strip_prefix("v1,"))
        .filter_map(|sig| base64::engine::general_purpose::STANDARD.decode(sig).ok())
        .any(|sig| {
            let Ok(mut mac) = HmacSha256::new_from_slice(&key) else {
                return false;
            };
            mac.update(msg_id.as_bytes());
            mac.update(b".");
            mac.update(timestamp.as_bytes());
            mac.update(b".");
            mac.update(body);
            mac.verify_slice(&sig).is_ok()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_body_verifies() {
        let header = sign_body(b"s3cret", b"{\"ok\":true}").unwrap();
        assert!(header.starts_with("sha256="));
        assert!(verify_hex_signature(b"s3cret", b"{\"ok\":true}", &header));
        assert!(!verify_hex_signature(b"other", b"{\"ok\":true}", &header));
        assert!(!verify_hex_signature(b"s3cret", b"{\"ok\":false}", &header));
    }

    #[test]
    fn malformed_headers_fail() {
        assert!(!verify_hex_signature(b"k", b"body", ""));
        assert!(!verify_hex_signature(b"k", b"body", "sha1=abcd"));
        assert!(!verify_hex_signature(b"k", b"body", "sha256=not-hex"));
    }

    #[test]
    fn standard_webhooks_accepts_any_listed_signature() {
        let secret_bytes = b"standard-secret";
        let secret = format!(
            "whsec_{}",
            base64::engine::general_purpose::STANDARD.encode(secret_bytes)
        );
        let mut mac = HmacSha256::new_from_slice(secret_bytes).unwrap();
        mac.update(b"msg_1.1700000000.{}");
        let sig = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
        let header = format!("v1,Zm9v v1,{sig}");

        assert!(verify_standard_webhooks(&secret, b"{}", "msg_1", "1700000000", &header));
        assert!(!verify_standard_webhooks(&secret, b"{}", "msg_2", "1700000000", &header));
    }
}
