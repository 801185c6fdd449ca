//! Cryptographic utilities for webhook verification.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Compute HMAC-SHA256 and return the hex-encoded result.
///
/// Returns `None` only if the HMAC implementation rejects the key, which
/// HMAC-SHA256 never does (RFC 2104 accepts keys of any size).
#[must_use]
pub fn hmac_sha256_hex(secret: &str, message: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(message);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time string comparison.
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// Check a cog webhook signature.
///
/// The header carries the hex HMAC-SHA256 of the raw body, optionally
/// prefixed with `sha256=`.
#[must_use]
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let provided = header.trim();
    let provided = provided.strip_prefix("sha256=").unwrap_or(provided);

    hmac_sha256_hex(secret, body)
        .is_some_and(|expected| constant_time_eq(&expected, &provided.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_matches_known_vector() {
        // RFC 4231 test case 2.
        let mac = hmac_sha256_hex("Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            mac,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn constant_time_eq_works() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn signature_accepts_prefixed_and_bare_forms() {
        let body = br#"{"id":"x","status":"succeeded"}"#;
        let mac = hmac_sha256_hex("s3cret", body).unwrap();

        assert!(verify_signature("s3cret", body, &mac));
        assert!(verify_signature("s3cret", body, &format!("sha256={mac}")));
        assert!(verify_signature("s3cret", body, &mac.to_uppercase()));
        assert!(!verify_signature("other", body, &mac));
        assert!(!verify_signature("s3cret", b"tampered", &mac));
    }
}
