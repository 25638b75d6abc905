//! Shared-secret credentials for rift.
//!
//! A privilege key is `hex(HMAC-SHA256(secret, decimal(timestamp)))`. The same
//! construction signs visitor requests, keyed by the proxy's `sk` instead of
//! the server token.

use crate::error::{RiftError, RiftResult};
use ring::hmac;

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Derive the key that proves knowledge of `secret` at `timestamp`.
pub fn auth_key(secret: &str, timestamp: i64) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let tag = hmac::sign(&key, timestamp.to_string().as_bytes());
    hex::encode(tag.as_ref())
}

/// Verify a presented key against `secret`, rejecting timestamps more than
/// `window_secs` away from now. A window of `0` disables the freshness check.
pub fn verify_auth_key(secret: &str, timestamp: i64, presented: &str, window_secs: u64) -> RiftResult<()> {
    verify_auth_key_at(unix_now(), secret, timestamp, presented, window_secs)
}

/// Like [`verify_auth_key`] with an explicit clock.
pub fn verify_auth_key_at(
    now: i64,
    secret: &str,
    timestamp: i64,
    presented: &str,
    window_secs: u64,
) -> RiftResult<()> {
    if window_secs > 0 && now.abs_diff(timestamp) > window_secs {
        return Err(RiftError::AuthenticationFailed(
            "timestamp outside freshness window".into(),
        ));
    }

    let tag = hex::decode(presented)
        .map_err(|_| RiftError::AuthenticationFailed("invalid key encoding".into()))?;
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    hmac::verify(&key, timestamp.to_string().as_bytes(), &tag)
        .map_err(|_| RiftError::AuthenticationFailed("invalid key".into()))
}

/// Generate a random identifier of `n_bytes` of entropy, hex-encoded.
pub fn generate_id(n_bytes: usize) -> String {
    use rand::RngCore;
    let mut buf = vec![0u8; n_bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_verifies_within_window() {
        let now = 1_700_000_000;
        let key = auth_key("s3cret", now - 30);
        assert!(verify_auth_key_at(now, "s3cret", now - 30, &key, 900).is_ok());
    }

    #[test]
    fn wrong_secret_rejected() {
        let key = auth_key("s3cret", 42);
        let err = verify_auth_key_at(42, "other", 42, &key, 900).unwrap_err();
        assert!(matches!(err, RiftError::AuthenticationFailed(_)));
    }

    #[test]
    fn timestamp_bound_to_key() {
        let key = auth_key("s3cret", 100);
        assert!(verify_auth_key_at(100, "s3cret", 101, &key, 900).is_err());
    }

    #[test]
    fn stale_timestamp_rejected() {
        let now = 1_700_000_000;
        let ts = now - 901;
        let key = auth_key("s3cret", ts);
        assert!(verify_auth_key_at(now, "s3cret", ts, &key, 900).is_err());
        // Disabled window accepts any age.
        assert!(verify_auth_key_at(now, "s3cret", ts, &key, 0).is_ok());
    }

    #[test]
    fn garbage_key_rejected() {
        assert!(verify_auth_key_at(1, "s", 1, "not-hex", 0).is_err());
        assert!(verify_auth_key_at(1, "s", 1, "", 0).is_err());
    }

    #[test]
    fn empty_secret_still_signs() {
        let key = auth_key("", 7);
        assert_eq!(key.len(), 64);
        assert!(verify_auth_key_at(7, "", 7, &key, 0).is_ok());
    }

    #[test]
    fn generated_ids_are_distinct() {
        let a = generate_id(8);
        let b = generate_id(8);
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }
}
