//! Symmetric transport primitives: AES-256-GCM seal/open for secure
//! envelopes, session key and nonce generation, random ids.

use aes_gcm::aead::{Aead, KeyInit, OsRng, rand_core::RngCore};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{CryptoError, CryptoResult};

pub const SESSION_KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Generate a random 32-byte AES-256 session key.
pub fn generate_session_key() -> [u8; SESSION_KEY_LEN] {
    let mut key = [0u8; SESSION_KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

/// Outbound nonce: 8 bytes big-endian nanosecond timestamp followed by
/// 4 random bytes. Monotonic-ish and collision-free for one sender; inbound
/// nonces are opaque and deduplicated by the session layer regardless.
pub fn outbound_nonce() -> [u8; NONCE_LEN] {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let mut nonce = [0u8; NONCE_LEN];
    nonce[..8].copy_from_slice(&nanos.to_be_bytes());
    OsRng.fill_bytes(&mut nonce[8..]);
    nonce
}

/// Random 128-bit identifier as 32 lowercase hex chars. Used for session,
/// user, room and message-delivery ids.
pub fn random_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// AES-256-GCM encrypt. Returns ciphertext with the 16-byte tag appended.
pub fn seal(
    key: &[u8; SESSION_KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> CryptoResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)
}

/// AES-256-GCM decrypt. `ciphertext` must include the appended tag.
pub fn open(key: &[u8; SESSION_KEY_LEN], nonce: &[u8], ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::InvalidNonceLength {
            expected: NONCE_LEN,
            actual: nonce.len(),
        });
    }
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::DecryptionFailed);
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = generate_session_key();
        let nonce = outbound_nonce();
        let message = b"{\"type\":\"HELLO\"}";

        let sealed = seal(&key, &nonce, message).unwrap();
        assert_eq!(sealed.len(), message.len() + TAG_LEN);

        let opened = open(&key, &nonce, &sealed).unwrap();
        assert_eq!(opened, message);
    }

    #[test]
    fn wrong_key_fails() {
        let key1 = generate_session_key();
        let key2 = generate_session_key();
        let nonce = outbound_nonce();

        let sealed = seal(&key1, &nonce, b"secret").unwrap();
        assert!(open(&key2, &nonce, &sealed).is_err());
    }

    #[test]
    fn tampering_any_byte_fails() {
        let key = generate_session_key();
        let nonce = outbound_nonce();
        let sealed = seal(&key, &nonce, b"payload bytes").unwrap();

        for i in 0..sealed.len() {
            let mut tampered = sealed.clone();
            tampered[i] ^= 0x01;
            assert!(open(&key, &nonce, &tampered).is_err(), "byte {} accepted", i);
        }
    }

    #[test]
    fn truncated_ciphertext_fails() {
        let key = generate_session_key();
        let nonce = outbound_nonce();
        let sealed = seal(&key, &nonce, b"payload").unwrap();
        assert!(open(&key, &nonce, &sealed[..TAG_LEN - 1]).is_err());
    }

    #[test]
    fn bad_nonce_length_rejected() {
        let key = generate_session_key();
        assert!(matches!(
            open(&key, &[0u8; 8], &[0u8; 32]),
            Err(CryptoError::InvalidNonceLength { expected: 12, actual: 8 })
        ));
    }

    #[test]
    fn nonce_prefix_is_timestamp() {
        let before = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos() as u64;
        let nonce = outbound_nonce();
        let after = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos() as u64;

        let stamp = u64::from_be_bytes(nonce[..8].try_into().unwrap());
        assert!(stamp >= before && stamp <= after);
    }

    #[test]
    fn random_ids_are_hex_and_distinct() {
        let a = random_id();
        let b = random_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
