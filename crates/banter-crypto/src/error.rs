use thiserror::Error;

/// Errors from the primitive layer. Callers branch on the kind: decrypt
/// and verify failures are dropped silently at the transport, key handling
/// failures surface at startup.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("invalid nonce length: expected {expected}, got {actual}")]
    InvalidNonceLength { expected: usize, actual: usize },

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("key wrap failed")]
    WrapFailed,

    #[error("key unwrap failed")]
    UnwrapFailed,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed: authentication or integrity check failed")]
    DecryptionFailed,

    #[error("signature verification failed")]
    SignatureVerificationFailed,
}

pub type CryptoResult<T> = Result<T, CryptoError>;
