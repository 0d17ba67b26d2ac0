pub mod error;
pub mod identity;
pub mod seal;

pub use error::{CryptoError, CryptoResult};
pub use identity::{fingerprint, oaep_wrap, pss_verify, RsaIdentity};
pub use seal::{
    generate_session_key, open, outbound_nonce, random_id, seal, NONCE_LEN, SESSION_KEY_LEN,
    TAG_LEN,
};
