//! RSA identity: a 2048-bit keypair used to wrap session keys to clients
//! (OAEP) and to sign the raw key bytes (PSS) so clients can authenticate
//! the handshake. The public key travels as DER SubjectPublicKeyInfo; the
//! fingerprint is the lowercase hex SHA-256 of that DER.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rsa::pkcs8::{
    DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding,
};
use rsa::pss::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::{CryptoError, CryptoResult};

const KEY_BITS: usize = 2048;
const PRIVATE_KEY_FILE: &str = "server_private_key.pem";
const PUBLIC_KEY_FILE: &str = "server_public_key.pem";

pub struct RsaIdentity {
    private: RsaPrivateKey,
    public_der: Vec<u8>,
    fingerprint: String,
}

impl RsaIdentity {
    /// Generate a fresh keypair without persisting it. Used for clients and
    /// tests; the server side goes through [`RsaIdentity::load_or_create`].
    pub fn generate() -> Result<Self> {
        let mut rng = rand::rngs::OsRng;
        let private =
            RsaPrivateKey::new(&mut rng, KEY_BITS).context("RSA key generation failed")?;
        Self::from_private(private)
    }

    /// Load the PEM keypair from `key_dir`, or generate and persist one on
    /// first start.
    pub fn load_or_create(key_dir: &Path) -> Result<Self> {
        let private_path = key_dir.join(PRIVATE_KEY_FILE);
        let public_path = key_dir.join(PUBLIC_KEY_FILE);

        if private_path.exists() {
            let pem = fs::read_to_string(&private_path)
                .with_context(|| format!("cannot read {}", private_path.display()))?;
            let private = RsaPrivateKey::from_pkcs8_pem(&pem)
                .with_context(|| format!("cannot parse {}", private_path.display()))?;
            let identity = Self::from_private(private)?;
            info!(fingerprint = %identity.fingerprint, "loaded server keypair");
            return Ok(identity);
        }

        fs::create_dir_all(key_dir)
            .with_context(|| format!("cannot create key dir {}", key_dir.display()))?;

        let identity = Self::generate()?;
        let private_pem = identity
            .private
            .to_pkcs8_pem(LineEnding::LF)
            .context("cannot encode private key")?;
        fs::write(&private_path, private_pem.as_bytes())
            .with_context(|| format!("cannot write {}", private_path.display()))?;

        let public_pem = identity
            .private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .context("cannot encode public key")?;
        fs::write(&public_path, public_pem.as_bytes())
            .with_context(|| format!("cannot write {}", public_path.display()))?;

        info!(fingerprint = %identity.fingerprint, "generated server keypair");
        Ok(identity)
    }

    fn from_private(private: RsaPrivateKey) -> Result<Self> {
        let public_der = private
            .to_public_key()
            .to_public_key_der()
            .context("cannot encode public key DER")?
            .into_vec();
        let fingerprint = fingerprint(&public_der);
        Ok(Self {
            private,
            public_der,
            fingerprint,
        })
    }

    /// DER-encoded SubjectPublicKeyInfo of the public key.
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_der
    }

    /// Lowercase hex SHA-256 of the DER SPKI.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// RSA-OAEP (SHA-256 for hash and MGF1) decrypt with the private key.
    pub fn oaep_unwrap(&self, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        self.private
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(|_| CryptoError::UnwrapFailed)
    }

    /// RSA-PSS sign (SHA-256, salt length = digest length) over `message`.
    pub fn pss_sign(&self, message: &[u8]) -> Vec<u8> {
        let mut rng = rand::rngs::OsRng;
        let signing_key = SigningKey::<Sha256>::new(self.private.clone());
        signing_key.sign_with_rng(&mut rng, message).to_vec()
    }
}

impl std::fmt::Debug for RsaIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RsaIdentity({})", &self.fingerprint[..8])
    }
}

/// RSA-OAEP encrypt `plaintext` to a peer's DER SPKI public key.
pub fn oaep_wrap(peer_spki_der: &[u8], plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let peer = RsaPublicKey::from_public_key_der(peer_spki_der)
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    let mut rng = rand::rngs::OsRng;
    peer.encrypt(&mut rng, Oaep::new::<Sha256>(), plaintext)
        .map_err(|_| CryptoError::WrapFailed)
}

/// Verify an RSA-PSS signature against a peer's DER SPKI public key.
pub fn pss_verify(peer_spki_der: &[u8], message: &[u8], signature: &[u8]) -> CryptoResult<()> {
    let peer = RsaPublicKey::from_public_key_der(peer_spki_der)
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    let signature =
        Signature::try_from(signature).map_err(|_| CryptoError::SignatureVerificationFailed)?;
    VerifyingKey::<Sha256>::new(peer)
        .verify(message, &signature)
        .map_err(|_| CryptoError::SignatureVerificationFailed)
}

/// Lowercase hex SHA-256 of a DER-encoded public key.
pub fn fingerprint(spki_der: &[u8]) -> String {
    hex::encode(Sha256::digest(spki_der))
}
