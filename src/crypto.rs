//! Cryptographic operations
//!
//! Opaque codes and tokens are drawn from the operating system CSPRNG.
//! Store snapshots are sealed with ChaCha20-Poly1305 under a key derived
//! from the operator-supplied secret.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ring::aead::{self, Aad, Nonce, UnboundKey, CHACHA20_POLY1305, NONCE_LEN};
use ring::hkdf::{self, HKDF_SHA256};
use ring::rand::{SecureRandom, SystemRandom};
use std::fmt;

use crate::error::{Error, Result};

/// Bytes of entropy in every opaque code and token (256 bits)
const TOKEN_BYTES: usize = 32;
const KEY_LEN: usize = 32;

/// Generates unguessable opaque identifiers
#[derive(Debug, Clone)]
pub struct TokenGenerator {
    rng: SystemRandom,
}

impl TokenGenerator {
    /// Create a generator backed by the system random source
    #[must_use]
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
        }
    }

    /// A fresh base64url token carrying 256 bits of entropy
    pub fn generate(&self) -> Result<String> {
        let mut bytes = [0u8; TOKEN_BYTES];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| Error::Crypto("Failed to generate random token".into()))?;
        Ok(URL_SAFE_NO_PAD.encode(bytes))
    }
}

impl Default for TokenGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Key used to seal and open store snapshots
#[derive(Clone)]
pub struct SnapshotKey {
    rng: SystemRandom,
    key: Vec<u8>,
}

impl fmt::Debug for SnapshotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotKey").finish_non_exhaustive()
    }
}

impl SnapshotKey {
    /// Wrap a 32-byte secret
    pub fn new(key: Vec<u8>) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(Error::Crypto("Invalid key length".into()));
        }

        Ok(Self {
            rng: SystemRandom::new(),
            key,
        })
    }

    /// Generate a random key
    pub fn generate() -> Result<Self> {
        let rng = SystemRandom::new();
        let mut key = vec![0u8; KEY_LEN];
        rng.fill(&mut key)
            .map_err(|_| Error::Crypto("Failed to generate key".into()))?;
        Ok(Self { rng, key })
    }

    fn derive_key(&self) -> Result<aead::LessSafeKey> {
        let salt = hkdf::Salt::new(HKDF_SHA256, &self.key);
        let prk = salt.extract(&[]);
        let okm = prk
            .expand(&[b"store-snapshot"], HKDF_SHA256)
            .map_err(|_| Error::Crypto("Failed to expand key".into()))?;

        let mut key_bytes = [0u8; KEY_LEN];
        okm.fill(&mut key_bytes)
            .map_err(|_| Error::Crypto("Failed to fill key bytes".into()))?;

        let unbound_key = UnboundKey::new(&CHACHA20_POLY1305, &key_bytes)
            .map_err(|_| Error::Crypto("Failed to create unbound key".into()))?;
        Ok(aead::LessSafeKey::new(unbound_key))
    }

    /// Encrypt; the random nonce is prepended to the ciphertext
    pub fn seal(&self, data: &[u8]) -> Result<Vec<u8>> {
        let sealing_key = self.derive_key()?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| Error::Crypto("Failed to generate nonce".into()))?;

        let mut in_out = data.to_vec();
        sealing_key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| Error::Crypto("Failed to seal data".into()))?;

        let mut result = Vec::with_capacity(NONCE_LEN + in_out.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&in_out);
        Ok(result)
    }

    /// Decrypt data produced by [`SnapshotKey::seal`]
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(Error::Crypto("Invalid encrypted data length".into()));
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| Error::Crypto("Failed to extract nonce".into()))?;

        let opening_key = self.derive_key()?;
        let mut in_out = ciphertext.to_vec();
        let plaintext = opening_key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| Error::Crypto("Failed to open data".into()))?;

        Ok(plaintext.to_vec())
    }
}

/// Compare two secrets without leaking timing
#[must_use]
#[allow(deprecated)]
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    ring::constant_time::verify_slices_are_equal(a, b).is_ok()
}
