//! Cryptographic capability boundary
//!
//! The engine never calls a primitive directly: signing, verification, AEAD,
//! and key agreement go through the [`CryptoProvider`] trait so platforms can
//! inject hardware-backed or audited implementations. [`DalekCrypto`] is the
//! default software provider.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{MeshError, Result};

/// AEAD nonce size prepended to ciphertexts
const NONCE_LEN: usize = 12;

// ----------------------------------------------------------------------------
// CryptoProvider Trait
// ----------------------------------------------------------------------------

/// Opaque cryptographic capability consumed by the engine.
///
/// Pure function surface: implementations own no engine state.
pub trait CryptoProvider: Send + Sync {
    /// Sign a message with an Ed25519 private key
    fn sign(&self, msg: &[u8], private_key: &[u8]) -> Result<[u8; 64]>;

    /// Verify an Ed25519 signature under a public key
    fn verify(&self, msg: &[u8], signature: &[u8; 64], public_key: &[u8]) -> bool;

    /// AEAD-encrypt a plaintext under a 32-byte symmetric key
    fn encrypt(&self, plaintext: &[u8], key: &[u8; 32]) -> Result<Vec<u8>>;

    /// AEAD-decrypt a ciphertext under a 32-byte symmetric key
    fn decrypt(&self, ciphertext: &[u8], key: &[u8; 32]) -> Result<Vec<u8>>;

    /// X25519 ECDH shared secret between a local private key and a peer's
    /// public key, hashed to a uniform 32-byte symmetric key
    fn derive_shared_secret(&self, private_key: &[u8; 32], peer_public: &[u8; 32]) -> [u8; 32];
}

// ----------------------------------------------------------------------------
// Default Provider
// ----------------------------------------------------------------------------

/// Software provider backed by ed25519-dalek, x25519-dalek, and
/// ChaCha20-Poly1305
#[derive(Debug, Clone, Copy, Default)]
pub struct DalekCrypto;

impl DalekCrypto {
    pub fn new() -> Self {
        Self
    }

    /// Generate a fresh Ed25519 keypair as (private, public) bytes.
    ///
    /// The public key doubles as the peer ID.
    pub fn generate_keypair() -> ([u8; 32], [u8; 32]) {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        let signing = SigningKey::from_bytes(&seed);
        (seed, signing.verifying_key().to_bytes())
    }
}

impl CryptoProvider for DalekCrypto {
    fn sign(&self, msg: &[u8], private_key: &[u8]) -> Result<[u8; 64]> {
        let key_bytes: [u8; 32] = private_key
            .try_into()
            .map_err(|_| MeshError::crypto("private key must be 32 bytes"))?;
        let signing = SigningKey::from_bytes(&key_bytes);
        Ok(signing.sign(msg).to_bytes())
    }

    fn verify(&self, msg: &[u8], signature: &[u8; 64], public_key: &[u8]) -> bool {
        let key_bytes: [u8; 32] = match public_key.try_into() {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let verifying = match VerifyingKey::from_bytes(&key_bytes) {
            Ok(key) => key,
            Err(_) => return false,
        };
        verifying
            .verify(msg, &Signature::from_bytes(signature))
            .is_ok()
    }

    fn encrypt(&self, plaintext: &[u8], key: &[u8; 32]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| MeshError::crypto("invalid AEAD key"))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| MeshError::crypto("encryption failed"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8], key: &[u8; 32]) -> Result<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN {
            return Err(MeshError::crypto("ciphertext shorter than nonce"));
        }
        let cipher = ChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| MeshError::crypto("invalid AEAD key"))?;

        let nonce = Nonce::from_slice(&ciphertext[..NONCE_LEN]);
        cipher
            .decrypt(nonce, &ciphertext[NONCE_LEN..])
            .map_err(|_| MeshError::crypto("decryption failed"))
    }

    fn derive_shared_secret(&self, private_key: &[u8; 32], peer_public: &[u8; 32]) -> [u8; 32] {
        let secret = StaticSecret::from(*private_key);
        let public = PublicKey::from(*peer_public);
        let shared = secret.diffie_hellman(&public);
        // Hash the raw ECDH output to a uniform symmetric key
        Sha256::digest(shared.as_bytes()).into()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
