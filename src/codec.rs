//! Chunk codec: deterministic authenticated encryption plus a content digest
//! over the ciphertext.
//!
//! Key derivation is deliberately weak (`SHA-256(passphrase)`) — spec.md
//! calls this out as an accepted non-goal, not an oversight. Encryption is
//! AES-SIV (RFC 5297) via the `aes-siv` crate: deterministic per (key,
//! plaintext), no explicit nonce, no associated data, which is exactly what
//! content-addressed deduplication over ciphertext requires — identical
//! plaintexts must produce identical ciphertexts and therefore identical
//! digests.

use aes_siv::aead::{Aead, KeyInit};
use aes_siv::Aes128SivAead;
use sha2::{Digest as Sha2Digest, Sha256};
use std::io::{Read, Write};

use crate::error::{CoreError, CoreResult};

/// A chunk's content digest: SHA-256 over the chunk's *ciphertext* form.
pub type Digest = [u8; 32];

/// An in-memory chunk: plaintext bytes plus the digest of their ciphertext
/// encoding.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub contents: Vec<u8>,
    pub digest: Digest,
}

impl Chunk {
    pub fn new(contents: Vec<u8>, digest: Digest) -> Self {
        Self { contents, digest }
    }
}

/// Pluggable cipher interface. The production implementation is AES-SIV; a
/// `NullCipher` test double makes it possible to unit-test framing logic
/// (varint lengths, journal chaining) without paying for real crypto.
pub trait Cipher: std::fmt::Debug {
    fn encrypt(&self, plaintext: &[u8]) -> CoreResult<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8]) -> CoreResult<Vec<u8>>;
}

/// AES-SIV (RFC 5297) cipher with a fixed 32-byte key, no nonce, no AAD.
#[derive(Debug)]
pub struct AesSivCipher {
    cipher: Aes128SivAead,
}

impl AesSivCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        let key = aes_siv::aead::generic_array::GenericArray::from_slice(key);
        Self {
            cipher: Aes128SivAead::new(key),
        }
    }
}

impl Cipher for AesSivCipher {
    fn encrypt(&self, plaintext: &[u8]) -> CoreResult<Vec<u8>> {
        let nonce = Default::default();
        self.cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CoreError::Integrity("AES-SIV encryption failed".into()))
    }

    fn decrypt(&self, ciphertext: &[u8]) -> CoreResult<Vec<u8>> {
        let nonce = Default::default();
        self.cipher
            .decrypt(&nonce, ciphertext)
            .map_err(|_| CoreError::Integrity("AES-SIV authentication failed".into()))
    }
}

/// Test double that passes plaintext through unchanged. Never use outside
/// tests: it provides no confidentiality or integrity at all.
#[cfg(any(test, feature = "test-support"))]
#[derive(Debug)]
pub struct NullCipher;

#[cfg(any(test, feature = "test-support"))]
impl Cipher for NullCipher {
    fn encrypt(&self, plaintext: &[u8]) -> CoreResult<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> CoreResult<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }
}

/// Owns the fixed key and cipher used to encrypt/decrypt chunks and compute
/// their content digests.
#[derive(Debug)]
pub struct FSInfo {
    cipher: Box<dyn Cipher + Send + Sync>,
}

impl FSInfo {
    /// Derives a 32-byte key from `passphrase` via SHA-256 and builds an
    /// AES-SIV-backed `FSInfo`.
    pub fn new(passphrase: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(passphrase);
        let key: [u8; 32] = hasher.finalize().into();
        Self::with_cipher(Box::new(AesSivCipher::new(&key)))
    }

    /// Builds an `FSInfo` from an arbitrary cipher, for tests or alternate
    /// deployments.
    pub fn with_cipher(cipher: Box<dyn Cipher + Send + Sync>) -> Self {
        Self { cipher }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> CoreResult<Vec<u8>> {
        self.cipher.encrypt(plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> CoreResult<Vec<u8>> {
        self.cipher.decrypt(ciphertext)
    }

    /// Reads all bytes from `src`, decrypts them, and returns a `Chunk`
    /// carrying the plaintext and the digest of the ciphertext that was
    /// read. Fails with `CoreError::Integrity` if the cipher rejects the
    /// ciphertext.
    pub fn read_chunk<R: Read>(&self, src: &mut R) -> CoreResult<Chunk> {
        let mut ciphertext = Vec::new();
        src.read_to_end(&mut ciphertext)?;
        let digest = Self::digest_of(&ciphertext);
        let plaintext = self.decrypt(&ciphertext)?;
        log::trace!("read_chunk: {} ciphertext bytes", ciphertext.len());
        Ok(Chunk::new(plaintext, digest))
    }

    /// Encrypts `data`, writes the ciphertext to `dst`, and returns the
    /// digest of the ciphertext that was written.
    pub fn write_chunk<W: Write>(&self, dst: &mut W, data: &[u8]) -> CoreResult<Digest> {
        let ciphertext = self.encrypt(data)?;
        dst.write_all(&ciphertext)?;
        let digest = Self::digest_of(&ciphertext);
        log::trace!("write_chunk: {} ciphertext bytes", ciphertext.len());
        Ok(digest)
    }

    /// Computes the digest that `write_chunk` would produce for the given
    /// ciphertext bytes, without touching a writer. Used by `make_digest` in
    /// the object store to answer "what digest would this produce" without
    /// persisting anything.
    pub fn digest_of(ciphertext: &[u8]) -> Digest {
        let mut hasher = Sha256::new();
        hasher.update(ciphertext);
        hasher.finalize().into()
    }
}
