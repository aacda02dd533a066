//! # Credential Codec
//!
//! Symmetric encryption of the broker password at rest.
//!
//! Stored form: `base64(iv || AES-256-CBC(pkcs7(plaintext)))` with a fresh
//! 16 byte IV per call. The 32 byte key is the SHA-256 digest of the key
//! material handed over by the key-management source.
//!
//! Decryption failures collapse into a single [`CredentialError`] value: a wrong
//! key, a truncated blob and invalid base64 all look the same to the caller.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CredentialError {
    #[error("Stored credential could not be decrypted")]
    Undecryptable,
}

/// AES-256 key derived from external key material
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn derive(secret: &str) -> Self {
        Self(Sha256::digest(secret.as_bytes()).into())
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

/// Encrypts and decrypts the broker password with one key
#[derive(Debug, Clone)]
pub struct CredentialCodec {
    key: EncryptionKey,
}

impl CredentialCodec {
    pub fn new(key: EncryptionKey) -> Self {
        Self { key }
    }

    pub fn encrypt(&self, plaintext: &str) -> String {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new(&self.key.0.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        let mut blob = Vec::with_capacity(IV_LEN + ciphertext.len());
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&ciphertext);
        STANDARD.encode(blob)
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, CredentialError> {
        let blob = STANDARD
            .decode(encoded.trim())
            .map_err(|_| CredentialError::Undecryptable)?;

        if blob.len() < IV_LEN + BLOCK_LEN || (blob.len() - IV_LEN) % BLOCK_LEN != 0 {
            return Err(CredentialError::Undecryptable);
        }
        let (iv, ciphertext) = blob.split_at(IV_LEN);

        let plaintext = Aes256CbcDec::new_from_slices(&self.key.0, iv)
            .map_err(|_| CredentialError::Undecryptable)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CredentialError::Undecryptable)?;

        String::from_utf8(plaintext).map_err(|_| CredentialError::Undecryptable)
    }
}
