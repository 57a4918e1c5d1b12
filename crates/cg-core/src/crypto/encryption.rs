//! AES-256-CBC with PKCS#7 padding.
//!
//! Output format: `base64(IV || ciphertext)` with a fresh random 16-byte IV
//! per call. Decryption validates block alignment and every padding byte,
//! and string decryption also requires UTF-8, so a corrupted ciphertext
//! block almost always surfaces as an error. There is no MAC: a flipped IV
//! byte over a data byte decrypts to a different plaintext without error.

use std::sync::Arc;

use aes::Aes256;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

use super::key_manager::{KeyError, KeyManager};

/// AES block size, also the IV length.
pub const BLOCK_SIZE: usize = 16;

/// AES-256 key length.
pub const KEY_SIZE: usize = 32;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Errors from the raw cipher layer. Messages never carry key material,
/// plaintext or ciphertext.
#[derive(Debug, Error)]
pub enum EncryptionError {
    /// Nothing to encrypt.
    #[error("plaintext is empty")]
    EmptyPlaintext,

    /// Nothing to decrypt.
    #[error("ciphertext is empty")]
    EmptyCiphertext,

    /// The input is not standard base64.
    #[error("ciphertext is not valid base64")]
    InvalidEncoding,

    /// Decoded input is shorter than the IV.
    #[error("ciphertext shorter than one block: missing IV")]
    MissingIv,

    /// Ciphertext after the IV is empty or not block-aligned.
    #[error("ciphertext is not a whole number of blocks")]
    InvalidBlockSize,

    /// Final padding byte is 0 or larger than the block size.
    #[error("invalid padding size")]
    InvalidPaddingSize,

    /// A padding byte disagrees with the padding length.
    #[error("invalid padding bytes")]
    InvalidPaddingBytes,

    /// Key is not exactly [`KEY_SIZE`] bytes.
    #[error("invalid key length: AES-256 needs 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    /// Decrypted bytes requested as a string are not UTF-8.
    #[error("decrypted value is not valid UTF-8")]
    InvalidUtf8,

    /// Cipher construction failed while encrypting.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Cipher construction or block decryption failed.
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// The key could not be obtained from the key manager.
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Append PKCS#7 padding; always adds between 1 and `block_size` bytes.
pub fn pkcs7_pad(data: &[u8], block_size: usize) -> Vec<u8> {
    let pad = block_size - data.len() % block_size;
    let mut out = Vec::with_capacity(data.len() + pad);
    out.extend_from_slice(data);
    out.resize(data.len() + pad, pad as u8);
    out
}

/// Strip and verify PKCS#7 padding.
pub fn pkcs7_unpad(data: &[u8], block_size: usize) -> Result<&[u8], EncryptionError> {
    if data.is_empty() || data.len() % block_size != 0 {
        return Err(EncryptionError::InvalidBlockSize);
    }

    let pad = data[data.len() - 1] as usize;
    if pad == 0 || pad > block_size {
        return Err(EncryptionError::InvalidPaddingSize);
    }

    let (body, padding) = data.split_at(data.len() - pad);
    if padding.iter().any(|&b| b as usize != pad) {
        return Err(EncryptionError::InvalidPaddingBytes);
    }
    Ok(body)
}

/// Raw encrypt/decrypt with one fixed key.
#[derive(Clone)]
pub struct EncryptionService {
    key: Arc<Zeroizing<[u8; KEY_SIZE]>>,
}

impl EncryptionService {
    /// Create a service over a 32-byte key. The key is copied and zeroized on
    /// drop of the last clone.
    pub fn new(key: &[u8]) -> Result<Self, EncryptionError> {
        let key: [u8; KEY_SIZE] = key
            .try_into()
            .map_err(|_| EncryptionError::InvalidKeyLength(key.len()))?;
        Ok(Self {
            key: Arc::new(Zeroizing::new(key)),
        })
    }

    /// Build a service over the manager's current key.
    pub fn from_key_manager(manager: &KeyManager) -> Result<Self, EncryptionError> {
        let key = manager.get_primary_key()?;
        Self::new(&key)
    }

    /// Encrypt under a fresh random IV and return `base64(IV || ciphertext)`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, EncryptionError> {
        if plaintext.is_empty() {
            return Err(EncryptionError::EmptyPlaintext);
        }

        let mut iv = [0u8; BLOCK_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let padded = Zeroizing::new(pkcs7_pad(plaintext, BLOCK_SIZE));
        let cipher = Aes256CbcEnc::new_from_slices(self.key.as_slice(), &iv)
            .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<NoPadding>(&padded);

        let mut out = Vec::with_capacity(BLOCK_SIZE + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    /// Reverse [`encrypt`](Self::encrypt), validating layout and padding.
    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>, EncryptionError> {
        if encoded.is_empty() {
            return Err(EncryptionError::EmptyCiphertext);
        }

        let data = STANDARD
            .decode(encoded)
            .map_err(|_| EncryptionError::InvalidEncoding)?;
        if data.len() < BLOCK_SIZE {
            return Err(EncryptionError::MissingIv);
        }

        let (iv, ciphertext) = data.split_at(BLOCK_SIZE);
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(EncryptionError::InvalidBlockSize);
        }

        let cipher = Aes256CbcDec::new_from_slices(self.key.as_slice(), iv)
            .map_err(|e| EncryptionError::DecryptionFailed(e.to_string()))?;
        let padded = Zeroizing::new(
            cipher
                .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
                .map_err(|e| EncryptionError::DecryptionFailed(e.to_string()))?,
        );

        Ok(pkcs7_unpad(&padded, BLOCK_SIZE)?.to_vec())
    }

    pub fn encrypt_string(&self, plaintext: &str) -> Result<String, EncryptionError> {
        self.encrypt(plaintext.as_bytes())
    }

    /// Decrypt and require the plaintext to be UTF-8.
    pub fn decrypt_string(&self, encoded: &str) -> Result<String, EncryptionError> {
        String::from_utf8(self.decrypt(encoded)?).map_err(|_| EncryptionError::InvalidUtf8)
    }
}

impl std::fmt::Debug for EncryptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionService")
            .field("algorithm", &"AES-256-CBC")
            .finish()
    }
}
