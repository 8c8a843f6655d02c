//! Authenticated Encryption with Associated Data
//!
//! Uses XChaCha20-Poly1305. Key: 32 bytes. Nonce: 24 bytes, never
//! transmitted: it is derived together with the key (see `kdf::kdf_ck` and
//! `kdf::message_key_from_seed`), so each `MessageKey` is used exactly once.
//!
//! Ciphertext wire format:
//!   [ ciphertext | tag (16 bytes) ]

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

/// Poly1305 authentication tag length.
pub const TAG_SIZE: usize = 16;
pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 24;

/// One-shot AEAD key: key material followed by its nonce.
#[derive(Clone, ZeroizeOnDrop)]
pub struct MessageKey([u8; KEY_SIZE + NONCE_SIZE]);

impl MessageKey {
    pub const SIZE: usize = KEY_SIZE + NONCE_SIZE;

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_SIZE + NONCE_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "message key must be {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn cipher(&self) -> Result<XChaCha20Poly1305, CryptoError> {
        XChaCha20Poly1305::new_from_slice(&self.0[..KEY_SIZE])
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    fn nonce(&self) -> &XNonce {
        XNonce::from_slice(&self.0[KEY_SIZE..])
    }

    /// Encrypt `plaintext`, authenticating `aad`. Returns ciphertext || tag.
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher()?
            .encrypt(self.nonce(), Payload { msg: plaintext, aad })
            .map_err(|_| CryptoError::AeadEncrypt)
    }

    /// Decrypt ciphertext || tag.
    pub fn decrypt(&self, data: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if data.len() < TAG_SIZE {
            return Err(CryptoError::AeadDecrypt);
        }
        let plaintext = self
            .cipher()?
            .decrypt(self.nonce(), Payload { msg: data, aad })
            .map_err(|_| CryptoError::AeadDecrypt)?;
        Ok(Zeroizing::new(plaintext))
    }
}

impl std::fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MessageKey(..)")
    }
}
