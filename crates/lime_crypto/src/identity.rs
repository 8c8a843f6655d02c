//! Identity key management
//!
//! Each local device owns one long-term Ed25519 `IdentityKeyPair`. Its public
//! half is published in the X3DH key bundle and signs the SPk; for key
//! agreement it is mapped onto X25519 (see `x3dh`).
//!
//! Storage form is `public(32) || secret(32)`.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

pub const PUBLIC_KEY_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

/// Long-term identity signing key. Drop clears memory via ZeroizeOnDrop.
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    #[zeroize(skip)]
    public: [u8; PUBLIC_KEY_SIZE],
    secret_bytes: [u8; 32],
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self {
            public: signing_key.verifying_key().to_bytes(),
            secret_bytes: signing_key.to_bytes(),
        }
    }

    pub fn from_secret(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("Identity key must be 32 bytes, got {}", bytes.len()))
        })?;
        let signing_key = SigningKey::from_bytes(&arr);
        Ok(Self { public: signing_key.verifying_key().to_bytes(), secret_bytes: arr })
    }

    /// Rebuild from `public || secret`, checking that both halves belong together.
    pub fn from_stored(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != PUBLIC_KEY_SIZE + 32 {
            return Err(CryptoError::InvalidKey(format!(
                "stored identity key must be 64 bytes, got {}",
                bytes.len()
            )));
        }
        let kp = Self::from_secret(&bytes[PUBLIC_KEY_SIZE..])?;
        if kp.public[..] != bytes[..PUBLIC_KEY_SIZE] {
            return Err(CryptoError::InvalidKey("identity public key does not match secret".into()));
        }
        Ok(kp)
    }

    pub fn to_stored(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(64));
        out.extend_from_slice(&self.public);
        out.extend_from_slice(&self.secret_bytes);
        out
    }

    pub fn public(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.public
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret_bytes
    }

    /// Sign arbitrary bytes; returns the 64-byte raw Ed25519 signature.
    pub fn sign(&self, msg: &[u8]) -> [u8; SIGNATURE_SIZE] {
        SigningKey::from_bytes(&self.secret_bytes).sign(msg).to_bytes()
    }

    /// Verify a signature made by any Ed25519 public key.
    pub fn verify(public_bytes: &[u8], msg: &[u8], sig_bytes: &[u8]) -> Result<(), CryptoError> {
        let vk = VerifyingKey::from_bytes(
            public_bytes.try_into().map_err(|_| CryptoError::InvalidKey("Bad pubkey len".into()))?,
        )
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let sig = Signature::from_bytes(
            sig_bytes.try_into().map_err(|_| CryptoError::InvalidKey("Bad sig len".into()))?,
        );
        vk.verify(msg, &sig).map_err(|_| CryptoError::SignatureVerification)
    }

    /// Hex fingerprint of the public key, as shown to users comparing keys.
    pub fn fingerprint(&self) -> String {
        hex::encode(self.public)
    }
}
