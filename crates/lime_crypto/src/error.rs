use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Signature verification failed")]
    SignatureVerification,

    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("AEAD decryption failed (authentication tag mismatch)")]
    AeadDecrypt,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Curve {0:?} is not supported by this build")]
    UnsupportedCurve(crate::curve::CurveId),

    #[error("Unknown curve id {0:#04x}")]
    UnknownCurve(u8),

    #[error("Ratchet step failed: {0}")]
    RatchetStep(String),

    #[error("Too many skipped messages: wanted {wanted}, allowed {allowed}")]
    TooManySkipped { wanted: u32, allowed: u32 },

    #[error("Receiving chain not initialised")]
    ReceivingChainUnset,
}
