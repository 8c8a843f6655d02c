use lime_crypto::{CryptoError, CurveId};
use lime_proto::{CodecError, X3dhErrorCode};
use lime_store::StoreError;
use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum LimeError {
    // ── Caller errors ────────────────────────────────────────────────────
    #[error("Unknown local user {0}")]
    UnknownUser(String),

    #[error("Local user {0} already exists")]
    UserAlreadyExists(String),

    #[error("Curve {0} is not supported")]
    UnsupportedCurve(CurveId),

    #[error("Peer device {0} presents an identity key different from the stored one")]
    IdentityKeyConflict(String),

    #[error("Storage error: {0}")]
    Store(StoreError),

    #[error("Invalid settings: {0}")]
    Config(String),

    // ── Key server round trips ───────────────────────────────────────────
    #[error("X3DH server error {code}: {message}")]
    Server { code: X3dhErrorCode, message: String },

    #[error("Got a non Ok response from server : {0}")]
    HttpStatus(u16),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Bad response from X3DH server: {0}")]
    BadResponse(String),

    #[error("Every recipient failed")]
    AllRecipientsFailed,

    // ── Lower layers ─────────────────────────────────────────────────────
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl From<StoreError> for LimeError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UserAlreadyExists(id) => Self::UserAlreadyExists(id),
            StoreError::UserInactive(id) => Self::UnknownUser(id),
            StoreError::IdentityKeyConflict { device_id, .. } => {
                Self::IdentityKeyConflict(device_id)
            }
            StoreError::Crypto(CryptoError::UnsupportedCurve(curve)) => {
                Self::UnsupportedCurve(curve)
            }
            other => Self::Store(other),
        }
    }
}

impl From<sqlx::Error> for LimeError {
    fn from(e: sqlx::Error) -> Self {
        Self::Store(StoreError::Database(e))
    }
}

impl LimeError {
    /// Local storage can no longer be trusted for this operation. Everything
    /// else met while decrypting only means the message does not decrypt.
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::Database(_) | StoreError::Corrupt(_) | StoreError::Migration(_))
        )
    }
}
