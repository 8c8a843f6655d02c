use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] lime_crypto::CryptoError),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Local user {0} already exists")]
    UserAlreadyExists(String),

    #[error("Local user {0} is not active yet (registration never acknowledged)")]
    UserInactive(String),

    #[error("Identity key conflict for device {device_id}: stored={stored} new={new}")]
    IdentityKeyConflict { device_id: String, stored: String, new: String },

    #[error("Corrupted record: {0}")]
    Corrupt(String),

    #[error("Schema error: {0}")]
    Migration(String),
}
