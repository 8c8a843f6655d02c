//! Tunables of the session core.
//!
//! Every field has a default matching the protocol constants below; a JSON
//! document only needs to name what it overrides.

use serde::{Deserialize, Serialize};

use crate::{double_ratchet::EncryptionPolicy, error::LimeError};

pub const DR_SHARED_AD_SIZE: usize = lime_crypto::x3dh::SHARED_AD_SIZE;
pub const MAX_MESSAGE_SKIP: u16 = 512;
pub const MAX_MESSAGES_RECEIVED_AFTER_SKIP: u32 = 64;
pub const MAX_SENDING_CHAIN: u16 = 500;
pub const DR_SESSION_LIMBO_DAYS: u32 = 30;
pub const SPK_LIFETIME_DAYS: u32 = 7;
pub const SPK_LIMBO_DAYS: u32 = 30;
pub const OPK_BATCH_SIZE: u16 = 25;
pub const OPK_INITIAL_BATCH_SIZE: u16 = 100;
pub const OPK_SERVER_LOW_LIMIT: u16 = 100;
/// Dispatched OPks outlive the SPk they were published with.
pub const OPK_LIMBO_DAYS: u32 = SPK_LIFETIME_DAYS + SPK_LIMBO_DAYS;
pub const OPK_UPDATE_PERIOD_SECS: u64 = 86_400;
pub const X3DH_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimeSettings {
    pub max_message_skip: u16,
    pub max_messages_received_after_skip: u32,
    pub max_sending_chain: u16,
    pub dr_session_limbo_days: u32,
    pub spk_lifetime_days: u32,
    pub spk_limbo_days: u32,
    pub opk_batch_size: u16,
    pub opk_initial_batch_size: u16,
    pub opk_server_low_limit: u16,
    pub opk_limbo_days: u32,
    pub opk_update_period_secs: u64,
    /// A key server round trip taking longer fails the operation waiting on it.
    pub request_timeout_secs: u64,
    pub default_policy: EncryptionPolicy,
}

impl Default for LimeSettings {
    fn default() -> Self {
        Self {
            max_message_skip: MAX_MESSAGE_SKIP,
            max_messages_received_after_skip: MAX_MESSAGES_RECEIVED_AFTER_SKIP,
            max_sending_chain: MAX_SENDING_CHAIN,
            dr_session_limbo_days: DR_SESSION_LIMBO_DAYS,
            spk_lifetime_days: SPK_LIFETIME_DAYS,
            spk_limbo_days: SPK_LIMBO_DAYS,
            opk_batch_size: OPK_BATCH_SIZE,
            opk_initial_batch_size: OPK_INITIAL_BATCH_SIZE,
            opk_server_low_limit: OPK_SERVER_LOW_LIMIT,
            opk_limbo_days: OPK_LIMBO_DAYS,
            opk_update_period_secs: OPK_UPDATE_PERIOD_SECS,
            request_timeout_secs: X3DH_REQUEST_TIMEOUT_SECS,
            default_policy: EncryptionPolicy::default(),
        }
    }
}

impl LimeSettings {
    pub fn from_json(json: &str) -> Result<Self, LimeError> {
        let settings: Self =
            serde_json::from_str(json).map_err(|e| LimeError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), LimeError> {
        if self.max_sending_chain == 0 {
            return Err(LimeError::Config("max_sending_chain must be at least 1".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(LimeError::Config("request_timeout_secs must be at least 1".into()));
        }
        Ok(())
    }
}
