//! Database row models and the enums stored in them.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Trust status of a peer device identity key.
///
/// Only `Untrusted`, `Trusted` and `Unsafe` are ever persisted. `Fail` is a
/// decryption outcome and `Unknown` means "not in local storage".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerDeviceStatus {
    Untrusted,
    Trusted,
    Unsafe,
    Fail,
    Unknown,
}

impl PeerDeviceStatus {
    /// Integer written in `lime_peer_devices.status`, `None` for the
    /// statuses that are never stored.
    pub fn to_stored(self) -> Option<i64> {
        match self {
            Self::Untrusted => Some(0),
            Self::Trusted => Some(1),
            Self::Unsafe => Some(2),
            Self::Fail | Self::Unknown => None,
        }
    }

    pub fn from_stored(value: i64) -> Result<Self, StoreError> {
        match value {
            0 => Ok(Self::Untrusted),
            1 => Ok(Self::Trusted),
            2 => Ok(Self::Unsafe),
            other => Err(StoreError::Corrupt(format!("peer device status {other}"))),
        }
    }
}

impl std::fmt::Display for PeerDeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Untrusted => "untrusted",
            Self::Trusted => "trusted",
            Self::Unsafe => "unsafe",
            Self::Fail => "fail",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LocalUserRow {
    pub uid: i64,
    pub user_id: String,
    /// Ed25519 public || secret.
    pub ik: Vec<u8>,
    pub server: String,
    /// Curve id, with the inactive bit set until the server acknowledged registration.
    pub curve_id: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PeerDeviceRow {
    pub did: i64,
    pub device_id: String,
    pub ik: Vec<u8>,
    pub status: i64,
}

#[derive(Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub session_id: i64,
    pub did: i64,
    pub uid: i64,
    pub ns: i64,
    pub nr: i64,
    pub pn: i64,
    pub dhr: Vec<u8>,
    /// DH key pair, public || private.
    pub dhs: Vec<u8>,
    pub rk: Vec<u8>,
    pub cks: Vec<u8>,
    pub ckr: Vec<u8>,
    pub ad: Vec<u8>,
    pub status: i64,
    pub time_stamp: Option<NaiveDateTime>,
    pub x3dh_init: Option<Vec<u8>>,
}

/// Session id and active flag, as listed for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionSummary {
    pub session_id: i64,
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::PeerDeviceStatus;

    #[test]
    fn only_three_statuses_are_stored() {
        let stored =
            [PeerDeviceStatus::Untrusted, PeerDeviceStatus::Trusted, PeerDeviceStatus::Unsafe];
        for s in stored {
            let v = s.to_stored().unwrap();
            assert_eq!(PeerDeviceStatus::from_stored(v).unwrap(), s);
        }
        assert_eq!(PeerDeviceStatus::Fail.to_stored(), None);
        assert_eq!(PeerDeviceStatus::Unknown.to_stored(), None);
        assert!(PeerDeviceStatus::from_stored(7).is_err());
    }

    #[test]
    fn serde_uses_snake_case_names() {
        let json = serde_json::to_string(&PeerDeviceStatus::Unsafe).unwrap();
        assert_eq!(json, "\"unsafe\"");
    }
}
