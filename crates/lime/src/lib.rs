//! lime — X3DH and Double Ratchet session manager for multi-device
//! end-to-end encryption.
//!
//! A [`LimeManager`] holds any number of local devices in one SQLite
//! database. Each one registers an identity key, a signed pre-key and a
//! batch of one-time pre-keys on a key server, reached through the
//! [`X3dhTransport`] the application provides. Encrypting to a device met
//! for the first time fetches its key bundle and runs X3DH; every message
//! after that goes through the double ratchet of the session.
//!
//! # Module layout
//! - `manager`       — `LimeManager`, the public entry point
//! - `user`          — one local device and its session cache
//! - `double_ratchet` — DR sessions, the encryption policy, multi-recipient fan-out
//! - `x3dh_client`   — key server requests and X3DH session creation
//! - `transport`     — the `X3dhTransport` trait
//! - `settings`      — protocol constants and `LimeSettings`
//! - `error`         — `LimeError`

pub mod double_ratchet;
pub mod error;
pub mod manager;
pub mod settings;
pub mod transport;
pub mod user;
mod x3dh_client;

pub use double_ratchet::EncryptionPolicy;
pub use error::LimeError;
pub use lime_crypto::CurveId;
pub use lime_store::{PeerDeviceStatus, SessionSummary, Store};
pub use manager::LimeManager;
pub use settings::LimeSettings;
pub use transport::{TransportError, X3dhResponse, X3dhTransport};
pub use user::{Decrypted, EncryptOutput, RecipientData};
