//! lime_store — local persistent storage for the lime session core.
//!
//! One SQLite database holds local users and their identity keys, the peer
//! device trust cache, double ratchet sessions with their skipped message
//! keys, and the SPk/OPk bookkeeping.
//!
//! Query functions take a `&mut SqliteConnection` so the caller decides the
//! transaction scope: pass `&mut *tx` from [`Store::begin`] or a pooled
//! connection from [`Store::acquire`].

pub mod cleanup;
pub mod db;
pub mod error;
pub mod models;
pub mod peers;
pub mod prekeys;
pub mod sessions;
pub mod users;

pub use db::Store;
pub use error::StoreError;
pub use models::{PeerDeviceStatus, SessionSummary};
pub use sessions::{SessionUpdate, StoredSession};
pub use users::LocalUser;
