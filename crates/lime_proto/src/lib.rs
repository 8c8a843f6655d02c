//! lime_proto — binary wire formats of the lime session core
//!
//! Every format is versioned (first byte `0x01`) and carries the `CurveId`
//! of the keys it holds.
//!
//! # Modules
//! - `codec` — byte cursor, error type
//! - `dr`    — Double Ratchet message header + embedded X3DH init message
//! - `x3dh`  — requests/responses exchanged with the X3DH key server

pub mod codec;
pub mod dr;
pub mod x3dh;

pub use codec::CodecError;
pub use dr::{DrHeader, X3dhInit};
pub use x3dh::{
    KeyBundle, PeerBundle, X3dhErrorCode, X3dhMessage, X3dhMessageType, X3DH_PROTOCOL_VERSION,
};
