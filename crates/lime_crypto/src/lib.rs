//! lime_crypto — cryptographic primitives of the lime session core
//!
//! # Design principles
//! - No custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Algorithms are reached through the `curve` dispatch table keyed by `CurveId`.
//!
//! # Module layout
//! - `curve`     — `CurveId`, X25519 key pairs, per-curve dispatch table
//! - `identity`  — long-term Ed25519 identity keys
//! - `x3dh`      — X3DH shared secret and associated data derivation
//! - `ratchet`   — Double Ratchet state transitions + skipped message keys
//! - `aead`      — XChaCha20-Poly1305 with derived nonces
//! - `kdf`       — HKDF / HMAC-SHA512 chain derivations
//! - `error`     — unified error type

pub mod aead;
pub mod curve;
pub mod error;
pub mod identity;
pub mod kdf;
pub mod ratchet;
pub mod x3dh;

pub use curve::{CurveId, DhKeyPair};
pub use error::CryptoError;
pub use identity::IdentityKeyPair;
