//! Key derivation functions
//!
//! Everything here runs on SHA-512:
//! - `hkdf_expand`  — generic HKDF, used by X3DH and the cipher-message seed.
//! - `kdf_rk`       — root chain step of the Double Ratchet.
//! - `kdf_ck`       — symmetric chain step producing a message key.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha512;
use zeroize::Zeroize;

use crate::{aead::MessageKey, error::CryptoError};

type HmacSha512 = Hmac<Sha512>;

/// HKDF info for the root chain.
pub const INFO_ROOT_CHAIN: &[u8] = b"DR Root Chain Key Derivation";
/// HKDF info for the cipher-message key derived from a random seed.
pub const INFO_MESSAGE_KEY: &[u8] = b"DR Message Key Derivation";
/// HKDF info for the X3DH shared secret.
pub const INFO_X3DH_SK: &[u8] = b"Lime";
/// HKDF info for the X3DH associated data.
pub const INFO_X3DH_AD: &[u8] = b"X3DH Associated Data";

/// Chain and root key length.
pub const CHAIN_KEY_SIZE: usize = 32;

// ── HKDF-SHA512 ───────────────────────────────────────────────────────────────

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
///
/// `salt` may be `None` (HKDF then uses a zeroed salt of hash length).
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha512>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

// ── Double Ratchet chains ─────────────────────────────────────────────────────

/// KDF_RK(rk, dh_out) → (rk', ck). Updates `rk` in place and returns the new chain key.
pub fn kdf_rk(rk: &mut [u8; 32], dh_output: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut okm = [0u8; 2 * CHAIN_KEY_SIZE];
    hkdf_expand(dh_output, Some(rk.as_slice()), INFO_ROOT_CHAIN, &mut okm)?;

    let mut ck = [0u8; CHAIN_KEY_SIZE];
    rk.copy_from_slice(&okm[..CHAIN_KEY_SIZE]);
    ck.copy_from_slice(&okm[CHAIN_KEY_SIZE..]);
    okm.zeroize();
    Ok(ck)
}

/// KDF_CK(ck) → mk, advancing `ck` in place.
///
/// MK = HMAC(CK, 0x01) truncated to key + nonce, CK' = HMAC(CK, 0x02) truncated to 32 bytes.
pub fn kdf_ck(ck: &mut [u8; 32]) -> Result<MessageKey, CryptoError> {
    let mut mac = HmacSha512::new_from_slice(ck.as_slice())
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac.update(&[0x01]);
    let mut mk_full = mac.finalize().into_bytes();

    let mut mac = HmacSha512::new_from_slice(ck.as_slice())
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac.update(&[0x02]);
    let mut ck_full = mac.finalize().into_bytes();

    ck.copy_from_slice(&ck_full[..CHAIN_KEY_SIZE]);
    let mk = MessageKey::from_slice(&mk_full[..MessageKey::SIZE])?;
    mk_full.as_mut_slice().zeroize();
    ck_full.as_mut_slice().zeroize();
    Ok(mk)
}

/// Turn the random seed carried by a DR message into the key protecting the shared cipher message.
pub fn message_key_from_seed(seed: &[u8]) -> Result<MessageKey, CryptoError> {
    let mut okm = [0u8; MessageKey::SIZE];
    hkdf_expand(seed, None, INFO_MESSAGE_KEY, &mut okm)?;
    let mk = MessageKey::from_slice(&okm);
    okm.zeroize();
    mk
}
