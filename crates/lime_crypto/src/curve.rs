//! Algorithm suites and the dispatch table selecting them.
//!
//! A `CurveId` travels with every stored key and every wire message. Key
//! generation and signature checks go through `suite(curve)`, a static table
//! of function pointers. Only Curve25519 is built in; the other identifiers
//! are recognised so that they can be rejected cleanly.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::{error::CryptoError, identity::IdentityKeyPair};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CurveId {
    C25519 = 0x01,
    C448 = 0x02,
    /// Curve25519 hybridised with a post-quantum KEM.
    C25519K512 = 0x03,
}

impl CurveId {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for CurveId {
    type Error = CryptoError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x01 => Ok(Self::C25519),
            0x02 => Ok(Self::C448),
            0x03 => Ok(Self::C25519K512),
            other => Err(CryptoError::UnknownCurve(other)),
        }
    }
}

impl std::fmt::Display for CurveId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::C25519 => "c25519",
            Self::C448 => "c448",
            Self::C25519K512 => "c25519k512",
        };
        f.write_str(name)
    }
}

// ── Key agreement key pair ────────────────────────────────────────────────────

/// X25519 key pair used for SPk, OPk, X3DH ephemeral and ratchet keys.
#[derive(Clone, ZeroizeOnDrop)]
pub struct DhKeyPair {
    #[zeroize(skip)]
    public: [u8; 32],
    secret: [u8; 32],
}

impl DhKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self { public: *public.as_bytes(), secret: secret.to_bytes() }
    }

    /// Rebuild from the stored `public || secret` form.
    pub fn from_stored(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 64 {
            return Err(CryptoError::InvalidKey(format!(
                "stored DH key pair must be 64 bytes, got {}",
                bytes.len()
            )));
        }
        let mut public = [0u8; 32];
        let mut secret = [0u8; 32];
        public.copy_from_slice(&bytes[..32]);
        secret.copy_from_slice(&bytes[32..]);
        Ok(Self { public, secret })
    }

    /// `public || secret`, the storage form.
    pub fn to_stored(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(64));
        out.extend_from_slice(&self.public);
        out.extend_from_slice(&self.secret);
        out
    }

    pub fn public(&self) -> &[u8; 32] {
        &self.public
    }

    pub fn dh(&self, peer_public: &[u8; 32]) -> Zeroizing<[u8; 32]> {
        x25519(&self.secret, peer_public)
    }
}

impl std::fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhKeyPair")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

fn x25519(secret: &[u8; 32], peer_public: &[u8; 32]) -> Zeroizing<[u8; 32]> {
    let secret = StaticSecret::from(*secret);
    let shared = secret.diffie_hellman(&X25519Public::from(*peer_public));
    Zeroizing::new(shared.to_bytes())
}

// ── Dispatch table ────────────────────────────────────────────────────────────

/// Capability set of one algorithm suite.
pub struct CurveSuite {
    pub id: CurveId,
    /// SPk, OPk, X3DH ephemeral and ratchet keys.
    pub generate_dh: fn() -> DhKeyPair,
    pub generate_identity: fn() -> IdentityKeyPair,
    /// `verify(identity_public, message, signature)`
    pub verify: fn(&[u8], &[u8], &[u8]) -> Result<(), CryptoError>,
}

impl CurveSuite {
    /// A fresh batch of key agreement key pairs.
    pub fn generate_dh_batch(&self, count: usize) -> Vec<DhKeyPair> {
        (0..count).map(|_| (self.generate_dh)()).collect()
    }
}

static C25519_SUITE: CurveSuite = CurveSuite {
    id: CurveId::C25519,
    generate_dh: DhKeyPair::generate,
    generate_identity: IdentityKeyPair::generate,
    verify: IdentityKeyPair::verify,
};

/// Look up the primitives for `curve`.
pub fn suite(curve: CurveId) -> Result<&'static CurveSuite, CryptoError> {
    match curve {
        CurveId::C25519 => Ok(&C25519_SUITE),
        other => Err(CryptoError::UnsupportedCurve(other)),
    }
}
