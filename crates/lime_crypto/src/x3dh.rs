//! X3DH asynchronous key agreement.
//!
//! References:
//!   - Signal X3DH spec: <https://signal.org/docs/specifications/x3dh/>
//!   - RFC 7748 (X25519), RFC 5869 (HKDF)
//!
//! Initiator (fetched the peer bundle IK_B, SPK_B + sig, optional OPK_B):
//!     DH1 = DH(IK_A, SPK_B)
//!     DH2 = DH(EK_A, IK_B)
//!     DH3 = DH(EK_A, SPK_B)
//!     DH4 = DH(EK_A, OPK_B)     [optional]
//!
//!   SK = HKDF(salt = 0, ikm = 0xFF*32 || DH1 || DH2 || DH3 [|| DH4], info = "Lime")
//!   AD = HKDF(salt = 0, ikm = IK_initiator || IK_receiver || id_initiator || id_receiver,
//!             info = "X3DH Associated Data")
//!
//! The SPk signature is verified before any DH is computed. The responder
//! mirrors the same DH set from the init message carried in the first DR
//! message header.

use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::{
    curve::{self, CurveId, DhKeyPair},
    error::CryptoError,
    identity::IdentityKeyPair,
    kdf,
};

/// Size of the X3DH associated data bound into every DR message of the session.
pub const SHARED_AD_SIZE: usize = 32;

/// Salt used for both X3DH derivations: zeros of SHA-512 length.
const ZERO_SALT: [u8; 64] = [0u8; 64];

/// Convert an Ed25519 signing key (32 bytes) to an X25519 static secret.
/// Uses the clamped SHA-512 expansion that ed25519-dalek uses internally.
pub fn ed25519_secret_to_x25519(ed_secret: &[u8; 32]) -> StaticSecret {
    use sha2::{Digest, Sha512};
    let mut h = Sha512::digest(ed_secret);
    // Clamp as per RFC 7748 §5
    h[0] &= 248;
    h[31] &= 127;
    h[31] |= 64;
    let mut key = [0u8; 32];
    key.copy_from_slice(&h[..32]);
    h.as_mut_slice().zeroize();
    let secret = StaticSecret::from(key);
    key.zeroize();
    secret
}

/// Convert an Ed25519 public key to an X25519 public key (Edwards → Montgomery).
pub fn ed25519_pub_to_x25519(ed_pub: &[u8; 32]) -> Result<X25519Public, CryptoError> {
    use curve25519_dalek::edwards::CompressedEdwardsY;
    let compressed = CompressedEdwardsY::from_slice(ed_pub)
        .map_err(|_| CryptoError::InvalidKey("invalid Ed25519 public key".into()))?;
    let point = compressed.decompress().ok_or_else(|| {
        CryptoError::InvalidKey("Ed25519 public key decompression failed".into())
    })?;
    Ok(X25519Public::from(point.to_montgomery().to_bytes()))
}

// ── Shared values ─────────────────────────────────────────────────────────────

/// Output of a completed agreement on either side.
pub struct X3dhSecret {
    /// Feeds the Double Ratchet as its initial root key.
    pub shared_key: Zeroizing<[u8; 32]>,
    pub shared_ad: [u8; SHARED_AD_SIZE],
}

/// Initiator side result: the secret plus the ephemeral key to put in the init message.
pub struct X3dhInitiation {
    pub secret: X3dhSecret,
    pub ephemeral_public: [u8; 32],
}

/// Peer material consumed by the initiator, as fetched from the key server.
pub struct PeerBundleKeys<'a> {
    pub curve: CurveId,
    pub device_id: &'a str,
    pub ik: &'a [u8; 32],
    pub spk: &'a [u8; 32],
    pub spk_sig: &'a [u8],
    pub opk: Option<&'a [u8; 32]>,
}

/// AD = HKDF(initiatorIk || receiverIk || initiatorDeviceId || receiverDeviceId).
pub fn shared_ad(
    initiator_ik: &[u8],
    receiver_ik: &[u8],
    initiator_device_id: &str,
    receiver_device_id: &str,
) -> Result<[u8; SHARED_AD_SIZE], CryptoError> {
    let mut ikm = Vec::with_capacity(
        initiator_ik.len()
            + receiver_ik.len()
            + initiator_device_id.len()
            + receiver_device_id.len(),
    );
    ikm.extend_from_slice(initiator_ik);
    ikm.extend_from_slice(receiver_ik);
    ikm.extend_from_slice(initiator_device_id.as_bytes());
    ikm.extend_from_slice(receiver_device_id.as_bytes());

    let mut ad = [0u8; SHARED_AD_SIZE];
    kdf::hkdf_expand(&ikm, Some(&ZERO_SALT), kdf::INFO_X3DH_AD, &mut ad)?;
    Ok(ad)
}

fn derive_sk(mut ikm: Vec<u8>) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let mut sk = Zeroizing::new([0u8; 32]);
    let res = kdf::hkdf_expand(&ikm, Some(&ZERO_SALT), kdf::INFO_X3DH_SK, sk.as_mut_slice());
    ikm.zeroize();
    res.map(|_| sk)
}

// ── Initiator ─────────────────────────────────────────────────────────────────

/// Run the initiator half against a fetched bundle.
pub fn initiate(
    self_ik: &IdentityKeyPair,
    self_device_id: &str,
    peer: &PeerBundleKeys<'_>,
) -> Result<X3dhInitiation, CryptoError> {
    let suite = curve::suite(peer.curve)?;
    (suite.verify)(peer.ik, peer.spk, peer.spk_sig)?;

    let ik_a_x = ed25519_secret_to_x25519(self_ik.secret_bytes());
    let ik_b_x = ed25519_pub_to_x25519(peer.ik)?;
    let spk_b = X25519Public::from(*peer.spk);

    let ek = (suite.generate_dh)();

    let dh1 = ik_a_x.diffie_hellman(&spk_b);
    let dh2 = ek.dh(ik_b_x.as_bytes());
    let dh3 = ek.dh(peer.spk);

    let mut ikm = vec![0xFFu8; 32];
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_slice());
    ikm.extend_from_slice(dh3.as_slice());
    if let Some(opk) = peer.opk {
        ikm.extend_from_slice(ek.dh(opk).as_slice());
    }

    let shared_key = derive_sk(ikm)?;
    let shared_ad = shared_ad(self_ik.public(), peer.ik, self_device_id, peer.device_id)?;

    Ok(X3dhInitiation {
        secret: X3dhSecret { shared_key, shared_ad },
        ephemeral_public: *ek.public(),
    })
}

// ── Responder ─────────────────────────────────────────────────────────────────

/// Rebuild the initiator's secret from an init message.
///
/// `peer_ik` / `peer_device_id` identify the initiator; `spk` and `opk` are
/// the local prekeys it referenced; `ek` is its ephemeral public key.
pub fn respond(
    self_ik: &IdentityKeyPair,
    self_device_id: &str,
    peer_ik: &[u8; 32],
    peer_device_id: &str,
    spk: &DhKeyPair,
    opk: Option<&DhKeyPair>,
    ek: &[u8; 32],
) -> Result<X3dhSecret, CryptoError> {
    let peer_ik_x = ed25519_pub_to_x25519(peer_ik)?;
    let self_ik_x = ed25519_secret_to_x25519(self_ik.secret_bytes());

    let dh1 = spk.dh(peer_ik_x.as_bytes());
    let dh2 = self_ik_x.diffie_hellman(&X25519Public::from(*ek));
    let dh3 = spk.dh(ek);

    let mut ikm = vec![0xFFu8; 32];
    ikm.extend_from_slice(dh1.as_slice());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_slice());
    if let Some(opk) = opk {
        ikm.extend_from_slice(opk.dh(ek).as_slice());
    }

    let shared_key = derive_sk(ikm)?;
    let shared_ad = shared_ad(peer_ik, self_ik.public(), peer_device_id, self_device_id)?;
    Ok(X3dhSecret { shared_key, shared_ad })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bob {
        ik: IdentityKeyPair,
        spk: DhKeyPair,
        sig: [u8; 64],
        opk: DhKeyPair,
    }

    fn bob() -> Bob {
        let ik = IdentityKeyPair::generate();
        let spk = DhKeyPair::generate();
        let sig = ik.sign(spk.public());
        Bob { ik, spk, sig, opk: DhKeyPair::generate() }
    }

    #[test]
    fn x3dh_roundtrip_without_opk() {
        let alice_ik = IdentityKeyPair::generate();
        let bob = bob();

        let init = initiate(
            &alice_ik,
            "alice.1",
            &PeerBundleKeys {
                curve: CurveId::C25519,
                device_id: "bob.1",
                ik: bob.ik.public(),
                spk: bob.spk.public(),
                spk_sig: &bob.sig,
                opk: None,
            },
        )
        .unwrap();

        let bob_side = respond(
            &bob.ik,
            "bob.1",
            alice_ik.public(),
            "alice.1",
            &bob.spk,
            None,
            &init.ephemeral_public,
        )
        .unwrap();

        assert_eq!(*init.secret.shared_key, *bob_side.shared_key);
        assert_eq!(init.secret.shared_ad, bob_side.shared_ad);
    }

    #[test]
    fn x3dh_roundtrip_with_opk() {
        let alice_ik = IdentityKeyPair::generate();
        let bob = bob();

        let init = initiate(
            &alice_ik,
            "alice.1",
            &PeerBundleKeys {
                curve: CurveId::C25519,
                device_id: "bob.1",
                ik: bob.ik.public(),
                spk: bob.spk.public(),
                spk_sig: &bob.sig,
                opk: Some(bob.opk.public()),
            },
        )
        .unwrap();

        let with_opk = respond(
            &bob.ik, "bob.1", alice_ik.public(), "alice.1", &bob.spk, Some(&bob.opk),
            &init.ephemeral_public,
        )
        .unwrap();
        assert_eq!(*init.secret.shared_key, *with_opk.shared_key);

        let without_opk = respond(
            &bob.ik, "bob.1", alice_ik.public(), "alice.1", &bob.spk, None,
            &init.ephemeral_public,
        )
        .unwrap();
        assert_ne!(*init.secret.shared_key, *without_opk.shared_key);
    }

    #[test]
    fn rejects_invalid_spk_signature() {
        let alice_ik = IdentityKeyPair::generate();
        let bob = bob();
        let evil_ik = IdentityKeyPair::generate();
        let evil_sig = evil_ik.sign(bob.spk.public());

        let res = initiate(
            &alice_ik,
            "alice.1",
            &PeerBundleKeys {
                curve: CurveId::C25519,
                device_id: "bob.1",
                ik: bob.ik.public(),
                spk: bob.spk.public(),
                spk_sig: &evil_sig,
                opk: None,
            },
        );
        assert!(matches!(res, Err(CryptoError::SignatureVerification)));
    }

    #[test]
    fn unsupported_curve_is_refused_before_any_dh() {
        let alice_ik = IdentityKeyPair::generate();
        let bob = bob();
        let res = initiate(
            &alice_ik,
            "alice.1",
            &PeerBundleKeys {
                curve: CurveId::C448,
                device_id: "bob.1",
                ik: bob.ik.public(),
                spk: bob.spk.public(),
                spk_sig: &bob.sig,
                opk: None,
            },
        );
        assert!(matches!(res, Err(CryptoError::UnsupportedCurve(CurveId::C448))));
    }

    #[test]
    fn associated_data_is_ordered_by_role() {
        let a = shared_ad(&[1u8; 32], &[2u8; 32], "a", "b").unwrap();
        let b = shared_ad(&[2u8; 32], &[1u8; 32], "b", "a").unwrap();
        assert_ne!(a, b);
    }
}
