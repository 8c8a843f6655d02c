//! Double Ratchet state machine.
//!
//! References:
//!   - Signal Double Ratchet spec: <https://signal.org/docs/specifications/doubleratchet/>
//!
//! State separation:
//!   RK  — root key (updated on every DH ratchet step)
//!   CKs — sending chain key (updated per message)
//!   CKr — receiving chain key (updated per message)
//!   MK  — message key (derived from CK, used once)
//!
//! This module holds the pure state transitions. Skipped message keys are
//! handed back to the caller as `SkippedChain`s; looking them up again and
//! persisting them belongs to the storage layer.

use zeroize::ZeroizeOnDrop;

use crate::{
    aead::MessageKey,
    curve::{CurveId, DhKeyPair},
    error::CryptoError,
    kdf,
    x3dh::SHARED_AD_SIZE,
};

/// Message keys derived but not yet used, all under one peer ratchet key.
#[derive(Debug, Clone)]
pub struct SkippedChain {
    pub dhr: [u8; 32],
    /// (Nr, MK) in derivation order.
    pub keys: Vec<(u16, MessageKey)>,
}

/// Key and header fields for one outgoing message.
#[derive(Debug)]
pub struct SendStep {
    pub ns: u16,
    pub pn: u16,
    pub dhs: [u8; 32],
    pub mk: MessageKey,
}

/// Complete ratchet state of one session.
#[derive(Clone, ZeroizeOnDrop)]
pub struct RatchetState {
    #[zeroize(skip)]
    pub curve: CurveId,
    #[zeroize(skip)]
    dhr: [u8; 32],
    #[zeroize(skip)]
    dhr_valid: bool,
    #[zeroize(skip)]
    dhs: DhKeyPair,
    rk: [u8; 32],
    cks: [u8; 32],
    ckr: [u8; 32],
    #[zeroize(skip)]
    pub ns: u16,
    #[zeroize(skip)]
    pub nr: u16,
    #[zeroize(skip)]
    pub pn: u16,
    #[zeroize(skip)]
    shared_ad: [u8; SHARED_AD_SIZE],
}

/// Raw columns of a persisted ratchet state.
pub struct RatchetParts {
    pub curve: CurveId,
    pub dhr: [u8; 32],
    pub dhs: DhKeyPair,
    pub rk: [u8; 32],
    pub cks: [u8; 32],
    pub ckr: [u8; 32],
    pub ns: u16,
    pub nr: u16,
    pub pn: u16,
    pub shared_ad: [u8; SHARED_AD_SIZE],
}

impl RatchetState {
    /// Sender side: the peer SPk acts as first DHr and a DH ratchet half-step
    /// produces the first sending chain.
    pub fn init_sender(
        curve: CurveId,
        shared_key: &[u8; 32],
        shared_ad: [u8; SHARED_AD_SIZE],
        peer_spk: &[u8; 32],
    ) -> Result<Self, CryptoError> {
        let dhs = (crate::curve::suite(curve)?.generate_dh)();
        let mut rk = *shared_key;
        let cks = kdf::kdf_rk(&mut rk, dhs.dh(peer_spk).as_slice())?;
        Ok(Self {
            curve,
            dhr: *peer_spk,
            dhr_valid: true,
            dhs,
            rk,
            cks,
            ckr: [0u8; 32],
            ns: 0,
            nr: 0,
            pn: 0,
            shared_ad,
        })
    }

    /// Receiver side: our SPk is the first DHs, DHr stays unset until the
    /// first incoming message runs a full DH ratchet.
    pub fn init_receiver(
        curve: CurveId,
        shared_key: &[u8; 32],
        shared_ad: [u8; SHARED_AD_SIZE],
        self_spk: DhKeyPair,
    ) -> Result<Self, CryptoError> {
        crate::curve::suite(curve)?;
        Ok(Self {
            curve,
            dhr: [0u8; 32],
            dhr_valid: false,
            dhs: self_spk,
            rk: *shared_key,
            cks: [0u8; 32],
            ckr: [0u8; 32],
            ns: 0,
            nr: 0,
            pn: 0,
            shared_ad,
        })
    }

    /// Rebuild a state loaded from storage. Stored sessions always have a valid DHr.
    pub fn from_parts(parts: RatchetParts) -> Self {
        Self {
            curve: parts.curve,
            dhr: parts.dhr,
            dhr_valid: true,
            dhs: parts.dhs,
            rk: parts.rk,
            cks: parts.cks,
            ckr: parts.ckr,
            ns: parts.ns,
            nr: parts.nr,
            pn: parts.pn,
            shared_ad: parts.shared_ad,
        }
    }

    pub fn to_parts(&self) -> RatchetParts {
        RatchetParts {
            curve: self.curve,
            dhr: self.dhr,
            dhs: self.dhs.clone(),
            rk: self.rk,
            cks: self.cks,
            ckr: self.ckr,
            ns: self.ns,
            nr: self.nr,
            pn: self.pn,
            shared_ad: self.shared_ad,
        }
    }

    pub fn dhr(&self) -> &[u8; 32] {
        &self.dhr
    }

    pub fn dhr_valid(&self) -> bool {
        self.dhr_valid
    }

    pub fn dhs_public(&self) -> &[u8; 32] {
        self.dhs.public()
    }

    pub fn shared_ad(&self) -> &[u8; SHARED_AD_SIZE] {
        &self.shared_ad
    }

    pub fn cks(&self) -> &[u8; 32] {
        &self.cks
    }

    pub fn ckr(&self) -> &[u8; 32] {
        &self.ckr
    }

    // ── Send ─────────────────────────────────────────────────────────────

    /// Symmetric ratchet step on the sending chain.
    pub fn send_step(&mut self) -> Result<SendStep, CryptoError> {
        let ns = self.ns;
        let mk = kdf::kdf_ck(&mut self.cks)?;
        self.ns = self.ns.checked_add(1).ok_or_else(|| {
            CryptoError::RatchetStep("sending chain counter overflow".into())
        })?;
        Ok(SendStep { ns, pn: self.pn, dhs: *self.dhs.public(), mk })
    }

    // ── Receive ──────────────────────────────────────────────────────────

    /// Derive the key of message (`dhs`, `ns`, `pn`) that was not found among
    /// stored skipped keys. Keys stepped over on the way are appended to
    /// `skipped`.
    ///
    /// At most `max_skip` keys are derived in total across the previous and
    /// the new receiving chain.
    pub fn receive_step(
        &mut self,
        dhs: &[u8; 32],
        ns: u16,
        pn: u16,
        max_skip: u16,
        skipped: &mut Vec<SkippedChain>,
    ) -> Result<MessageKey, CryptoError> {
        let mut allowed = i32::from(max_skip);
        if !self.dhr_valid {
            self.dh_ratchet(dhs)?;
            self.dhr_valid = true;
        } else if &self.dhr != dhs {
            allowed -= i32::from(pn) - i32::from(self.nr);
            self.skip_message_keys(pn, i32::from(max_skip) - i32::from(ns), skipped)?;
            self.dh_ratchet(dhs)?;
        }

        self.skip_message_keys(ns, allowed, skipped)?;

        let mk = kdf::kdf_ck(&mut self.ckr)?;
        self.nr = self.nr.checked_add(1).ok_or_else(|| {
            CryptoError::RatchetStep("receiving chain counter overflow".into())
        })?;
        Ok(mk)
    }

    fn skip_message_keys(
        &mut self,
        until: u16,
        limit: i32,
        skipped: &mut Vec<SkippedChain>,
    ) -> Result<(), CryptoError> {
        if self.nr >= until {
            return Ok(());
        }
        if i32::from(self.nr) + limit < i32::from(until) {
            return Err(CryptoError::TooManySkipped {
                wanted: u32::from(until.saturating_sub(self.nr)),
                allowed: limit.max(0) as u32,
            });
        }

        let mut chain = SkippedChain { dhr: self.dhr, keys: Vec::new() };
        while self.nr < until {
            chain.keys.push((self.nr, kdf::kdf_ck(&mut self.ckr)?));
            self.nr += 1;
        }
        skipped.push(chain);
        Ok(())
    }

    fn dh_ratchet(&mut self, peer_dh: &[u8; 32]) -> Result<(), CryptoError> {
        self.pn = self.ns;
        self.ns = 0;
        self.nr = 0;
        self.dhr = *peer_dh;

        self.ckr = kdf::kdf_rk(&mut self.rk, self.dhs.dh(&self.dhr).as_slice())?;
        self.dhs = (crate::curve::suite(self.curve)?.generate_dh)();
        self.cks = kdf::kdf_rk(&mut self.rk, self.dhs.dh(&self.dhr).as_slice())?;
        Ok(())
    }
}

impl std::fmt::Debug for RatchetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetState")
            .field("curve", &self.curve)
            .field("dhr", &hex::encode(self.dhr))
            .field("dhs", &self.dhs)
            .field("ns", &self.ns)
            .field("nr", &self.nr)
            .field("pn", &self.pn)
            .finish_non_exhaustive()
    }
}
