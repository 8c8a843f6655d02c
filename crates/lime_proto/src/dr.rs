//! Double Ratchet message format, protocol version 0x01.
//!
//! ```text
//! header   = version(1) || type(1) || curve(1) || [X3DH init] || Ns(2) || PN(2) || DHs
//! type     = 0x01 X3DH init present | 0x02 payload directly encrypted
//! X3DHinit = OPk flag(1) || Ik || Ek || SPk id(4) || [OPk id(4)]
//! message  = header || ciphertext || tag(16)
//! ```
//!
//! The header is sent in clear and authenticated as part of the AEAD
//! associated data.

use lime_crypto::{aead::TAG_SIZE, CurveId};

use crate::codec::{expect_curve, CodecError, Reader};

pub const DR_PROTOCOL_VERSION: u8 = 0x01;

/// Set when the header embeds an X3DH init message.
pub const FLAG_X3DH_INIT: u8 = 0x01;
/// Set when the DR message carries the payload itself rather than a cipher-message seed.
pub const FLAG_PAYLOAD_DIRECT: u8 = 0x02;

const OPK_ABSENT: u8 = 0x00;
const OPK_PRESENT: u8 = 0x01;

const DH_SIZE: usize = 32;
const IK_SIZE: usize = 32;

/// Key material a receiver needs to complete X3DH without a round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X3dhInit {
    pub ik: [u8; IK_SIZE],
    pub ek: [u8; DH_SIZE],
    pub spk_id: u32,
    pub opk_id: Option<u32>,
}

impl X3dhInit {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(if self.opk_id.is_some() { OPK_PRESENT } else { OPK_ABSENT });
        out.extend_from_slice(&self.ik);
        out.extend_from_slice(&self.ek);
        out.extend_from_slice(&self.spk_id.to_be_bytes());
        if let Some(opk_id) = self.opk_id {
            out.extend_from_slice(&opk_id.to_be_bytes());
        }
        out
    }

    pub fn encoded_len(&self) -> usize {
        1 + IK_SIZE + DH_SIZE + 4 + if self.opk_id.is_some() { 4 } else { 0 }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let init = Self::read(&mut r)?;
        r.finish()?;
        Ok(init)
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let with_opk = match r.u8()? {
            OPK_ABSENT => false,
            OPK_PRESENT => true,
            other => {
                return Err(CodecError::InvalidField(format!("X3DH init OPk flag {other:#04x}")))
            }
        };
        let ik = r.array::<IK_SIZE>()?;
        let ek = r.array::<DH_SIZE>()?;
        let spk_id = r.u32()?;
        let opk_id = if with_opk { Some(r.u32()?) } else { None };
        Ok(Self { ik, ek, spk_id, opk_id })
    }
}

/// Parsed DR message header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrHeader {
    pub curve: CurveId,
    pub ns: u16,
    pub pn: u16,
    pub dhs: [u8; DH_SIZE],
    pub payload_direct: bool,
    pub x3dh_init: Option<X3dhInit>,
    /// Encoded header length; the header bytes are `message[..size]`.
    pub size: usize,
}

impl DrHeader {
    /// Encode a header. `x3dh_init` is the already encoded init message, if any.
    pub fn encode(
        curve: CurveId,
        ns: u16,
        pn: u16,
        dhs: &[u8; DH_SIZE],
        x3dh_init: Option<&[u8]>,
        payload_direct: bool,
    ) -> Vec<u8> {
        let init_len = x3dh_init.map_or(0, <[u8]>::len);
        let mut out = Vec::with_capacity(3 + init_len + 4 + DH_SIZE);

        let mut msg_type = 0u8;
        if x3dh_init.is_some() {
            msg_type |= FLAG_X3DH_INIT;
        }
        if payload_direct {
            msg_type |= FLAG_PAYLOAD_DIRECT;
        }

        out.push(DR_PROTOCOL_VERSION);
        out.push(msg_type);
        out.push(curve.as_u8());
        if let Some(init) = x3dh_init {
            out.extend_from_slice(init);
        }
        out.extend_from_slice(&ns.to_be_bytes());
        out.extend_from_slice(&pn.to_be_bytes());
        out.extend_from_slice(dhs);
        out
    }

    /// Parse the header at the front of a full DR message.
    ///
    /// Fails when the message cannot even hold the auth tag after the header.
    pub fn parse(message: &[u8], expected_curve: CurveId) -> Result<Self, CodecError> {
        let mut r = Reader::new(message);

        let version = r.u8()?;
        if version != DR_PROTOCOL_VERSION {
            return Err(CodecError::BadVersion(version));
        }
        let msg_type = r.u8()?;
        if msg_type & !(FLAG_X3DH_INIT | FLAG_PAYLOAD_DIRECT) != 0 {
            return Err(CodecError::UnknownType(msg_type));
        }
        expect_curve(r.u8()?, expected_curve)?;

        let x3dh_init = if msg_type & FLAG_X3DH_INIT != 0 {
            Some(X3dhInit::read(&mut r)?)
        } else {
            None
        };
        let ns = r.u16()?;
        let pn = r.u16()?;
        let dhs = r.array::<DH_SIZE>()?;
        let size = r.position();

        if r.remaining() < TAG_SIZE {
            return Err(CodecError::Truncated {
                needed: TAG_SIZE,
                offset: size,
                len: message.len(),
            });
        }

        Ok(Self {
            curve: expected_curve,
            ns,
            pn,
            dhs,
            payload_direct: msg_type & FLAG_PAYLOAD_DIRECT != 0,
            x3dh_init,
            size,
        })
    }
}

/// Peek at the X3DH init message of a DR message, without a session.
pub fn x3dh_init_of(message: &[u8], curve: CurveId) -> Result<Option<X3dhInit>, CodecError> {
    Ok(DrHeader::parse(message, curve)?.x3dh_init)
}

/// Cheap check on the type byte only.
pub fn has_x3dh_init(message: &[u8]) -> bool {
    message.len() > 1 && message[0] == DR_PROTOCOL_VERSION && message[1] & FLAG_X3DH_INIT != 0
}
