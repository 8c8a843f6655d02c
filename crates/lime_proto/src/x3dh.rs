//! X3DH key server protocol, version 0x01.
//!
//! ```text
//! header        = version(1) || type(1) || curve(1)
//! registerUser  = Ik || SPk || SPk sig || SPk id(4) || OPk count(2) || (OPk || OPk id(4))*
//! deleteUser    = (empty)
//! postSPk       = SPk || SPk sig || SPk id(4)
//! postOPks      = OPk count(2) || (OPk || OPk id(4))*
//! getPeerBundle = count(2) || (id len(2) || device id)*
//! peerBundle    = count(2) || (id len(2) || device id || flag(1)
//!                              || [Ik || SPk || SPk id(4) || SPk sig || [OPk || OPk id(4)]])*
//! getSelfOPks   = (empty)
//! selfOPks      = count(2) || OPk id(4)*
//! error         = code(1) || [utf-8 message]
//! ```
//!
//! Apart from `getPeerBundle` and `getSelfOPks`, the server acknowledges a
//! request with a bare header of the same type.

use lime_crypto::CurveId;

use crate::codec::{expect_curve, CodecError, Reader};

pub const X3DH_PROTOCOL_VERSION: u8 = 0x01;
pub const HEADER_SIZE: usize = 3;

const IK_SIZE: usize = 32;
const DH_SIZE: usize = 32;
const SIG_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum X3dhMessageType {
    DeleteUser = 0x02,
    PostSpk = 0x03,
    PostOpks = 0x04,
    GetPeerBundle = 0x05,
    PeerBundle = 0x06,
    GetSelfOpks = 0x07,
    SelfOpks = 0x08,
    RegisterUser = 0x09,
    Error = 0xff,
}

impl X3dhMessageType {
    pub fn from_u8(v: u8) -> Result<Self, CodecError> {
        Ok(match v {
            0x02 => Self::DeleteUser,
            0x03 => Self::PostSpk,
            0x04 => Self::PostOpks,
            0x05 => Self::GetPeerBundle,
            0x06 => Self::PeerBundle,
            0x07 => Self::GetSelfOpks,
            0x08 => Self::SelfOpks,
            0x09 => Self::RegisterUser,
            0xff => Self::Error,
            // 0x01 was the pre-registerUser registration message, no longer accepted.
            other => return Err(CodecError::UnknownType(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum X3dhErrorCode {
    BadContentType = 0x00,
    BadCurve = 0x01,
    MissingSenderId = 0x02,
    BadX3dhProtocolVersion = 0x03,
    BadSize = 0x04,
    UserAlreadyIn = 0x05,
    UserNotFound = 0x06,
    DbError = 0x07,
    BadRequest = 0x08,
    ServerFailure = 0x09,
    ResourceLimitReached = 0x0a,
    Unknown = 0xfe,
}

impl From<u8> for X3dhErrorCode {
    fn from(v: u8) -> Self {
        match v {
            0x00 => Self::BadContentType,
            0x01 => Self::BadCurve,
            0x02 => Self::MissingSenderId,
            0x03 => Self::BadX3dhProtocolVersion,
            0x04 => Self::BadSize,
            0x05 => Self::UserAlreadyIn,
            0x06 => Self::UserNotFound,
            0x07 => Self::DbError,
            0x08 => Self::BadRequest,
            0x09 => Self::ServerFailure,
            0x0a => Self::ResourceLimitReached,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for X3dhErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::BadContentType => "bad_content_type",
            Self::BadCurve => "bad_curve",
            Self::MissingSenderId => "missing_senderId",
            Self::BadX3dhProtocolVersion => "bad_x3dh_protocol_version",
            Self::BadSize => "bad_size",
            Self::UserAlreadyIn => "user_already_in",
            Self::UserNotFound => "user_not_found",
            Self::DbError => "db_error",
            Self::BadRequest => "bad_request",
            Self::ServerFailure => "server_failure",
            Self::ResourceLimitReached => "resource_limit_reached",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Published keys of one peer device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBundle {
    pub ik: [u8; IK_SIZE],
    pub spk: [u8; DH_SIZE],
    pub spk_id: u32,
    pub spk_sig: [u8; SIG_SIZE],
    pub opk: Option<([u8; DH_SIZE], u32)>,
}

/// One entry of a `peerBundle` answer. `bundle` is `None` when the server
/// knows nothing about the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerBundle {
    pub device_id: String,
    pub bundle: Option<KeyBundle>,
}

const BUNDLE_NO_OPK: u8 = 0x00;
const BUNDLE_OPK: u8 = 0x01;
const BUNDLE_NONE: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum X3dhMessage {
    RegisterUser {
        ik: [u8; IK_SIZE],
        spk: [u8; DH_SIZE],
        spk_sig: [u8; SIG_SIZE],
        spk_id: u32,
        opks: Vec<([u8; DH_SIZE], u32)>,
    },
    DeleteUser,
    PostSpk {
        spk: [u8; DH_SIZE],
        spk_sig: [u8; SIG_SIZE],
        spk_id: u32,
    },
    PostOpks {
        opks: Vec<([u8; DH_SIZE], u32)>,
    },
    GetPeerBundle {
        device_ids: Vec<String>,
    },
    PeerBundle {
        bundles: Vec<PeerBundle>,
    },
    GetSelfOpks,
    SelfOpks {
        opk_ids: Vec<u32>,
    },
    Error {
        code: X3dhErrorCode,
        message: String,
    },
}

fn header(msg_type: X3dhMessageType, curve: CurveId) -> Vec<u8> {
    vec![X3DH_PROTOCOL_VERSION, msg_type as u8, curve.as_u8()]
}

fn count_u16(n: usize, what: &str) -> Result<[u8; 2], CodecError> {
    u16::try_from(n)
        .map(u16::to_be_bytes)
        .map_err(|_| CodecError::InvalidField(format!("too many {what}: {n}")))
}

fn put_opks(out: &mut Vec<u8>, opks: &[([u8; DH_SIZE], u32)]) -> Result<(), CodecError> {
    out.extend_from_slice(&count_u16(opks.len(), "OPks")?);
    for (opk, id) in opks {
        out.extend_from_slice(opk);
        out.extend_from_slice(&id.to_be_bytes());
    }
    Ok(())
}

fn read_opks(r: &mut Reader<'_>) -> Result<Vec<([u8; DH_SIZE], u32)>, CodecError> {
    let count = r.u16()?;
    let mut opks = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let opk = r.array::<DH_SIZE>()?;
        opks.push((opk, r.u32()?));
    }
    Ok(opks)
}

fn put_device_id(out: &mut Vec<u8>, id: &str) -> Result<(), CodecError> {
    out.extend_from_slice(&count_u16(id.len(), "device id bytes")?);
    out.extend_from_slice(id.as_bytes());
    Ok(())
}

fn read_device_id(r: &mut Reader<'_>) -> Result<String, CodecError> {
    let len = r.u16()? as usize;
    let raw = r.take(len)?;
    String::from_utf8(raw.to_vec())
        .map_err(|e| CodecError::InvalidField(format!("device id is not utf-8: {e}")))
}

/// Parse and validate the 3-byte header, returning the message type.
pub fn parse_header(body: &[u8], curve: CurveId) -> Result<X3dhMessageType, CodecError> {
    let mut r = Reader::new(body);
    let version = r.u8()?;
    if version != X3DH_PROTOCOL_VERSION {
        return Err(CodecError::BadVersion(version));
    }
    let msg_type = X3dhMessageType::from_u8(r.u8()?)?;
    expect_curve(r.u8()?, curve)?;
    Ok(msg_type)
}

impl X3dhMessage {
    pub fn message_type(&self) -> X3dhMessageType {
        match self {
            Self::RegisterUser { .. } => X3dhMessageType::RegisterUser,
            Self::DeleteUser => X3dhMessageType::DeleteUser,
            Self::PostSpk { .. } => X3dhMessageType::PostSpk,
            Self::PostOpks { .. } => X3dhMessageType::PostOpks,
            Self::GetPeerBundle { .. } => X3dhMessageType::GetPeerBundle,
            Self::PeerBundle { .. } => X3dhMessageType::PeerBundle,
            Self::GetSelfOpks => X3dhMessageType::GetSelfOpks,
            Self::SelfOpks { .. } => X3dhMessageType::SelfOpks,
            Self::Error { .. } => X3dhMessageType::Error,
        }
    }

    /// Bare header acknowledging a request of `msg_type`.
    pub fn ack(msg_type: X3dhMessageType, curve: CurveId) -> Vec<u8> {
        header(msg_type, curve)
    }

    pub fn encode(&self, curve: CurveId) -> Result<Vec<u8>, CodecError> {
        let mut out = header(self.message_type(), curve);
        match self {
            Self::RegisterUser { ik, spk, spk_sig, spk_id, opks } => {
                out.extend_from_slice(ik);
                out.extend_from_slice(spk);
                out.extend_from_slice(spk_sig);
                out.extend_from_slice(&spk_id.to_be_bytes());
                put_opks(&mut out, opks)?;
            }
            Self::DeleteUser | Self::GetSelfOpks => {}
            Self::PostSpk { spk, spk_sig, spk_id } => {
                out.extend_from_slice(spk);
                out.extend_from_slice(spk_sig);
                out.extend_from_slice(&spk_id.to_be_bytes());
            }
            Self::PostOpks { opks } => put_opks(&mut out, opks)?,
            Self::GetPeerBundle { device_ids } => {
                out.extend_from_slice(&count_u16(device_ids.len(), "device ids")?);
                for id in device_ids {
                    put_device_id(&mut out, id)?;
                }
            }
            Self::PeerBundle { bundles } => {
                out.extend_from_slice(&count_u16(bundles.len(), "bundles")?);
                for peer in bundles {
                    put_device_id(&mut out, &peer.device_id)?;
                    match &peer.bundle {
                        None => out.push(BUNDLE_NONE),
                        Some(b) => {
                            out.push(if b.opk.is_some() { BUNDLE_OPK } else { BUNDLE_NO_OPK });
                            out.extend_from_slice(&b.ik);
                            out.extend_from_slice(&b.spk);
                            out.extend_from_slice(&b.spk_id.to_be_bytes());
                            out.extend_from_slice(&b.spk_sig);
                            if let Some((opk, opk_id)) = &b.opk {
                                out.extend_from_slice(opk);
                                out.extend_from_slice(&opk_id.to_be_bytes());
                            }
                        }
                    }
                }
            }
            Self::SelfOpks { opk_ids } => {
                out.extend_from_slice(&count_u16(opk_ids.len(), "OPk ids")?);
                for id in opk_ids {
                    out.extend_from_slice(&id.to_be_bytes());
                }
            }
            Self::Error { code, message } => {
                out.push(*code as u8);
                out.extend_from_slice(message.as_bytes());
            }
        }
        Ok(out)
    }

    /// Parse a complete message whose body matches its type.
    pub fn decode(body: &[u8], curve: CurveId) -> Result<Self, CodecError> {
        let msg_type = parse_header(body, curve)?;
        let mut r = Reader::new(body);
        r.take(crate::x3dh::HEADER_SIZE)?;

        let msg = match msg_type {
            X3dhMessageType::RegisterUser => {
                let ik = r.array::<IK_SIZE>()?;
                let spk = r.array::<DH_SIZE>()?;
                let spk_sig = r.array::<SIG_SIZE>()?;
                let spk_id = r.u32()?;
                let opks = read_opks(&mut r)?;
                Self::RegisterUser { ik, spk, spk_sig, spk_id, opks }
            }
            X3dhMessageType::DeleteUser => Self::DeleteUser,
            X3dhMessageType::PostSpk => {
                let spk = r.array::<DH_SIZE>()?;
                let spk_sig = r.array::<SIG_SIZE>()?;
                let spk_id = r.u32()?;
                Self::PostSpk { spk, spk_sig, spk_id }
            }
            X3dhMessageType::PostOpks => Self::PostOpks { opks: read_opks(&mut r)? },
            X3dhMessageType::GetPeerBundle => {
                let count = r.u16()?;
                let mut device_ids = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    device_ids.push(read_device_id(&mut r)?);
                }
                Self::GetPeerBundle { device_ids }
            }
            X3dhMessageType::PeerBundle => {
                let count = r.u16()?;
                let mut bundles = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let device_id = read_device_id(&mut r)?;
                    let bundle = match r.u8()? {
                        BUNDLE_NONE => None,
                        flag @ (BUNDLE_NO_OPK | BUNDLE_OPK) => {
                            let ik = r.array::<IK_SIZE>()?;
                            let spk = r.array::<DH_SIZE>()?;
                            let spk_id = r.u32()?;
                            let spk_sig = r.array::<SIG_SIZE>()?;
                            let opk = if flag == BUNDLE_OPK {
                                let opk = r.array::<DH_SIZE>()?;
                                Some((opk, r.u32()?))
                            } else {
                                None
                            };
                            Some(KeyBundle { ik, spk, spk_id, spk_sig, opk })
                        }
                        other => {
                            return Err(CodecError::InvalidField(format!(
                                "key bundle flag {other:#04x} for {device_id}"
                            )))
                        }
                    };
                    bundles.push(PeerBundle { device_id, bundle });
                }
                Self::PeerBundle { bundles }
            }
            X3dhMessageType::GetSelfOpks => Self::GetSelfOpks,
            X3dhMessageType::SelfOpks => {
                let count = r.u16()?;
                let mut opk_ids = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    opk_ids.push(r.u32()?);
                }
                Self::SelfOpks { opk_ids }
            }
            X3dhMessageType::Error => {
                let code = X3dhErrorCode::from(r.u8()?);
                let message = String::from_utf8_lossy(r.rest()).into_owned();
                Self::Error { code, message }
            }
        };
        r.finish()?;
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const C: CurveId = CurveId::C25519;

    fn bundle(opk: bool) -> KeyBundle {
        KeyBundle {
            ik: [1u8; 32],
            spk: [2u8; 32],
            spk_id: 7,
            spk_sig: [3u8; 64],
            opk: opk.then_some(([4u8; 32], 0x7fff_0001)),
        }
    }

    #[test]
    fn register_user_layout() {
        let msg = X3dhMessage::RegisterUser {
            ik: [1u8; 32],
            spk: [2u8; 32],
            spk_sig: [3u8; 64],
            spk_id: 0x0a0b_0c0d,
            opks: vec![([4u8; 32], 1), ([5u8; 32], 2)],
        };
        let bytes = msg.encode(C).unwrap();
        assert_eq!(&bytes[..3], &[0x01, 0x09, 0x01]);
        assert_eq!(bytes.len(), 3 + 32 + 32 + 64 + 4 + 2 + 2 * 36);
        assert_eq!(&bytes[131..135], &[0x0a, 0x0b, 0x0c, 0x0d]);
        assert_eq!(X3dhMessage::decode(&bytes, C).unwrap(), msg);
    }

    #[test]
    fn peer_bundle_flags() {
        let msg = X3dhMessage::PeerBundle {
            bundles: vec![
                PeerBundle { device_id: "bob.1".into(), bundle: Some(bundle(true)) },
                PeerBundle { device_id: "bob.2".into(), bundle: Some(bundle(false)) },
                PeerBundle { device_id: "ghost".into(), bundle: None },
            ],
        };
        let bytes = msg.encode(C).unwrap();
        // first entry: id len(2) + "bob.1" then flag
        assert_eq!(bytes[3 + 2 + 2 + 5], 0x01);
        assert_eq!(X3dhMessage::decode(&bytes, C).unwrap(), msg);
    }

    #[test]
    fn error_message_and_unknown_code() {
        let bytes = X3dhMessage::Error {
            code: X3dhErrorCode::UserNotFound,
            message: "no such user".into(),
        }
        .encode(C)
        .unwrap();
        match X3dhMessage::decode(&bytes, C).unwrap() {
            X3dhMessage::Error { code, message } => {
                assert_eq!(code, X3dhErrorCode::UserNotFound);
                assert_eq!(message, "no such user");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(X3dhErrorCode::from(0x42), X3dhErrorCode::Unknown);
    }

    #[test]
    fn header_checks() {
        assert_eq!(
            parse_header(&X3dhMessage::ack(X3dhMessageType::PostSpk, C), C).unwrap(),
            X3dhMessageType::PostSpk
        );
        assert!(matches!(parse_header(&[0x02, 0x03, 0x01], C), Err(CodecError::BadVersion(2))));
        assert!(matches!(parse_header(&[0x01, 0x01, 0x01], C), Err(CodecError::UnknownType(1))));
        assert!(matches!(
            parse_header(&[0x01, 0x03, 0x02], C),
            Err(CodecError::CurveMismatch { got: 2, .. })
        ));
        assert!(matches!(
            X3dhMessage::decode(&[0x01, 0x08, 0x01, 0x00, 0x02, 0, 0, 0, 1], C),
            Err(CodecError::Truncated { .. })
        ));
    }
}
