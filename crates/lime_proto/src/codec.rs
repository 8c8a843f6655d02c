//! Byte-level helpers shared by the DR and X3DH codecs.
//!
//! All integers on the wire are big endian.

use lime_crypto::CurveId;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Message truncated: needed {needed} bytes at offset {offset}, have {len}")]
    Truncated { needed: usize, offset: usize, len: usize },

    #[error("Unsupported protocol version {0:#04x}")]
    BadVersion(u8),

    #[error("Unexpected curve: message says {got:#04x}, expected {expected}")]
    CurveMismatch { got: u8, expected: CurveId },

    #[error("Unknown message type {0:#04x}")]
    UnknownType(u8),

    #[error("Invalid field: {0}")]
    InvalidField(String),

    #[error("Trailing bytes after message: {0}")]
    TrailingBytes(usize),
}

/// Read cursor over a received buffer.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated { needed: n, offset: self.pos, len: self.buf.len() });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes(self.array::<2>()?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.array::<4>()?))
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    pub(crate) fn finish(&self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }
}

/// Map a wire curve byte, checking it against what the caller expects.
pub(crate) fn expect_curve(got: u8, expected: CurveId) -> Result<(), CodecError> {
    if got == expected.as_u8() {
        Ok(())
    } else {
        Err(CodecError::CurveMismatch { got, expected })
    }
}
