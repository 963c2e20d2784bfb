//! The two frames the connection-ID machinery emits and consumes.

use std::fmt;

use bytes::{Buf, BufMut};

use crate::cid::{ConnectionId, ResetToken};
use crate::coding::{self, BufExt, BufMutExt, UnexpectedEnd};
use crate::{varint, MAX_CID_SIZE, RESET_TOKEN_SIZE};

/// QUIC frame type identifier
#[derive(Copy, Clone, Eq, PartialEq)]
pub(crate) struct FrameType(u64);

impl FrameType {
    pub(crate) const NEW_CONNECTION_ID: Self = Self(0x18);
    pub(crate) const RETIRE_CONNECTION_ID: Self = Self(0x19);
}

impl fmt::Debug for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NEW_CONNECTION_ID => f.write_str("NEW_CONNECTION_ID"),
            Self::RETIRE_CONNECTION_ID => f.write_str("RETIRE_CONNECTION_ID"),
            Self(x) => write!(f, "FrameType({x:02x})"),
        }
    }
}

/// Frame decoding errors
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum FrameError {
    UnexpectedEnd,
    Malformed,
}

impl From<UnexpectedEnd> for FrameError {
    fn from(_: UnexpectedEnd) -> Self {
        Self::UnexpectedEnd
    }
}

/// NEW_CONNECTION_ID
///
/// Advertises a fresh CID the peer may route to us with, optionally
/// demanding retirement of all CIDs issued before `retire_prior_to`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct NewConnectionId {
    pub(crate) sequence: u64,
    pub(crate) retire_prior_to: u64,
    pub(crate) id: ConnectionId,
    pub(crate) reset_token: ResetToken,
}

impl NewConnectionId {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W) {
        out.write_var(FrameType::NEW_CONNECTION_ID.0);
        out.write_var(self.sequence);
        out.write_var(self.retire_prior_to);
        out.write(self.id.len() as u8);
        out.put_slice(&self.id);
        out.put_slice(&self.reset_token);
    }

    /// Upper bound on the encoded size for CIDs of length `cid_len`
    pub(crate) fn size_bound(cid_len: usize) -> usize {
        let type_len = varint::size(FrameType::NEW_CONNECTION_ID.0);
        let seq_max_len = 8;
        let retire_prior_to_max_len = 8;
        let cid_len_len = 1;
        type_len + seq_max_len + retire_prior_to_max_len + cid_len_len + cid_len + RESET_TOKEN_SIZE
    }

    /// Decode the frame body, the type having been read already
    pub(crate) fn decode<R: Buf>(bytes: &mut R) -> Result<Self, FrameError> {
        let sequence = bytes.get_var()?;
        let retire_prior_to = bytes.get_var()?;
        if retire_prior_to > sequence {
            return Err(FrameError::Malformed);
        }
        let length = bytes.get::<u8>()? as usize;
        if length > MAX_CID_SIZE || length == 0 {
            return Err(FrameError::Malformed);
        }
        if length > bytes.remaining() {
            return Err(FrameError::UnexpectedEnd);
        }
        let mut stage = [0; MAX_CID_SIZE];
        bytes.copy_to_slice(&mut stage[0..length]);
        let id = ConnectionId::new(&stage[..length]);
        if bytes.remaining() < RESET_TOKEN_SIZE {
            return Err(FrameError::UnexpectedEnd);
        }
        let mut reset_token = [0; RESET_TOKEN_SIZE];
        bytes.copy_to_slice(&mut reset_token);
        Ok(Self {
            sequence,
            retire_prior_to,
            id,
            reset_token: reset_token.into(),
        })
    }
}

/// RETIRE_CONNECTION_ID
///
/// Tells the peer we will no longer route with the CID it issued under
/// `sequence`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct RetireConnectionId {
    pub(crate) sequence: u64,
}

impl RetireConnectionId {
    pub(crate) fn encode<W: BufMut>(&self, buf: &mut W) {
        buf.write_var(FrameType::RETIRE_CONNECTION_ID.0);
        buf.write_var(self.sequence);
    }

    pub(crate) fn size_bound() -> usize {
        varint::size(FrameType::RETIRE_CONNECTION_ID.0) + 8
    }

    pub(crate) fn decode<R: Buf>(bytes: &mut R) -> coding::Result<Self> {
        Ok(Self {
            sequence: bytes.get_var()?,
        })
    }
}
