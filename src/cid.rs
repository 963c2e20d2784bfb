//! Connection identifiers and stateless-reset tokens.

use std::fmt;

use rand::RngCore;
use ring::hmac;

use crate::{MAX_CID_SIZE, RESET_TOKEN_SIZE};

/// Protocol-level identifier for a connection
///
/// Multiple connection IDs may refer to the same connection; peers route on
/// whatever ID appears in a packet's destination field.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    /// Construct from a sequence of at most `MAX_CID_SIZE` bytes
    pub fn new(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= MAX_CID_SIZE);
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    pub(crate) fn random<R: RngCore>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut res = Self {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        rng.fill_bytes(&mut res.bytes[..len]);
        res
    }
}

impl ::std::ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[0..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.bytes[0..self.len as usize].fmt(f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Stateless reset token
///
/// Used for an endpoint to securely communicate that it has lost state for a
/// connection.
#[allow(clippy::derived_hash_with_manual_eq)] // custom PartialEq matches derived semantics
#[derive(Debug, Copy, Clone, Hash)]
pub struct ResetToken([u8; RESET_TOKEN_SIZE]);

impl PartialEq for ResetToken {
    fn eq(&self, other: &Self) -> bool {
        ring::constant_time::verify_slices_are_equal(&self.0, &other.0).is_ok()
    }
}

impl Eq for ResetToken {}

impl From<[u8; RESET_TOKEN_SIZE]> for ResetToken {
    fn from(x: [u8; RESET_TOKEN_SIZE]) -> Self {
        Self(x)
    }
}

impl std::ops::Deref for ResetToken {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ResetToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Keyed derivation of stateless-reset tokens from connection IDs
///
/// Tokens are always derivable so that NEW_CONNECTION_ID frames can carry
/// them, but resets are only *sent* when the key was supplied by
/// configuration: a random per-process key would produce resets no past
/// incarnation's peer could recognize.
pub(crate) struct ResetTokenGenerator {
    key: hmac::Key,
    can_reset: bool,
}

impl ResetTokenGenerator {
    pub(crate) fn new(configured: Option<&[u8]>) -> Self {
        match configured {
            Some(key) => Self {
                key: hmac::Key::new(hmac::HMAC_SHA256, key),
                can_reset: true,
            },
            None => {
                let mut key = [0; 32];
                rand::thread_rng().fill_bytes(&mut key);
                Self {
                    key: hmac::Key::new(hmac::HMAC_SHA256, &key),
                    can_reset: false,
                }
            }
        }
    }

    /// Whether stateless resets may be emitted
    pub(crate) fn can_reset(&self) -> bool {
        self.can_reset
    }

    pub(crate) fn token_for(&self, id: &ConnectionId) -> ResetToken {
        let signature = hmac::sign(&self.key, id);
        let mut result = [0; RESET_TOKEN_SIZE];
        result.copy_from_slice(&signature.as_ref()[..RESET_TOKEN_SIZE]);
        result.into()
    }
}

/// Generates connection IDs for new connections
pub trait ConnectionIdGenerator: Send {
    /// Generates a new CID
    fn generate_cid(&mut self) -> ConnectionId;
    /// Returns the length of CIDs created by this generator
    fn cid_len(&self) -> usize;
}

/// CID filled with random bytes
#[derive(Debug, Clone, Copy)]
pub struct RandomConnectionIdGenerator {
    cid_len: usize,
}

impl RandomConnectionIdGenerator {
    /// A generator of random CIDs of length `cid_len`, at most `MAX_CID_SIZE`
    pub fn new(cid_len: usize) -> Self {
        debug_assert!(cid_len <= MAX_CID_SIZE);
        Self { cid_len }
    }
}

impl ConnectionIdGenerator for RandomConnectionIdGenerator {
    fn generate_cid(&mut self) -> ConnectionId {
        ConnectionId::random(&mut rand::thread_rng(), self.cid_len)
    }

    fn cid_len(&self) -> usize {
        self.cid_len
    }
}
