//! QUIC endpoint listener core.
//!
//! An [`Endpoint`] multiplexes many logical QUIC connections over a single
//! UDP socket. Incoming datagrams are routed by destination connection ID to
//! the task owning the connection, recognized as new-connection attempts, or
//! answered directly (version negotiation, stateless reset, retry). Each
//! connection tracks the connection IDs it has issued and received per
//! RFC 9000 §5.1.
//!
//! Cryptographic handshaking, packet protection, streams, and loss recovery
//! are collaborators reached through narrow seams ([`HandshakeConfig`],
//! [`Conn::handshake_complete`]); this crate owns the socket, the dispatch
//! tables, and the connection-ID lifecycle.

use std::ops;

mod cid;
mod cid_state;
mod coding;
mod config;
mod connection;
mod endpoint;
mod frame;
mod packet;
mod queue;
mod retry;
#[cfg(test)]
mod tests;
mod transport_error;
mod transport_parameters;
mod varint;

pub use crate::cid::{ConnectionId, ConnectionIdGenerator, RandomConnectionIdGenerator, ResetToken};
pub use crate::cid_state::PacketFate;
pub use crate::config::{Config, HandshakeConfig};
pub use crate::connection::Conn;
pub use crate::endpoint::{ConnectError, Endpoint, EndpointError};
pub use crate::transport_error::{Code as TransportErrorCode, TransportError};
pub use crate::transport_parameters::TransportParameters;

/// The QUIC protocol version implemented
pub const VERSION: u32 = 0x0000_0001;

/// Whether an endpoint was the initiator of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl Side {
    #[inline]
    pub(crate) fn is_client(self) -> bool {
        self == Side::Client
    }

    #[inline]
    pub(crate) fn is_server(self) -> bool {
        self == Side::Server
    }
}

impl ops::Not for Side {
    type Output = Side;
    fn not(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

//
// Useful internal constants
//

/// Length of connection IDs issued by this endpoint.
///
/// Short-header packets carry no explicit CID length, so the receive path
/// relies on every locally issued CID having exactly this length.
pub(crate) const LOC_CID_LEN: usize = 8;
pub(crate) const MAX_CID_SIZE: usize = 20;
pub(crate) const RESET_TOKEN_SIZE: usize = 16;
pub(crate) const MIN_INITIAL_SIZE: usize = 1200;
/// active_connection_id_limit we advertise and enforce on peer-issued CIDs
pub(crate) const ACTIVE_CONNECTION_ID_LIMIT: usize = 2;
/// Upper bound on CIDs we issue regardless of the peer's advertised limit
pub(crate) const MAX_PEER_ACTIVE_CID_LIMIT: u64 = 4;
