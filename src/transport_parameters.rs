//! The connection-ID-relevant subset of QUIC transport parameters.
//!
//! Parameter encoding and decoding happens inside the TLS handshake, which
//! is a collaborator of this crate; the handshake layer hands the decoded
//! values over once they are authenticated.

use crate::cid::{ConnectionId, ResetToken};
use crate::ACTIVE_CONNECTION_ID_LIMIT;

/// Transport parameters received from the peer that this crate validates or
/// consumes
#[derive(Debug, Clone, Default)]
pub struct TransportParameters {
    /// The destination CID from the first Initial packet the client sent
    ///
    /// Present only in the server's parameters.
    pub original_dst_cid: Option<ConnectionId>,
    /// The source CID of the server's Retry packet, when one was sent
    pub retry_src_cid: Option<ConnectionId>,
    /// The source CID of the peer's first Initial packet
    pub initial_src_cid: Option<ConnectionId>,
    /// Token the client may use to recognize a stateless reset from the
    /// server's handshake CID
    ///
    /// Present only in the server's parameters.
    pub stateless_reset_token: Option<ResetToken>,
    /// How many connection IDs the peer is willing to track for us
    pub active_conn_id_limit: u64,
}

impl TransportParameters {
    /// Parameters as they stand before the peer communicates any
    pub fn initial() -> Self {
        Self {
            // https://www.rfc-editor.org/rfc/rfc9000.html#section-18.2: default 2
            active_conn_id_limit: ACTIVE_CONNECTION_ID_LIMIT as u64,
            ..Self::default()
        }
    }
}
