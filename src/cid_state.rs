//! Per-connection state of issued and received connection IDs.
//!
//! The destination CIDs of packets we receive are *local* IDs; the
//! destination CIDs of packets we send are *remote* IDs. Local IDs are
//! usually issued by us and remote IDs by the peer. The exception is the
//! transient destination CID carried in a client's first Initial packets,
//! which is invented by the client and tracked under sequence number -1.

use tracing::trace;

use crate::cid::{ConnectionId, ConnectionIdGenerator, ResetToken, ResetTokenGenerator};
use crate::connection::ConnRoute;
use crate::endpoint::{TableUpdate, TableUpdater};
use crate::frame::{NewConnectionId, RetireConnectionId};
use crate::packet::LongType;
use crate::transport_error::{Code, TransportError};
use crate::transport_parameters::TransportParameters;
use crate::{Side, ACTIVE_CONNECTION_ID_LIMIT, MAX_PEER_ACTIVE_CID_LIMIT};

/// What loss detection concluded about a packet
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketFate {
    /// The peer acknowledged the packet
    Acked,
    /// The packet was declared lost
    Lost,
}

/// Retransmission state of a frame that must reach the peer
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
enum SendState {
    /// Nothing to convey, or nothing yet
    #[default]
    Unset,
    /// Needs to go out in the next packet with room
    Unsent,
    /// In flight in the given packet number
    Sent(u64),
    /// The peer confirmed receipt
    Acked,
}

impl SendState {
    fn set_unsent(&mut self) {
        *self = Self::Unsent;
    }

    fn set_sent(&mut self, pnum: u64) {
        *self = Self::Sent(pnum);
    }

    /// Whether the frame should be included in the packet under
    /// construction; a probe resends in-flight frames as well
    fn should_send(&self, pto: bool) -> bool {
        match *self {
            Self::Unsent => true,
            Self::Sent(_) => pto,
            _ => false,
        }
    }

    /// Reconcile with the fate of the packet that last carried the frame
    fn ack_or_loss(&mut self, pnum: u64, fate: PacketFate) {
        if let Self::Sent(sent) = *self {
            if sent == pnum {
                *self = match fate {
                    PacketFate::Acked => Self::Acked,
                    PacketFate::Lost => Self::Unsent,
                };
            }
        }
    }
}

/// A connection ID we advertised (or, transiently, received packets on),
/// with its metadata
#[derive(Debug)]
struct LocalCid {
    cid: ConnectionId,
    /// -1 for the client-chosen transient ID
    seq: i64,
    retired: bool,
    /// Pending NEW_CONNECTION_ID emission
    send: SendState,
}

/// A peer-issued connection ID and its stateless reset token
#[derive(Debug)]
struct RemoteCid {
    cid: ConnectionId,
    seq: i64,
    retired: bool,
    /// Pending RETIRE_CONNECTION_ID emission
    send: SendState,
    reset_token: Option<ResetToken>,
}

/// A connection's connection IDs
#[derive(Default)]
pub(crate) struct ConnIdState {
    /// Ordered by issuance; the head may be the transient ID. Never
    /// rearranged: `append_frames` relies on the head being the oldest
    /// live ID when computing Retire Prior To.
    local: Vec<LocalCid>,
    /// The head is the destination CID in active use
    remote: Vec<RemoteCid>,

    next_local_seq: i64,
    /// Largest Retire Prior To value the peer has sent
    retire_remote_prior_to: i64,
    /// The peer's active_connection_id_limit transport parameter
    peer_active_conn_id_limit: u64,

    /// Expected original_destination_connection_id parameter; cleared once
    /// validated
    original_dst_cid: Option<ConnectionId>,
    /// Expected retry_source_connection_id parameter; cleared once validated
    retry_src_cid: Option<ConnectionId>,

    need_send: bool,
}

impl ConnIdState {
    /// Set up a client connection: we pick our own first local ID and a
    /// transient destination ID for the server
    pub(crate) fn init_client(
        &mut self,
        gen: &mut dyn ConnectionIdGenerator,
        route: &ConnRoute,
        table: &TableUpdater,
    ) {
        // Sent in the Source Connection ID field of the first Initial packet.
        let loc_cid = gen.generate_cid();
        self.local.push(LocalCid {
            cid: loc_cid,
            seq: 0,
            retired: false,
            send: SendState::Unset,
        });
        self.next_local_seq = 1;
        table.push(TableUpdate::AddCid(loc_cid, route.clone()));

        // Transient destination for the server, sent in the Destination
        // Connection ID field of the first Initial packet.
        let rem_cid = gen.generate_cid();
        self.remote.push(RemoteCid {
            cid: rem_cid,
            seq: -1,
            retired: false,
            send: SendState::Unset,
            reset_token: None,
        });
        self.original_dst_cid = Some(rem_cid);
    }

    /// Set up a server connection: keep routing on the client-chosen
    /// transient ID and pick our own source ID
    pub(crate) fn init_server(
        &mut self,
        gen: &mut dyn ConnectionIdGenerator,
        route: &ConnRoute,
        table: &TableUpdater,
        dst_cid: ConnectionId,
    ) {
        // The client-chosen transient ID will never be our Source Connection
        // ID, but packets addressed to it must keep reaching us.
        self.local.push(LocalCid {
            cid: dst_cid,
            seq: -1,
            retired: false,
            send: SendState::Unset,
        });

        let loc_cid = gen.generate_cid();
        self.local.push(LocalCid {
            cid: loc_cid,
            seq: 0,
            retired: false,
            send: SendState::Unset,
        });
        self.next_local_seq = 1;
        table.push(TableUpdate::AddCid(dst_cid, route.clone()));
        table.push(TableUpdate::AddCid(loc_cid, route.clone()));
    }

    /// The Source Connection ID to use in a sent packet
    pub(crate) fn src_cid(&self) -> ConnectionId {
        if self.local[0].seq == -1 && self.local.len() > 1 {
            // Don't use the transient connection ID if another is available.
            return self.local[1].cid;
        }
        self.local[0].cid
    }

    /// The Destination Connection ID to use in a sent packet
    pub(crate) fn dst_cid(&self) -> Option<ConnectionId> {
        self.remote.iter().find(|r| !r.retired).map(|r| r.cid)
    }

    /// Whether the token matches one associated with a non-retired
    /// connection ID we have used
    pub(crate) fn is_valid_stateless_reset_token(&self, token: ResetToken) -> bool {
        // Only the first available remote ID is ever in use, so any other
        // token is not valid.
        match self.remote.iter().find(|r| !r.retired) {
            Some(r) => r.reset_token == Some(token),
            None => false,
        }
    }

    /// Record the peer's active_connection_id_limit transport parameter and
    /// issue IDs up to it
    pub(crate) fn set_peer_active_conn_id_limit(
        &mut self,
        gen: &mut dyn ConnectionIdGenerator,
        route: &ConnRoute,
        table: &TableUpdater,
        limit: u64,
    ) {
        self.peer_active_conn_id_limit = limit;
        self.issue_local_cids(gen, route, table);
    }

    fn issue_local_cids(
        &mut self,
        gen: &mut dyn ConnectionIdGenerator,
        route: &ConnRoute,
        table: &TableUpdater,
    ) {
        let limit = self.peer_active_conn_id_limit.min(MAX_PEER_ACTIVE_CID_LIMIT);
        let live = self
            .local
            .iter()
            .filter(|l| l.seq != -1 && !l.retired)
            .count() as u64;
        let mut to_issue = limit.saturating_sub(live);
        while to_issue > 0 {
            let cid = gen.generate_cid();
            self.local.push(LocalCid {
                cid,
                seq: self.next_local_seq,
                retired: false,
                send: SendState::Unsent,
            });
            self.next_local_seq += 1;
            self.need_send = true;
            table.push(TableUpdate::AddCid(cid, route.clone()));
            to_issue -= 1;
        }
    }

    /// Check the connection-ID-related transport parameters against the
    /// values observed during the handshake
    pub(crate) fn validate_transport_parameters(
        &mut self,
        side: Side,
        route: &ConnRoute,
        table: &TableUpdater,
        params: &TransportParameters,
    ) -> Result<(), TransportError> {
        // original_destination_connection_id must match the transient remote
        // ID we chose (client) or be absent (server).
        if params.original_dst_cid != self.original_dst_cid {
            return Err(TransportError::new(
                Code::TRANSPORT_PARAMETER_ERROR,
                "original_destination_connection_id mismatch",
            ));
        }
        self.original_dst_cid = None; // no further need for this
        // retry_source_connection_id must match the value from the server's
        // Retry packet (when one was sent), or be absent.
        if params.retry_src_cid != self.retry_src_cid {
            return Err(TransportError::new(
                Code::TRANSPORT_PARAMETER_ERROR,
                "retry_source_connection_id mismatch",
            ));
        }
        self.retry_src_cid = None;
        // initial_source_connection_id must match the first remote ID.
        if self.remote.first().map(|r| r.seq) != Some(0) {
            return Err(Code::INTERNAL_ERROR.into());
        }
        if params.initial_src_cid != Some(self.remote[0].cid) {
            return Err(TransportError::new(
                Code::TRANSPORT_PARAMETER_ERROR,
                "initial_source_connection_id mismatch",
            ));
        }
        if let Some(token) = params.stateless_reset_token {
            if side.is_server() {
                return Err(TransportError::new(
                    Code::TRANSPORT_PARAMETER_ERROR,
                    "client sent stateless_reset_token",
                ));
            }
            self.remote[0].reset_token = Some(token);
            table.push(TableUpdate::AddResetToken(token, route.clone()));
        }
        Ok(())
    }

    /// Update connection ID state from an Initial or Handshake packet
    pub(crate) fn handle_packet(
        &mut self,
        side: Side,
        table: &TableUpdater,
        ptype: LongType,
        src_cid: &ConnectionId,
    ) {
        match (ptype, side) {
            (LongType::Initial, Side::Client) => {
                if self.remote.len() == 1 && self.remote[0].seq == -1 {
                    // First Initial from the server: replace the transient
                    // remote ID with its Source Connection ID.
                    self.remote[0] = RemoteCid {
                        cid: *src_cid,
                        seq: 0,
                        retired: false,
                        send: SendState::Unset,
                        reset_token: None,
                    };
                }
            }
            (LongType::Initial, Side::Server) => {
                if self.remote.is_empty() {
                    // First Initial from the client: adopt its ID.
                    self.remote.push(RemoteCid {
                        cid: *src_cid,
                        seq: 0,
                        retired: false,
                        send: SendState::Unset,
                        reset_token: None,
                    });
                }
            }
            (LongType::Handshake, Side::Server) => {
                if self
                    .local
                    .first()
                    .is_some_and(|l| l.seq == -1 && !l.retired)
                {
                    // The client has progressed past Initial packets and
                    // will never address the transient ID again.
                    let cid = self.local[0].cid;
                    table.push(TableUpdate::RetireCid(cid));
                    self.local.remove(0);
                }
            }
            _ => {}
        }
    }

    /// Whether a Retry packet is meaningful right now: the destination must
    /// still be the transient ID from our first flight
    pub(crate) fn can_accept_retry(&self) -> bool {
        self.remote.len() == 1 && self.remote[0].seq == -1
    }

    /// Adopt the new server-chosen ID from a Retry packet
    pub(crate) fn handle_retry_packet(&mut self, src_cid: &ConnectionId) {
        debug_assert!(
            self.remote.len() == 1 && self.remote[0].seq == -1,
            "retry with non-transient remote connection ID"
        );
        self.retry_src_cid = Some(*src_cid);
        self.remote[0].cid = *src_cid;
    }

    /// Process a NEW_CONNECTION_ID frame
    pub(crate) fn handle_new_conn_id(
        &mut self,
        route: &ConnRoute,
        table: &TableUpdater,
        frame: &NewConnectionId,
    ) -> Result<(), TransportError> {
        if self.remote.first().map_or(true, |r| r.cid.is_empty()) {
            // "An endpoint that is sending packets with a zero-length
            // Destination Connection ID MUST treat receipt of a
            // NEW_CONNECTION_ID frame as a connection error of type
            // PROTOCOL_VIOLATION."
            // https://www.rfc-editor.org/rfc/rfc9000.html#section-19.15-6
            return Err(TransportError::new(
                Code::PROTOCOL_VIOLATION,
                "NEW_CONNECTION_ID for zero-length CID",
            ));
        }

        let seq = frame.sequence as i64;
        let retire_prior_to = frame.retire_prior_to as i64;
        if retire_prior_to > self.retire_remote_prior_to {
            self.retire_remote_prior_to = retire_prior_to;
        }

        let mut have = false; // do we already have this connection ID?
        let mut active = 0;
        let prior_to = self.retire_remote_prior_to;
        for rcid in &mut self.remote {
            if !rcid.retired && rcid.seq >= 0 && rcid.seq < prior_to {
                rcid.retired = true;
                rcid.send.set_unsent();
                self.need_send = true;
                if let Some(token) = rcid.reset_token.take() {
                    table.push(TableUpdate::RetireResetToken(token));
                }
            }
            if !rcid.retired {
                active += 1;
            }
            if rcid.seq == seq {
                if rcid.cid != frame.id {
                    return Err(TransportError::new(
                        Code::PROTOCOL_VIOLATION,
                        "connection ID changed for sequence number",
                    ));
                }
                have = true; // yes, we've seen this sequence number
            }
        }

        if !have {
            // A new connection ID we have not seen before. The list is not
            // kept sorted by sequence number; there's no need.
            self.remote.push(RemoteCid {
                cid: frame.id,
                seq,
                retired: false,
                send: SendState::Unset,
                reset_token: Some(frame.reset_token),
            });
            if seq < self.retire_remote_prior_to {
                // Already retired by a previous Retire Prior To.
                let last = self.remote.last_mut().unwrap();
                last.retired = true;
                last.send.set_unsent();
                last.reset_token = None;
                self.need_send = true;
            } else {
                active += 1;
                table.push(TableUpdate::AddResetToken(frame.reset_token, route.clone()));
            }
        }

        if active > ACTIVE_CONNECTION_ID_LIMIT {
            // Retired connection IDs (including newly-retired ones) do not
            // count against the limit.
            // https://www.rfc-editor.org/rfc/rfc9000.html#section-5.1.1-5
            return Err(TransportError::new(
                Code::CONNECTION_ID_LIMIT_ERROR,
                "active_connection_id_limit exceeded",
            ));
        }

        // "An endpoint SHOULD limit the number of connection IDs it has
        // retired locally for which RETIRE_CONNECTION_ID frames have not yet
        // been acknowledged."
        // https://www.rfc-editor.org/rfc/rfc9000#section-5.1.2-6
        if self.remote.len() > 4 * ACTIVE_CONNECTION_ID_LIMIT {
            return Err(TransportError::new(
                Code::CONNECTION_ID_LIMIT_ERROR,
                "too many unacknowledged retired connection IDs",
            ));
        }

        Ok(())
    }

    /// Process a RETIRE_CONNECTION_ID frame
    pub(crate) fn handle_retire_conn_id(
        &mut self,
        gen: &mut dyn ConnectionIdGenerator,
        route: &ConnRoute,
        table: &TableUpdater,
        sequence: u64,
    ) -> Result<(), TransportError> {
        let seq = sequence as i64;
        if seq >= self.next_local_seq {
            return Err(TransportError::new(
                Code::PROTOCOL_VIOLATION,
                "RETIRE_CONNECTION_ID for unissued sequence number",
            ));
        }
        if let Some(i) = self.local.iter().position(|l| l.seq == seq) {
            trace!(seq, cid = %self.local[i].cid, "peer retired connection ID");
            table.push(TableUpdate::RetireCid(self.local[i].cid));
            self.local.remove(i);
        }
        self.issue_local_cids(gen, route, table);
        Ok(())
    }

    /// Reconcile an in-flight NEW_CONNECTION_ID with its packet's fate
    pub(crate) fn ack_or_loss_new_connection_id(
        &mut self,
        pnum: u64,
        sequence: u64,
        fate: PacketFate,
    ) {
        let seq = sequence as i64;
        for l in &mut self.local {
            if l.seq != seq {
                continue;
            }
            l.send.ack_or_loss(pnum, fate);
            if fate != PacketFate::Acked {
                self.need_send = true;
            }
            return;
        }
    }

    /// Reconcile an in-flight RETIRE_CONNECTION_ID with its packet's fate
    pub(crate) fn ack_or_loss_retire_connection_id(
        &mut self,
        pnum: u64,
        sequence: u64,
        fate: PacketFate,
    ) {
        let seq = sequence as i64;
        for i in 0..self.remote.len() {
            if self.remote[i].seq != seq {
                continue;
            }
            if fate == PacketFate::Acked {
                // The peer has confirmed the retirement; discard the entry's
                // state completely.
                self.remote.remove(i);
            } else {
                self.need_send = true;
                self.remote[i].send.ack_or_loss(pnum, fate);
            }
            return;
        }
    }

    /// Append pending NEW_CONNECTION_ID and RETIRE_CONNECTION_ID frames to
    /// the packet under construction
    ///
    /// Returns true if nothing further needs appending, false if a frame did
    /// not fit; the caller retries in the next packet.
    pub(crate) fn append_frames(
        &mut self,
        reset_gen: &ResetTokenGenerator,
        buf: &mut Vec<u8>,
        max_size: usize,
        pnum: u64,
        pto: bool,
    ) -> bool {
        if !self.need_send && !pto {
            // Fast path: nothing to send.
            return true;
        }
        let retire_before = match self.local[0].seq {
            -1 => 0,
            seq => seq,
        };
        for l in &mut self.local {
            if !l.send.should_send(pto) {
                continue;
            }
            if buf.len() + NewConnectionId::size_bound(l.cid.len()) > max_size {
                return false;
            }
            NewConnectionId {
                sequence: l.seq as u64,
                retire_prior_to: retire_before as u64,
                id: l.cid,
                reset_token: reset_gen.token_for(&l.cid),
            }
            .encode(buf);
            l.send.set_sent(pnum);
        }
        for r in &mut self.remote {
            if !r.send.should_send(pto) {
                continue;
            }
            if buf.len() + RetireConnectionId::size_bound() > max_size {
                return false;
            }
            RetireConnectionId {
                sequence: r.seq as u64,
            }
            .encode(buf);
            r.send.set_sent(pnum);
        }
        self.need_send = false;
        true
    }

    // Used by the connection's teardown to unregister everything it may
    // still be routing on.

    pub(crate) fn local_cids(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.local.iter().map(|l| l.cid)
    }

    pub(crate) fn remote_reset_tokens(&self) -> impl Iterator<Item = ResetToken> + '_ {
        self.remote.iter().filter_map(|r| r.reset_token)
    }

    #[cfg(test)]
    pub(crate) fn local_snapshot(&self) -> Vec<(ConnectionId, i64, bool)> {
        self.local.iter().map(|l| (l.cid, l.seq, l.retired)).collect()
    }

    #[cfg(test)]
    pub(crate) fn remote_snapshot(&self) -> Vec<(i64, bool, Option<ResetToken>)> {
        self.remote
            .iter()
            .map(|r| (r.seq, r.retired, r.reset_token))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn active_local_seqs(&self) -> Vec<i64> {
        self.local
            .iter()
            .filter(|l| !l.retired)
            .map(|l| l.seq)
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn remote_seqs(&self) -> Vec<(i64, bool)> {
        self.remote.iter().map(|r| (r.seq, r.retired)).collect()
    }
}
