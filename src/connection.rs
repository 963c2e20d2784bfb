//! Connection handles and the per-connection task.
//!
//! Each connection owns its CID state and runs as an independent task fed
//! through a mailbox. The receive loop (and the handshake/packet layers it
//! collaborates with) communicate with a connection exclusively by sending
//! [`Inbound`] messages; nothing outside the task touches its state.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::BytesMut;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::cid::{ConnectionId, RandomConnectionIdGenerator, ResetToken};
use crate::cid_state::{ConnIdState, PacketFate};
use crate::endpoint::{ConnectError, EndpointShared, TableUpdate};
use crate::frame::NewConnectionId;
use crate::packet::{LongHeader, LongType};
use crate::transport_error::{Code, TransportError};
use crate::transport_parameters::TransportParameters;
use crate::{Side, LOC_CID_LEN};

/// A datagram received from the socket, owned by whoever handles it
#[derive(Debug)]
pub(crate) struct Datagram {
    pub(crate) contents: BytesMut,
    pub(crate) remote: SocketAddr,
}

/// Everything that can arrive in a connection's mailbox
pub(crate) enum Inbound {
    Datagram(Datagram),
    Event(ConnEvent),
}

/// Control inputs from the receive loop and the crypto/loss collaborators
pub(crate) enum ConnEvent {
    /// A datagram carrying this connection's reset token arrived
    StatelessReset(ResetToken),
    /// The handshake layer finished the cryptographic handshake
    HandshakeComplete,
    /// The handshake layer decoded and authenticated the peer's transport
    /// parameters
    TransportParameters(TransportParameters),
    /// The frame layer received NEW_CONNECTION_ID
    NewConnectionId(NewConnectionId),
    /// The frame layer received RETIRE_CONNECTION_ID
    RetireConnectionId(u64),
    /// Loss detection resolved a packet carrying NEW_CONNECTION_ID
    AckOrLossNewConnectionId {
        pnum: u64,
        sequence: u64,
        fate: PacketFate,
    },
    /// Loss detection resolved a packet carrying RETIRE_CONNECTION_ID
    AckOrLossRetireConnectionId {
        pnum: u64,
        sequence: u64,
        fate: PacketFate,
    },
    /// The peer acknowledged connection closure
    PeerClosed,
    /// Close the connection, waiting out the drain period
    Abort(TransportError),
    /// Stop immediately, without waiting for the peer
    Exit,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Phase {
    Handshaking,
    Ready,
    Draining,
    Drained,
}

/// Handle to a connection multiplexed on an [`Endpoint`](crate::Endpoint)
///
/// Cheaply cloneable; all clones refer to the same connection.
#[derive(Clone)]
pub struct Conn {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    side: Side,
    remote: SocketAddr,
    /// Client-chosen destination CID of the very first Initial, recovered
    /// from the retry token when address validation ran
    orig_dst_cid: Option<ConnectionId>,
    /// Source CID of the Retry we sent, when one was
    retry_src_cid: Option<ConnectionId>,
    inbound: mpsc::UnboundedSender<Inbound>,
    phase: watch::Sender<Phase>,
    error: Mutex<Option<TransportError>>,
    #[cfg(test)]
    datagrams_seen: AtomicUsize,
}

/// Routing handle stored in the dispatch tables
///
/// Carries just enough of a [`Conn`] to deliver mailbox messages; the
/// receive loop never touches connection state directly.
#[derive(Clone)]
pub(crate) struct ConnRoute {
    inbound: mpsc::UnboundedSender<Inbound>,
}

impl ConnRoute {
    pub(crate) fn new(inbound: mpsc::UnboundedSender<Inbound>) -> Self {
        Self { inbound }
    }

    /// Deliver a message; false when the connection is gone
    pub(crate) fn send(&self, msg: Inbound) -> bool {
        self.inbound.send(msg).is_ok()
    }

    #[cfg(test)]
    pub(crate) fn same_conn(&self, other: &Self) -> bool {
        self.inbound.same_channel(&other.inbound)
    }
}

/// How a connection came to exist
pub(crate) enum ConnOpts {
    Client,
    Server {
        /// Destination CID of the packet that created the connection; the
        /// client keeps addressing it until the handshake progresses
        initial_dst_cid: ConnectionId,
        orig_dst_cid: ConnectionId,
        retry_src_cid: Option<ConnectionId>,
    },
}

impl Conn {
    pub(crate) fn spawn(endpoint: Arc<EndpointShared>, opts: ConnOpts, remote: SocketAddr) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (phase_tx, _) = watch::channel(Phase::Handshaking);
        let (side, orig_dst_cid, retry_src_cid) = match &opts {
            ConnOpts::Client => (Side::Client, None, None),
            ConnOpts::Server {
                orig_dst_cid,
                retry_src_cid,
                ..
            } => (Side::Server, Some(*orig_dst_cid), *retry_src_cid),
        };
        let conn = Self {
            inner: Arc::new(ConnInner {
                side,
                remote,
                orig_dst_cid,
                retry_src_cid,
                inbound: inbound_tx,
                phase: phase_tx,
                error: Mutex::new(None),
                #[cfg(test)]
                datagrams_seen: AtomicUsize::new(0),
            }),
        };

        let mut driver = ConnDriver {
            handle: conn.clone(),
            endpoint,
            inbound: inbound_rx,
            cid_state: ConnIdState::default(),
            cid_gen: RandomConnectionIdGenerator::new(LOC_CID_LEN),
            drain_deadline: None,
        };
        let route = conn.route();
        let table = &driver.endpoint.table;
        match opts {
            ConnOpts::Client => {
                driver
                    .cid_state
                    .init_client(&mut driver.cid_gen, &route, table)
            }
            ConnOpts::Server {
                initial_dst_cid, ..
            } => driver.cid_state.init_server(
                &mut driver.cid_gen,
                &route,
                table,
                initial_dst_cid,
            ),
        }
        tokio::spawn(driver.run());
        conn
    }

    /// Which side of the connection this endpoint is
    pub fn side(&self) -> Side {
        self.inner.side
    }

    /// The peer's address when the connection was created
    pub fn remote_address(&self) -> SocketAddr {
        self.inner.remote
    }

    /// For servers, the destination CID of the client's very first Initial,
    /// to be echoed in the original_destination_connection_id transport
    /// parameter
    pub fn original_dst_cid(&self) -> Option<ConnectionId> {
        self.inner.orig_dst_cid
    }

    /// For servers, the source CID of the Retry packet that validated the
    /// client's address, if any
    pub fn retry_src_cid(&self) -> Option<ConnectionId> {
        self.inner.retry_src_cid
    }

    /// Wait until the handshake completes
    ///
    /// Fails when the connection dies first or `cancel` fires.
    pub async fn wait_ready(&self, cancel: &CancellationToken) -> Result<(), ConnectError> {
        let mut phase = self.inner.phase.subscribe();
        loop {
            match *phase.borrow_and_update() {
                Phase::Ready => return Ok(()),
                Phase::Draining | Phase::Drained => return Err(ConnectError::Aborted),
                Phase::Handshaking => {}
            }
            tokio::select! {
                changed = phase.changed() => {
                    if changed.is_err() {
                        return Err(ConnectError::Aborted);
                    }
                }
                _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
            }
        }
    }

    /// Close the connection, waiting out the drain period for the peer to
    /// acknowledge
    pub fn abort(&self, error: TransportError) {
        self.send_event(ConnEvent::Abort(error));
    }

    /// Called by the handshake layer when the cryptographic handshake
    /// completes; server connections become available to `accept` from here
    pub fn handshake_complete(&self) {
        self.send_event(ConnEvent::HandshakeComplete);
    }

    /// Called by the handshake layer once the peer's transport parameters
    /// are decoded and authenticated
    pub fn peer_transport_parameters(&self, params: TransportParameters) {
        self.send_event(ConnEvent::TransportParameters(params));
    }

    /// Called by the frame layer for each NEW_CONNECTION_ID frame
    pub fn handle_new_connection_id(
        &self,
        sequence: u64,
        retire_prior_to: u64,
        id: ConnectionId,
        reset_token: ResetToken,
    ) {
        self.send_event(ConnEvent::NewConnectionId(NewConnectionId {
            sequence,
            retire_prior_to,
            id,
            reset_token,
        }));
    }

    /// Called by the frame layer for each RETIRE_CONNECTION_ID frame
    pub fn handle_retire_connection_id(&self, sequence: u64) {
        self.send_event(ConnEvent::RetireConnectionId(sequence));
    }

    /// Called by loss detection when the fate of a packet carrying a
    /// NEW_CONNECTION_ID frame is known
    pub fn ack_or_loss_new_connection_id(&self, pnum: u64, sequence: u64, fate: PacketFate) {
        self.send_event(ConnEvent::AckOrLossNewConnectionId {
            pnum,
            sequence,
            fate,
        });
    }

    /// Called by loss detection when the fate of a packet carrying a
    /// RETIRE_CONNECTION_ID frame is known
    pub fn ack_or_loss_retire_connection_id(&self, pnum: u64, sequence: u64, fate: PacketFate) {
        self.send_event(ConnEvent::AckOrLossRetireConnectionId {
            pnum,
            sequence,
            fate,
        });
    }

    /// Called when the peer acknowledges connection closure; the connection
    /// stops draining immediately
    pub fn peer_closed(&self) {
        self.send_event(ConnEvent::PeerClosed);
    }

    /// The error that closed the connection, if one did
    pub fn error(&self) -> Option<TransportError> {
        self.inner.error.lock().unwrap().clone()
    }

    /// Stop the connection's task without notifying the peer
    pub(crate) fn exit(&self) {
        self.send_event(ConnEvent::Exit);
    }

    pub(crate) fn send_event(&self, event: ConnEvent) {
        let _ = self.inner.inbound.send(Inbound::Event(event));
    }

    pub(crate) fn route(&self) -> ConnRoute {
        ConnRoute::new(self.inner.inbound.clone())
    }

    pub(crate) fn same_conn(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    #[cfg(test)]
    pub(crate) fn datagrams_seen(&self) -> usize {
        self.inner.datagrams_seen.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn is_drained(&self) -> bool {
        *self.inner.phase.borrow() == Phase::Drained
    }
}

enum Flow {
    Continue,
    Break,
}

struct ConnDriver {
    handle: Conn,
    endpoint: Arc<EndpointShared>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    cid_state: ConnIdState,
    cid_gen: RandomConnectionIdGenerator,
    /// Set once the connection is closing; reaching it ends the task
    drain_deadline: Option<Instant>,
}

impl ConnDriver {
    async fn run(mut self) {
        loop {
            let msg = match self.drain_deadline {
                Some(deadline) => tokio::select! {
                    msg = self.inbound.recv() => msg,
                    _ = tokio::time::sleep_until(deadline) => {
                        trace!("drain period elapsed");
                        break;
                    }
                },
                None => self.inbound.recv().await,
            };
            let Some(msg) = msg else {
                // The endpoint is gone; nobody is left to route us packets.
                break;
            };
            match msg {
                Inbound::Datagram(datagram) => self.handle_datagram(datagram),
                Inbound::Event(event) => match self.handle_event(event) {
                    Flow::Continue => {}
                    Flow::Break => break,
                },
            }
        }
        self.finish();
    }

    fn handle_datagram(&mut self, datagram: Datagram) {
        #[cfg(test)]
        self.handle
            .inner
            .datagrams_seen
            .fetch_add(1, Ordering::Relaxed);

        let side = self.handle.inner.side;
        let Some(hdr) = LongHeader::decode(&datagram.contents) else {
            // Short-header packets carry nothing the CID machinery needs;
            // their payload belongs to the packet-protection layer.
            return;
        };
        if hdr.version == 0 {
            // Version Negotiation; meaningful only to the handshake layer.
            return;
        }
        match hdr.ty() {
            Some(ty @ (LongType::Initial | LongType::Handshake)) => {
                self.cid_state
                    .handle_packet(side, &self.endpoint.table, ty, &hdr.src_cid);
            }
            Some(LongType::Retry) => {
                if side.is_client() && self.cid_state.can_accept_retry() {
                    self.cid_state.handle_retry_packet(&hdr.src_cid);
                }
            }
            _ => {}
        }
    }

    fn handle_event(&mut self, event: ConnEvent) -> Flow {
        let route = self.handle.route();
        let side = self.handle.inner.side;
        match event {
            ConnEvent::StatelessReset(token) => {
                if !self.cid_state.is_valid_stateless_reset_token(token) {
                    return Flow::Continue;
                }
                debug!("received stateless reset");
                // The peer has lost our state; there is nothing to wait for.
                self.handle.inner.phase.send_replace(Phase::Draining);
                Flow::Break
            }
            ConnEvent::HandshakeComplete => {
                if *self.handle.inner.phase.borrow() != Phase::Handshaking {
                    return Flow::Continue;
                }
                trace!(
                    src = %self.cid_state.src_cid(),
                    dst = ?self.cid_state.dst_cid(),
                    "handshake complete"
                );
                self.handle.inner.phase.send_replace(Phase::Ready);
                if side.is_server() && !self.endpoint.server_conn_established(&self.handle) {
                    warn!("accept queue unavailable, refusing connection");
                    self.fail(Code::CONNECTION_REFUSED.into());
                }
                Flow::Continue
            }
            ConnEvent::TransportParameters(params) => {
                if let Err(e) = self.cid_state.validate_transport_parameters(
                    side,
                    &route,
                    &self.endpoint.table,
                    &params,
                ) {
                    self.fail(e);
                    return Flow::Continue;
                }
                self.cid_state.set_peer_active_conn_id_limit(
                    &mut self.cid_gen,
                    &route,
                    &self.endpoint.table,
                    params.active_conn_id_limit,
                );
                Flow::Continue
            }
            ConnEvent::NewConnectionId(frame) => {
                if let Err(e) =
                    self.cid_state
                        .handle_new_conn_id(&route, &self.endpoint.table, &frame)
                {
                    self.fail(e);
                }
                Flow::Continue
            }
            ConnEvent::RetireConnectionId(sequence) => {
                if let Err(e) = self.cid_state.handle_retire_conn_id(
                    &mut self.cid_gen,
                    &route,
                    &self.endpoint.table,
                    sequence,
                ) {
                    self.fail(e);
                }
                Flow::Continue
            }
            ConnEvent::AckOrLossNewConnectionId {
                pnum,
                sequence,
                fate,
            } => {
                self.cid_state
                    .ack_or_loss_new_connection_id(pnum, sequence, fate);
                Flow::Continue
            }
            ConnEvent::AckOrLossRetireConnectionId {
                pnum,
                sequence,
                fate,
            } => {
                self.cid_state
                    .ack_or_loss_retire_connection_id(pnum, sequence, fate);
                Flow::Continue
            }
            ConnEvent::PeerClosed => Flow::Break,
            ConnEvent::Abort(error) => {
                self.record_error(error);
                self.start_drain();
                Flow::Continue
            }
            ConnEvent::Exit => Flow::Break,
        }
    }

    /// Enter the draining state due to a local error
    fn fail(&mut self, error: TransportError) {
        warn!(%error, "closing connection");
        self.record_error(error);
        self.start_drain();
    }

    fn record_error(&self, error: TransportError) {
        let mut slot = self.handle.inner.error.lock().unwrap();
        if slot.is_none() && error.code != Code::NO_ERROR {
            *slot = Some(error);
        }
    }

    fn start_drain(&mut self) {
        self.handle.inner.phase.send_replace(Phase::Draining);
        if self.drain_deadline.is_none() {
            self.drain_deadline = Some(Instant::now() + self.endpoint.config.drain_timeout);
        }
    }

    /// Tear down: nothing sent to this connection's IDs may route anywhere
    /// after this
    fn finish(&mut self) {
        let table = &self.endpoint.table;
        for cid in self.cid_state.local_cids() {
            table.push(TableUpdate::RetireCid(cid));
        }
        for token in self.cid_state.remote_reset_tokens() {
            table.push(TableUpdate::RetireResetToken(token));
        }
        self.handle.inner.phase.send_replace(Phase::Drained);
        self.endpoint.conn_drained(&self.handle);
    }
}
