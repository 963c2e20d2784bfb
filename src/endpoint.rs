//! The endpoint: one UDP socket, many connections.
//!
//! A single receive task reads datagrams and routes each one by destination
//! CID. The routing maps are owned by that task and never locked; every
//! mutation is a [`TableUpdate`] queued by connection tasks and applied by
//! the receive task between datagrams. A NEW_CONNECTION_ID can only affect
//! *future* datagrams, so deferring visibility by one datagram is sound.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use bytes::BytesMut;
use rand::RngCore;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::cid::{ConnectionId, ResetToken, ResetTokenGenerator};
use crate::config::Config;
use crate::connection::{Conn, ConnEvent, ConnOpts, ConnRoute, Datagram, Inbound};
use crate::packet::{self, LongHeader, LongType, FIXED_BIT, LONG_HEADER_FORM};
use crate::queue::Queue;
use crate::retry::{AddressValidation, RetryState};
use crate::transport_error::Code;
use crate::{LOC_CID_LEN, MIN_INITIAL_SIZE, RESET_TOKEN_SIZE, VERSION};

/// Errors constructing an [`Endpoint`]
#[derive(Debug, Error)]
pub enum EndpointError {
    /// No handshake configuration was supplied
    #[error("crypto handshake configuration is not set")]
    NoCryptoConfig,
    /// The listen address did not resolve to anything
    #[error("could not resolve address: {0}")]
    Resolve(String),
    /// Socket setup failed
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors surfaced by `accept`, `dial`, and `close`
#[derive(Debug, Clone, Error)]
pub enum ConnectError {
    /// The endpoint has been closed
    #[error("endpoint closed")]
    EndpointClosed,
    /// The caller's cancellation token fired
    #[error("operation cancelled")]
    Cancelled,
    /// The connection died before becoming ready
    #[error("connection aborted")]
    Aborted,
    /// The remote address did not resolve to anything
    #[error("could not resolve address: {0}")]
    Resolve(String),
    /// Socket or resolver failure
    #[error("i/o error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for ConnectError {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

/// A mutation of the dispatch tables, applied only by the receive task
pub(crate) enum TableUpdate {
    AddCid(ConnectionId, ConnRoute),
    RetireCid(ConnectionId),
    AddResetToken(ResetToken, ConnRoute),
    RetireResetToken(ResetToken),
}

/// Queue of table mutations from connection tasks to the receive task
///
/// The atomic flag lets the receive loop skip the mutex on the overwhelming
/// majority of datagrams, when no update is pending.
#[derive(Default)]
pub(crate) struct TableUpdater {
    pending: Mutex<Vec<TableUpdate>>,
    dirty: AtomicBool,
}

impl TableUpdater {
    pub(crate) fn push(&self, update: TableUpdate) {
        let mut pending = self.pending.lock().unwrap();
        pending.push(update);
        self.dirty.store(true, Ordering::Release);
    }

    pub(crate) fn dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Apply all queued updates in the order they were enqueued
    pub(crate) fn apply(&self, map: &mut ConnsMap) {
        let mut pending = self.pending.lock().unwrap();
        for update in pending.drain(..) {
            map.apply(update);
        }
        self.dirty.store(false, Ordering::Release);
    }
}

/// The demultiplexer's read maps; owned exclusively by the receive task
#[derive(Default)]
pub(crate) struct ConnsMap {
    pub(crate) by_conn_id: FxHashMap<ConnectionId, ConnRoute>,
    pub(crate) by_reset_token: FxHashMap<ResetToken, ConnRoute>,
}

impl ConnsMap {
    fn apply(&mut self, update: TableUpdate) {
        match update {
            TableUpdate::AddCid(cid, route) => {
                self.by_conn_id.insert(cid, route);
            }
            TableUpdate::RetireCid(cid) => {
                self.by_conn_id.remove(&cid);
            }
            TableUpdate::AddResetToken(token, route) => {
                self.by_reset_token.insert(token, route);
            }
            TableUpdate::RetireResetToken(token) => {
                self.by_reset_token.remove(&token);
            }
        }
    }
}

/// Per-source budget for stateless reset emission
///
/// Resets are a reflection primitive: without a budget, an attacker spraying
/// short-header packets with spoofed sources turns us into an amplifierless
/// but still unwelcome packet generator.
struct ResetRateLimiter {
    per_ip: FxHashMap<IpAddr, TokenBucket>,
    /// Fallback budget once the table is full of distinct (likely spoofed)
    /// sources
    overflow: TokenBucket,
}

const RESET_BURST: u32 = 8;
const RESET_REFILL: Duration = Duration::from_millis(500);
const RESET_TRACKED_SOURCES: usize = 1024;

#[derive(Copy, Clone)]
struct TokenBucket {
    tokens: u32,
    last: Instant,
}

impl TokenBucket {
    fn new(now: Instant) -> Self {
        Self {
            tokens: RESET_BURST,
            last: now,
        }
    }

    fn allow(&mut self, now: Instant) -> bool {
        let refilled = (now.saturating_duration_since(self.last).as_millis()
            / RESET_REFILL.as_millis()) as u32;
        if refilled > 0 {
            self.tokens = (self.tokens + refilled).min(RESET_BURST);
            self.last = now;
        }
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }
}

impl ResetRateLimiter {
    fn new(now: Instant) -> Self {
        Self {
            per_ip: FxHashMap::default(),
            overflow: TokenBucket::new(now),
        }
    }

    fn allow(&mut self, ip: IpAddr, now: Instant) -> bool {
        if let Some(bucket) = self.per_ip.get_mut(&ip) {
            return bucket.allow(now);
        }
        if self.per_ip.len() >= RESET_TRACKED_SOURCES {
            let idle = RESET_REFILL * RESET_BURST;
            self.per_ip
                .retain(|_, b| now.saturating_duration_since(b.last) < idle);
        }
        if self.per_ip.len() >= RESET_TRACKED_SOURCES {
            return self.overflow.allow(now);
        }
        let bucket = self.per_ip.entry(ip).or_insert_with(|| TokenBucket::new(now));
        bucket.allow(now)
    }
}

/// A QUIC endpoint bound to a UDP socket
///
/// Accepts inbound connections and creates outbound ones, multiplexing all
/// of them over the one socket. Cheaply cloneable.
#[derive(Clone)]
pub struct Endpoint {
    shared: Arc<EndpointShared>,
}

pub(crate) struct EndpointShared {
    pub(crate) socket: UdpSocket,
    pub(crate) config: Config,
    pub(crate) reset_gen: ResetTokenGenerator,
    pub(crate) retry: Option<RetryState>,
    pub(crate) accept_queue: Queue<Conn>,
    pub(crate) table: TableUpdater,
    conns: Mutex<ConnSet>,
    /// Cancelled when the socket should stop being read: on `close` with no
    /// connections left
    pub(crate) shutdown: CancellationToken,
    /// Cancelled when the receive loop has exited
    pub(crate) loop_done: CancellationToken,
}

struct ConnSet {
    conns: Vec<Conn>,
    closing: bool,
}

impl Endpoint {
    /// Bind `address` and start serving it
    ///
    /// The configuration must carry a handshake setup.
    pub async fn listen(address: &str, config: Config) -> Result<Self, EndpointError> {
        if config.crypto.is_none() {
            return Err(EndpointError::NoCryptoConfig);
        }
        let addr = lookup_host(address)
            .await?
            .next()
            .ok_or_else(|| EndpointError::Resolve(address.into()))?;
        let socket = UdpSocket::bind(addr).await?;
        let reset_gen = ResetTokenGenerator::new(config.stateless_reset_key.as_deref());
        let retry = config.require_address_validation.then(RetryState::new);
        let shared = Arc::new(EndpointShared {
            socket,
            accept_queue: Queue::new(config.accept_queue_depth),
            config,
            reset_gen,
            retry,
            table: TableUpdater::default(),
            conns: Mutex::new(ConnSet {
                conns: Vec::new(),
                closing: false,
            }),
            shutdown: CancellationToken::new(),
            loop_done: CancellationToken::new(),
        });
        tokio::spawn(drive(shared.clone()));
        Ok(Self { shared })
    }

    /// The local address the socket is bound to
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.shared.socket.local_addr()
    }

    /// Wait for and return the next inbound connection
    pub async fn accept(&self, cancel: &CancellationToken) -> Result<Conn, ConnectError> {
        self.shared.accept_queue.get(cancel).await
    }

    /// Create a connection to `address`, returning once it is
    /// handshake-ready
    pub async fn dial(&self, address: &str, cancel: &CancellationToken) -> Result<Conn, ConnectError> {
        let addr = lookup_host(address)
            .await?
            .next()
            .ok_or_else(|| ConnectError::Resolve(address.into()))?;
        let conn = self.shared.new_conn(ConnOpts::Client, unmap(addr))?;
        match conn.wait_ready(cancel).await {
            Ok(()) => Ok(conn),
            Err(e) => {
                conn.abort(Code::NO_ERROR.into());
                Err(e)
            }
        }
    }

    /// Close the endpoint
    ///
    /// Aborts every open connection and waits for their peers to acknowledge
    /// closure. When `cancel` fires first, all connections are stopped
    /// immediately and the cancellation is returned while teardown finishes
    /// in the background. Blocked `accept` calls fail either way.
    pub async fn close(&self, cancel: &CancellationToken) -> Result<(), ConnectError> {
        let shared = &self.shared;
        shared.accept_queue.close(ConnectError::EndpointClosed);
        {
            let mut set = shared.conns.lock().unwrap();
            if !set.closing {
                set.closing = true;
                for conn in &set.conns {
                    conn.abort(Code::NO_ERROR.into());
                }
                if set.conns.is_empty() {
                    shared.shutdown.cancel();
                }
            }
        }
        tokio::select! {
            _ = shared.loop_done.cancelled() => Ok(()),
            _ = cancel.cancelled() => {
                let conns = shared.conns.lock().unwrap().conns.clone();
                for conn in conns {
                    conn.exit();
                }
                Err(ConnectError::Cancelled)
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<EndpointShared> {
        &self.shared
    }

    #[cfg(test)]
    pub(crate) fn conn_count(&self) -> usize {
        self.shared.conns.lock().unwrap().conns.len()
    }

    #[cfg(test)]
    pub(crate) fn conns_snapshot(&self) -> Vec<Conn> {
        self.shared.conns.lock().unwrap().conns.clone()
    }
}

impl EndpointShared {
    pub(crate) fn new_conn(
        self: &Arc<Self>,
        opts: ConnOpts,
        remote: SocketAddr,
    ) -> Result<Conn, ConnectError> {
        let mut set = self.conns.lock().unwrap();
        if set.closing {
            return Err(ConnectError::EndpointClosed);
        }
        let conn = Conn::spawn(self.clone(), opts, remote);
        set.conns.push(conn.clone());
        Ok(conn)
    }

    /// An inbound connection finished its handshake; make it acceptable
    pub(crate) fn server_conn_established(&self, conn: &Conn) -> bool {
        self.accept_queue.put(conn.clone())
    }

    /// A connection left its draining state; its IDs are already queued for
    /// removal from the dispatch tables
    pub(crate) fn conn_drained(&self, conn: &Conn) {
        let mut set = self.conns.lock().unwrap();
        set.conns.retain(|c| !c.same_conn(conn));
        if set.closing && set.conns.is_empty() {
            self.shutdown.cancel();
        }
    }
}

/// The receive loop: owns the socket read path and the dispatch tables
async fn drive(shared: Arc<EndpointShared>) {
    let mut map = ConnsMap::default();
    let mut reset_limiter = ResetRateLimiter::new(Instant::now());
    let mut buf = vec![0; u16::MAX as usize];
    loop {
        let (len, remote) = tokio::select! {
            result = shared.socket.recv_from(&mut buf) => match result {
                Ok(x) => x,
                // Undefined in QUIC and may be injected by an attacker;
                // a reflected ICMP error must not kill the endpoint.
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    debug!("socket read failed: {e}");
                    break;
                }
            },
            _ = shared.shutdown.cancelled() => break,
        };
        if len == 0 {
            continue;
        }
        if shared.table.dirty() {
            shared.table.apply(&mut map);
        }
        let datagram = Datagram {
            contents: BytesMut::from(&buf[..len]),
            remote,
        };
        handle_datagram(&shared, &map, datagram, &mut reset_limiter).await;
    }
    shared.loop_done.cancel();
}

async fn handle_datagram(
    shared: &Arc<EndpointShared>,
    map: &ConnsMap,
    datagram: Datagram,
    reset_limiter: &mut ResetRateLimiter,
) {
    let Some(dst_cid) = packet::dst_cid_for_datagram(&datagram.contents) else {
        return;
    };
    if let Some(route) = map.by_conn_id.get(&dst_cid) {
        route.send(Inbound::Datagram(datagram));
        return;
    }
    handle_unknown_destination(shared, map, datagram, reset_limiter).await;
}

async fn handle_unknown_destination(
    shared: &Arc<EndpointShared>,
    map: &ConnsMap,
    datagram: Datagram,
    reset_limiter: &mut ResetRateLimiter,
) {
    const MINIMUM_VALID_PACKET_SIZE: usize = 21;
    let contents = &datagram.contents;
    if contents.len() < MINIMUM_VALID_PACKET_SIZE {
        return;
    }

    // A datagram ending in a token we issued is a stateless reset no matter
    // what the rest of it claims to be.
    let mut tail = [0; RESET_TOKEN_SIZE];
    tail.copy_from_slice(&contents[contents.len() - RESET_TOKEN_SIZE..]);
    let token = ResetToken::from(tail);
    if let Some(route) = map.by_reset_token.get(&token) {
        trace!("routing stateless reset");
        route.send(Inbound::Event(ConnEvent::StatelessReset(token)));
        return;
    }

    if contents[0] & LONG_HEADER_FORM == 0 {
        // A 1-RTT packet for a connection we know nothing about; nothing
        // productive to do with it beyond possibly resetting the sender.
        maybe_send_stateless_reset(shared, &datagram, reset_limiter).await;
        return;
    }

    let Some(hdr) = LongHeader::decode(contents) else {
        return;
    };
    if contents.len() < MIN_INITIAL_SIZE {
        return;
    }
    match hdr.version {
        VERSION => {}
        0 => {
            // Version Negotiation for an unknown connection.
            return;
        }
        version => {
            trace!(version, "sending version negotiation");
            let mut buf = Vec::new();
            packet::encode_version_negotiation(
                rand::thread_rng().next_u32() as u8,
                &hdr.src_cid,
                &hdr.dst_cid,
                &mut buf,
            );
            let _ = shared.socket.send_to(&buf, datagram.remote).await;
            return;
        }
    }
    if hdr.ty() != Some(LongType::Initial) {
        // Not trying to create a connection; it might belong to one we have
        // lost state for, but a stateless reset for a long-header packet is
        // not generally useful.
        // https://www.rfc-editor.org/rfc/rfc9000#section-10.3-16
        return;
    }

    let (orig_dst_cid, retry_src_cid) = match &shared.retry {
        Some(retry) => {
            let Some(token) = packet::initial_token(contents) else {
                return;
            };
            match retry.validate_initial_address(
                SystemTime::now(),
                &hdr,
                token,
                datagram.remote,
                shared.config.retry_token_lifetime,
            ) {
                AddressValidation::Validated { orig_dst_cid } => {
                    (orig_dst_cid, Some(hdr.dst_cid))
                }
                AddressValidation::Retry { datagram: reply } => {
                    trace!("sending retry");
                    let _ = shared.socket.send_to(&reply, datagram.remote).await;
                    return;
                }
                AddressValidation::Invalid => return,
            }
        }
        None => (hdr.dst_cid, None),
    };

    if shared.accept_queue.is_full() {
        debug!("dropping connection attempt: accept queue full");
        return;
    }
    let conn = match shared.new_conn(
        ConnOpts::Server {
            initial_dst_cid: hdr.dst_cid,
            orig_dst_cid,
            retry_src_cid,
        },
        datagram.remote,
    ) {
        Ok(conn) => conn,
        Err(_) => {
            debug!("dropping connection attempt: endpoint closing");
            return;
        }
    };
    trace!(dst_cid = %hdr.dst_cid, "connection incoming");
    conn.route().send(Inbound::Datagram(datagram));
}

async fn maybe_send_stateless_reset(
    shared: &Arc<EndpointShared>,
    datagram: &Datagram,
    reset_limiter: &mut ResetRateLimiter,
) {
    if !shared.reset_gen.can_reset() {
        return;
    }
    let b = &datagram.contents;
    // The smallest possible valid packet a peer can send us is a header
    // byte, a full-length CID, a packet number byte, a payload byte, and
    // the AEAD expansion.
    if b.len() < 1 + LOC_CID_LEN + 1 + 1 + 16 {
        return;
    }
    if !reset_limiter.allow(datagram.remote.ip(), Instant::now()) {
        trace!("stateless reset suppressed by rate limit");
        return;
    }
    let cid = ConnectionId::new(&b[1..1 + LOC_CID_LEN]);
    let token = shared.reset_gen.token_for(&cid);

    // As short as possible while remaining hard to distinguish from a
    // minimal 1-RTT packet (1 + 20 + 4 + 1 + 16 = 42 bytes), and always
    // shorter than the provoking datagram so reset loops terminate.
    // https://www.rfc-editor.org/rfc/rfc9000#section-10.3
    let size = (b.len() - 1).min(42);
    let mut reset = vec![0; size];
    rand::thread_rng().fill_bytes(&mut reset);
    reset[0] = (reset[0] & !LONG_HEADER_FORM) | FIXED_BIT;
    let tail = size - RESET_TOKEN_SIZE;
    reset[tail..].copy_from_slice(&token);
    debug!(peer = %datagram.remote, "sending stateless reset");
    let _ = shared.socket.send_to(&reset, datagram.remote).await;
}

fn unmap(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(ip) => SocketAddr::new(IpAddr::V4(ip), v6.port()),
            None => addr,
        },
        v4 => v4,
    }
}
