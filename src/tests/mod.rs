use std::time::Duration;

use hex_literal::hex;
use tokio_util::sync::CancellationToken;

use crate::cid::{ConnectionId, ResetToken, ResetTokenGenerator};
use crate::endpoint::{ConnectError, Endpoint, EndpointError};
use crate::packet::{LongHeader, LongType, LONG_HEADER_FORM};
use crate::transport_error::Code;
use crate::{Config, Side, TransportParameters, RESET_TOKEN_SIZE, VERSION};

mod util;
use util::*;

const DCID: [u8; 8] = hex!("aaaaaaaaaaaaaaaa");
const SCID: [u8; 5] = hex!("bbbbbbbbbb");

async fn endpoint(config: Config) -> (Endpoint, std::net::SocketAddr) {
    subscribe();
    let endpoint = Endpoint::listen("127.0.0.1:0", config).await.unwrap();
    let addr = endpoint.local_addr().unwrap();
    (endpoint, addr)
}

#[tokio::test]
async fn listen_requires_crypto_config() {
    assert!(matches!(
        Endpoint::listen("127.0.0.1:0", Config::default()).await,
        Err(EndpointError::NoCryptoConfig)
    ));
}

#[tokio::test]
async fn version_negotiation_for_unknown_version() {
    let (_endpoint, addr) = endpoint(config()).await;
    let peer = Peer::new().await;
    peer.send(addr, &initial_datagram(0xdead_beef, &DCID, &SCID, &[]))
        .await;

    let reply = peer.recv().await.expect("expected version negotiation");
    let hdr = LongHeader::decode(&reply).unwrap();
    assert_ne!(reply[0] & LONG_HEADER_FORM, 0);
    assert_eq!(hdr.version, 0);
    // CIDs are swapped relative to the provoking packet.
    assert_eq!(&*hdr.dst_cid, &SCID[..]);
    assert_eq!(&*hdr.src_cid, &DCID[..]);
    let versions = &reply[1 + 4 + 1 + SCID.len() + 1 + DCID.len()..];
    assert!(versions.chunks(4).any(|v| v == VERSION.to_be_bytes()));
}

#[tokio::test]
async fn unknown_version_below_minimum_size_ignored() {
    let (_endpoint, addr) = endpoint(config()).await;
    let peer = Peer::new().await;
    let mut small = initial_datagram(0xdead_beef, &DCID, &SCID, &[]);
    small.truncate(100);
    peer.send(addr, &small).await;
    assert!(peer.recv().await.is_none());
}

#[tokio::test]
async fn version_zero_for_unknown_connection_ignored() {
    let (endpoint, addr) = endpoint(config()).await;
    let peer = Peer::new().await;
    peer.send(addr, &initial_datagram(0, &DCID, &SCID, &[])).await;
    assert!(peer.recv().await.is_none());
    assert_eq!(endpoint.conn_count(), 0);
}

#[tokio::test]
async fn runt_datagrams_dropped() {
    let (endpoint, addr) = endpoint(config()).await;
    let peer = Peer::new().await;
    peer.send(addr, &[0x40, 1, 2, 3]).await;
    peer.send(addr, &hex!("00")).await;
    assert!(peer.recv().await.is_none());
    assert_eq!(endpoint.conn_count(), 0);
}

fn reset_key() -> Vec<u8> {
    b"an unremarkable reset key for tests".to_vec()
}

#[tokio::test]
async fn stateless_reset_emission() {
    let (_endpoint, addr) = endpoint(Config {
        stateless_reset_key: Some(reset_key()),
        ..config()
    })
    .await;
    let peer = Peer::new().await;
    let provoking = short_datagram(&hex!("0123456789abcdef"), 50);
    peer.send(addr, &provoking).await;

    let reset = peer.recv().await.expect("expected a stateless reset");
    // min(50 - 1, 42)
    assert_eq!(reset.len(), 42);
    assert_eq!(reset[0] & LONG_HEADER_FORM, 0);
    assert_ne!(reset[0] & 0x40, 0);
    let expected = ResetTokenGenerator::new(Some(&reset_key()[..]))
        .token_for(&ConnectionId::new(&provoking[1..9]));
    assert_eq!(&reset[reset.len() - RESET_TOKEN_SIZE..], &*expected);
}

#[tokio::test]
async fn stateless_reset_shorter_than_provocation() {
    let (_endpoint, addr) = endpoint(Config {
        stateless_reset_key: Some(reset_key()),
        ..config()
    })
    .await;
    let peer = Peer::new().await;
    peer.send(addr, &short_datagram(&hex!("0123456789abcdef"), 30))
        .await;
    assert_eq!(peer.recv().await.unwrap().len(), 29);

    // Below the smallest valid packet there is nothing to respond to.
    peer.send(addr, &short_datagram(&hex!("0123456789abcdef"), 26))
        .await;
    assert!(peer.recv().await.is_none());
}

#[tokio::test]
async fn no_stateless_reset_without_key() {
    let (_endpoint, addr) = endpoint(config()).await;
    let peer = Peer::new().await;
    peer.send(addr, &short_datagram(&hex!("0123456789abcdef"), 50))
        .await;
    assert!(peer.recv().await.is_none());
}

#[tokio::test]
async fn stateless_resets_are_rate_limited() {
    let (_endpoint, addr) = endpoint(Config {
        stateless_reset_key: Some(reset_key()),
        ..config()
    })
    .await;
    let peer = Peer::new().await;
    for i in 0..20u8 {
        let mut cid = [i; 8];
        cid[0] = 0x7f;
        peer.send(addr, &short_datagram(&cid, 50)).await;
    }
    let mut replies = 0;
    while peer.recv().await.is_some() {
        replies += 1;
    }
    // The per-source budget, give or take a refill under a slow scheduler.
    assert!((8..=10).contains(&replies), "got {replies} resets");
}

#[tokio::test]
async fn server_admits_client() {
    let (endpoint, addr) = endpoint(config()).await;
    let peer = Peer::new().await;
    peer.send(addr, &initial_datagram(VERSION, &DCID, &SCID, &[]))
        .await;

    wait_for(|| endpoint.conn_count() == 1).await;
    let conn = endpoint.conns_snapshot().remove(0);
    assert_eq!(conn.side(), Side::Server);
    wait_for(|| conn.datagrams_seen() == 1).await;

    // The client-chosen transient ID keeps routing here...
    peer.send(addr, &handshake_datagram(&DCID, &SCID)).await;
    wait_for(|| conn.datagrams_seen() == 2).await;

    // ...until the first Handshake packet proves it dead. After that the
    // transient ID no longer routes anywhere.
    tokio::time::sleep(Duration::from_millis(20)).await;
    peer.send(addr, &short_datagram(&DCID, 50)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(conn.datagrams_seen(), 2);

    // Handshake completion surfaces the connection to accept.
    conn.handshake_complete();
    let accepted = endpoint.accept(&CancellationToken::new()).await.unwrap();
    assert!(accepted.same_conn(&conn));
}

#[tokio::test]
async fn reset_token_routes_to_owning_conn() {
    let (endpoint, addr) = endpoint(Config {
        stateless_reset_key: Some(reset_key()),
        ..config()
    })
    .await;
    let peer = Peer::new().await;
    peer.send(addr, &initial_datagram(VERSION, &DCID, &SCID, &[]))
        .await;
    wait_for(|| endpoint.conn_count() == 1).await;
    let conn = endpoint.conns_snapshot().remove(0);
    wait_for(|| conn.datagrams_seen() == 1).await;

    // The peer issues a replacement CID with a reset token and retires its
    // handshake CID, making the token the one in active use.
    let token = ResetToken::from([0x42; RESET_TOKEN_SIZE]);
    conn.handle_new_connection_id(1, 1, ConnectionId::new(&hex!("cccccccccccccccc")), token);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A datagram with unknown CID but the token in its tail is a stateless
    // reset: delivered to the connection, never answered with a reset of
    // our own.
    let mut datagram = short_datagram(&hex!("9999999999999999"), 40);
    let tail = datagram.len() - RESET_TOKEN_SIZE;
    datagram[tail..].copy_from_slice(&token);
    peer.send(addr, &datagram).await;

    assert!(peer.recv().await.is_none());
    wait_for(|| endpoint.conn_count() == 0).await;
    assert!(conn.is_drained());
}

#[tokio::test]
async fn admission_stops_when_accept_queue_full() {
    let (endpoint, addr) = endpoint(Config {
        accept_queue_depth: 0,
        ..config()
    })
    .await;
    let peer = Peer::new().await;
    peer.send(addr, &initial_datagram(VERSION, &DCID, &SCID, &[]))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(endpoint.conn_count(), 0);
}

#[tokio::test]
async fn retry_round_trip() {
    let (endpoint, addr) = endpoint(Config {
        require_address_validation: true,
        ..config()
    })
    .await;
    let peer = Peer::new().await;

    // First flight without a token provokes a Retry.
    peer.send(addr, &initial_datagram(VERSION, &DCID, &SCID, &[]))
        .await;
    let reply = peer.recv().await.expect("expected a retry");
    let retry = LongHeader::decode(&reply).unwrap();
    assert_eq!(retry.ty(), Some(LongType::Retry));
    assert_eq!(&*retry.dst_cid, &SCID[..]);
    assert_eq!(endpoint.conn_count(), 0);
    let token_start = 1 + 4 + 1 + SCID.len() + 1 + retry.src_cid.len();
    let token = &reply[token_start..reply.len() - 16];

    // A mangled token is dropped outright.
    let mut mangled = token.to_vec();
    mangled[0] ^= 0xff;
    peer.send(
        addr,
        &initial_datagram(VERSION, &retry.src_cid, &SCID, &mangled),
    )
    .await;
    assert!(peer.recv().await.is_none());
    assert_eq!(endpoint.conn_count(), 0);

    // The echoed token validates and carries the original DCID through.
    peer.send(
        addr,
        &initial_datagram(VERSION, &retry.src_cid, &SCID, token),
    )
    .await;
    wait_for(|| endpoint.conn_count() == 1).await;
    let conn = endpoint.conns_snapshot().remove(0);
    assert_eq!(conn.original_dst_cid(), Some(ConnectionId::new(&DCID)));
    assert_eq!(conn.retry_src_cid(), Some(retry.src_cid));
}

#[tokio::test]
async fn dial_returns_once_handshake_completes() {
    let (endpoint, _addr) = endpoint(config()).await;
    let dialer = endpoint.clone();
    let task = tokio::spawn(async move {
        dialer.dial("127.0.0.1:4433", &CancellationToken::new()).await
    });

    wait_for(|| endpoint.conn_count() == 1).await;
    let conn = endpoint.conns_snapshot().remove(0);
    assert_eq!(conn.side(), Side::Client);
    conn.handshake_complete();

    let dialed = task.await.unwrap().unwrap();
    assert!(dialed.same_conn(&conn));
}

#[tokio::test]
async fn dial_cancellation_aborts_half_built_conn() {
    let (endpoint, _addr) = endpoint(config()).await;
    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(matches!(
        endpoint.dial("127.0.0.1:4433", &cancel).await,
        Err(ConnectError::Cancelled)
    ));
    // The aborted connection drains away on its own.
    wait_for(|| endpoint.conn_count() == 0).await;
}

#[tokio::test]
async fn accept_honors_cancellation() {
    let (endpoint, _addr) = endpoint(config()).await;
    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(matches!(
        endpoint.accept(&cancel).await,
        Err(ConnectError::Cancelled)
    ));
}

#[tokio::test]
async fn close_with_no_connections() {
    let (endpoint, addr) = endpoint(config()).await;
    endpoint.close(&CancellationToken::new()).await.unwrap();

    // Blocked and future accepts fail, and nothing is admitted anymore.
    assert!(matches!(
        endpoint.accept(&CancellationToken::new()).await,
        Err(ConnectError::EndpointClosed)
    ));
    let peer = Peer::new().await;
    peer.send(addr, &initial_datagram(VERSION, &DCID, &SCID, &[]))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(endpoint.conn_count(), 0);
}

#[tokio::test]
async fn close_waits_for_draining_conns() {
    let (endpoint, _addr) = endpoint(config()).await;
    let dialer = endpoint.clone();
    tokio::spawn(async move {
        let _ = dialer.dial("127.0.0.1:4433", &CancellationToken::new()).await;
    });
    wait_for(|| endpoint.conn_count() == 1).await;

    endpoint.close(&CancellationToken::new()).await.unwrap();
    assert_eq!(endpoint.conn_count(), 0);
    // The conn was closed without an error of its own.
    assert!(endpoint.shared().loop_done.is_cancelled());
}

#[tokio::test]
async fn close_cancellation_hard_exits_conns() {
    let (endpoint, _addr) = endpoint(Config {
        // Long enough that a graceful drain cannot win the race below.
        drain_timeout: Duration::from_secs(30),
        ..config()
    })
    .await;
    for _ in 0..2 {
        let dialer = endpoint.clone();
        tokio::spawn(async move {
            let _ = dialer.dial("127.0.0.1:4433", &CancellationToken::new()).await;
        });
    }
    wait_for(|| endpoint.conn_count() == 2).await;

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });
    assert!(matches!(
        endpoint.close(&cancel).await,
        Err(ConnectError::Cancelled)
    ));

    // Teardown finishes in the background: conns exit, then the loop.
    endpoint.shared().loop_done.cancelled().await;
    wait_for(|| endpoint.conn_count() == 0).await;
}

#[tokio::test]
async fn transport_parameter_mismatch_closes_conn() {
    let (endpoint, _addr) = endpoint(config()).await;
    let dialer = endpoint.clone();
    tokio::spawn(async move {
        let _ = dialer.dial("127.0.0.1:4433", &CancellationToken::new()).await;
    });
    wait_for(|| endpoint.conn_count() == 1).await;
    let conn = endpoint.conns_snapshot().remove(0);

    // The handshake layer reports parameters whose original_dst_cid cannot
    // match the transient ID the connection invented.
    conn.peer_transport_parameters(TransportParameters {
        original_dst_cid: Some(ConnectionId::new(&hex!("00"))),
        ..TransportParameters::initial()
    });
    wait_for(|| conn.error().is_some()).await;
    assert_eq!(
        conn.error().unwrap().code,
        Code::TRANSPORT_PARAMETER_ERROR
    );
}

#[tokio::test]
async fn conn_errors_are_recorded() {
    let (endpoint, addr) = endpoint(config()).await;
    let peer = Peer::new().await;
    peer.send(addr, &initial_datagram(VERSION, &DCID, &SCID, &[]))
        .await;
    wait_for(|| endpoint.conn_count() == 1).await;
    let conn = endpoint.conns_snapshot().remove(0);
    wait_for(|| conn.datagrams_seen() == 1).await;

    // A NEW_CONNECTION_ID clashing with a known sequence number is a
    // protocol violation; the connection closes with the error recorded.
    conn.handle_new_connection_id(
        0,
        0,
        ConnectionId::new(&hex!("cccccccccccccccc")),
        ResetToken::from([1; RESET_TOKEN_SIZE]),
    );
    wait_for(|| conn.error().is_some()).await;
    assert_eq!(conn.error().unwrap().code, Code::PROTOCOL_VIOLATION);
    // After the drain period the endpoint forgets the connection.
    wait_for(|| endpoint.conn_count() == 0).await;
}
