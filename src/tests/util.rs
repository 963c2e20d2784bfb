use std::sync::Arc;
use std::time::Duration;

use bytes::BufMut;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::coding::BufMutExt;
use crate::config::{Config, HandshakeConfig};
use crate::packet::{FIXED_BIT, LONG_HEADER_FORM};
use crate::MIN_INITIAL_SIZE;

pub(super) fn subscribe() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("quicmux=trace")),
        )
        .with_test_writer()
        .try_init();
}

struct NullHandshake;

impl HandshakeConfig for NullHandshake {}

/// A config with a handshake stub and a drain period short enough for tests
pub(super) fn config() -> Config {
    Config {
        crypto: Some(Arc::new(NullHandshake)),
        drain_timeout: Duration::from_millis(50),
        ..Config::default()
    }
}

/// A raw UDP peer for injecting crafted datagrams and observing replies
pub(super) struct Peer {
    socket: UdpSocket,
}

impl Peer {
    pub(super) async fn new() -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    pub(super) async fn send(&self, target: std::net::SocketAddr, datagram: &[u8]) {
        self.socket.send_to(datagram, target).await.unwrap();
    }

    /// The next datagram within 200ms, if any
    pub(super) async fn recv(&self) -> Option<Vec<u8>> {
        let mut buf = vec![0; 2048];
        match timeout(Duration::from_millis(200), self.socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => {
                buf.truncate(len);
                Some(buf)
            }
            _ => None,
        }
    }
}

/// A structurally valid Initial datagram, padded to `MIN_INITIAL_SIZE`
pub(super) fn initial_datagram(version: u32, dst: &[u8], src: &[u8], token: &[u8]) -> Vec<u8> {
    let mut b = long_header(LONG_HEADER_FORM | FIXED_BIT, version, dst, src);
    b.write_var(token.len() as u64);
    b.put_slice(token);
    b.write_var(1200);
    b.resize(MIN_INITIAL_SIZE, 0);
    b
}

/// A Handshake-type datagram, padded like a client's second flight
pub(super) fn handshake_datagram(dst: &[u8], src: &[u8]) -> Vec<u8> {
    let mut b = long_header(
        LONG_HEADER_FORM | FIXED_BIT | 0x20,
        crate::VERSION,
        dst,
        src,
    );
    b.write_var(1200);
    b.resize(MIN_INITIAL_SIZE, 0);
    b
}

pub(super) fn long_header(first: u8, version: u32, dst: &[u8], src: &[u8]) -> Vec<u8> {
    let mut b = Vec::new();
    b.write(first);
    b.write(version);
    b.write(dst.len() as u8);
    b.put_slice(dst);
    b.write(src.len() as u8);
    b.put_slice(src);
    b
}

/// A short-header datagram of `len` bytes addressed to `dst`
pub(super) fn short_datagram(dst: &[u8], len: usize) -> Vec<u8> {
    let mut b = vec![0; len];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut b);
    b[0] = (b[0] & !LONG_HEADER_FORM) | FIXED_BIT;
    b[1..1 + dst.len()].copy_from_slice(dst);
    b
}

/// Poll until `f` holds, failing the test after a second
pub(super) async fn wait_for(mut f: impl FnMut() -> bool) {
    for _ in 0..200 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within deadline");
}
