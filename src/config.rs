use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the cryptographic handshake run on each connection
///
/// The listener core does not drive the handshake itself: the handshake
/// layer owns packet protection and the TLS state machine, and reports
/// completion through [`Conn::handshake_complete`](crate::Conn::handshake_complete).
/// An implementation of this trait carries whatever state that layer needs
/// (certificates, ALPN, session storage).
pub trait HandshakeConfig: Send + Sync + 'static {}

/// Endpoint-wide configuration, affecting all connections
pub struct Config {
    /// Handshake configuration; `listen` fails when unset
    pub crypto: Option<Arc<dyn HandshakeConfig>>,

    /// Whether clients must prove ownership of their address with a Retry
    /// round-trip before the server commits connection state
    pub require_address_validation: bool,

    /// How long an address-validation token issued in a Retry packet is
    /// honored
    pub retry_token_lifetime: Duration,

    /// Private key used to derive stateless reset tokens
    ///
    /// Peers that were communicating with a previous instance of this
    /// endpoint can only recognize resets if the key survives restarts.
    /// When unset, stateless resets are not sent.
    pub stateless_reset_key: Option<Vec<u8>>,

    /// Maximum number of handshake-complete inbound connections awaiting
    /// `accept`; new Initials are dropped while the queue is full
    pub accept_queue_depth: usize,

    /// How long a closing connection lingers waiting for the peer to
    /// acknowledge connection closure
    pub drain_timeout: Duration,
}

impl Config {
    /// Configuration with the given handshake setup and conservative
    /// defaults otherwise
    pub fn new(crypto: Arc<dyn HandshakeConfig>) -> Self {
        Self {
            crypto: Some(crypto),
            ..Self::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            crypto: None,
            require_address_validation: false,
            retry_token_lifetime: Duration::from_secs(15),
            stateless_reset_key: None,
            accept_queue_depth: 1024,
            drain_timeout: Duration::from_secs(1),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("crypto", &self.crypto.as_ref().map(|_| "..."))
            .field("require_address_validation", &self.require_address_validation)
            .field("retry_token_lifetime", &self.retry_token_lifetime)
            .field("stateless_reset_key", &self.stateless_reset_key.as_ref().map(|_| "..."))
            .field("accept_queue_depth", &self.accept_queue_depth)
            .field("drain_timeout", &self.drain_timeout)
            .finish()
    }
}
