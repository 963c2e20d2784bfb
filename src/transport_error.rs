use std::fmt;

/// Transport-level errors occurring when communicating with a peer
///
/// Surfaced to the peer in a CONNECTION_CLOSE frame by the connection's
/// packet layer.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TransportError {
    /// Type of error
    pub code: Code,
    /// Human-readable explanation of the reason
    pub reason: &'static str,
}

impl TransportError {
    pub(crate) fn new(code: Code, reason: &'static str) -> Self {
        Self { code, reason }
    }
}

impl From<Code> for TransportError {
    fn from(code: Code) -> Self {
        Self { code, reason: "" }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.code)?;
        if !self.reason.is_empty() {
            write!(f, ": {}", self.reason)?;
        }
        Ok(())
    }
}

impl std::error::Error for TransportError {}

/// Transport-level error code as it appears on the wire
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Code(u64);

impl From<Code> for u64 {
    fn from(x: Code) -> Self {
        x.0
    }
}

macro_rules! errors {
    {$($name:ident($val:expr) $desc:expr;)*} => {
        impl Code {
            $(#[doc = $desc] pub const $name: Self = Code($val);)*
        }

        impl fmt::Debug for Code {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    x => write!(f, "Code({x:04x})"),
                }
            }
        }

        impl fmt::Display for Code {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let x = match self.0 {
                    $($val => $desc,)*
                    _ => "unknown error",
                };
                f.write_str(x)
            }
        }
    }
}

errors! {
    NO_ERROR(0x0) "the connection is being closed in the absence of any error";
    INTERNAL_ERROR(0x1) "the endpoint encountered an internal error and cannot continue with the connection";
    CONNECTION_REFUSED(0x2) "the server refused to accept a new connection";
    TRANSPORT_PARAMETER_ERROR(0x8) "an endpoint received transport parameters that were badly formatted, included an invalid value, or were otherwise in error";
    CONNECTION_ID_LIMIT_ERROR(0x9) "the number of connection IDs provided by the peer exceeds the advertised active_connection_id_limit";
    PROTOCOL_VIOLATION(0xa) "an endpoint detected an error with protocol compliance that was not covered by more specific error codes";
    INVALID_TOKEN(0xb) "a server received a client Initial that contained an invalid Token field";
}
