//! Typed error kinds for every fallible boundary in the relay core.
//!
//! Each enum corresponds to one of the error kinds in the design (config,
//! bind, admission, tls_handshake, auth, framing, io, protocol). None of
//! these are retried by the core itself except non-blocking write `EAGAIN`,
//! which is handled by the outbound queue's retry timer rather than surfaced
//! as an error at all.

use std::io;
use std::net::AddrParseError;

use failure::Fail;

/// Failure parsing or binding an endpoint spec (§4.1).
#[derive(Debug, Fail)]
pub enum ListenError {
    #[fail(display = "invalid endpoint spec: {}", _0)]
    InvalidSpec(String),
    #[fail(display = "could not bind listening socket: {}", _0)]
    Bind(#[cause] io::Error),
    #[fail(display = "port {} is already bound by another listener", _0)]
    DuplicatePort(u16),
    #[fail(display = "path {} is already bound by another listener", _0)]
    DuplicatePath(String),
    #[fail(display = "path {} exists and is not a socket", _0)]
    UnixPathExistsNotSocket(String),
}

impl From<AddrParseError> for ListenError {
    fn from(e: AddrParseError) -> Self {
        ListenError::InvalidSpec(e.to_string())
    }
}

/// Per-accept rejection (§4.1 admission policy). Always fail-closed; the
/// freshly accepted file descriptor is simply dropped.
#[derive(Debug, Fail, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    #[fail(display = "empty password not allowed on this listener")]
    EmptyPasswordDisallowed,
    #[fail(display = "TOTP configured but password is empty")]
    TotpRequiresPassword,
    #[fail(display = "max clients for this endpoint exceeded")]
    TooManyClients,
    #[fail(display = "peer address rejected by allowed_ips")]
    IpNotAllowed,
}

/// TLS handshake failures (§4.2, §7 `tls_handshake`).
#[derive(Debug, Fail)]
pub enum HandshakeError {
    #[fail(display = "TLS handshake failed: {}", _0)]
    Failed(String),
    #[fail(display = "TLS handshake timed out")]
    TimedOut,
}

/// Failures decoding the wire framing (§4.3, §4.6). Fatal: closes the
/// connection.
#[derive(Debug, Fail)]
pub enum FramingError {
    #[fail(display = "malformed HTTP request: {}", _0)]
    MalformedHttp(String),
    #[fail(display = "websocket protocol violation: {}", _0)]
    WebSocketProtocol(String),
    #[fail(display = "permessage-deflate inflate error: {}", _0)]
    Inflate(String),
    #[fail(display = "unmasked frame received from client")]
    UnmaskedClientFrame,
}

/// Authentication failures (§4.4, §7 `auth`). Surfaces as a single `ERROR`
/// line to the client followed by the `auth_failed` terminal state.
#[derive(Debug, Fail, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[fail(display = "password error")]
    PasswordMismatch,
    #[fail(display = "authentication timed out")]
    TimedOut,
}

/// Reasons a connection transitioned to `disconnected` (§4.2, §7 `io`).
#[derive(Debug, Fail)]
pub enum ConnectionError {
    #[fail(display = "peer closed the connection")]
    PeerClosed,
    #[fail(display = "I/O error: {}", _0)]
    Io(#[cause] io::Error),
    #[fail(display = "{}", _0)]
    Handshake(#[cause] HandshakeError),
    #[fail(display = "{}", _0)]
    Framing(#[cause] FramingError),
    #[fail(display = "{}", _0)]
    Auth(#[cause] AuthError),
    #[fail(display = "shut down by request")]
    Shutdown,
}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<HandshakeError> for ConnectionError {
    fn from(e: HandshakeError) -> Self {
        ConnectionError::Handshake(e)
    }
}

impl From<FramingError> for ConnectionError {
    fn from(e: FramingError) -> Self {
        ConnectionError::Framing(e)
    }
}

impl From<AuthError> for ConnectionError {
    fn from(e: AuthError) -> Self {
        ConnectionError::Auth(e)
    }
}

/// An option value rejected at load/change time (§7 `config`). The option
/// keeps its previous value; this is reported on the control buffer by the
/// embedder, not acted upon by the core.
#[derive(Debug, Fail, Clone, PartialEq, Eq)]
#[fail(display = "invalid value for {}: {}", key, reason)]
pub struct ConfigError {
    pub key: &'static str,
    pub reason: String,
}
