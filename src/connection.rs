//! Per-client state machine (§3 "Connection", §4.2, §4.7).
//!
//! A `Connection` performs no socket I/O itself — see `io` for the `mio`
//! reactor that owns the actual file descriptor — it only tracks status,
//! buffers, stats, and the protocol substate, and produces writes and
//! timer requests that the reactor carries out.

use std::net::IpAddr;

use rand::RngCore;
use slog::Logger;

use crate::config::RelayConfig;
use crate::error::{ConnectionError, FramingError};
use crate::framing::{DataType, FeedEvent, Framer};
use crate::host::UpstreamHost;
use crate::irc::proxy::{IrcProxy, ProxyContext, ProxyOutcome};
use crate::listener::Protocol;
use crate::outbound::{OutboundEntry, OutboundQueue, TraceShadow};
use crate::raw_trace::{Direction, MessageKind, RawMessage};
use crate::timer::Timer;
use crate::websocket::{self, DecodedFrame, FrameDecoder, FrameEncoder, Opcode};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionHandle(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Authenticating,
    Connected,
    AuthFailed,
    Disconnected,
}

impl ConnectionStatus {
    /// `RELAY_STATUS_HAS_ENDED`: true once a connection can no longer act
    /// on inbound data or be transitioned back to a live state.
    pub fn has_ended(self) -> bool {
        matches!(self, ConnectionStatus::AuthFailed | ConnectionStatus::Disconnected)
    }
}

/// Events the owning `RelayCore` surfaces to its caller after draining one
/// connection.
#[derive(Debug)]
pub enum ConnectionEvent {
    StatusChanged(ConnectionStatus),
    Disconnected(ConnectionError),
}

pub struct ConnectionParams {
    pub id: usize,
    pub descriptor: String,
    pub peer_address: IpAddr,
    pub real_ip: Option<IpAddr>,
    pub protocol: Protocol,
    pub irc_server: Option<String>,
    pub tls: bool,
    pub is_http_upgrade_candidate: bool,
    pub connect_time: i64,
    pub nonce_size: usize,
}

/// Password-hash algorithm negotiated for the rich-protocol authentication
/// handshake (out of scope here, per the glossary's "Nonce" entry, but
/// carried on every connection record since the persisted-state layout
/// names it unconditionally, §6 "Persisted state layout").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordHashAlgo {
    Plain,
    Sha256,
    Sha512,
    Pbkdf2Sha256,
    Pbkdf2Sha512,
}

pub struct Connection {
    pub id: usize,
    pub descriptor: String,
    pub status: ConnectionStatus,
    pub peer_address: IpAddr,
    pub real_ip: Option<IpAddr>,
    pub protocol: Protocol,
    pub tls: bool,
    pub handshake_ok: bool,

    framer: Framer,
    pub outbound: OutboundQueue,
    ws_decoder: Option<FrameDecoder>,
    ws_encoder: Option<FrameEncoder>,
    is_websocket: bool,
    send_data_type: DataType,

    pub connect_time: i64,
    pub last_activity: i64,
    pub bytes_in: u64,
    pub bytes_out: u64,

    /// Rich-protocol authentication nonce (§3 "Authentication state").
    pub nonce: Vec<u8>,
    pub password_ok: Option<bool>,
    pub password_hash_algo: Option<PasswordHashAlgo>,

    pub irc: Option<IrcProxy>,

    log: Logger,
}

impl Connection {
    pub fn new(params: ConnectionParams, relay_host: String, log: Logger) -> Self {
        let data_type = match params.protocol {
            Protocol::Irc => DataType::TextLine,
            Protocol::Weechat => DataType::Binary,
            Protocol::Api => DataType::Http,
        };

        let irc = if params.protocol == Protocol::Irc {
            Some(IrcProxy::new(
                params.id,
                params.irc_server.unwrap_or_default(),
                relay_host,
            ))
        } else {
            None
        };

        let mut nonce = vec![0u8; params.nonce_size];
        rand::thread_rng().fill_bytes(&mut nonce);

        Connection {
            id: params.id,
            descriptor: params.descriptor,
            status: ConnectionStatus::Connecting,
            peer_address: params.peer_address,
            real_ip: params.real_ip,
            protocol: params.protocol,
            tls: params.tls,
            handshake_ok: !params.tls,
            framer: Framer::new(data_type),
            outbound: OutboundQueue::new(),
            ws_decoder: None,
            ws_encoder: None,
            is_websocket: false,
            send_data_type: data_type,
            connect_time: params.connect_time,
            last_activity: params.connect_time,
            bytes_in: 0,
            bytes_out: 0,
            nonce,
            password_ok: None,
            password_hash_algo: None,
            irc,
            log,
        }
    }

    /// TLS handshake completion (§4.2): the connection reports its initial
    /// protocol state once the handshake (or the plain-text equivalent) is
    /// done.
    pub fn handshake_complete(&mut self, requires_password: bool) {
        self.handshake_ok = true;
        self.status = if requires_password {
            ConnectionStatus::Authenticating
        } else {
            ConnectionStatus::Connected
        };
    }

    pub fn client_tag(&self) -> String {
        format!("relay_client_{}", self.id)
    }

    /// Feeds freshly read bytes through framing (and, once active,
    /// WebSocket decoding) and dispatches complete units to the IRC-proxy
    /// protocol (§4.3, §4.6, §4.8). Returns whatever outcome the protocol
    /// layer reached while processing this read.
    #[allow(clippy::too_many_arguments)]
    pub fn feed_inbound(
        &mut self,
        data: &[u8],
        now: i64,
        config: &RelayConfig,
        host: &dyn UpstreamHost,
        eval: &dyn crate::config::EvalHook,
        listener_start_time: i64,
        connected_clients: u32,
        total_clients: u32,
        last_client_disconnect: Option<i64>,
    ) -> Result<ProxyOutcome, ConnectionError> {
        if self.status.has_ended() {
            return Ok(ProxyOutcome::Continue);
        }

        self.bytes_in += data.len() as u64;
        self.last_activity = now;

        let payloads = if self.is_websocket {
            self.decode_websocket(data)?
        } else {
            vec![data.to_vec()]
        };

        let mut outcome = ProxyOutcome::Continue;
        for payload in payloads {
            let events = self.framer.feed(&payload)?;
            for event in events {
                outcome = self.dispatch_feed_event(
                    event,
                    now,
                    config,
                    host,
                    eval,
                    listener_start_time,
                    connected_clients,
                    total_clients,
                    last_client_disconnect,
                )?;
            }
        }

        Ok(outcome)
    }

    fn decode_websocket(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>, ConnectionError> {
        let decoder = self
            .ws_decoder
            .as_mut()
            .expect("is_websocket implies ws_decoder is set");
        let frames = decoder.feed(data)?;
        let mut payloads = Vec::new();
        for frame in frames {
            if let Some(payload) = self.handle_decoded_frame(frame)? {
                payloads.push(payload);
            }
        }
        Ok(payloads)
    }

    fn handle_decoded_frame(&mut self, frame: DecodedFrame) -> Result<Option<Vec<u8>>, ConnectionError> {
        match frame.opcode {
            Opcode::Text | Opcode::Binary => Ok(Some(frame.payload)),
            Opcode::Ping => {
                self.send(MessageKind::Pong, frame.payload);
                Ok(None)
            }
            Opcode::Pong => Ok(None),
            Opcode::Close => {
                self.send(MessageKind::Close, frame.payload);
                self.status = ConnectionStatus::Disconnected;
                Ok(None)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_feed_event(
        &mut self,
        event: FeedEvent,
        now: i64,
        config: &RelayConfig,
        host: &dyn UpstreamHost,
        eval: &dyn crate::config::EvalHook,
        listener_start_time: i64,
        connected_clients: u32,
        total_clients: u32,
        last_client_disconnect: Option<i64>,
    ) -> Result<ProxyOutcome, ConnectionError> {
        match event {
            FeedEvent::Line(line) => {
                let line = String::from_utf8_lossy(&line).into_owned();
                let ctx = ProxyContext {
                    host,
                    eval,
                    config,
                    relay_version: env!("CARGO_PKG_VERSION"),
                    listener_start_time,
                    connected_clients,
                    total_clients,
                    last_client_disconnect,
                    now,
                };
                if let Some(irc) = self.irc.as_mut() {
                    let (lines, outcome) = irc.handle_client_line(&line, &ctx);
                    for out_line in lines {
                        self.send_line(&out_line);
                    }
                    match outcome {
                        ProxyOutcome::Registered => self.status = ConnectionStatus::Connected,
                        ProxyOutcome::AuthFailed => self.status = ConnectionStatus::AuthFailed,
                        ProxyOutcome::Continue => {}
                    }
                    return Ok(outcome);
                }
                Ok(ProxyOutcome::Continue)
            }
            FeedEvent::Message(_) | FeedEvent::Http(_) => Ok(ProxyOutcome::Continue),
            FeedEvent::WebSocketUpgradeRequest(request) => {
                self.complete_websocket_handshake(&request, config)?;
                Ok(ProxyOutcome::Continue)
            }
        }
    }

    fn complete_websocket_handshake(
        &mut self,
        request: &crate::http::HttpRequest,
        config: &RelayConfig,
    ) -> Result<(), ConnectionError> {
        if !websocket::looks_like_upgrade(request) {
            return Err(FramingError::WebSocketProtocol("not an upgrade request".to_string()).into());
        }
        if !websocket::origin_allowed(request, config.websocket_allowed_origins.as_deref()) {
            let forbidden = websocket::forbidden_response();
            self.raw_write(forbidden.to_bytes());
            self.status = ConnectionStatus::Disconnected;
            return Ok(());
        }

        let deflate_params = request
            .header("sec-websocket-extensions")
            .and_then(websocket::negotiate_deflate);
        let response = websocket::build_upgrade_response(request, deflate_params)?;
        self.raw_write(response.to_bytes());

        self.ws_decoder = Some(FrameDecoder::new(deflate_params));
        self.ws_encoder = Some(FrameEncoder::new(deflate_params));
        self.is_websocket = true;
        self.framer.complete_websocket_upgrade();
        Ok(())
    }

    /// Queues a complete IRC line for the client (§4.7 `send`), tagging it
    /// `standard` for the raw-trace.
    pub fn send_line(&mut self, line: &str) {
        let mut bytes = line.as_bytes().to_vec();
        bytes.extend_from_slice(b"\r\n");
        let shadow = TraceShadow {
            msg_type: MessageKind::Standard,
            binary: false,
            prefix: String::new(),
            payload: line.as_bytes().to_vec(),
        };
        self.send_traced(MessageKind::Standard, bytes, Some(shadow));
    }

    fn send(&mut self, kind: MessageKind, payload: Vec<u8>) {
        self.send_traced(kind, payload, None);
    }

    fn send_traced(&mut self, kind: MessageKind, payload: Vec<u8>, shadow: Option<TraceShadow>) {
        let wire = if self.is_websocket {
            let opcode = match kind {
                MessageKind::Standard => match self.send_data_type {
                    DataType::Binary => Opcode::Binary,
                    _ => Opcode::Text,
                },
                MessageKind::Ping => Opcode::Ping,
                MessageKind::Pong => Opcode::Pong,
                MessageKind::Close => Opcode::Close,
            };
            self.ws_encoder
                .as_mut()
                .expect("is_websocket implies ws_encoder is set")
                .encode(opcode, &payload)
        } else {
            payload
        };

        let binary = self.is_websocket && self.send_data_type == DataType::Binary;
        let shadows = [
            shadow.map(|mut s| {
                s.binary = binary;
                s
            }),
            None,
        ];
        self.raw_write_traced(wire, shadows);
    }

    fn raw_write(&mut self, bytes: Vec<u8>) {
        self.raw_write_traced(bytes, [None, None]);
    }

    fn raw_write_traced(&mut self, bytes: Vec<u8>, shadows: [Option<TraceShadow>; 2]) {
        self.bytes_out += bytes.len() as u64;
        self.outbound.push(OutboundEntry::new(bytes, shadows));
    }

    /// Records that `n` bytes of the front outbound entry were actually
    /// transmitted by the `io` layer. Returns any raw-trace records that
    /// should now be logged exactly once (§4.7 point 4, §8 "trace").
    pub fn record_write(&mut self, n: usize, now_sec: i64, now_usec: i64) -> Vec<RawMessage> {
        let mut traced = Vec::new();
        if let Some(entry) = self.outbound.front_mut() {
            let shadows = entry.advance(n);
            for shadow in shadows.into_iter().flatten() {
                traced.push(RawMessage {
                    sec: now_sec,
                    usec: now_usec,
                    direction: Direction::Send,
                    kind: shadow.msg_type,
                    prefix: shadow.prefix,
                    payload: shadow.payload,
                });
            }
        }
        self.outbound.pop_front_if_drained();
        traced
    }

    /// Enters a terminal state (§4.2): drop the outbound queue. The caller
    /// is responsible for unregistering read interest, canceling timers,
    /// and closing the socket.
    pub fn disconnect(&mut self, reason: ConnectionError) -> ConnectionEvent {
        self.outbound.clear();
        self.status = ConnectionStatus::Disconnected;
        ConnectionEvent::Disconnected(reason)
    }

    /// Whether a permessage-deflate context is active on this connection's
    /// WebSocket framing (§3 "WebSocket deflate context", §6 persisted
    /// state layout).
    pub fn has_websocket_deflate(&self) -> bool {
        self.ws_decoder
            .as_ref()
            .map_or(false, FrameDecoder::has_deflate_context)
    }

    pub fn timer_for_status(&self) -> Option<Timer> {
        match self.status {
            ConnectionStatus::Connecting if self.tls && !self.handshake_ok => Some(Timer::TlsHandshake),
            ConnectionStatus::Authenticating => Some(Timer::Auth),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentityEval;
    use crate::host::fake::FakeHost;

    fn new_irc_connection() -> Connection {
        let log = Logger::root(slog::Discard, slog::o!());
        Connection::new(
            ConnectionParams {
                id: 1,
                descriptor: "127.0.0.1:1234".to_string(),
                peer_address: "127.0.0.1".parse().unwrap(),
                real_ip: None,
                protocol: Protocol::Irc,
                irc_server: Some("libera".to_string()),
                tls: false,
                is_http_upgrade_candidate: true,
                connect_time: 0,
                nonce_size: 16,
            },
            "weechat.relay.irc".to_string(),
            log,
        )
    }

    #[test]
    fn starts_connecting_and_moves_to_authenticating_on_plain_handshake() {
        let mut conn = new_irc_connection();
        assert_eq!(conn.status, ConnectionStatus::Connecting);
        conn.handshake_complete(true);
        assert_eq!(conn.status, ConnectionStatus::Authenticating);
    }

    #[test]
    fn bad_password_login_transitions_to_auth_failed() {
        let mut conn = new_irc_connection();
        conn.handshake_complete(true);
        let host = FakeHost::new();
        let eval = IdentityEval;
        let mut config = RelayConfig::default();
        config.password = "secret".to_string();

        for line in ["PASS wrong\r\n", "NICK alice\r\n", "USER alice 0 * :Alice\r\n"] {
            conn.feed_inbound(line.as_bytes(), 0, &config, &host, &eval, 0, 0, 0, None)
                .unwrap();
        }
        assert_eq!(conn.status, ConnectionStatus::AuthFailed);
        assert!(conn.status.has_ended());
    }

    #[test]
    fn outbound_queue_drains_on_partial_write() {
        let mut conn = new_irc_connection();
        conn.send_line("PING :x");
        assert!(!conn.outbound.is_empty());
        let front_len = conn.outbound.front_mut().unwrap().bytes().len();
        let traced = conn.record_write(front_len, 0, 0);
        assert_eq!(traced.len(), 1);
        assert!(conn.outbound.is_empty());
    }
}
