//! Crash-safe state dump: serialize every live listener and connection so
//! the host can restart in place and resume the relay without dropping
//! clients (§3 "Crash-safe state dump", §6 "Persisted state layout").
//!
//! This mirrors `relay-upgrade.c`'s save/restore pass over `relay_servers`
//! and `relay_client`/`relay_raw_message` lists, tagging each serialized
//! record with its kind (`RELAY_UPGRADE_TYPE_SERVER` /
//! `_CLIENT` / `_RAW_MESSAGE`) the same way. Where the original writes an
//! `infolist` through WeeChat's upgrade-file format, this writes a
//! `Vec<PersistedRecord>` through `bincode`; the wire format is private to
//! this crate's own save/restore round trip, not a stable external format.

use serde_derive::{Deserialize, Serialize};

use crate::connection::{Connection, ConnectionStatus, PasswordHashAlgo};
use crate::core::RelayCore;
use crate::irc::proxy::Capability;
use crate::listener::{BindTarget, EndpointSpec, Listener, Protocol, TransportFlags};
use crate::raw_trace::{Direction, MessageKind, RawMessage};

#[derive(Debug, Serialize, Deserialize)]
pub enum PersistedRecord {
    Server(ServerRecord),
    Client(ClientRecord),
    RawMessage(RawMessageRecord),
}

/// One listener (§3 "Listener"): just enough to recreate the bind target
/// and carry forward the backlog "since last client disconnect" cutoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecord {
    pub protocol: ProtocolRecord,
    pub args: Option<String>,
    pub ipv4: bool,
    pub ipv6: bool,
    pub tls: bool,
    pub unix: bool,
    pub target: BindTargetRecord,
    pub start_time: i64,
    pub last_client_disconnect: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ProtocolRecord {
    Irc,
    Weechat,
    Api,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindTargetRecord {
    Port(u16),
    UnixPath(String),
}

/// One client (§3 "Connection"). `status` is forced to `Disconnected` when
/// the host requests a controlled-shutdown dump, matching the original's
/// `force_disconnected_state` parameter to `relay_client_add_to_infolist`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecord {
    pub id: usize,
    pub descriptor: String,
    pub peer_address: String,
    pub real_ip: Option<String>,
    pub protocol: ProtocolRecord,
    pub protocol_args: Option<String>,
    pub nick: Option<String>,
    pub status: ClientStatusRecord,
    pub connect_time: i64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub nonce: Vec<u8>,
    pub password_hash_algo: Option<PasswordHashAlgoRecord>,
    pub irc: Option<IrcSubstateRecord>,
    /// Whether a permessage-deflate context was active; the zlib window
    /// contents themselves are not captured (see DESIGN.md "Open Question
    /// decisions" — a restored client renegotiates deflate on next upgrade
    /// rather than resuming mid-stream compression state).
    pub had_websocket_deflate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientStatusRecord {
    Connecting,
    Authenticating,
    Connected,
    AuthFailed,
    Disconnected,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum PasswordHashAlgoRecord {
    Plain,
    Sha256,
    Sha512,
    Pbkdf2Sha256,
    Pbkdf2Sha512,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrcSubstateRecord {
    pub server: String,
    pub nick: Option<String>,
    pub user_received: bool,
    pub cap_ls_received: bool,
    pub cap_end_received: bool,
    pub connected: bool,
    pub echo_message_upstream: bool,
    pub caps: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessageRecord {
    pub sec: i64,
    pub usec: i64,
    pub send: bool,
    pub kind: RawKindRecord,
    pub prefix: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum RawKindRecord {
    Standard,
    Ping,
    Pong,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    Encode,
    Decode,
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            StateError::Encode => write!(f, "failed to encode relay state"),
            StateError::Decode => write!(f, "failed to decode relay state"),
        }
    }
}

impl std::error::Error for StateError {}

fn protocol_to_record(p: Protocol) -> ProtocolRecord {
    match p {
        Protocol::Irc => ProtocolRecord::Irc,
        Protocol::Weechat => ProtocolRecord::Weechat,
        Protocol::Api => ProtocolRecord::Api,
    }
}

fn protocol_from_record(p: ProtocolRecord) -> Protocol {
    match p {
        ProtocolRecord::Irc => Protocol::Irc,
        ProtocolRecord::Weechat => Protocol::Weechat,
        ProtocolRecord::Api => Protocol::Api,
    }
}

fn status_to_record(s: ConnectionStatus, force_disconnected: bool) -> ClientStatusRecord {
    if force_disconnected {
        return ClientStatusRecord::Disconnected;
    }
    match s {
        ConnectionStatus::Connecting => ClientStatusRecord::Connecting,
        ConnectionStatus::Authenticating => ClientStatusRecord::Authenticating,
        ConnectionStatus::Connected => ClientStatusRecord::Connected,
        ConnectionStatus::AuthFailed => ClientStatusRecord::AuthFailed,
        ConnectionStatus::Disconnected => ClientStatusRecord::Disconnected,
    }
}

fn hash_algo_to_record(a: PasswordHashAlgo) -> PasswordHashAlgoRecord {
    match a {
        PasswordHashAlgo::Plain => PasswordHashAlgoRecord::Plain,
        PasswordHashAlgo::Sha256 => PasswordHashAlgoRecord::Sha256,
        PasswordHashAlgo::Sha512 => PasswordHashAlgoRecord::Sha512,
        PasswordHashAlgo::Pbkdf2Sha256 => PasswordHashAlgoRecord::Pbkdf2Sha256,
        PasswordHashAlgo::Pbkdf2Sha512 => PasswordHashAlgoRecord::Pbkdf2Sha512,
    }
}

fn raw_message_to_record(m: &RawMessage) -> RawMessageRecord {
    RawMessageRecord {
        sec: m.sec,
        usec: m.usec,
        send: m.direction == Direction::Send,
        kind: match m.kind {
            MessageKind::Standard => RawKindRecord::Standard,
            MessageKind::Ping => RawKindRecord::Ping,
            MessageKind::Pong => RawKindRecord::Pong,
            MessageKind::Close => RawKindRecord::Close,
        },
        prefix: m.prefix.clone(),
        payload: m.payload.clone(),
    }
}

fn listener_to_record(listener: &Listener) -> ServerRecord {
    ServerRecord {
        protocol: protocol_to_record(listener.spec.protocol),
        args: listener.spec.args.clone(),
        ipv4: listener.spec.flags.ipv4,
        ipv6: listener.spec.flags.ipv6,
        tls: listener.spec.flags.tls,
        unix: listener.spec.flags.unix,
        target: match &listener.spec.target {
            BindTarget::Port(p) => BindTargetRecord::Port(*p),
            BindTarget::UnixPath(p) => BindTargetRecord::UnixPath(p.clone()),
        },
        start_time: listener.start_time,
        last_client_disconnect: listener.last_client_disconnect,
    }
}

fn connection_to_record(conn: &Connection, force_disconnected: bool) -> ClientRecord {
    let irc = conn.irc.as_ref().map(|irc| IrcSubstateRecord {
        server: irc.server.clone(),
        nick: irc.nick.clone(),
        user_received: irc.user_received,
        cap_ls_received: irc.cap_ls_received,
        cap_end_received: irc.cap_end_received,
        connected: irc.connected,
        echo_message_upstream: irc.echo_message_upstream,
        caps: irc
            .caps
            .iter()
            .map(|c| match c {
                Capability::EchoMessage => "echo-message".to_string(),
                Capability::ServerTime => "server-time".to_string(),
            })
            .collect(),
    });

    ClientRecord {
        id: conn.id,
        descriptor: conn.descriptor.clone(),
        peer_address: conn.peer_address.to_string(),
        real_ip: conn.real_ip.map(|ip| ip.to_string()),
        protocol: protocol_to_record(conn.protocol),
        protocol_args: irc.as_ref().map(|i| i.server.clone()),
        nick: irc.as_ref().and_then(|i| i.nick.clone()),
        status: status_to_record(conn.status, force_disconnected),
        connect_time: conn.connect_time,
        bytes_in: conn.bytes_in,
        bytes_out: conn.bytes_out,
        nonce: conn.nonce.clone(),
        password_hash_algo: conn.password_hash_algo.map(hash_algo_to_record),
        irc,
        had_websocket_deflate: conn.has_websocket_deflate(),
    }
}

/// Rebuilds the `EndpointSpec` a restarted host re-binds from one
/// `ServerRecord` (§4.1 `create()`, mirroring the original's restore pass
/// that re-opens each listening socket before replaying client records).
/// The caller still does the actual `bind`; this just undoes
/// `listener_to_record`.
pub fn restore_listener_spec(record: &ServerRecord) -> EndpointSpec {
    EndpointSpec {
        flags: TransportFlags {
            ipv4: record.ipv4,
            ipv6: record.ipv6,
            tls: record.tls,
            unix: record.unix,
        },
        protocol: protocol_from_record(record.protocol),
        args: record.args.clone(),
        target: match &record.target {
            BindTargetRecord::Port(p) => BindTarget::Port(*p),
            BindTargetRecord::UnixPath(p) => BindTarget::UnixPath(p.clone()),
        },
    }
}

/// Builds the full record list for one dump (§6 "Persisted state layout").
/// Servers first, then clients, then raw-trace messages, matching the
/// original's save order.
pub fn snapshot(core: &RelayCore, force_disconnected: bool) -> Vec<PersistedRecord> {
    let mut records = Vec::new();
    for (_, listener) in core.listeners.iter() {
        records.push(PersistedRecord::Server(listener_to_record(listener)));
    }
    for (_, conn) in core.connections.iter() {
        records.push(PersistedRecord::Client(connection_to_record(
            conn,
            force_disconnected,
        )));
    }
    for msg in core.raw_trace().iter() {
        records.push(PersistedRecord::RawMessage(raw_message_to_record(msg)));
    }
    records
}

/// Serializes a snapshot to bytes with `bincode`, a compact binary codec
/// favored here over a textual one for anything that isn't user-facing
/// configuration.
pub fn encode(records: &[PersistedRecord]) -> Result<Vec<u8>, StateError> {
    bincode::serialize(records).map_err(|_| StateError::Encode)
}

pub fn decode(bytes: &[u8]) -> Result<Vec<PersistedRecord>, StateError> {
    bincode::deserialize(bytes).map_err(|_| StateError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_server_record() {
        let records = vec![PersistedRecord::Server(ServerRecord {
            protocol: ProtocolRecord::Irc,
            args: Some("libera".to_string()),
            ipv4: true,
            ipv6: false,
            tls: false,
            unix: false,
            target: BindTargetRecord::Port(7000),
            start_time: 100,
            last_client_disconnect: Some(150),
        })];
        let bytes = encode(&records).unwrap();
        let restored = decode(&bytes).unwrap();
        match &restored[0] {
            PersistedRecord::Server(s) => {
                assert_eq!(s.args.as_deref(), Some("libera"));
                assert_eq!(s.target, BindTargetRecord::Port(7000));
            }
            _ => panic!("expected server record"),
        }
    }

    #[test]
    fn restore_listener_spec_undoes_listener_to_record() {
        let record = ServerRecord {
            protocol: ProtocolRecord::Irc,
            args: Some("libera".to_string()),
            ipv4: true,
            ipv6: false,
            tls: true,
            unix: false,
            target: BindTargetRecord::Port(7001),
            start_time: 0,
            last_client_disconnect: None,
        };
        let spec = restore_listener_spec(&record);
        assert_eq!(spec.protocol, Protocol::Irc);
        assert_eq!(spec.args.as_deref(), Some("libera"));
        assert!(spec.flags.tls);
        assert_eq!(spec.target, BindTarget::Port(7001));
    }

    #[test]
    fn client_status_is_forced_disconnected_when_requested() {
        assert_eq!(
            status_to_record(ConnectionStatus::Connected, true),
            ClientStatusRecord::Disconnected
        );
        assert_eq!(
            status_to_record(ConnectionStatus::Connected, false),
            ClientStatusRecord::Connected
        );
    }

    #[test]
    fn round_trips_a_raw_message_record() {
        let records = vec![PersistedRecord::RawMessage(RawMessageRecord {
            sec: 1,
            usec: 2,
            send: true,
            kind: RawKindRecord::Standard,
            prefix: String::new(),
            payload: b"hello".to_vec(),
        })];
        let bytes = encode(&records).unwrap();
        let restored = decode(&bytes).unwrap();
        match &restored[0] {
            PersistedRecord::RawMessage(m) => assert_eq!(m.payload, b"hello"),
            _ => panic!("expected raw message record"),
        }
    }
}
