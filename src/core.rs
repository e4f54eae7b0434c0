//! `RelayCore`: the sans-I/O heart of the relay (§5).
//!
//! Holds every listener and connection, accepts readable/timeout/write
//! notifications from the `io` reactor, and drains `Io` requests for it to
//! carry out. No socket call happens anywhere in this module: sockets are
//! entirely the `io` reactor's concern.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;

use fnv::{FnvHashMap, FnvHashSet};
use slab::Slab;
use slog::Logger;

use crate::config::{EvalHook, RelayConfig};
use crate::connection::{Connection, ConnectionHandle, ConnectionParams, ConnectionStatus};
use crate::error::{AdmissionError, AuthError, ConnectionError};
use crate::host::UpstreamHost;
use crate::listener::{self, EndpointSpec, Listener, Protocol};
use crate::raw_trace::{RawMessage, RawTrace};
use crate::timer::Timer;

/// Application-facing events: connection status transitions, disconnects,
/// and raw-trace records (§4.2, §3).
#[derive(Debug)]
pub enum Event {
    StatusChanged(ConnectionStatus),
    Disconnected(ConnectionError),
    /// A raw-trace record is ready for a debug view (§3, §8 "trace").
    Traced(RawMessage),
}

/// I/O operations the `io` reactor must carry out.
#[derive(Debug)]
pub enum Io {
    Write {
        connection: ConnectionHandle,
    },
    CloseSocket {
        connection: ConnectionHandle,
    },
    TimerStart {
        connection: ConnectionHandle,
        timer: Timer,
        /// Absolute wall-clock seconds.
        time: i64,
    },
    TimerStop {
        connection: ConnectionHandle,
        timer: Timer,
    },
}

/// Bundles everything handler methods need: config plus the queues that
/// accumulate I/O requests and events for the caller to drain (§9 "Shared
/// mutable globals ... represent them as one context object").
pub struct Context {
    pub config: Arc<RelayConfig>,
    pub io: VecDeque<Io>,
    pub events: VecDeque<(ConnectionHandle, Event)>,
    pub dirty_conns: FnvHashSet<ConnectionHandle>,
    pub readable_conns: FnvHashSet<ConnectionHandle>,
}

pub struct RelayCore {
    log: Logger,
    pub(crate) ctx: Context,
    pub(crate) connections: Slab<Connection>,
    pub(crate) listeners: Slab<Listener>,
    listener_ports: FnvHashMap<u16, usize>,
    listener_paths: FnvHashMap<String, usize>,
    next_connection_id: usize,
    relay_host: String,
    total_clients_ever: u64,
    raw_trace: RawTrace,
}

impl RelayCore {
    pub fn new(log: Logger, config: RelayConfig) -> Self {
        let relay_host = config.relay_host.clone();
        let raw_trace = RawTrace::new(config.raw_trace_capacity);
        RelayCore {
            ctx: Context {
                config: Arc::new(config),
                io: VecDeque::new(),
                events: VecDeque::new(),
                dirty_conns: FnvHashSet::default(),
                readable_conns: FnvHashSet::default(),
            },
            log,
            connections: Slab::new(),
            listeners: Slab::new(),
            listener_ports: FnvHashMap::default(),
            listener_paths: FnvHashMap::default(),
            next_connection_id: 1,
            relay_host,
            total_clients_ever: 0,
            raw_trace,
        }
    }

    /// Records a just-transmitted raw-trace message in the bounded ring
    /// (§3 "Raw message tracer") and surfaces it as an `Event::Traced` for
    /// whatever debug view the embedder wires up.
    pub fn record_trace(&mut self, handle: ConnectionHandle, msg: RawMessage) {
        self.raw_trace.push(msg.clone());
        self.ctx.events.push_back((handle, Event::Traced(msg)));
    }

    pub fn raw_trace(&self) -> &RawTrace {
        &self.raw_trace
    }

    /// `Listener::create` (§4.1): parses the spec, checks for a duplicate
    /// bind target, and registers the listener. Actual binding is the
    /// `io` reactor's job; this just reserves the slot and returns the
    /// parsed spec for it to act on.
    pub fn create_listener(
        &mut self,
        spec_str: &str,
        value: &str,
        now: i64,
    ) -> Result<(usize, EndpointSpec), crate::error::ListenError> {
        let spec = listener::parse_endpoint_spec(spec_str, value, self.ctx.config.ipv6)?;

        match &spec.target {
            listener::BindTarget::Port(port) => {
                if self.listener_ports.contains_key(port) {
                    return Err(crate::error::ListenError::DuplicatePort(*port));
                }
            }
            listener::BindTarget::UnixPath(path) => {
                if self.listener_paths.contains_key(path) {
                    return Err(crate::error::ListenError::DuplicatePath(path.clone()));
                }
            }
        }

        let created_unix_socket = matches!(spec.target, listener::BindTarget::UnixPath(_));
        let listener = Listener::new(spec.clone(), now, created_unix_socket);
        let idx = self.listeners.insert(listener);

        match &spec.target {
            listener::BindTarget::Port(port) => {
                self.listener_ports.insert(*port, idx);
            }
            listener::BindTarget::UnixPath(path) => {
                self.listener_paths.insert(path.clone(), idx);
            }
        }

        Ok((idx, spec))
    }

    pub fn close_listener(&mut self, idx: usize) {
        if let Some(listener) = self.listeners.try_remove(idx) {
            match listener.spec.target {
                listener::BindTarget::Port(port) => {
                    self.listener_ports.remove(&port);
                }
                listener::BindTarget::UnixPath(path) => {
                    self.listener_paths.remove(&path);
                }
            }
        }
    }

    /// Runs the §4.1 admission policy and, if it passes, allocates a new
    /// `Connection` bound to `listener_idx`. The caller (the `io` reactor)
    /// already `accept()`ed the socket; on `Err` it should simply drop the
    /// freshly accepted fd.
    pub fn admit_connection(
        &mut self,
        listener_idx: usize,
        peer_ip: IpAddr,
        now: i64,
    ) -> Result<ConnectionHandle, AdmissionError> {
        let listener = &self.listeners[listener_idx];
        let max_clients = self.ctx.config.max_clients;

        listener::admit(
            &self.ctx.config,
            listener.spec.protocol,
            listener.client_count,
            max_clients,
            &peer_ip,
        )?;

        let id = self.next_connection_id;
        self.next_connection_id += 1;
        self.total_clients_ever += 1;

        let descriptor = format!("{}/{}", listener::peer_address_string(&peer_ip), id);
        let params = ConnectionParams {
            id,
            descriptor,
            peer_address: peer_ip,
            real_ip: None,
            protocol: listener.spec.protocol,
            irc_server: listener.spec.args.clone(),
            tls: listener.spec.flags.tls,
            is_http_upgrade_candidate: listener.spec.protocol != Protocol::Api,
            connect_time: now,
            nonce_size: self.ctx.config.nonce_size,
        };

        let log = self.log.new(slog::o!("client" => id));
        let conn = Connection::new(params, self.relay_host.clone(), log);
        let key = self.connections.insert(conn);
        self.listeners[listener_idx].client_count += 1;

        if !listener.spec.flags.tls {
            let requires_password = !self.ctx.config.password.is_empty();
            self.connections[key].handshake_complete(requires_password);
        }

        self.arm_status_timer(ConnectionHandle(key), now);

        Ok(ConnectionHandle(key))
    }

    /// Called by the reactor once a `tls.` connection's `rustls` session
    /// stops handshaking, to do the same status transition `admit_connection`
    /// does immediately for plaintext connections (§4.2).
    pub fn complete_tls_handshake(&mut self, handle: ConnectionHandle, now: i64) {
        let requires_password = !self.ctx.config.password.is_empty();
        match self.connections.get_mut(handle.0) {
            Some(conn) if !conn.handshake_ok => conn.handshake_complete(requires_password),
            _ => return,
        }
        self.arm_status_timer(handle, now);
    }

    /// Requests/cancels the `TlsHandshake`/`Auth` timer to match the
    /// connection's current status (§4.2, §4.4 timeouts). Both timer kinds
    /// are stopped unconditionally first since a connection never needs
    /// more than one of them armed at once.
    fn arm_status_timer(&mut self, handle: ConnectionHandle, now: i64) {
        self.ctx.io.push_back(Io::TimerStop {
            connection: handle,
            timer: Timer::TlsHandshake,
        });
        self.ctx.io.push_back(Io::TimerStop {
            connection: handle,
            timer: Timer::Auth,
        });
        if let Some(timer) = self.connections[handle.0].timer_for_status() {
            let deadline = match timer {
                Timer::TlsHandshake => now + self.ctx.config.tls_handshake_timeout_tenths as i64 / 10,
                Timer::Auth => now + self.ctx.config.auth_timeout_secs as i64,
                _ => now,
            };
            self.ctx.io.push_back(Io::TimerStart {
                connection: handle,
                timer,
                time: deadline,
            });
        }
    }

    /// Feeds freshly read bytes for one connection through to the IRC
    /// proxy and queues resulting writes; marks the connection dirty so
    /// `poll_io` drains its outbound queue.
    pub fn handle_readable(
        &mut self,
        handle: ConnectionHandle,
        data: &[u8],
        now: i64,
        host: &dyn UpstreamHost,
        eval: &dyn EvalHook,
    ) {
        let listener_start_time = self
            .listeners
            .iter()
            .next()
            .map(|(_, l)| l.start_time)
            .unwrap_or(now);
        let connected = self.connected_client_count();
        let total = self.total_clients_ever as u32;
        let last_disconnect = self.last_client_disconnect();

        let config = Arc::clone(&self.ctx.config);
        let result = self.connections[handle.0].feed_inbound(
            data,
            now,
            &config,
            host,
            eval,
            listener_start_time,
            connected,
            total,
            last_disconnect,
        );

        if let Err(e) = result {
            self.fail_connection(handle, e);
            return;
        }

        self.arm_status_timer(handle, now);

        if !self.connections[handle.0].outbound.is_empty() {
            self.ctx.dirty_conns.insert(handle);
        }
        self.ctx.readable_conns.insert(handle);
    }

    pub fn fail_connection(&mut self, handle: ConnectionHandle, reason: ConnectionError) {
        if let Some(conn) = self.connections.get_mut(handle.0) {
            conn.disconnect(reason);
            self.ctx.readable_conns.insert(handle);
        }
    }

    fn connected_client_count(&self) -> u32 {
        self.connections
            .iter()
            .filter(|(_, c)| c.status == ConnectionStatus::Connected)
            .count() as u32
    }

    fn last_client_disconnect(&self) -> Option<i64> {
        self.listeners
            .iter()
            .filter_map(|(_, l)| l.last_client_disconnect)
            .max()
    }

    /// Drains application events (mirrors `Endpoint::poll`).
    pub fn poll(&mut self) -> Option<(ConnectionHandle, Event)> {
        if let Some(x) = self.ctx.events.pop_front() {
            return Some(x);
        }
        loop {
            let &handle = self.ctx.readable_conns.iter().next()?;
            let conn = self.connections.get(handle.0)?;
            if conn.status.has_ended() {
                self.ctx.readable_conns.remove(&handle);
                let reason = if conn.status == ConnectionStatus::AuthFailed {
                    ConnectionError::Auth(AuthError::PasswordMismatch)
                } else {
                    ConnectionError::Shutdown
                };
                return Some((handle, Event::Disconnected(reason)));
            }
            self.ctx.readable_conns.remove(&handle);
        }
    }

    /// Drains pending I/O (mirrors `Endpoint::poll_io`).
    pub fn poll_io(&mut self) -> Option<Io> {
        loop {
            if let Some(x) = self.ctx.io.pop_front() {
                return Some(x);
            }
            let &handle = self.ctx.dirty_conns.iter().next()?;
            self.ctx.dirty_conns.remove(&handle);
            if self
                .connections
                .get(handle.0)
                .map_or(false, |c| !c.outbound.is_empty())
            {
                return Some(Io::Write { connection: handle });
            }
        }
    }

    /// One-second housekeeping tick (§5): purges terminal-state
    /// connections past their configured delay.
    pub fn housekeeping_tick(&mut self, now: i64) {
        if self.ctx.config.clients_purge_delay_mins < 0 {
            return;
        }
        let delay_secs = self.ctx.config.clients_purge_delay_mins as i64 * 60;
        let to_purge: Vec<usize> = self
            .connections
            .iter()
            .filter(|(_, c)| {
                c.status.has_ended() && now - c.last_activity >= delay_secs
            })
            .map(|(k, _)| k)
            .collect();
        for key in to_purge {
            self.connections.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentityEval;
    use crate::host::fake::FakeHost;

    fn new_core(config: RelayConfig) -> RelayCore {
        let log = slog::Logger::root(slog::Discard, slog::o!());
        RelayCore::new(log, config)
    }

    /// Reproduces the orchestration-layer leak: `poll()` must surface a
    /// terminal status reached mid-registration (not just a socket-level
    /// `Disconnected`), since that is the only signal the `io` reactor uses
    /// to deregister and close the underlying fd (§4.2/§5).
    #[test]
    fn auth_failed_connection_is_drained_as_a_disconnected_event() {
        let mut config = RelayConfig::default();
        config.password = "secret".to_string();
        let mut core = new_core(config);

        let (idx, _spec) = core.create_listener("irc", "6667", 0).unwrap();
        let handle = core
            .admit_connection(idx, "127.0.0.1".parse().unwrap(), 0)
            .unwrap();
        core.connections[handle.0].handshake_complete(true);
        assert_eq!(core.connections[handle.0].status, ConnectionStatus::Authenticating);

        let host = FakeHost::new();
        let eval = IdentityEval;
        core.handle_readable(handle, b"PASS wrong\r\n", 1, &host, &eval);
        core.handle_readable(handle, b"NICK alice\r\n", 1, &host, &eval);
        core.handle_readable(handle, b"USER alice 0 * :Alice\r\n", 1, &host, &eval);
        assert_eq!(core.connections[handle.0].status, ConnectionStatus::AuthFailed);

        let mut events = Vec::new();
        while let Some((h, event)) = core.poll() {
            events.push((h, event));
        }
        assert!(
            events.iter().any(|(h, e)| *h == handle
                && matches!(e, Event::Disconnected(ConnectionError::Auth(AuthError::PasswordMismatch)))),
            "AuthFailed connection must surface Event::Disconnected so the reactor closes its socket, got {:?}",
            events
        );
    }
}
