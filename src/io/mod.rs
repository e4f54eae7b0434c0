//! The real reactor: owns every socket and timer, and does nothing else.
//!
//! `RelayCore` never touches a file descriptor; this module is the thin
//! layer that turns `mio` readiness events into `RelayCore::handle_readable`
//! calls and turns `RelayCore::poll_io` requests into actual `write(2)`s,
//! timer registrations, and socket closes. Splitting it out this way keeps
//! the protocol state machine independent of any particular socket type or
//! event loop.

mod listener_socket;
mod tls;

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fnv::FnvHashMap;
use mio::{Events, Poll, PollOpt, Ready, Token};
use mio_extras::timer::{Timeout, Timer as MioTimer};
use slog::{debug, o, warn, Logger};

use crate::config::{EvalHook, RelayConfig};
use crate::connection::ConnectionHandle;
use crate::core::{Event, Io, RelayCore};
use crate::host::UpstreamHost;
use crate::listener::{BindTarget, ListenerHandle, Protocol};
use crate::timer::Timer as RelayTimer;

use listener_socket::ListenerSocket;
use tls::TlsSession;

const LISTENER_TOKEN_BASE: usize = 0;
const CONNECTION_TOKEN_BASE: usize = 1 << 20;

fn listener_token(idx: usize) -> Token {
    Token(LISTENER_TOKEN_BASE + idx)
}

fn connection_token(key: usize) -> Token {
    Token(CONNECTION_TOKEN_BASE + key)
}

fn token_to_connection_key(token: Token) -> Option<usize> {
    if token.0 >= CONNECTION_TOKEN_BASE {
        Some(token.0 - CONNECTION_TOKEN_BASE)
    } else {
        None
    }
}

fn unix_epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Per-connection socket state the reactor needs that `Connection` itself
/// has no business knowing about: the raw stream, and (for `tls.` listeners)
/// the in-progress or completed TLS session wrapping it.
enum Transport {
    Plain(mio::net::TcpStream),
    PlainUnix(mio_uds::UnixStream),
    Tls(TlsSession<mio::net::TcpStream>),
}

impl Transport {
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf),
            Transport::PlainUnix(s) => s.read(buf),
            Transport::Tls(s) => s.read(buf),
        }
    }

    fn write_nonblocking(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf),
            Transport::PlainUnix(s) => s.write(buf),
            Transport::Tls(s) => s.write(buf),
        }
    }
}

struct Socket {
    transport: Transport,
    listener: ListenerHandle,
}

/// Drives one `RelayCore` against real sockets. Construct with
/// `Reactor::new`, call `bind` once per configured endpoint, then `run` (or
/// drive `poll_once` from an embedding event loop, e.g. WeeChat's own hook
/// system rather than owning the process).
pub struct Reactor {
    log: Logger,
    poll: Poll,
    core: RelayCore,
    sockets: FnvHashMap<usize, Socket>,
    listener_sockets: HashMap<usize, ListenerSocket>,
    timer: MioTimer<(ConnectionHandle, RelayTimer)>,
    pending_timeouts: FnvHashMap<(usize, RelayTimer), Timeout>,
    housekeeping_timeout: Option<Timeout>,
}

const TIMER_TOKEN: Token = Token(usize::max_value() - 1);

impl Reactor {
    pub fn new(log: Logger, config: RelayConfig) -> std::io::Result<Self> {
        let poll = Poll::new()?;
        let timer = MioTimer::default();
        poll.register(&timer, TIMER_TOKEN, Ready::readable(), PollOpt::edge())?;

        Ok(Reactor {
            core: RelayCore::new(log.new(o!("component" => "core")), config),
            log,
            poll,
            sockets: FnvHashMap::default(),
            listener_sockets: HashMap::new(),
            timer,
            pending_timeouts: FnvHashMap::default(),
            housekeeping_timeout: None,
        })
    }

    /// Parses and binds one `relay.network.port.*`/`relay.network.path.*`
    /// style endpoint (§6 endpoint spec syntax, §4.1).
    pub fn bind(&mut self, spec_str: &str, value: &str) -> Result<(), crate::error::ListenError> {
        let now = unix_epoch_secs();
        let (idx, spec) = self.core.create_listener(spec_str, value, now)?;

        let socket = match &spec.target {
            BindTarget::Port(port) if spec.flags.tls => {
                let cert_key_path = self.core.ctx.config.tls_cert_key.clone().ok_or_else(|| {
                    crate::error::ListenError::Bind(std::io::Error::new(
                        ErrorKind::InvalidInput,
                        "tls. listener requires network.tls_cert_key to be set",
                    ))
                })?;
                let server_config = tls::load_server_config(&cert_key_path)
                    .map_err(crate::error::ListenError::Bind)?;
                ListenerSocket::bind_tcp_tls(*port, spec.flags.ipv4, spec.flags.ipv6, Arc::new(server_config))
                    .map_err(crate::error::ListenError::Bind)?
            }
            BindTarget::Port(port) => {
                ListenerSocket::bind_tcp(*port, spec.flags.ipv4, spec.flags.ipv6)
                    .map_err(crate::error::ListenError::Bind)?
            }
            BindTarget::UnixPath(path) => ListenerSocket::bind_unix(path)
                .map_err(crate::error::ListenError::Bind)?,
        };

        self.poll
            .register(socket.evented(), listener_token(idx), Ready::readable(), PollOpt::edge())
            .map_err(crate::error::ListenError::Bind)?;
        self.listener_sockets.insert(idx, socket);

        if self.housekeeping_timeout.is_none() {
            self.housekeeping_timeout = Some(self.timer.set_timeout(
                Duration::from_secs(1),
                // Housekeeping is keyed off connection 0 / a dedicated
                // timer kind; the reactor special-cases it below rather
                // than routing it through `RelayCore`.
                (ConnectionHandle(usize::max_value()), RelayTimer::Housekeeping),
            ));
        }

        Ok(())
    }

    /// Runs forever, servicing readiness and timer events. Most embedders
    /// instead call `poll_once` repeatedly from their own loop; this exists
    /// for a standalone binary.
    pub fn run(&mut self, host: &dyn UpstreamHost, eval: &dyn EvalHook) -> std::io::Result<()> {
        loop {
            self.poll_once(host, eval, None)?;
        }
    }

    /// Services one batch of readiness events (blocking up to `timeout`,
    /// or indefinitely if `None`), then drains every `RelayCore::poll_io`
    /// request and every `RelayCore::poll` event that resulted.
    pub fn poll_once(
        &mut self,
        host: &dyn UpstreamHost,
        eval: &dyn EvalHook,
        timeout: Option<Duration>,
    ) -> std::io::Result<()> {
        let mut events = Events::with_capacity(1024);
        self.poll.poll(&mut events, timeout)?;

        for event in events.iter() {
            if event.token() == TIMER_TOKEN {
                self.drain_timer_queue();
                continue;
            }
            if let Some(idx) = self.listener_token_index(event.token()) {
                self.accept_loop(idx, host, eval);
                continue;
            }
            if let Some(key) = token_to_connection_key(event.token()) {
                if event.readiness().is_readable() {
                    self.read_connection(key, host, eval);
                }
                if event.readiness().is_writable() {
                    self.flush_connection(key);
                }
            }
        }

        self.drain_core_io();
        self.drain_core_events();
        Ok(())
    }

    fn listener_token_index(&self, token: Token) -> Option<usize> {
        if token.0 >= LISTENER_TOKEN_BASE && token.0 < CONNECTION_TOKEN_BASE {
            let idx = token.0 - LISTENER_TOKEN_BASE;
            if self.listener_sockets.contains_key(&idx) {
                return Some(idx);
            }
        }
        None
    }

    fn accept_loop(&mut self, listener_idx: usize, host: &dyn UpstreamHost, eval: &dyn EvalHook) {
        loop {
            let accepted = match self.listener_sockets.get_mut(&listener_idx) {
                Some(socket) => socket.accept(),
                None => return,
            };
            let (transport, peer) = match accepted {
                Ok(Some(pair)) => pair,
                Ok(None) => return,
                Err(e) => {
                    warn!(self.log, "accept failed"; "error" => %e);
                    return;
                }
            };

            let now = unix_epoch_secs();
            let handle = match self.core.admit_connection(listener_idx, peer, now) {
                Ok(handle) => handle,
                Err(reason) => {
                    debug!(self.log, "rejecting connection"; "reason" => %reason);
                    continue;
                }
            };

            if let Err(e) = self.poll.register(
                transport_evented(&transport),
                connection_token(handle.0),
                Ready::readable(),
                PollOpt::edge(),
            ) {
                warn!(self.log, "failed to register accepted socket"; "error" => %e);
                continue;
            }

            self.sockets.insert(
                handle.0,
                Socket {
                    transport,
                    listener: ListenerHandle(listener_idx),
                },
            );

            // A freshly accepted plaintext connection may already have
            // bytes buffered by the kernel (pipelined clients); give it one
            // immediate read so `poll_once` doesn't need a second wakeup.
            self.read_connection(handle.0, host, eval);
        }
    }

    fn read_connection(&mut self, key: usize, host: &dyn UpstreamHost, eval: &dyn EvalHook) {
        let mut buf = [0u8; 8192];
        loop {
            let read = match self.sockets.get_mut(&key) {
                Some(socket) => socket.transport.read_nonblocking(&mut buf),
                None => return,
            };
            // `rustls` may finish the handshake while consuming a record
            // that carries no decrypted application data yet, so check on
            // every pass through this loop, not just when `Ok(n)` lands.
            self.maybe_complete_tls_handshake(key);
            match read {
                Ok(0) => {
                    self.fail_connection(key, crate::error::ConnectionError::PeerClosed);
                    return;
                }
                Ok(n) => {
                    let now = unix_epoch_secs();
                    self.core
                        .handle_readable(ConnectionHandle(key), &buf[..n], now, host, eval);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    self.fail_connection(key, crate::error::ConnectionError::Io(e));
                    return;
                }
            }
        }
    }

    fn maybe_complete_tls_handshake(&mut self, key: usize) {
        let finished = match self.sockets.get(&key) {
            Some(Socket { transport: Transport::Tls(session), .. }) => !session.is_handshaking(),
            _ => return,
        };
        if finished {
            let now = unix_epoch_secs();
            self.core.complete_tls_handshake(ConnectionHandle(key), now);
        }
    }

    fn flush_connection(&mut self, key: usize) {
        loop {
            let (front_len, bytes) = {
                let conn = match self.core.connections.get_mut(key) {
                    Some(c) => c,
                    None => return,
                };
                let entry = match conn.outbound.front_mut() {
                    Some(e) => e,
                    None => {
                        let _ = self.poll.reregister(
                            self.socket_evented(key),
                            connection_token(key),
                            Ready::readable(),
                            PollOpt::edge(),
                        );
                        return;
                    }
                };
                (entry.bytes().len(), entry.bytes().to_vec())
            };
            if front_len == 0 {
                return;
            }

            let write = match self.sockets.get_mut(&key) {
                Some(socket) => socket.transport.write_nonblocking(&bytes),
                None => return,
            };
            match write {
                Ok(n) => {
                    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
                    let traced = self.core.connections[key]
                        .record_write(n, now.as_secs() as i64, now.subsec_micros() as i64);
                    for msg in traced {
                        self.core.record_trace(ConnectionHandle(key), msg);
                    }
                    if n < bytes.len() {
                        return;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    self.fail_connection(key, crate::error::ConnectionError::Io(e));
                    return;
                }
            }
        }
    }

    fn socket_evented(&self, key: usize) -> &dyn mio::Evented {
        transport_evented(&self.sockets[&key].transport)
    }

    fn fail_connection(&mut self, key: usize, reason: crate::error::ConnectionError) {
        self.core
            .fail_connection(ConnectionHandle(key), reason);
        self.close_connection(key);
    }

    fn close_connection(&mut self, key: usize) {
        if let Some(socket) = self.sockets.remove(&key) {
            let _ = self.poll.deregister(transport_evented(&socket.transport));
            if let Some(listener) = self.core.listeners.get_mut(socket.listener.0) {
                listener.record_disconnect(unix_epoch_secs());
            }
        }
    }

    fn drain_timer_queue(&mut self) {
        while let Some((handle, kind)) = self.timer.poll() {
            if handle.0 == usize::max_value() {
                // Housekeeping: not routed through `RelayCore::poll_io`
                // since it has no single connection to attach to.
                self.core.housekeeping_tick(unix_epoch_secs());
                self.housekeeping_timeout =
                    Some(self.timer.set_timeout(Duration::from_secs(1), (handle, kind)));
                continue;
            }
            self.pending_timeouts.remove(&(handle.0, kind));
            match kind {
                RelayTimer::Auth | RelayTimer::TlsHandshake => {
                    self.fail_connection(
                        handle.0,
                        crate::error::ConnectionError::Auth(crate::error::AuthError::TimedOut),
                    );
                }
                RelayTimer::OutboundRetry => self.flush_connection(handle.0),
                RelayTimer::Purge => {
                    self.core.connections.remove(handle.0);
                }
                RelayTimer::Housekeeping => {}
            }
        }
    }

    fn drain_core_io(&mut self) {
        while let Some(io) = self.core.poll_io() {
            match io {
                Io::Write { connection } => self.flush_connection(connection.0),
                Io::CloseSocket { connection } => self.close_connection(connection.0),
                Io::TimerStart { connection, timer, time } => {
                    let now = unix_epoch_secs();
                    let delay = (time - now).max(0) as u64;
                    let timeout = self
                        .timer
                        .set_timeout(Duration::from_secs(delay), (connection, timer));
                    self.pending_timeouts.insert((connection.0, timer), timeout);
                }
                Io::TimerStop { connection, timer } => {
                    if let Some(timeout) = self.pending_timeouts.remove(&(connection.0, timer)) {
                        self.timer.cancel_timeout(&timeout);
                    }
                }
            }
        }
    }

    fn drain_core_events(&mut self) {
        while let Some((handle, event)) = self.core.poll() {
            match event {
                Event::Disconnected(reason) => {
                    debug!(self.log, "connection disconnected"; "client" => handle.0, "reason" => %reason);
                    self.close_connection(handle.0);
                }
                Event::StatusChanged(status) => {
                    debug!(self.log, "connection status changed"; "client" => handle.0, "status" => ?status);
                }
                Event::Traced(_msg) => {
                    // Forwarded to whatever debug view the embedder wires
                    // up; the reactor itself only needs to keep draining.
                }
            }
        }
    }
}

fn transport_evented(transport: &Transport) -> &dyn mio::Evented {
    match transport {
        Transport::Plain(s) => s,
        Transport::PlainUnix(s) => s,
        Transport::Tls(s) => s.evented(),
    }
}
