//! Binds one `EndpointSpec` to a real `mio` listening socket (TCP or
//! UNIX-domain) and accepts connections off it (§4.1, §6 endpoint spec
//! syntax).

use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use mio_uds::UnixListener;

use super::tls::TlsSession;
use super::Transport;

pub enum ListenerSocket {
    Tcp {
        listener: mio::net::TcpListener,
        tls_config: Option<Arc<rustls::ServerConfig>>,
    },
    Unix(UnixListener),
}

impl ListenerSocket {
    pub fn bind_tcp(port: u16, ipv4: bool, ipv6: bool) -> io::Result<Self> {
        // `ipv6` with `ipv4` both set binds the IPv6 wildcard address;
        // most platforms dual-stack this automatically the way the
        // original binds `::` without `IPV6_V6ONLY`. IPv4-only binds the
        // IPv4 wildcard instead.
        let addr: SocketAddr = if ipv6 {
            (std::net::Ipv6Addr::UNSPECIFIED, port).into()
        } else if ipv4 {
            (Ipv4Addr::UNSPECIFIED, port).into()
        } else {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "listener has neither ipv4 nor ipv6 enabled",
            ));
        };

        let listener = mio::net::TcpListener::bind(&addr)?;
        Ok(ListenerSocket::Tcp {
            listener,
            tls_config: None,
        })
    }

    pub fn bind_tcp_tls(
        port: u16,
        ipv4: bool,
        ipv6: bool,
        tls_config: Arc<rustls::ServerConfig>,
    ) -> io::Result<Self> {
        let mut socket = Self::bind_tcp(port, ipv4, ipv6)?;
        if let ListenerSocket::Tcp { tls_config: slot, .. } = &mut socket {
            *slot = Some(tls_config);
        }
        Ok(socket)
    }

    pub fn bind_unix(path: &str) -> io::Result<Self> {
        // A stale socket file from a previous crash-exit would otherwise
        // make every future bind fail with `EADDRINUSE`; §4.1's admission
        // policy has no opinion on this, it's purely a bind-time concern.
        let _ = std::fs::remove_file(path);
        Ok(ListenerSocket::Unix(UnixListener::bind(path)?))
    }

    pub fn evented(&self) -> &dyn mio::Evented {
        match self {
            ListenerSocket::Tcp { listener, .. } => listener,
            ListenerSocket::Unix(listener) => listener,
        }
    }

    /// Accepts one pending connection, if any (edge-triggered: the caller
    /// loops until this returns `Ok(None)`).
    pub fn accept(&mut self) -> io::Result<Option<(Transport, IpAddr)>> {
        match self {
            ListenerSocket::Tcp { listener, tls_config } => match listener.accept() {
                Ok((stream, addr)) => {
                    let transport = match tls_config {
                        Some(cfg) => Transport::Tls(TlsSession::new_server(stream, cfg.clone())),
                        None => Transport::Plain(stream),
                    };
                    Ok(Some((transport, addr.ip())))
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
                Err(e) => Err(e),
            },
            ListenerSocket::Unix(listener) => match listener.accept() {
                Ok(Some((stream, _addr))) => {
                    Ok(Some((Transport::PlainUnix(stream), IpAddr::V4(Ipv4Addr::LOCALHOST))))
                }
                Ok(None) => Ok(None),
                Err(e) => Err(e),
            },
        }
    }
}
