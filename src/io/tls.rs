//! Minimal `rustls`-backed TLS stream for `tls.` listeners (§4.2).
//!
//! Wraps a `rustls::ServerSession` around the raw socket: the session
//! object holds all cryptographic state, this type just adapts it to
//! `Read`/`Write`/`Evented` for the reactor.

use std::io::{self, BufReader, Read, Write};
use std::sync::Arc;

use rustls::Session;

/// Loads a single certificate chain and private key from one PEM file for
/// a `tls.` listener, the way `relay-server.c` points GnuTLS at one
/// combined cert+key path rather than requiring two separate files.
/// Tries PKCS#8 first, then falls back to PKCS#1 (plain RSA) keys.
pub fn load_server_config(cert_key_path: &str) -> io::Result<rustls::ServerConfig> {
    let certs = {
        let mut reader = BufReader::new(std::fs::File::open(cert_key_path)?);
        rustls::internal::pemfile::certs(&mut reader)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "no certificates found in tls_cert_key"))?
    };

    let mut keys = {
        let mut reader = BufReader::new(std::fs::File::open(cert_key_path)?);
        rustls::internal::pemfile::pkcs8_private_keys(&mut reader)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed private key in tls_cert_key"))?
    };
    if keys.is_empty() {
        let mut reader = BufReader::new(std::fs::File::open(cert_key_path)?);
        keys = rustls::internal::pemfile::rsa_private_keys(&mut reader)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed private key in tls_cert_key"))?;
    }
    let key = keys
        .into_iter()
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no private key found in tls_cert_key"))?;

    let mut config = rustls::ServerConfig::new(rustls::NoClientAuth::new());
    config
        .set_single_cert(certs, key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    Ok(config)
}

pub struct TlsSession<S> {
    socket: S,
    session: rustls::ServerSession,
}

impl<S: Read + Write> TlsSession<S> {
    pub fn new_server(socket: S, config: Arc<rustls::ServerConfig>) -> Self {
        TlsSession {
            socket,
            session: rustls::ServerSession::new(&config),
        }
    }

    pub fn evented(&self) -> &S {
        &self.socket
    }

    /// Completion is implicit: once `rustls` has a full client certificate
    /// chain validated (or none required) it stops wanting more handshake
    /// bytes and `read`/`write` behave like a plain stream from the
    /// caller's point of view (§4.2 `tls_handshake` timer governs how long
    /// this is allowed to take, enforced by the reactor, not here).
    pub fn is_handshaking(&self) -> bool {
        self.session.is_handshaking()
    }
}

impl<S: Read + Write> Read for TlsSession<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.session.wants_read() {
            match self.session.read_tls(&mut self.socket) {
                Ok(0) => return Ok(0),
                Ok(_) => {
                    self.session
                        .process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
        self.session.read(buf)
    }
}

impl<S: Read + Write> Write for TlsSession<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.session.write(buf)?;
        self.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        while self.session.wants_write() {
            match self.session.write_tls(&mut self.socket) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
