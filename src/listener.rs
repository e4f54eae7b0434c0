//! Per-endpoint accept loop bookkeeping (§4.1, §6 endpoint spec syntax).
//!
//! `Listener` itself performs no socket I/O — see `io` for the real `mio`
//! reactor — it only holds the parsed identity, lifecycle timestamps, and
//! the admission policy that every fresh connection on this endpoint must
//! pass.

use std::net::IpAddr;
use std::sync::Arc;

use regex::Regex;

use crate::config::RelayConfig;
use crate::error::{AdmissionError, ListenError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Irc,
    Weechat,
    Api,
}

impl Protocol {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "irc" => Some(Protocol::Irc),
            "weechat" => Some(Protocol::Weechat),
            "api" => Some(Protocol::Api),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportFlags {
    pub ipv4: bool,
    pub ipv6: bool,
    pub tls: bool,
    pub unix: bool,
}

/// Where a listener binds: a TCP port, or a UNIX-domain socket path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindTarget {
    Port(u16),
    UnixPath(String),
}

/// A parsed `[ipv4.][ipv6.][tls.][unix.]<protocol>[.<args>]` endpoint spec
/// (§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
    pub flags: TransportFlags,
    pub protocol: Protocol,
    /// For `irc`, the upstream server name (the listener-level default,
    /// overridable per-connection by `PASS server:password`, §4.4).
    pub args: Option<String>,
    pub target: BindTarget,
}

/// Parses an endpoint spec string together with the raw config value (a
/// port number or filesystem path, already evaluated by the host's
/// path-expansion service for UNIX paths).
pub fn parse_endpoint_spec(
    spec: &str,
    value: &str,
    global_ipv6: bool,
) -> Result<EndpointSpec, ListenError> {
    let mut flags = TransportFlags::default();
    let mut rest = spec;

    loop {
        if let Some(tail) = rest.strip_prefix("ipv4.") {
            flags.ipv4 = true;
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix("ipv6.") {
            flags.ipv6 = true;
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix("tls.") {
            flags.tls = true;
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix("unix.") {
            flags.unix = true;
            rest = tail;
        } else {
            break;
        }
    }

    if !flags.ipv4 && !flags.ipv6 {
        flags.ipv4 = true;
        flags.ipv6 = global_ipv6;
    }

    let mut parts = rest.splitn(2, '.');
    let protocol = parts
        .next()
        .filter(|s| !s.is_empty())
        .and_then(Protocol::parse)
        .ok_or_else(|| ListenError::InvalidSpec(spec.to_string()))?;
    let args = parts.next().map(str::to_string);

    let target = if flags.unix {
        BindTarget::UnixPath(value.to_string())
    } else {
        let port: u16 = value
            .parse()
            .map_err(|_| ListenError::InvalidSpec(format!("{}: not a valid port", spec)))?;
        BindTarget::Port(port)
    };

    Ok(EndpointSpec {
        flags,
        protocol,
        args,
        target,
    })
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ListenerHandle(pub usize);

/// A bound endpoint (§3 "Listener"). The `start_time` and
/// `last_client_disconnect` fields back the backlog "since last client
/// disconnect" cutoff (§4.10).
pub struct Listener {
    pub spec: EndpointSpec,
    pub start_time: i64,
    pub last_client_disconnect: Option<i64>,
    pub client_count: u32,
    created_unix_socket: bool,
}

impl Listener {
    pub fn new(spec: EndpointSpec, now: i64, created_unix_socket: bool) -> Self {
        Listener {
            spec,
            start_time: now,
            last_client_disconnect: None,
            client_count: 0,
            created_unix_socket,
        }
    }

    /// Whether this listener's UNIX socket path should be unlinked on
    /// close (§4.1 `close()`: "unlinks UNIX sockets iff they were created
    /// by this listener").
    pub fn owns_unix_socket(&self) -> bool {
        self.created_unix_socket
    }

    pub fn record_disconnect(&mut self, now: i64) {
        self.last_client_disconnect = Some(now);
    }
}

/// Evaluates the admission policy in order, fail-closed (§4.1).
pub fn admit(
    config: &RelayConfig,
    protocol: Protocol,
    listener_client_count: u32,
    max_clients: u32,
    peer_ip: &IpAddr,
) -> Result<(), AdmissionError> {
    if config.password.is_empty() && !config.allow_empty_password {
        return Err(AdmissionError::EmptyPasswordDisallowed);
    }
    if protocol == Protocol::Irc && !config.totp_secret.is_empty() && config.password.is_empty() {
        return Err(AdmissionError::TotpRequiresPassword);
    }
    if max_clients > 0 && listener_client_count >= max_clients {
        return Err(AdmissionError::TooManyClients);
    }
    if let Some(re) = &config.allowed_ips {
        if !ip_allowed(re, peer_ip) {
            return Err(AdmissionError::IpNotAllowed);
        }
    }
    Ok(())
}

fn ip_allowed(re: &Arc<Regex>, peer_ip: &IpAddr) -> bool {
    re.is_match(&peer_address_string(peer_ip))
}

/// Canonical peer-address string used both for `allowed_ips` matching and
/// for the connection descriptor (§4.1 step 4): the IPv6 form, with a
/// `::ffff:`-mapped IPv4 address stripped back to plain dotted-quad.
pub fn peer_address_string(addr: &IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => match v6.to_ipv4() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_irc_spec() {
        let spec = parse_endpoint_spec("irc", "7000", false).unwrap();
        assert_eq!(spec.protocol, Protocol::Irc);
        assert!(spec.flags.ipv4);
        assert!(!spec.flags.ipv6);
        assert_eq!(spec.target, BindTarget::Port(7000));
    }

    #[test]
    fn parses_tls_irc_with_server_name() {
        let spec = parse_endpoint_spec("tls.irc.libera", "7001", true).unwrap();
        assert!(spec.flags.tls);
        assert_eq!(spec.args.as_deref(), Some("libera"));
    }

    #[test]
    fn parses_unix_weechat_spec() {
        let spec = parse_endpoint_spec("unix.weechat", "/tmp/relay.sock", false).unwrap();
        assert!(spec.flags.unix);
        assert_eq!(
            spec.target,
            BindTarget::UnixPath("/tmp/relay.sock".to_string())
        );
    }

    #[test]
    fn rejects_unknown_protocol() {
        assert!(parse_endpoint_spec("bogus", "1234", false).is_err());
    }

    #[test]
    fn default_enables_ipv4_always_and_ipv6_from_global_flag() {
        let spec = parse_endpoint_spec("irc", "7000", true).unwrap();
        assert!(spec.flags.ipv4);
        assert!(spec.flags.ipv6);
    }

    #[test]
    fn strips_v4_mapped_prefix() {
        let mapped: IpAddr = "::ffff:192.0.2.1".parse().unwrap();
        assert_eq!(peer_address_string(&mapped), "192.0.2.1");
    }
}
