//! Configuration consumed by the relay core (§6).
//!
//! One field per configuration key named in the design: a plain data
//! struct plus a hand-written `Default` impl with named constants for any
//! non-obvious default.

use std::sync::Arc;

use regex::Regex;

/// Evaluates a WeeChat-style expression string (e.g. `${sec.data.relay}`) to
/// its final value. Real expansion lives in the host; tests and standalone
/// use supply an identity evaluator.
pub trait EvalHook: Send + Sync {
    fn eval(&self, expression: &str) -> String;
}

/// Evaluator that returns its input unchanged, for configurations that hold
/// literal values rather than WeeChat expressions.
pub struct IdentityEval;

impl EvalHook for IdentityEval {
    fn eval(&self, expression: &str) -> String {
        expression.to_string()
    }
}

#[derive(Clone)]
pub struct RelayConfig {
    /// `network.bind_address`: interface to bind TCP listeners on. Empty
    /// binds all interfaces.
    pub bind_address: String,
    /// `network.ipv6`: enable IPv6 on listeners that did not explicitly
    /// request `ipv4.`/`ipv6.` in their endpoint spec.
    pub ipv6: bool,
    /// `network.max_clients`: maximum simultaneous clients per endpoint.
    pub max_clients: u32,
    /// `network.allowed_ips`: compiled once; `None` means unrestricted.
    pub allowed_ips: Option<Arc<Regex>>,
    /// `network.websocket_allowed_origins`.
    pub websocket_allowed_origins: Option<Arc<Regex>>,
    /// `network.password`, already evaluated.
    pub password: String,
    /// `network.allow_empty_password`.
    pub allow_empty_password: bool,
    /// `network.auth_timeout`, seconds.
    pub auth_timeout_secs: u32,
    /// `network.clients_purge_delay`, minutes. `-1` disables, `0` purges
    /// immediately.
    pub clients_purge_delay_mins: i32,
    /// `network.tls_cert_key`, already evaluated to a filesystem path.
    pub tls_cert_key: Option<String>,
    /// `network.tls_priorities`, a gnutls-like priority string; kept opaque
    /// and passed to the TLS layer's cipher-suite selection.
    pub tls_priorities: String,
    /// `network.totp_secret`, already evaluated base32 text. Empty disables
    /// TOTP.
    pub totp_secret: String,
    /// `network.totp_window`.
    pub totp_window: i32,
    /// `network.nonce_size`, bytes, clamped to 8..=128 by `validate`.
    pub nonce_size: usize,
    /// `irc.backlog_max_number`. `0` = unlimited.
    pub backlog_max_number: u32,
    /// `irc.backlog_max_minutes`. `0` = unlimited.
    pub backlog_max_minutes: u32,
    pub backlog_since_last_disconnect: bool,
    pub backlog_since_last_message: bool,
    /// `irc.backlog_tags`: parsed subset of the supported tag set, or `None`
    /// for `*` (all tags).
    pub backlog_tags: Option<Vec<BacklogTag>>,
    /// `irc.backlog_time_format`, a strftime-style format string. Empty
    /// disables the user-visible timestamp prefix (used only when
    /// `server-time` isn't negotiated).
    pub backlog_time_format: String,
    /// `look.auto_open_buffer`: protocols for which the host should open a
    /// buffer automatically. Consumed by the host, carried here only so it
    /// can be read back out of the same config blob.
    pub auto_open_buffer: Vec<String>,
    /// `look.display_clients`.
    pub display_clients: Vec<String>,
    /// TLS handshake timeout, tenths of a second (§4.2).
    pub tls_handshake_timeout_tenths: u32,
    /// Size of the raw-message trace ring (§3 "Raw message").
    pub raw_trace_capacity: usize,
    /// Advertised server host string used as the IRC prefix and in `004`.
    pub relay_host: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BacklogTag {
    Join,
    Part,
    Quit,
    Nick,
    Privmsg,
}

impl BacklogTag {
    pub fn as_str(self) -> &'static str {
        match self {
            BacklogTag::Join => "irc_join",
            BacklogTag::Part => "irc_part",
            BacklogTag::Quit => "irc_quit",
            BacklogTag::Nick => "irc_nick",
            BacklogTag::Privmsg => "irc_privmsg",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "irc_join" => Some(BacklogTag::Join),
            "irc_part" => Some(BacklogTag::Part),
            "irc_quit" => Some(BacklogTag::Quit),
            "irc_nick" => Some(BacklogTag::Nick),
            "irc_privmsg" => Some(BacklogTag::Privmsg),
            _ => None,
        }
    }
}

/// Parses `irc.backlog_tags`: a comma list of tag names, or `*` for all.
pub fn parse_backlog_tags(value: &str) -> Option<Vec<BacklogTag>> {
    if value.trim() == "*" {
        return None;
    }
    Some(
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(BacklogTag::parse)
            .collect(),
    )
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: String::new(),
            ipv6: true,
            max_clients: 0,
            allowed_ips: None,
            websocket_allowed_origins: None,
            password: String::new(),
            allow_empty_password: false,
            auth_timeout_secs: 60,
            clients_purge_delay_mins: 0,
            tls_cert_key: None,
            tls_priorities: "NORMAL:-VERS-SSL3.0".to_string(),
            totp_secret: String::new(),
            totp_window: 0,
            nonce_size: 16,
            backlog_max_number: 256,
            backlog_max_minutes: 1440,
            backlog_since_last_disconnect: true,
            backlog_since_last_message: false,
            backlog_tags: Some(vec![
                BacklogTag::Join,
                BacklogTag::Part,
                BacklogTag::Quit,
                BacklogTag::Nick,
                BacklogTag::Privmsg,
            ]),
            backlog_time_format: String::new(),
            auto_open_buffer: Vec::new(),
            display_clients: Vec::new(),
            tls_handshake_timeout_tenths: 300,
            raw_trace_capacity: 512,
            relay_host: "weechat.relay.irc".to_string(),
        }
    }
}

impl RelayConfig {
    /// Clamps `nonce_size` into its documented 8..=128 range; called after
    /// any change originating from the host's config layer.
    pub fn validate(&mut self) {
        self.nonce_size = self.nonce_size.max(8).min(128);
    }
}
