//! The IRC-proxy state machine itself (§4.4, §4.8, §4.9, §4.11): client
//! commands in, upstream events in, client wire lines out.
//!
//! `IrcProxy` holds exactly the per-connection substate from spec §3; it
//! never touches a socket. `Connection` drives it and turns its returned
//! lines into outbound-queue writes.

use std::collections::BTreeSet;

use crate::config::{EvalHook, RelayConfig};
use crate::host::{InputOptions, UpstreamHost};
use crate::irc::backlog::{replay_lines, BacklogConfig};
use crate::irc::numerics::{parse_irc_line, welcome_lines, WelcomeParams};
use crate::irc::redirect::{mode_pattern, pattern_for_command};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Capability {
    EchoMessage,
    ServerTime,
}

impl Capability {
    fn name(self) -> &'static str {
        match self {
            Capability::EchoMessage => "echo-message",
            Capability::ServerTime => "server-time",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "echo-message" => Some(Capability::EchoMessage),
            "server-time" => Some(Capability::ServerTime),
            _ => None,
        }
    }
}

/// Outcome of feeding one client line through the proxy, consumed by the
/// owning `Connection` to drive the §4.2 state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyOutcome {
    Continue,
    Registered,
    AuthFailed,
}

/// Everything `IrcProxy` needs from the wider world for one call; bundles
/// config, the host, and the evaluator the same way `core::Context` bundles
/// shared state for `RelayCore`'s own handler methods.
pub struct ProxyContext<'a> {
    pub host: &'a dyn UpstreamHost,
    pub eval: &'a dyn EvalHook,
    pub config: &'a RelayConfig,
    pub relay_version: &'a str,
    pub listener_start_time: i64,
    pub connected_clients: u32,
    pub total_clients: u32,
    pub last_client_disconnect: Option<i64>,
    pub now: i64,
}

pub struct IrcProxy {
    pub client_id: usize,
    /// Upstream server name; fixed by the listener arg, overridable by
    /// `PASS server:password` (§4.4).
    pub server: String,
    pub relay_host: String,
    pub nick: Option<String>,
    pub user_received: bool,
    pub cap_ls_received: bool,
    pub cap_end_received: bool,
    /// Past IRC registration; distinct from the connection-level state.
    pub connected: bool,
    /// Mirror of whether the upstream has `echo-message` enabled, refreshed
    /// from `server_info` at registration and `CAP ACK/NAK` time.
    pub echo_message_upstream: bool,
    pub caps: BTreeSet<Capability>,
    password_supplied: Option<String>,
    password_ok: Option<bool>,
}

impl IrcProxy {
    pub fn new(client_id: usize, server: String, relay_host: String) -> Self {
        IrcProxy {
            client_id,
            server,
            relay_host,
            nick: None,
            user_received: false,
            cap_ls_received: false,
            cap_end_received: false,
            connected: false,
            echo_message_upstream: false,
            caps: BTreeSet::new(),
            password_supplied: None,
            password_ok: None,
        }
    }

    fn client_tag(&self) -> String {
        format!("relay_client_{}", self.client_id)
    }

    fn supported_caps(&self) -> Vec<Capability> {
        let mut caps = vec![Capability::ServerTime];
        if self.echo_message_upstream {
            caps.push(Capability::EchoMessage);
        }
        caps.sort();
        caps
    }

    fn ready_to_register(&self) -> bool {
        self.nick.is_some() && self.user_received && (!self.cap_ls_received || self.cap_end_received)
    }

    /// Feeds one line received from the client (§4.8). Returns the wire
    /// lines to send back and the resulting outcome.
    pub fn handle_client_line(&mut self, line: &str, ctx: &ProxyContext) -> (Vec<String>, ProxyOutcome) {
        let msg = parse_irc_line(line);
        let mut out = Vec::new();

        match msg.command.as_str() {
            "PASS" => {
                if let Some(arg) = msg.params.first() {
                    match arg.split_once(':') {
                        Some((server, password)) if !server.is_empty() => {
                            self.server = server.to_string();
                            self.password_supplied = Some(password.to_string());
                        }
                        _ => self.password_supplied = Some(arg.clone()),
                    }
                }
            }
            "NICK" => {
                if let Some(nick) = msg.params.first() {
                    self.nick = Some(nick.clone());
                }
            }
            "USER" => {
                self.user_received = true;
            }
            "CAP" => {
                out.extend(self.handle_cap(&msg.params));
            }
            "PING" => {
                if let Some(token) = msg.text.clone().or_else(|| msg.params.first().cloned()) {
                    out.push(format!(":{} PONG {} :{}", self.relay_host, self.relay_host, token));
                }
            }
            "PONG" | "QUIT" => {}
            "JOIN" | "PART" => {
                if let Some(channels) = msg.params.first() {
                    ctx.host.send_input(
                        &self.server,
                        channels,
                        InputOptions::user_message(),
                        &self.client_tag(),
                        line,
                    );
                }
            }
            "NOTICE" => {
                if let (Some(target), Some(text)) = (msg.params.first(), &msg.text) {
                    ctx.host.send_input(
                        &self.server,
                        target,
                        InputOptions::user_message(),
                        &self.client_tag(),
                        &format!("NOTICE {} :{}", target, text),
                    );
                }
            }
            "PRIVMSG" => {
                if let (Some(target), Some(text)) = (msg.params.first(), &msg.text) {
                    ctx.host.send_input(
                        &self.server,
                        target,
                        InputOptions::user_message(),
                        &self.client_tag(),
                        text,
                    );
                }
            }
            other => {
                out.extend(self.forward_with_redirect(other, &msg.params, line, ctx));
            }
        }

        if !self.connected && self.ready_to_register() {
            let (welcome, outcome) = self.attempt_registration(ctx);
            out.extend(welcome);
            return (out, outcome);
        }

        (out, ProxyOutcome::Continue)
    }

    fn handle_cap(&mut self, params: &[String]) -> Vec<String> {
        let nick = self.nick.clone().unwrap_or_else(|| "*".to_string());
        if params.is_empty() {
            return Vec::new();
        }
        match params[0].as_str() {
            "LS" => {
                self.cap_ls_received = true;
                let names: Vec<&str> = self.supported_caps().iter().map(|c| c.name()).collect();
                vec![format!(
                    ":{} CAP {} LS :{}",
                    self.relay_host,
                    nick,
                    names.join(" ")
                )]
            }
            "REQ" => {
                let requested: Vec<&str> = params[1..].iter().flat_map(|p| p.split(' ')).filter(|s| !s.is_empty()).collect();
                if requested.is_empty() {
                    return Vec::new();
                }
                let supported = self.supported_caps();
                let parsed: Option<Vec<Capability>> = requested
                    .iter()
                    .map(|name| Capability::parse(name).filter(|c| supported.contains(c)))
                    .collect();
                match parsed {
                    Some(caps) => {
                        for c in caps {
                            self.caps.insert(c);
                        }
                        vec![format!(
                            ":{} CAP {} ACK :{}",
                            self.relay_host,
                            nick,
                            requested.join(" ")
                        )]
                    }
                    None => vec![format!(
                        ":{} CAP {} NAK :{}",
                        self.relay_host,
                        nick,
                        requested.join(" ")
                    )],
                }
            }
            "END" => {
                self.cap_end_received = true;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// Everything not handled above (§4.8): a raw quoted command to the
    /// upstream, optionally registering a redirection.
    fn forward_with_redirect(
        &self,
        command: &str,
        params: &[String],
        raw_line: &str,
        ctx: &ProxyContext,
    ) -> Vec<String> {
        let target = params.first().cloned().unwrap_or_default();

        if command == "MODE" {
            let is_channel = ctx.host.is_channel(&self.server, &target);
            let arg = params.get(1).map(String::as_str);
            let pattern = mode_pattern(&target, arg, is_channel);
            let signal = format!("relay_{}", self.client_id);
            ctx.host
                .register_redirect(&self.server, &signal, pattern, &target);
        } else if let Some((pattern, string)) = pattern_for_command(command, &target) {
            let signal = format!("relay_{}", self.client_id);
            ctx.host
                .register_redirect(&self.server, &signal, pattern, &string);
        }

        ctx.host.send_input(
            &self.server,
            "",
            InputOptions {
                priority_high: true,
                user_message: false,
            },
            &self.client_tag(),
            raw_line,
        );
        Vec::new()
    }

    fn attempt_registration(&mut self, ctx: &ProxyContext) -> (Vec<String>, ProxyOutcome) {
        let configured = ctx.eval.eval(&ctx.config.password);
        let supplied = self
            .password_supplied
            .as_ref()
            .map(|p| ctx.eval.eval(p))
            .unwrap_or_default();

        let password_required = !configured.is_empty();
        self.password_ok = Some(!password_required || supplied == configured);

        if self.password_ok != Some(true) {
            return (
                vec![format!(":{} ERROR :WeeChat: password error", self.relay_host)],
                ProxyOutcome::AuthFailed,
            );
        }

        self.connected = true;
        let nick = self.nick.clone().unwrap_or_else(|| "*".to_string());
        let mut lines = Vec::new();

        let info = ctx.host.server_info(&self.server);
        if let Some(info) = &info {
            self.echo_message_upstream = info.echo_message;
            if info.nick != nick {
                lines.push(format!(":{}!proxy NICK :{}", nick, info.nick));
                self.nick = Some(info.nick.clone());
            }
        }

        let welcome = welcome_lines(&WelcomeParams {
            relay_host: &self.relay_host,
            nick: self.nick.as_deref().unwrap_or(&nick),
            version: ctx.relay_version,
            listener_start_time: ctx.listener_start_time,
            isupport_tokens: info.as_ref().map(|i| i.isupport.as_slice()).unwrap_or(&[]),
            num_connected_clients: ctx.connected_clients,
            num_total_clients: ctx.total_clients,
        });
        lines.extend(welcome);

        if let Some(info) = &info {
            let backlog_config = BacklogConfig {
                max_number: ctx.config.backlog_max_number,
                max_age_secs: ctx.config.backlog_max_minutes * 60,
                since_last_disconnect: ctx.config.backlog_since_last_disconnect,
                since_last_message: ctx.config.backlog_since_last_message,
                tags: &ctx.config.backlog_tags,
                time_format: &ctx.config.backlog_time_format,
            };
            let server_time = self.caps.contains(&Capability::ServerTime);
            for channel in &info.channels {
                lines.push(format!(
                    ":{}!proxy JOIN :{}",
                    self.nick.as_deref().unwrap_or(&nick),
                    channel.name
                ));
                if !channel.topic.is_empty() {
                    lines.push(format!(
                        ":{} 332 {} {} :{}",
                        self.relay_host,
                        self.nick.as_deref().unwrap_or(&nick),
                        channel.name,
                        channel.topic
                    ));
                }
                let names = channel.nicks.join(" ");
                lines.push(format!(
                    ":{} 353 {} = {} :{}",
                    self.relay_host,
                    self.nick.as_deref().unwrap_or(&nick),
                    channel.name,
                    names
                ));
                lines.push(format!(
                    ":{} 366 {} {} :End of /NAMES list.",
                    self.relay_host,
                    self.nick.as_deref().unwrap_or(&nick),
                    channel.name
                ));
                lines.extend(replay_lines(
                    ctx.host,
                    &self.server,
                    &channel.name,
                    &self.relay_host,
                    self.nick.as_deref().unwrap_or(&nick),
                    ctx.last_client_disconnect,
                    ctx.now,
                    &backlog_config,
                    server_time,
                ));
            }
        }

        (lines, ProxyOutcome::Registered)
    }

    /// Inbound upstream traffic (`irc_in2_*`, §4.9).
    pub fn handle_upstream_inbound(&mut self, line: &str) -> Vec<String> {
        let msg = parse_irc_line(line);

        if msg.command == "NICK" {
            if self.nick.as_deref() == Some(msg.nick.as_str()) {
                if let Some(new_nick) = &msg.text.clone().or_else(|| msg.params.first().cloned()) {
                    self.nick = Some(new_nick.clone());
                }
            }
        }

        if msg.command == "CAP" && msg.params.get(1).map(String::as_str) == Some("ACK") {
            if let Some(caps) = msg.params.get(2) {
                for cap in caps.split(' ') {
                    match cap.strip_prefix('-') {
                        Some("echo-message") => self.echo_message_upstream = false,
                        _ if cap == "echo-message" => self.echo_message_upstream = true,
                        _ => {}
                    }
                }
            }
        }

        if msg.command == "PING" || msg.command == "PONG" {
            return Vec::new();
        }

        let prefix = if msg.prefix.is_empty() {
            self.relay_host.clone()
        } else {
            msg.prefix.clone()
        };
        let mut rebuilt = format!(":{} {}", prefix, msg.command);
        for (i, param) in msg.params.iter().enumerate() {
            let is_trailing = i == msg.params.len() - 1 && msg.text.is_some();
            if is_trailing {
                rebuilt.push_str(&format!(" :{}", param));
            } else {
                rebuilt.push_str(&format!(" {}", param));
            }
        }
        vec![rebuilt]
    }

    /// Outbound-with-tags traffic (`irc_outtags_*`, §4.9): loop suppression
    /// plus the self-echo synthesis when the upstream lacks `echo-message`.
    pub fn handle_upstream_outtags(&mut self, line: &str, tags: &[String]) -> Vec<String> {
        if tags.iter().any(|t| t == &self.client_tag()) {
            return Vec::new();
        }

        let msg = parse_irc_line(line);
        if self.echo_message_upstream {
            return Vec::new();
        }
        if msg.command != "PRIVMSG" && msg.command != "NOTICE" {
            return Vec::new();
        }

        let nick = self.nick.clone().unwrap_or_default();
        let target = msg.params.first().cloned().unwrap_or_default();
        let text = msg.text.clone().unwrap_or_default();
        vec![format!(
            ":{}!weechat@proxy {} {} :{}",
            nick, msg.command, target, text
        )]
    }

    /// Redirection completion (§4.8, §4.9): split the accumulated output
    /// on `\n` and pass each line through verbatim.
    pub fn handle_redirection_completion(&self, output: &str) -> Vec<String> {
        output.split('\n').filter(|l| !l.is_empty()).map(str::to_string).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentityEval;
    use crate::host::fake::FakeHost;
    use crate::host::ServerInfo;

    fn ctx<'a>(host: &'a FakeHost, eval: &'a IdentityEval, config: &'a RelayConfig) -> ProxyContext<'a> {
        ProxyContext {
            host,
            eval,
            config,
            relay_version: "0.1.0",
            listener_start_time: 0,
            connected_clients: 1,
            total_clients: 1,
            last_client_disconnect: None,
            now: 100,
        }
    }

    fn registered_config() -> RelayConfig {
        let mut c = RelayConfig::default();
        c.password = "secret".to_string();
        c
    }

    #[test]
    fn happy_login_registers_and_sends_welcome() {
        let host = FakeHost::new();
        host.set_server(
            "libera",
            ServerInfo {
                is_connected: true,
                isupport: vec![],
                channels: vec![],
                nick: "alice".to_string(),
                echo_message: false,
            },
        );
        let eval = IdentityEval;
        let config = registered_config();
        let c = ctx(&host, &eval, &config);

        let mut proxy = IrcProxy::new(1, "libera".to_string(), "weechat.relay.irc".to_string());
        let mut all = Vec::new();
        for line in ["PASS secret", "NICK alice", "USER alice 0 * :Alice"] {
            let (lines, _) = proxy.handle_client_line(line, &c);
            all.extend(lines);
        }
        assert!(proxy.connected);
        assert!(all.iter().any(|l| l.contains("001")));
        assert!(all.iter().any(|l| l.contains("422")));
    }

    #[test]
    fn bad_password_yields_auth_failed() {
        let host = FakeHost::new();
        let eval = IdentityEval;
        let config = registered_config();
        let c = ctx(&host, &eval, &config);

        let mut proxy = IrcProxy::new(1, "libera".to_string(), "weechat.relay.irc".to_string());
        let mut outcome = ProxyOutcome::Continue;
        for line in ["PASS wrong", "NICK alice", "USER alice 0 * :Alice"] {
            let (_, o) = proxy.handle_client_line(line, &c);
            outcome = o;
        }
        assert_eq!(outcome, ProxyOutcome::AuthFailed);
        assert!(!proxy.connected);
    }

    #[test]
    fn ping_replies_locally_without_forwarding() {
        let host = FakeHost::new();
        let eval = IdentityEval;
        let config = RelayConfig::default();
        let c = ctx(&host, &eval, &config);
        let mut proxy = IrcProxy::new(1, "libera".to_string(), "weechat.relay.irc".to_string());
        let (lines, _) = proxy.handle_client_line("PING :12345", &c);
        assert_eq!(lines, vec![":weechat.relay.irc PONG weechat.relay.irc :12345".to_string()]);
        assert!(host.sent_inputs.borrow().is_empty());
    }

    #[test]
    fn cap_req_all_supported_acks_and_sets_bits() {
        let host = FakeHost::new();
        let eval = IdentityEval;
        let config = RelayConfig::default();
        let c = ctx(&host, &eval, &config);
        let mut proxy = IrcProxy::new(1, "libera".to_string(), "weechat.relay.irc".to_string());
        proxy.echo_message_upstream = true;
        let (lines, _) = proxy.handle_client_line("CAP REQ :server-time echo-message", &c);
        assert!(lines[0].contains("ACK"));
        assert!(proxy.caps.contains(&Capability::ServerTime));
        assert!(proxy.caps.contains(&Capability::EchoMessage));
    }

    #[test]
    fn cap_req_unsupported_naks_without_setting_bits() {
        let host = FakeHost::new();
        let eval = IdentityEval;
        let config = RelayConfig::default();
        let c = ctx(&host, &eval, &config);
        let mut proxy = IrcProxy::new(1, "libera".to_string(), "weechat.relay.irc".to_string());
        let (lines, _) = proxy.handle_client_line("CAP REQ :server-time away-notify", &c);
        assert!(lines[0].contains("NAK"));
        assert!(proxy.caps.is_empty());
    }

    #[test]
    fn privmsg_sends_input_tagged_with_client_id() {
        let host = FakeHost::new();
        let eval = IdentityEval;
        let config = RelayConfig::default();
        let c = ctx(&host, &eval, &config);
        let mut proxy = IrcProxy::new(1, "libera".to_string(), "weechat.relay.irc".to_string());
        proxy.handle_client_line("PRIVMSG #test :hello", &c);
        let sent = host.sent_inputs.borrow();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "#test");
        assert_eq!(sent[0].3, "relay_client_1");
        assert_eq!(sent[0].4, "hello");
    }

    #[test]
    fn outtags_from_self_are_suppressed() {
        let mut proxy = IrcProxy::new(1, "libera".to_string(), "weechat.relay.irc".to_string());
        proxy.nick = Some("alice".to_string());
        let lines = proxy.handle_upstream_outtags(
            ":alice!a@b PRIVMSG #test :hello",
            &["relay_client_1".to_string()],
        );
        assert!(lines.is_empty());
    }

    #[test]
    fn outtags_without_echo_message_synthesizes_self_echo() {
        let mut proxy = IrcProxy::new(1, "libera".to_string(), "weechat.relay.irc".to_string());
        proxy.nick = Some("alice".to_string());
        proxy.echo_message_upstream = false;
        let lines = proxy.handle_upstream_outtags(":alice!a@b PRIVMSG #test :hello", &[]);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("PRIVMSG #test :hello"));
    }

    #[test]
    fn redirection_completion_splits_on_newline() {
        let proxy = IrcProxy::new(1, "libera".to_string(), "weechat.relay.irc".to_string());
        let lines = proxy.handle_redirection_completion(":s 311 alice bob :r\n:s 318 alice bob :End of WHOIS list.");
        assert_eq!(lines.len(), 2);
    }
}
