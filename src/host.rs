//! The single collaborator boundary onto "the host" (§6 "Collaborator
//! interfaces consumed from the host").
//!
//! Everything this crate needs from the embedding chat client — upstream
//! server state, input injection, IRC parsing/splitting, channel-name
//! checks, backlog traversal, and redirect registration — goes through
//! `UpstreamHost`. Production wires this to the real IRC client; tests use
//! `FakeHost`.

use crate::irc::redirect::RedirectPattern;

#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub name: String,
    /// `'#'`, `'&'`, … the channel-type prefix character, kept distinct
    /// from `name` since some protocols strip it for display.
    pub channel_type: char,
    pub nicks: Vec<String>,
    pub topic: String,
}

#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub is_connected: bool,
    /// Raw `ISUPPORT` tokens as received from the upstream `005` line(s),
    /// unchunked; §4.4 does the ≤10-token rechunking for the client.
    pub isupport: Vec<String>,
    pub channels: Vec<ChannelInfo>,
    pub nick: String,
    /// Whether the upstream negotiated IRCv3 `echo-message` with the
    /// network (§4.9, §4.11).
    pub echo_message: bool,
}

/// `options` for `send_input`, a comma list from `{priority_high,
/// user_message}` in the wire form; modeled here as explicit flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct InputOptions {
    pub priority_high: bool,
    pub user_message: bool,
}

impl InputOptions {
    pub fn user_message() -> Self {
        InputOptions {
            priority_high: true,
            user_message: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParsedIrcMessage {
    pub tags: Vec<(String, String)>,
    pub prefix: String,
    pub nick: String,
    pub user: String,
    pub host: String,
    pub command: String,
    pub params: Vec<String>,
    pub channel: Option<String>,
    /// The trailing parameter (the `:text` argument), when present.
    pub text: Option<String>,
}

impl ParsedIrcMessage {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Lower bound used when walking a channel's line store backwards for
/// backlog replay (§4.10).
#[derive(Debug, Clone, Copy)]
pub struct BacklogCutoff {
    pub max_number: u32,
    pub max_age_secs: u32,
    pub since: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct BacklogLine {
    pub timestamp: i64,
    pub tags: Vec<String>,
    pub nick: String,
    pub host: String,
    pub text: String,
}

/// The object-safe trait every relay operation that needs the embedding
/// chat client's state goes through. No method here performs any framing,
/// socket, or WebSocket work — that's entirely this crate's job.
pub trait UpstreamHost {
    fn server_info(&self, server: &str) -> Option<ServerInfo>;
    /// `tag` carries the `relay_client_<id>` loop-suppression marker
    /// (§4.8) attached to the synthesized input.
    fn send_input(&self, server: &str, target: &str, options: InputOptions, tag: &str, payload: &str);
    fn parse_irc(&self, line: &str) -> ParsedIrcMessage;
    fn split_for_server(&self, server: &str, line: &str) -> Vec<String>;
    fn is_channel(&self, server: &str, name: &str) -> bool;
    fn backlog_lines(&self, server: &str, target: &str, cutoff: BacklogCutoff) -> Vec<BacklogLine>;
    fn register_redirect(&self, server: &str, signal: &str, pattern: RedirectPattern, target: &str);

    /// `relay_client_irc_out1` (pre-split) / `relay_client_irc_out`
    /// (per-split-chunk) modifier hook; an empty return drops the chunk.
    /// Default passes the line through unchanged, matching a host with no
    /// modifier scripts registered.
    fn modifier_irc_out1(&self, line: &str) -> String {
        line.to_string()
    }

    fn modifier_irc_out(&self, line: &str) -> String {
        line.to_string()
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// Records every `send_input` call for assertions and backs
    /// `server_info`/`backlog_lines` from fixture data set up by the test.
    #[derive(Default)]
    pub struct FakeHost {
        pub servers: RefCell<HashMap<String, ServerInfo>>,
        pub backlog: RefCell<HashMap<(String, String), Vec<BacklogLine>>>,
        pub sent_inputs: RefCell<Vec<(String, String, InputOptions, String, String)>>,
        pub registered_redirects: RefCell<Vec<(String, String, RedirectPattern, String)>>,
    }

    impl FakeHost {
        pub fn new() -> Self {
            FakeHost::default()
        }

        pub fn set_server(&self, name: &str, info: ServerInfo) {
            self.servers.borrow_mut().insert(name.to_string(), info);
        }

        pub fn set_backlog(&self, server: &str, target: &str, lines: Vec<BacklogLine>) {
            self.backlog
                .borrow_mut()
                .insert((server.to_string(), target.to_string()), lines);
        }
    }

    impl UpstreamHost for FakeHost {
        fn server_info(&self, server: &str) -> Option<ServerInfo> {
            self.servers.borrow().get(server).cloned()
        }

        fn send_input(&self, server: &str, target: &str, options: InputOptions, tag: &str, payload: &str) {
            self.sent_inputs.borrow_mut().push((
                server.to_string(),
                target.to_string(),
                options,
                tag.to_string(),
                payload.to_string(),
            ));
        }

        fn parse_irc(&self, line: &str) -> ParsedIrcMessage {
            crate::irc::numerics::parse_irc_line(line)
        }

        fn split_for_server(&self, _server: &str, line: &str) -> Vec<String> {
            vec![line.to_string()]
        }

        fn is_channel(&self, _server: &str, name: &str) -> bool {
            name.starts_with('#') || name.starts_with('&')
        }

        fn backlog_lines(&self, server: &str, target: &str, cutoff: BacklogCutoff) -> Vec<BacklogLine> {
            let key = (server.to_string(), target.to_string());
            let lines = self.backlog.borrow().get(&key).cloned().unwrap_or_default();
            let mut filtered: Vec<BacklogLine> = lines
                .into_iter()
                .filter(|l| cutoff.since.map_or(true, |since| l.timestamp >= since))
                .collect();
            if cutoff.max_number > 0 && filtered.len() as u32 > cutoff.max_number {
                let skip = filtered.len() - cutoff.max_number as usize;
                filtered.drain(..skip);
            }
            filtered
        }

        fn register_redirect(
            &self,
            server: &str,
            signal: &str,
            pattern: RedirectPattern,
            target: &str,
        ) {
            self.registered_redirects.borrow_mut().push((
                server.to_string(),
                signal.to_string(),
                pattern,
                target.to_string(),
            ));
        }
    }
}
