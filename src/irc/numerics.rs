//! IRC line parsing and the synthesized welcome-sequence numerics (§4.4,
//! §6 "Numeric replies synthesized at welcome").

use crate::host::ParsedIrcMessage;

/// `RELAY_IRC_ISUPPORT_MAX`: the original chunks `005` tokens into lines of
/// at most this many, each repeating the trailing text.
const ISUPPORT_CHUNK_SIZE: usize = 10;

/// Parses one IRC line (`@tags :prefix COMMAND params… :trailing`, any
/// prefix omitted) into its component parts. Shared by client-command
/// parsing and upstream-message parsing — the wire grammar is identical in
/// both directions.
pub fn parse_irc_line(line: &str) -> ParsedIrcMessage {
    let mut rest = line.trim_end_matches(['\r', '\n']);
    let mut msg = ParsedIrcMessage::default();

    if let Some(tag_rest) = rest.strip_prefix('@') {
        let (tag_part, after) = split_first_space(tag_rest);
        for kv in tag_part.split(';') {
            if kv.is_empty() {
                continue;
            }
            let mut it = kv.splitn(2, '=');
            let key = it.next().unwrap_or("").to_string();
            let value = it.next().unwrap_or("").to_string();
            msg.tags.push((key, value));
        }
        rest = after;
    }

    if let Some(prefix_rest) = rest.strip_prefix(':') {
        let (prefix, after) = split_first_space(prefix_rest);
        msg.prefix = prefix.to_string();
        rest = after;
        let (nick, tail) = match prefix.find('!') {
            Some(i) => (&prefix[..i], &prefix[i + 1..]),
            None => (prefix, ""),
        };
        msg.nick = nick.to_string();
        if let Some(at) = tail.find('@') {
            msg.user = tail[..at].to_string();
            msg.host = tail[at + 1..].to_string();
        } else if !tail.is_empty() {
            msg.host = tail.to_string();
        }
    }

    let (command, mut params_rest) = split_first_space(rest);
    msg.command = command.to_ascii_uppercase();

    while !params_rest.is_empty() {
        if let Some(trailing) = params_rest.strip_prefix(':') {
            msg.params.push(trailing.to_string());
            msg.text = Some(trailing.to_string());
            break;
        }
        let (param, after) = split_first_space(params_rest);
        if param.is_empty() {
            break;
        }
        msg.params.push(param.to_string());
        params_rest = after;
    }

    msg.channel = msg
        .params
        .iter()
        .find(|p| p.starts_with('#') || p.starts_with('&'))
        .cloned();

    msg
}

fn split_first_space(s: &str) -> (&str, &str) {
    match s.find(' ') {
        Some(i) => (&s[..i], s[i + 1..].trim_start_matches(' ')),
        None => (s, ""),
    }
}

/// Everything the welcome sequence (§4.4) needs to render `001`..`005`,
/// `251`, `255`, `422`.
pub struct WelcomeParams<'a> {
    pub relay_host: &'a str,
    pub nick: &'a str,
    pub version: &'a str,
    pub listener_start_time: i64,
    pub isupport_tokens: &'a [String],
    pub num_connected_clients: u32,
    pub num_total_clients: u32,
}

const USER_MODES: &str = "oirw";
const CHANNEL_MODES: &str = "abiklmnopqstv";

pub fn welcome_lines(p: &WelcomeParams) -> Vec<String> {
    let mut lines = Vec::new();
    lines.push(format!(
        ":{} 001 {} :Welcome to the Internet Relay Chat Network {}!weechat@proxy",
        p.relay_host, p.nick, p.nick
    ));
    lines.push(format!(
        ":{} 002 {} :Your host is {}, running version {}",
        p.relay_host, p.nick, p.relay_host, p.version
    ));
    lines.push(format!(
        ":{} 003 {} :This server was created at startup time {}",
        p.relay_host, p.nick, p.listener_start_time
    ));
    lines.push(format!(
        ":{} 004 {} {} {} {} {}",
        p.relay_host, p.nick, p.relay_host, p.version, USER_MODES, CHANNEL_MODES
    ));
    lines.extend(isupport_lines(p.relay_host, p.nick, p.isupport_tokens));
    lines.push(format!(
        ":{} 251 {} :There are {} users and 0 invisible on 1 server",
        p.relay_host, p.nick, p.num_connected_clients
    ));
    lines.push(format!(
        ":{} 255 {} :I have {} clients and 1 server",
        p.relay_host, p.nick, p.num_total_clients
    ));
    lines.push(format!(
        ":{} 422 {} :MOTD File is missing",
        p.relay_host, p.nick
    ));
    lines
}

/// `005 ISUPPORT` rechunked to at most `ISUPPORT_CHUNK_SIZE` tokens per
/// line, matching `relay-irc.c`'s `RELAY_IRC_ISUPPORT_MAX`.
fn isupport_lines(relay_host: &str, nick: &str, tokens: &[String]) -> Vec<String> {
    if tokens.is_empty() {
        return vec![format!(
            ":{} 005 {} :are supported by this server",
            relay_host, nick
        )];
    }
    tokens
        .chunks(ISUPPORT_CHUNK_SIZE)
        .map(|chunk| {
            format!(
                ":{} 005 {} {} :are supported by this server",
                relay_host,
                nick,
                chunk.join(" ")
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_prefixed_privmsg_with_trailing() {
        let msg = parse_irc_line(":nick1!user@host PRIVMSG #test :hello world\r\n");
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.nick, "nick1");
        assert_eq!(msg.user, "user");
        assert_eq!(msg.host, "host");
        assert_eq!(msg.params, vec!["#test".to_string(), "hello world".to_string()]);
        assert_eq!(msg.channel.as_deref(), Some("#test"));
        assert_eq!(msg.text.as_deref(), Some("hello world"));
    }

    #[test]
    fn parses_tagged_message() {
        let msg = parse_irc_line("@time=2024-01-01T00:00:00.000Z;msgid=x :s 001 alice :hi");
        assert_eq!(msg.tag("time"), Some("2024-01-01T00:00:00.000Z"));
        assert_eq!(msg.command, "001");
    }

    #[test]
    fn parses_command_without_prefix() {
        let msg = parse_irc_line("PASS secret");
        assert_eq!(msg.command, "PASS");
        assert_eq!(msg.params, vec!["secret".to_string()]);
    }

    #[test]
    fn isupport_chunks_at_ten_tokens() {
        let tokens: Vec<String> = (0..23).map(|i| format!("TOK{}", i)).collect();
        let lines = isupport_lines("h", "n", &tokens);
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("TOK0") && lines[0].contains("TOK9"));
        assert!(lines[2].contains("TOK22"));
    }

    #[test]
    fn welcome_sequence_has_eight_lines() {
        let params = WelcomeParams {
            relay_host: "weechat.relay.irc",
            nick: "alice",
            version: "0.1.0",
            listener_start_time: 0,
            isupport_tokens: &[],
            num_connected_clients: 1,
            num_total_clients: 1,
        };
        let lines = welcome_lines(&params);
        assert_eq!(lines.len(), 8);
        assert!(lines[0].contains("001"));
        assert!(lines.last().unwrap().contains("422"));
    }
}
