//! Backlog replay on synthesized `JOIN` (§4.10).

use crate::config::BacklogTag;
use crate::host::{BacklogCutoff, BacklogLine, UpstreamHost};

pub struct BacklogConfig<'a> {
    pub max_number: u32,
    pub max_age_secs: u32,
    pub since_last_disconnect: bool,
    pub since_last_message: bool,
    pub tags: &'a Option<Vec<BacklogTag>>,
    /// `strftime`-style format string; empty disables the plain-text
    /// timestamp prefix used when `server-time` isn't negotiated.
    pub time_format: &'a str,
}

fn tag_enabled(config: &BacklogConfig, tag: BacklogTag) -> bool {
    match config.tags {
        None => true,
        Some(tags) => tags.contains(&tag),
    }
}

fn backlog_tag_for_line(line: &BacklogLine) -> Option<BacklogTag> {
    [
        BacklogTag::Join,
        BacklogTag::Part,
        BacklogTag::Quit,
        BacklogTag::Nick,
        BacklogTag::Privmsg,
    ]
    .into_iter()
    .find(|t| line.tags.iter().any(|s| s == t.as_str()))
}

/// Replays recent lines for `target` (a channel, or a one-to-one buffer,
/// per §4.10's "private-message buffers have the same treatment without
/// the preceding JOIN"). Returns wire-ready IRC lines, oldest first.
pub fn replay_lines(
    host: &dyn UpstreamHost,
    server: &str,
    target: &str,
    relay_host: &str,
    client_nick: &str,
    last_client_disconnect: Option<i64>,
    now: i64,
    config: &BacklogConfig,
    server_time_enabled: bool,
) -> Vec<String> {
    let disconnect_since = if config.since_last_disconnect {
        last_client_disconnect
    } else {
        None
    };

    let broad = host.backlog_lines(
        server,
        target,
        BacklogCutoff {
            max_number: 0,
            max_age_secs: config.max_age_secs,
            since: disconnect_since,
        },
    );

    let own_message_since = if config.since_last_message {
        broad
            .iter()
            .rev()
            .find(|l| l.nick == client_nick)
            .map(|l| l.timestamp)
    } else {
        None
    };

    let effective_since = [disconnect_since, own_message_since]
        .into_iter()
        .flatten()
        .max();

    let mut selected: Vec<&BacklogLine> = broad
        .iter()
        .filter(|l| effective_since.map_or(true, |since| l.timestamp >= since))
        .filter(|l| config.max_age_secs == 0 || l.timestamp >= now - config.max_age_secs as i64)
        .collect();

    if config.max_number > 0 && selected.len() as u32 > config.max_number {
        let skip = selected.len() - config.max_number as usize;
        selected.drain(..skip);
    }

    selected
        .into_iter()
        .filter_map(|line| {
            let tag = backlog_tag_for_line(line)?;
            if !tag_enabled(config, tag) {
                return None;
            }
            Some(render_line(target, tag, line, server_time_enabled, config.time_format))
        })
        .collect()
}

fn render_line(
    target: &str,
    tag: BacklogTag,
    line: &BacklogLine,
    server_time_enabled: bool,
    time_format: &str,
) -> String {
    let prefix = if line.host.is_empty() {
        line.nick.clone()
    } else {
        format!("{}!{}", line.nick, line.host)
    };

    let body = match tag {
        BacklogTag::Join => format!(":{} JOIN :{}", prefix, target),
        BacklogTag::Part => format!(":{} PART {} :{}", prefix, target, line.text),
        BacklogTag::Quit => format!(":{} QUIT :{}", prefix, line.text),
        BacklogTag::Nick => format!(":{} NICK :{}", prefix, line.text),
        BacklogTag::Privmsg => {
            let is_action = line.tags.iter().any(|t| t == "irc_action");
            let mut text = if is_action {
                format!("\x01ACTION {}\x01", line.text)
            } else {
                line.text.clone()
            };
            // Matches relay-irc.c: when server-time isn't negotiated, the
            // formatted time is prepended directly onto the message text
            // rather than carried as a separate IRCv3 tag.
            if !server_time_enabled && !time_format.is_empty() {
                text = format!("{}{}", strftime_prefix(time_format, line.timestamp), text);
            }
            format!(":{} PRIVMSG {} :{}", prefix, target, text)
        }
    };

    if server_time_enabled {
        format!("@time={} {}", format_server_time(line.timestamp), body)
    } else {
        body
    }
}

/// Expands the `%Y %m %d %H %M %S %%` subset of `strftime` directives used
/// by `backlog_time_format` (§4.10); any other `%`-directive is passed
/// through unchanged. Always renders UTC — unlike the original's
/// `localtime`, the relay core has no timezone database to consult.
fn strftime_prefix(format: &str, epoch_secs: i64) -> String {
    let days = epoch_secs.div_euclid(86400);
    let secs_of_day = epoch_secs.rem_euclid(86400);
    let (y, m, d) = civil_from_days(days);
    let (hh, mm, ss) = (secs_of_day / 3600, (secs_of_day % 3600) / 60, secs_of_day % 60);

    let mut out = String::with_capacity(format.len());
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('Y') => out.push_str(&format!("{:04}", y)),
            Some('m') => out.push_str(&format!("{:02}", m)),
            Some('d') => out.push_str(&format!("{:02}", d)),
            Some('H') => out.push_str(&format!("{:02}", hh)),
            Some('M') => out.push_str(&format!("{:02}", mm)),
            Some('S') => out.push_str(&format!("{:02}", ss)),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

/// `YYYY-MM-DDThh:mm:ss.000Z`; the relay always has sub-second precision
/// zeroed since the stored lines only carry second resolution.
fn format_server_time(epoch_secs: i64) -> String {
    let days = epoch_secs.div_euclid(86400);
    let secs_of_day = epoch_secs.rem_euclid(86400);
    let (y, m, d) = civil_from_days(days);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.000Z",
        y,
        m,
        d,
        secs_of_day / 3600,
        (secs_of_day % 3600) / 60,
        secs_of_day % 60
    )
}

/// Howard Hinnant's civil-from-days algorithm; avoids pulling in a chrono
/// dependency just to render one UTC timestamp format.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::fake::FakeHost;

    fn line(ts: i64, nick: &str, tag: &str, text: &str) -> BacklogLine {
        BacklogLine {
            timestamp: ts,
            tags: vec![tag.to_string()],
            nick: nick.to_string(),
            host: "h".to_string(),
            text: text.to_string(),
        }
    }

    #[test]
    fn respects_max_number() {
        let host = FakeHost::new();
        host.set_backlog(
            "libera",
            "#test",
            vec![
                line(1, "bob", "irc_privmsg", "one"),
                line(2, "bob", "irc_privmsg", "two"),
                line(3, "bob", "irc_privmsg", "three"),
            ],
        );
        let config = BacklogConfig {
            max_number: 2,
            max_age_secs: 0,
            since_last_disconnect: false,
            since_last_message: false,
            tags: &None,
            time_format: "",
        };
        let lines = replay_lines(&host, "libera", "#test", "weechat.relay.irc", "alice", None, 100, &config, false);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("two"));
        assert!(lines[1].contains("three"));
    }

    #[test]
    fn filters_by_since_last_disconnect() {
        let host = FakeHost::new();
        host.set_backlog(
            "libera",
            "#test",
            vec![line(10, "bob", "irc_privmsg", "old"), line(50, "bob", "irc_privmsg", "new")],
        );
        let config = BacklogConfig {
            max_number: 0,
            max_age_secs: 0,
            since_last_disconnect: true,
            since_last_message: false,
            tags: &None,
            time_format: "",
        };
        let lines = replay_lines(&host, "libera", "#test", "weechat.relay.irc", "alice", Some(20), 100, &config, false);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("new"));
    }

    #[test]
    fn prepends_server_time_tag() {
        let host = FakeHost::new();
        host.set_backlog("libera", "#test", vec![line(0, "bob", "irc_privmsg", "hi")]);
        let config = BacklogConfig {
            max_number: 0,
            max_age_secs: 0,
            since_last_disconnect: false,
            since_last_message: false,
            tags: &None,
            time_format: "",
        };
        let lines = replay_lines(&host, "libera", "#test", "weechat.relay.irc", "alice", None, 100, &config, true);
        assert!(lines[0].starts_with("@time=1970-01-01T00:00:00.000Z"));
    }

    #[test]
    fn expands_time_format_prefix_when_server_time_not_negotiated() {
        let host = FakeHost::new();
        host.set_backlog("libera", "#test", vec![line(3661, "bob", "irc_privmsg", "hi")]);
        let config = BacklogConfig {
            max_number: 0,
            max_age_secs: 0,
            since_last_disconnect: false,
            since_last_message: false,
            tags: &None,
            time_format: "%H:%M:%S ",
        };
        let lines = replay_lines(&host, "libera", "#test", "weechat.relay.irc", "alice", None, 100, &config, false);
        assert!(lines[0].contains(":01:01:01 hi"), "{}", lines[0]);
    }

    #[test]
    fn wraps_action_tagged_privmsg() {
        let host = FakeHost::new();
        let mut l = line(0, "bob", "irc_privmsg", "waves");
        l.tags.push("irc_action".to_string());
        host.set_backlog("libera", "#test", vec![l]);
        let config = BacklogConfig {
            max_number: 0,
            max_age_secs: 0,
            since_last_disconnect: false,
            since_last_message: false,
            tags: &None,
            time_format: "",
        };
        let lines = replay_lines(&host, "libera", "#test", "weechat.relay.irc", "alice", None, 100, &config, false);
        assert!(lines[0].contains("\x01ACTION waves\x01"));
    }
}
