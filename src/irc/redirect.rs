//! Redirection patterns for synchronous IRC queries (§4.8).
//!
//! A redirection batches a command's numeric replies — which are otherwise
//! interleaved with unrelated upstream traffic — and delivers them to the
//! client as one unit once the host's redirection facility fires.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectPattern {
    ModeChannel,
    ModeChannelBan,
    ModeChannelBanException,
    ModeChannelInvite,
    ModeUser,
    Ison,
    List,
    Time,
    Userhost,
    Names,
    Topic,
    Who,
    Whois,
    Whowas,
}

impl RedirectPattern {
    pub fn as_str(self) -> &'static str {
        match self {
            RedirectPattern::ModeChannel => "mode_channel",
            RedirectPattern::ModeChannelBan => "mode_channel_ban",
            RedirectPattern::ModeChannelBanException => "mode_channel_ban_exception",
            RedirectPattern::ModeChannelInvite => "mode_channel_invite",
            RedirectPattern::ModeUser => "mode_user",
            RedirectPattern::Ison => "ison",
            RedirectPattern::List => "list",
            RedirectPattern::Time => "time",
            RedirectPattern::Userhost => "userhost",
            RedirectPattern::Names => "names",
            RedirectPattern::Topic => "topic",
            RedirectPattern::Who => "who",
            RedirectPattern::Whois => "whois",
            RedirectPattern::Whowas => "whowas",
        }
    }
}

/// `MODE <chan|nick> [<arg>]`: picks one of the five mode sub-patterns
/// depending on whether the target is a channel and, if so, on the
/// optional argument's leading character (`+b`/`-b` ban list, `+I`/`-I`
/// invite list, otherwise a plain channel-mode change).
pub fn mode_pattern(target: &str, arg: Option<&str>, is_channel: bool) -> RedirectPattern {
    if !is_channel {
        return RedirectPattern::ModeUser;
    }
    match arg {
        Some(a) if a.contains('b') => RedirectPattern::ModeChannelBan,
        Some(a) if a.contains('e') => RedirectPattern::ModeChannelBanException,
        Some(a) if a.contains('I') => RedirectPattern::ModeChannelInvite,
        _ => RedirectPattern::ModeChannel,
    }
}

/// Maps a bare client command (already upper-cased) to its redirection
/// pattern and the `string` payload the host records alongside it, for
/// every command in §4.8's table other than `MODE` (handled by
/// `mode_pattern` since it needs the channel-ness of its target).
pub fn pattern_for_command(command: &str, target: &str) -> Option<(RedirectPattern, String)> {
    let pattern = match command {
        "ISON" => RedirectPattern::Ison,
        "LIST" => RedirectPattern::List,
        "TIME" => RedirectPattern::Time,
        "USERHOST" => RedirectPattern::Userhost,
        "NAMES" => RedirectPattern::Names,
        "TOPIC" => RedirectPattern::Topic,
        "WHO" => RedirectPattern::Who,
        "WHOIS" => RedirectPattern::Whois,
        "WHOWAS" => RedirectPattern::Whowas,
        _ => return None,
    };
    Some((pattern, target.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_on_nick_is_mode_user() {
        assert_eq!(mode_pattern("alice", None, false), RedirectPattern::ModeUser);
    }

    #[test]
    fn mode_ban_arg_picks_ban_pattern() {
        assert_eq!(
            mode_pattern("#test", Some("+b"), true),
            RedirectPattern::ModeChannelBan
        );
    }

    #[test]
    fn plain_channel_mode_has_no_special_arg() {
        assert_eq!(
            mode_pattern("#test", Some("+m"), true),
            RedirectPattern::ModeChannel
        );
    }

    #[test]
    fn whois_maps_to_lower_cased_pattern_name() {
        let (pattern, target) = pattern_for_command("WHOIS", "bob").unwrap();
        assert_eq!(pattern.as_str(), "whois");
        assert_eq!(target, "bob");
    }

    #[test]
    fn unknown_command_has_no_pattern() {
        assert!(pattern_for_command("FOOBAR", "x").is_none());
    }
}
