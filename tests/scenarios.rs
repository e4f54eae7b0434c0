//! End-to-end scenarios driving `Connection` (and, for upstream-originated
//! traffic, the `IrcProxy` it owns) the way the real `io::Reactor` and host
//! application would, but entirely in memory against `FakeHost`.

use weechat_relay_core::config::{IdentityEval, RelayConfig};
use weechat_relay_core::connection::{Connection, ConnectionParams, ConnectionStatus};
use weechat_relay_core::host::{BacklogLine, ChannelInfo, ServerInfo};
use weechat_relay_core::irc::proxy::ProxyOutcome;
use weechat_relay_core::listener::Protocol;
use weechat_relay_core::FakeHost;

fn new_connection(server: &str) -> Connection {
    let log = slog::Logger::root(slog::Discard, slog::o!());
    Connection::new(
        ConnectionParams {
            id: 1,
            descriptor: "127.0.0.1:4567".to_string(),
            peer_address: "127.0.0.1".parse().unwrap(),
            real_ip: None,
            protocol: Protocol::Irc,
            irc_server: Some(server.to_string()),
            tls: false,
            is_http_upgrade_candidate: true,
            connect_time: 1000,
            nonce_size: 16,
        },
        "weechat.relay.irc".to_string(),
        log,
    )
}

/// Drains every queued outbound entry and returns the concatenated wire
/// bytes as text, the way a test client reading the socket would see them.
fn drain_outbound(conn: &mut Connection) -> String {
    let mut out = Vec::new();
    while !conn.outbound.is_empty() {
        let len = conn.outbound.front_mut().unwrap().bytes().len();
        out.extend_from_slice(conn.outbound.front_mut().unwrap().bytes());
        conn.record_write(len, 0, 0);
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn feed(conn: &mut Connection, host: &FakeHost, config: &RelayConfig, line: &str) -> ProxyOutcome {
    let eval = IdentityEval;
    conn.feed_inbound(
        format!("{}\r\n", line).as_bytes(),
        1000,
        config,
        host,
        &eval,
        900,
        1,
        1,
        None,
    )
    .unwrap()
}

#[test]
fn happy_irc_login_registers_and_sends_welcome_block() {
    let host = FakeHost::new();
    host.set_server(
        "libera",
        ServerInfo {
            is_connected: true,
            isupport: vec!["NETWORK=Libera.Chat".to_string()],
            channels: vec![ChannelInfo {
                name: "#weechat".to_string(),
                channel_type: '#',
                nicks: vec!["alice".to_string(), "bob".to_string()],
                topic: "Welcome to #weechat".to_string(),
            }],
            nick: "alice".to_string(),
            echo_message: false,
        },
    );

    let mut config = RelayConfig::default();
    config.password = "secret".to_string();

    let mut conn = new_connection("libera");
    conn.handshake_complete(true);
    assert_eq!(conn.status, ConnectionStatus::Authenticating);

    feed(&mut conn, &host, &config, "PASS secret");
    feed(&mut conn, &host, &config, "NICK alice");
    let outcome = feed(&mut conn, &host, &config, "USER alice 0 * :Alice Example");

    assert_eq!(outcome, ProxyOutcome::Registered);
    assert_eq!(conn.status, ConnectionStatus::Connected);

    let wire = drain_outbound(&mut conn);
    assert!(wire.contains(" 001 alice "), "missing welcome numeric: {}", wire);
    assert!(wire.contains(" 005 "), "missing isupport numeric: {}", wire);
    assert!(wire.contains(" 251 "), "missing luserclient numeric: {}", wire);
    assert!(wire.contains(" 422 "), "missing no-motd numeric: {}", wire);
    assert!(wire.contains("JOIN :#weechat"), "missing synthesized join: {}", wire);
    assert!(wire.contains(" 353 "), "missing names reply: {}", wire);
    assert!(wire.contains(" 366 "), "missing end-of-names: {}", wire);
}

#[test]
fn bad_password_fails_authentication_and_ends_connection() {
    let host = FakeHost::new();
    let mut config = RelayConfig::default();
    config.password = "secret".to_string();

    let mut conn = new_connection("libera");
    conn.handshake_complete(true);

    feed(&mut conn, &host, &config, "PASS wrong");
    feed(&mut conn, &host, &config, "NICK alice");
    let outcome = feed(&mut conn, &host, &config, "USER alice 0 * :Alice Example");

    assert_eq!(outcome, ProxyOutcome::AuthFailed);
    assert_eq!(conn.status, ConnectionStatus::AuthFailed);
    assert!(conn.status.has_ended());

    let wire = drain_outbound(&mut conn);
    assert!(wire.contains("ERROR"), "missing error line: {}", wire);
}

#[test]
fn cap_negotiation_enables_server_time_and_echo_message() {
    let host = FakeHost::new();
    host.set_server(
        "libera",
        ServerInfo {
            is_connected: true,
            isupport: vec![],
            channels: vec![],
            nick: "alice".to_string(),
            echo_message: true,
        },
    );
    let config = RelayConfig::default();
    let mut conn = new_connection("libera");
    conn.handshake_complete(false);

    feed(&mut conn, &host, &config, "CAP LS 302");
    feed(&mut conn, &host, &config, "NICK alice");
    feed(&mut conn, &host, &config, "USER alice 0 * :Alice Example");
    feed(&mut conn, &host, &config, "CAP REQ :server-time echo-message");
    let outcome = feed(&mut conn, &host, &config, "CAP END");

    assert_eq!(outcome, ProxyOutcome::Registered);
    let irc = conn.irc.as_ref().unwrap();
    assert!(irc.caps.contains(&weechat_relay_core::irc::proxy::Capability::ServerTime));
    assert!(irc.caps.contains(&weechat_relay_core::irc::proxy::Capability::EchoMessage));
}

#[test]
fn ping_is_answered_locally_without_touching_upstream() {
    let host = FakeHost::new();
    let config = RelayConfig::default();
    let mut conn = new_connection("libera");
    conn.handshake_complete(false);

    feed(&mut conn, &host, &config, "PING :123456");

    let wire = drain_outbound(&mut conn);
    assert!(wire.contains("PONG weechat.relay.irc :123456"), "{}", wire);
    assert!(host.sent_inputs.borrow().is_empty());
}

#[test]
fn own_channel_message_is_suppressed_by_loop_tag_and_replayed_without_it() {
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
    let config = RelayConfig::default();
    let mut conn = new_connection("libera");
    conn.handshake_complete(false);
    feed(&mut conn, &host, &config, "NICK alice");
    feed(&mut conn, &host, &config, "USER alice 0 * :Alice Example");
    drain_outbound(&mut conn);

    feed(&mut conn, &host, &config, "PRIVMSG #weechat :hello there");
    let sent = host.sent_inputs.borrow();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].3, conn.client_tag());
    drop(sent);

    let irc = conn.irc.as_mut().unwrap();
    let looped_back = irc.handle_upstream_outtags(
        ":alice!alice@weechat PRIVMSG #weechat :hello there",
        &[conn.client_tag()],
    );
    assert!(looped_back.is_empty());

    let from_elsewhere = irc.handle_upstream_outtags(
        ":alice!alice@weechat PRIVMSG #weechat :hello there",
        &["relay_client_99".to_string()],
    );
    assert!(from_elsewhere.is_empty(), "echo-message off but no self-echo expected without enabling it on a different client tag: {:?}", from_elsewhere);
}

#[test]
fn whois_is_forwarded_and_redirect_registered_then_replayed_on_completion() {
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
    let config = RelayConfig::default();
    let mut conn = new_connection("libera");
    conn.handshake_complete(false);
    feed(&mut conn, &host, &config, "NICK alice");
    feed(&mut conn, &host, &config, "USER alice 0 * :Alice Example");
    drain_outbound(&mut conn);

    feed(&mut conn, &host, &config, "WHOIS bob");

    assert_eq!(host.registered_redirects.borrow().len(), 1);
    let sent = host.sent_inputs.borrow();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].4, "WHOIS bob");
    drop(sent);

    let irc = conn.irc.as_ref().unwrap();
    let replayed = irc.handle_redirection_completion(
        ":weechat.relay.irc 311 alice bob ~bob host * :Bob\n:weechat.relay.irc 318 alice bob :End of /WHOIS list.",
    );
    assert_eq!(replayed.len(), 2);
    assert!(replayed[0].contains("311"));
    assert!(replayed[1].contains("318"));
}

#[test]
fn backlog_replay_on_join_respects_cutoff_and_emits_before_end_of_names() {
    let host = FakeHost::new();
    host.set_server(
        "libera",
        ServerInfo {
            is_connected: true,
            isupport: vec![],
            channels: vec![ChannelInfo {
                name: "#weechat".to_string(),
                channel_type: '#',
                nicks: vec!["alice".to_string()],
                topic: String::new(),
            }],
            nick: "alice".to_string(),
            echo_message: false,
        },
    );
    host.set_backlog(
        "libera",
        "#weechat",
        vec![BacklogLine {
            timestamp: 500,
            tags: vec!["irc_privmsg".to_string()],
            nick: "bob".to_string(),
            host: "b@h".to_string(),
            text: "missed this".to_string(),
        }],
    );

    let mut config = RelayConfig::default();
    config.backlog_max_number = 100;
    config.backlog_max_minutes = 60;

    let mut conn = new_connection("libera");
    conn.handshake_complete(false);
    feed(&mut conn, &host, &config, "NICK alice");
    feed(&mut conn, &host, &config, "USER alice 0 * :Alice Example");

    let wire = drain_outbound(&mut conn);
    let names_pos = wire.find(" 366 ").expect("end of names present");
    let backlog_pos = wire.find("missed this").expect("backlog line replayed");
    assert!(backlog_pos < names_pos, "backlog must replay before end-of-names: {}", wire);
}
