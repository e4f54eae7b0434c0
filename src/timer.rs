//! Timer kinds scheduled per connection or globally (§5).
//!
//! A small `Copy` enum plus a `slog::Value` impl so timers can be logged
//! without extra ceremony at call sites.

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub enum Timer {
    /// TLS handshake must complete before this fires (§4.2, fires 10Hz).
    TlsHandshake,
    /// Authentication must complete before this fires (§4.4).
    Auth,
    /// Drains the outbound queue when a previous write blocked (§4.7).
    OutboundRetry,
    /// One-second wall clock housekeeping tick (purge, timeouts).
    Housekeeping,
    /// Fires when a client held in a terminal state should be freed (§5).
    Purge,
}

impl slog::Value for Timer {
    fn serialize(
        &self,
        _record: &slog::Record,
        key: slog::Key,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{:?}", self))
    }
}
