//! FIFO outbound queue and the raw-trace "shadow" bookkeeping that makes
//! sure a logical message is traced exactly once even when the socket
//! write splits it across several `send(2)` calls (§3, §4.7, §8 "trace").

use std::collections::VecDeque;

use crate::raw_trace::MessageKind;

/// A pending raw-trace record attached to an outbound entry. Two of these
/// may be attached to one entry: e.g. the original IRC line (for display)
/// and its websocket-framed wire form (flagged binary), matching the
/// `raw_msg[2]` / `raw_flags[2]` pair `relay-client.c` carries per write.
#[derive(Debug, Clone)]
pub struct TraceShadow {
    pub msg_type: MessageKind,
    pub binary: bool,
    pub prefix: String,
    pub payload: Vec<u8>,
}

/// One queued outbound write. `bytes` shrinks from the front as partial
/// writes succeed; `shadows` are taken (and thus traced) the first time any
/// byte of this entry is transmitted.
pub struct OutboundEntry {
    bytes: Vec<u8>,
    shadows: [Option<TraceShadow>; 2],
}

impl OutboundEntry {
    pub fn new(bytes: Vec<u8>, shadows: [Option<TraceShadow>; 2]) -> Self {
        OutboundEntry { bytes, shadows }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Removes `n` transmitted bytes from the front. Returns the shadows if
    /// this is the first time bytes left this entry (`n > 0`); callers
    /// should trace them exactly once and discard on subsequent calls.
    pub fn advance(&mut self, n: usize) -> [Option<TraceShadow>; 2] {
        let taken = if n > 0 {
            [self.shadows[0].take(), self.shadows[1].take()]
        } else {
            [None, None]
        };
        self.bytes.drain(..n.min(self.bytes.len()));
        taken
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A connection's pending-write FIFO. Invariant (§3): sent in FIFO order;
/// a non-empty queue always has a registered retry timer (enforced by the
/// connection, not this type).
#[derive(Default)]
pub struct OutboundQueue {
    entries: VecDeque<OutboundEntry>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        OutboundQueue {
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, entry: OutboundEntry) {
        self.entries.push_back(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn front_mut(&mut self) -> Option<&mut OutboundEntry> {
        self.entries.front_mut()
    }

    /// Drops the front entry once fully drained.
    pub fn pop_front_if_drained(&mut self) {
        if self.entries.front().map_or(false, OutboundEntry::is_empty) {
            self.entries.pop_front();
        }
    }

    /// Drops every queued entry, discarding any untraced shadows (used on
    /// disconnect; §4.2 entering a terminal state drops the outbound queue).
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw_trace::MessageKind;

    fn shadow(payload: &str) -> TraceShadow {
        TraceShadow {
            msg_type: MessageKind::Standard,
            binary: false,
            prefix: String::new(),
            payload: payload.as_bytes().to_vec(),
        }
    }

    #[test]
    fn shadow_emitted_once_across_partial_writes() {
        let mut entry = OutboundEntry::new(b"hello world".to_vec(), [Some(shadow("hello world")), None]);
        let first = entry.advance(5);
        assert!(first[0].is_some());
        assert_eq!(entry.bytes(), b" world");
        let second = entry.advance(6);
        assert!(second[0].is_none());
        assert!(entry.is_empty());
    }

    #[test]
    fn fifo_ordering_preserved() {
        let mut q = OutboundQueue::new();
        q.push(OutboundEntry::new(b"a".to_vec(), [None, None]));
        q.push(OutboundEntry::new(b"b".to_vec(), [None, None]));
        assert_eq!(q.front_mut().unwrap().bytes(), b"a");
        q.front_mut().unwrap().advance(1);
        q.pop_front_if_drained();
        assert_eq!(q.front_mut().unwrap().bytes(), b"b");
    }
}
