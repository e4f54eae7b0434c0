//! Ring of the last-N raw frames for a debug view (§3 "Raw message").

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Recv,
    Send,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Standard,
    Ping,
    Pong,
    Close,
}

#[derive(Debug, Clone)]
pub struct RawMessage {
    pub sec: i64,
    pub usec: i64,
    pub direction: Direction,
    pub kind: MessageKind,
    pub prefix: String,
    pub payload: Vec<u8>,
}

/// Bounded deque; oldest dropped on overflow, per the design note suggesting
/// a bounded deque rather than an intrusive linked list for this ring.
pub struct RawTrace {
    capacity: usize,
    messages: VecDeque<RawMessage>,
}

impl RawTrace {
    pub fn new(capacity: usize) -> Self {
        RawTrace {
            capacity,
            messages: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    pub fn push(&mut self, message: RawMessage) {
        if self.capacity == 0 {
            return;
        }
        if self.messages.len() >= self.capacity {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    pub fn iter(&self) -> impl Iterator<Item = &RawMessage> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(payload: &str) -> RawMessage {
        RawMessage {
            sec: 0,
            usec: 0,
            direction: Direction::Send,
            kind: MessageKind::Standard,
            prefix: String::new(),
            payload: payload.as_bytes().to_vec(),
        }
    }

    #[test]
    fn drops_oldest_on_overflow() {
        let mut trace = RawTrace::new(2);
        trace.push(msg("a"));
        trace.push(msg("b"));
        trace.push(msg("c"));
        let payloads: Vec<_> = trace
            .iter()
            .map(|m| String::from_utf8(m.payload.clone()).unwrap())
            .collect();
        assert_eq!(payloads, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn zero_capacity_discards_everything() {
        let mut trace = RawTrace::new(0);
        trace.push(msg("a"));
        assert!(trace.is_empty());
    }
}
