//! Merges raw bytes into line-delimited text, multi-line messages, or
//! binary frames, and feeds the correct upper protocol (§4.3).
//!
//! Transport-agnostic: the same splitting logic runs whether `feed` is
//! called with bytes straight off a raw socket, or with the payload of an
//! already-decoded WebSocket data frame — matching the design's "upper
//! protocol's inbound data type keeps its original meaning".

use crate::error::FramingError;
use crate::http::{HttpRequest, HttpRequestParser};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    TextLine,
    TextMultiline,
    Binary,
    Http,
}

#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// One complete, CRLF/LF-stripped line (text-line mode).
    Line(Vec<u8>),
    /// One complete transport-delimited unit (text-multiline or binary
    /// mode).
    Message(Vec<u8>),
    /// A complete HTTP request on an `api-http` listener.
    Http(HttpRequest),
    /// A complete HTTP GET that satisfies the WebSocket upgrade criteria;
    /// caller performs admission/origin checks and calls
    /// `Framer::complete_websocket_upgrade`.
    WebSocketUpgradeRequest(HttpRequest),
}

enum Mode {
    /// Haven't yet decided whether this connection is raw protocol bytes or
    /// an HTTP request that might upgrade to WebSocket.
    Peeking(Vec<u8>),
    Plain,
    WebSocketInitializing(HttpRequestParser),
}

/// Per-connection framing state machine (§3 "Buffers": partial inbound text
/// buffer, §4.3).
pub struct Framer {
    data_type: DataType,
    mode: Mode,
    line_partial: Vec<u8>,
    http_parser: HttpRequestParser,
}

impl Framer {
    pub fn new(data_type: DataType) -> Self {
        let mode = if data_type == DataType::Http {
            Mode::Plain
        } else {
            Mode::Peeking(Vec::new())
        };
        Framer {
            data_type,
            mode,
            line_partial: Vec::new(),
            http_parser: HttpRequestParser::new(),
        }
    }

    /// Call once the caller has validated a peeked `WebSocketUpgradeRequest`
    /// and sent the 101 response; subsequent `feed()` calls are expected to
    /// receive *decoded websocket frame payloads*, not raw socket bytes.
    pub fn complete_websocket_upgrade(&mut self) {
        self.mode = Mode::Plain;
    }

    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<FeedEvent>, FramingError> {
        match &mut self.mode {
            Mode::Peeking(buf) => {
                buf.extend_from_slice(data);
                if buf.len() < 4 && !looks_decided(buf) {
                    return Ok(Vec::new());
                }
                if buf.starts_with(b"GET ") {
                    let pending = std::mem::replace(buf, Vec::new());
                    let mut parser = HttpRequestParser::new();
                    let events = match parser.feed(&pending)? {
                        Some(request) => vec![FeedEvent::WebSocketUpgradeRequest(request)],
                        None => Vec::new(),
                    };
                    self.mode = Mode::WebSocketInitializing(parser);
                    Ok(events)
                } else {
                    let pending = std::mem::replace(buf, Vec::new());
                    self.mode = Mode::Plain;
                    self.continue_feed(&pending)
                }
            }
            Mode::WebSocketInitializing(_) | Mode::Plain => self.continue_feed(data),
        }
    }

    fn continue_feed(&mut self, data: &[u8]) -> Result<Vec<FeedEvent>, FramingError> {
        match &mut self.mode {
            Mode::Peeking(_) => unreachable!("resolved before continue_feed"),
            Mode::WebSocketInitializing(parser) => {
                if let Some(request) = parser.feed(data)? {
                    return Ok(vec![FeedEvent::WebSocketUpgradeRequest(request)]);
                }
                Ok(Vec::new())
            }
            Mode::Plain => match self.data_type {
                DataType::Http => {
                    let mut events = Vec::new();
                    if let Some(request) = self.http_parser.feed(data)? {
                        events.push(FeedEvent::Http(request));
                    }
                    Ok(events)
                }
                DataType::TextLine => {
                    self.line_partial.extend_from_slice(data);
                    let mut events = Vec::new();
                    while let Some(pos) = self.line_partial.iter().position(|&b| b == b'\n') {
                        let mut line: Vec<u8> = self.line_partial.drain(..=pos).collect();
                        line.pop(); // trailing \n
                        if line.last() == Some(&b'\r') {
                            line.pop();
                        }
                        events.push(FeedEvent::Line(line));
                    }
                    Ok(events)
                }
                DataType::TextMultiline | DataType::Binary => {
                    if data.is_empty() {
                        Ok(Vec::new())
                    } else {
                        Ok(vec![FeedEvent::Message(data.to_vec())])
                    }
                }
            },
        }
    }
}

fn looks_decided(buf: &[u8]) -> bool {
    // A non-GET first byte already tells us this isn't an HTTP request
    // line; no need to wait for more bytes.
    !buf.is_empty() && buf[0] != b'G'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_text_lines_across_reads() {
        let mut framer = Framer::new(DataType::TextLine);
        let mut events = framer.feed(b"PASS sec").unwrap();
        assert!(events.is_empty());
        events = framer.feed(b"ret\r\nNICK a").unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            FeedEvent::Line(line) => assert_eq!(line, b"PASS secret"),
            _ => panic!("expected line"),
        }
    }

    #[test]
    fn lf_only_terminator_accepted() {
        let mut framer = Framer::new(DataType::TextLine);
        let events = framer.feed(b"PING :1\n").unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            FeedEvent::Line(line) => assert_eq!(line, b"PING :1"),
            _ => panic!("expected line"),
        }
    }

    #[test]
    fn detects_websocket_upgrade_request() {
        let mut framer = Framer::new(DataType::TextLine);
        let events = framer
            .feed(b"GET /weechat HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: x\r\n\r\n")
            .unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            FeedEvent::WebSocketUpgradeRequest(req) => assert_eq!(req.path, "/weechat"),
            _ => panic!("expected upgrade request"),
        }
    }

    #[test]
    fn non_http_bytes_stay_in_plain_mode() {
        let mut framer = Framer::new(DataType::TextLine);
        let events = framer.feed(b"PASS secret\r\n").unwrap();
        assert_eq!(events.len(), 1);
    }
}
