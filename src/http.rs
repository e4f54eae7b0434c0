//! Minimal incremental HTTP/1.1 request parser (§4.5).
//!
//! Used both during the WebSocket upgrade handshake and, in full, by the
//! sibling `api-http` protocol. No chunked transfer encoding; completion is
//! determined purely by `Content-Length` (absence means a bodyless
//! request).

use std::collections::HashMap;

use crate::error::FramingError;

#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub method: String,
    /// Path including any query string, unparsed.
    pub path: String,
    pub version: String,
    /// Header names are stored lower-cased; lookups are case-insensitive.
    headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn header_eq_ignore_case(&self, name: &str, value: &str) -> bool {
        self.header(name)
            .map_or(false, |v| v.eq_ignore_ascii_case(value))
    }
}

/// Accumulates bytes across reads until a full request (headers + body) is
/// available.
#[derive(Default)]
pub struct HttpRequestParser {
    buf: Vec<u8>,
}

enum ParseState {
    NeedMoreHeaders,
    Complete(HttpRequest, usize),
}

impl HttpRequestParser {
    pub fn new() -> Self {
        HttpRequestParser { buf: Vec::new() }
    }

    /// Feeds bytes in; returns `Some(request)` (and consumes the bytes that
    /// made it up, retaining any trailing leftover for the next request)
    /// once a complete request has been accumulated.
    pub fn feed(&mut self, data: &[u8]) -> Result<Option<HttpRequest>, FramingError> {
        self.buf.extend_from_slice(data);
        match self.try_parse()? {
            ParseState::NeedMoreHeaders => Ok(None),
            ParseState::Complete(request, consumed) => {
                self.buf.drain(..consumed);
                Ok(Some(request))
            }
        }
    }

    fn try_parse(&self) -> Result<ParseState, FramingError> {
        let header_end = match find_subslice(&self.buf, b"\r\n\r\n") {
            Some(pos) => pos + 4,
            None => return Ok(ParseState::NeedMoreHeaders),
        };

        let head = &self.buf[..header_end - 4];
        let head_str = std::str::from_utf8(head)
            .map_err(|e| FramingError::MalformedHttp(e.to_string()))?;
        let mut lines = head_str.split("\r\n");
        let request_line = lines
            .next()
            .ok_or_else(|| FramingError::MalformedHttp("missing request line".to_string()))?;
        let mut parts = request_line.splitn(3, ' ');
        let method = parts
            .next()
            .ok_or_else(|| FramingError::MalformedHttp("missing method".to_string()))?
            .to_string();
        let path = parts
            .next()
            .ok_or_else(|| FramingError::MalformedHttp("missing path".to_string()))?
            .to_string();
        let version = parts.next().unwrap_or("HTTP/1.1").to_string();

        let mut headers = HashMap::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let mut kv = line.splitn(2, ':');
            let key = kv
                .next()
                .ok_or_else(|| FramingError::MalformedHttp("malformed header".to_string()))?
                .trim()
                .to_ascii_lowercase();
            let value = kv.next().unwrap_or("").trim().to_string();
            headers.insert(key, value);
        }

        let content_length: usize = headers
            .get("content-length")
            .map(|v| {
                v.parse()
                    .map_err(|_| FramingError::MalformedHttp("bad content-length".to_string()))
            })
            .transpose()?
            .unwrap_or(0);

        let total_needed = header_end + content_length;
        if self.buf.len() < total_needed {
            return Ok(ParseState::NeedMoreHeaders);
        }

        let body = self.buf[header_end..total_needed].to_vec();
        Ok(ParseState::Complete(
            HttpRequest {
                method,
                path,
                version,
                headers,
                body,
            },
            total_needed,
        ))
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_get() {
        let mut parser = HttpRequestParser::new();
        let req = parser
            .feed(b"GET /weechat HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/weechat");
        assert!(req.header_eq_ignore_case("upgrade", "websocket"));
    }

    #[test]
    fn waits_for_body() {
        let mut parser = HttpRequestParser::new();
        assert!(parser
            .feed(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhel")
            .unwrap()
            .is_none());
        let req = parser.feed(b"lo").unwrap().unwrap();
        assert_eq!(req.body, b"hello");
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut parser = HttpRequestParser::new();
        let req = parser
            .feed(b"GET / HTTP/1.1\r\nCONNECTION: Upgrade\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(req.header_eq_ignore_case("connection", "upgrade"));
    }
}
