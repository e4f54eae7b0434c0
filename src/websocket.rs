//! RFC 6455 WebSocket codec: upgrade handshake, frame encode/decode, and
//! the `permessage-deflate` extension (RFC 7692) (§4.6).

use base64;
use byteorder::{BigEndian, ByteOrder};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use regex::Regex;
use sha1::Sha1;

use crate::error::FramingError;
use crate::http::HttpRequest;

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(GUID.as_bytes());
    base64::encode(&hasher.digest().bytes())
}

/// Negotiated `permessage-deflate` parameters (§3 "WebSocket deflate
/// context").
#[derive(Debug, Clone, Copy)]
pub struct DeflateParams {
    pub server_max_window_bits: u8,
    pub client_max_window_bits: u8,
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
}

impl Default for DeflateParams {
    fn default() -> Self {
        DeflateParams {
            server_max_window_bits: 15,
            client_max_window_bits: 15,
            server_no_context_takeover: false,
            client_no_context_takeover: false,
        }
    }
}

/// Parses the client's `Sec-WebSocket-Extensions` header and, if
/// `permessage-deflate` is offered with parameters we can honor, returns
/// the parameters to echo back in the 101 response.
pub fn negotiate_deflate(extensions_header: &str) -> Option<DeflateParams> {
    let mut found = false;
    let mut params = DeflateParams::default();
    for offer in extensions_header.split(',') {
        let mut tokens = offer.split(';').map(str::trim);
        let name = tokens.next()?;
        if !name.eq_ignore_ascii_case("permessage-deflate") {
            continue;
        }
        found = true;
        for token in tokens {
            let mut kv = token.splitn(2, '=');
            let key = kv.next().unwrap_or("").trim();
            let value = kv.next().map(|v| v.trim().trim_matches('"'));
            match key {
                "server_max_window_bits" => {
                    if let Some(bits) = value.and_then(|v| v.parse().ok()) {
                        params.server_max_window_bits = bits;
                    }
                }
                "client_max_window_bits" => {
                    if let Some(bits) = value.and_then(|v| v.parse().ok()) {
                        params.client_max_window_bits = bits;
                    }
                }
                "server_no_context_takeover" => params.server_no_context_takeover = true,
                "client_no_context_takeover" => params.client_no_context_takeover = true,
                _ => {}
            }
        }
    }
    if found {
        Some(params)
    } else {
        None
    }
}

pub struct UpgradeResponse {
    pub status_line: &'static str,
    pub headers: Vec<(String, String)>,
}

/// Builds the handshake response for a request that already matched the
/// upgrade criteria (§4.6). Callers are responsible for the preceding
/// `Upgrade`/`Connection`/version checks and the origin check.
pub fn build_upgrade_response(
    request: &HttpRequest,
    deflate: Option<DeflateParams>,
) -> Result<UpgradeResponse, FramingError> {
    let key = request
        .header("sec-websocket-key")
        .ok_or_else(|| FramingError::WebSocketProtocol("missing Sec-WebSocket-Key".to_string()))?;
    let mut headers = vec![
        ("Upgrade".to_string(), "websocket".to_string()),
        ("Connection".to_string(), "Upgrade".to_string()),
        ("Sec-WebSocket-Accept".to_string(), accept_key(key)),
    ];
    if let Some(params) = deflate {
        headers.push((
            "Sec-WebSocket-Extensions".to_string(),
            format!(
                "permessage-deflate; server_max_window_bits={}; client_max_window_bits={}{}{}",
                params.server_max_window_bits,
                params.client_max_window_bits,
                if params.server_no_context_takeover {
                    "; server_no_context_takeover"
                } else {
                    ""
                },
                if params.client_no_context_takeover {
                    "; client_no_context_takeover"
                } else {
                    ""
                },
            ),
        ));
    }
    Ok(UpgradeResponse {
        status_line: "HTTP/1.1 101 Switching Protocols",
        headers,
    })
}

/// The fixed rejection response for a failed origin check.
pub fn forbidden_response() -> UpgradeResponse {
    UpgradeResponse {
        status_line: "HTTP/1.1 403 Forbidden",
        headers: vec![("Connection".to_string(), "close".to_string())],
    }
}

impl UpgradeResponse {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("{}\r\n", self.status_line).into_bytes();
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Origin check (§4.6): if `allowed_origins` is configured, the `Origin`
/// header must match it, or the upgrade is refused with a 403-class
/// response.
pub fn origin_allowed(request: &HttpRequest, allowed_origins: Option<&Regex>) -> bool {
    match allowed_origins {
        None => true,
        Some(re) => request.header("origin").map_or(false, |o| re.is_match(o)),
    }
}

pub fn looks_like_upgrade(request: &HttpRequest) -> bool {
    request.header_eq_ignore_case("upgrade", "websocket")
        && request
            .header("connection")
            .map_or(false, |c| c.to_ascii_lowercase().contains("upgrade"))
        && request.header_eq_ignore_case("sec-websocket-version", "13")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Inflate side of a negotiated `permessage-deflate` context (§3
/// "WebSocket deflate context": "separate deflate and inflate streams").
struct InflateState {
    decompress: Decompress,
    no_context_takeover: bool,
}

/// Deflate side of a negotiated `permessage-deflate` context.
struct DeflateState {
    compress: Compress,
    no_context_takeover: bool,
}

/// Assembles raw bytes from the client into complete WebSocket messages.
/// Client frames must be masked (§4.6); an unmasked frame is a fatal
/// protocol error.
pub struct FrameDecoder {
    leftover: Vec<u8>,
    assembling: Option<(Opcode, bool, Vec<u8>)>, // (opcode, compressed, payload so far)
    inflate: Option<InflateState>,
}

impl FrameDecoder {
    pub fn has_deflate_context(&self) -> bool {
        self.inflate.is_some()
    }

    pub fn new(deflate: Option<DeflateParams>) -> Self {
        FrameDecoder {
            leftover: Vec::new(),
            assembling: None,
            inflate: deflate.map(|params| InflateState {
                decompress: Decompress::new(false),
                no_context_takeover: params.client_no_context_takeover,
            }),
        }
    }

    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<DecodedFrame>, FramingError> {
        self.leftover.extend_from_slice(data);
        let mut out = Vec::new();
        loop {
            match self.try_decode_one()? {
                Some(frame) => out.push(frame),
                None => break,
            }
        }
        Ok(out)
    }

    fn try_decode_one(&mut self) -> Result<Option<DecodedFrame>, FramingError> {
        loop {
            let raw = match parse_raw_frame(&self.leftover)? {
                Some((raw, consumed)) => {
                    self.leftover.drain(..consumed);
                    raw
                }
                None => return Ok(None),
            };

            if is_control_opcode(raw.opcode_bits) {
                let opcode = match raw.opcode_bits {
                    0x8 => Opcode::Close,
                    0x9 => Opcode::Ping,
                    0xA => Opcode::Pong,
                    _ => unreachable!(),
                };
                return Ok(Some(DecodedFrame {
                    opcode,
                    payload: raw.payload,
                }));
            }

            match raw.opcode_bits {
                0x0 => {
                    // continuation
                    let (opcode, compressed, mut buf) = self.assembling.take().ok_or_else(|| {
                        FramingError::WebSocketProtocol(
                            "continuation without initial frame".to_string(),
                        )
                    })?;
                    buf.extend_from_slice(&raw.payload);
                    if raw.fin {
                        let payload = self.finish_message(compressed, buf)?;
                        return Ok(Some(DecodedFrame { opcode, payload }));
                    } else {
                        self.assembling = Some((opcode, compressed, buf));
                    }
                }
                0x1 | 0x2 => {
                    let opcode = if raw.opcode_bits == 0x1 {
                        Opcode::Text
                    } else {
                        Opcode::Binary
                    };
                    if raw.fin {
                        let payload = self.finish_message(raw.rsv1, raw.payload)?;
                        return Ok(Some(DecodedFrame { opcode, payload }));
                    } else {
                        self.assembling = Some((opcode, raw.rsv1, raw.payload));
                    }
                }
                _ => {
                    return Err(FramingError::WebSocketProtocol(format!(
                        "unsupported opcode {}",
                        raw.opcode_bits
                    )))
                }
            }
        }
    }

    fn finish_message(&mut self, compressed: bool, mut payload: Vec<u8>) -> Result<Vec<u8>, FramingError> {
        if !compressed {
            return Ok(payload);
        }
        let state = self
            .inflate
            .as_mut()
            .ok_or_else(|| FramingError::WebSocketProtocol("RSV1 set without deflate".to_string()))?;
        payload.extend_from_slice(&DEFLATE_TAIL);
        let mut out = Vec::with_capacity(payload.len() * 3);
        let mut chunk = vec![0u8; 32 * 1024];
        let mut offset = 0;
        loop {
            let before_in = state.decompress.total_in();
            let before_out = state.decompress.total_out();
            let status = state
                .decompress
                .decompress(&payload[offset..], &mut chunk, FlushDecompress::Sync)
                .map_err(|e| FramingError::Inflate(e.to_string()))?;
            let produced = (state.decompress.total_out() - before_out) as usize;
            out.extend_from_slice(&chunk[..produced]);
            offset += (state.decompress.total_in() - before_in) as usize;
            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if offset >= payload.len() && produced == 0 {
                        break;
                    }
                }
            }
            if offset >= payload.len() {
                break;
            }
        }
        if state.no_context_takeover {
            state.decompress = Decompress::new(false);
        }
        Ok(out)
    }
}

fn is_control_opcode(opcode: u8) -> bool {
    opcode & 0x8 != 0
}

struct RawFrame {
    fin: bool,
    rsv1: bool,
    opcode_bits: u8,
    payload: Vec<u8>,
}

fn parse_raw_frame(buf: &[u8]) -> Result<Option<(RawFrame, usize)>, FramingError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let byte0 = buf[0];
    let byte1 = buf[1];
    let fin = byte0 & 0x80 != 0;
    let rsv1 = byte0 & 0x40 != 0;
    let opcode_bits = byte0 & 0x0F;
    let masked = byte1 & 0x80 != 0;
    let mut len = (byte1 & 0x7F) as u64;
    let mut pos = 2;

    if len == 126 {
        if buf.len() < pos + 2 {
            return Ok(None);
        }
        len = BigEndian::read_u16(&buf[pos..pos + 2]) as u64;
        pos += 2;
    } else if len == 127 {
        if buf.len() < pos + 8 {
            return Ok(None);
        }
        len = BigEndian::read_u64(&buf[pos..pos + 8]);
        pos += 8;
    }

    if !masked {
        return Err(FramingError::UnmaskedClientFrame);
    }
    if buf.len() < pos + 4 {
        return Ok(None);
    }
    let mask = [buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]];
    pos += 4;

    let len = len as usize;
    if buf.len() < pos + len {
        return Ok(None);
    }
    let mut payload = buf[pos..pos + len].to_vec();
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
    pos += len;

    Ok(Some((
        RawFrame {
            fin,
            rsv1,
            opcode_bits,
            payload,
        },
        pos,
    )))
}

/// Encodes server→client frames. Server frames are never masked (§4.6).
/// Holds the deflate compression context across messages so
/// `server_no_context_takeover` can reset it between messages when
/// negotiated.
pub struct FrameEncoder {
    deflate: Option<DeflateState>,
}

impl FrameEncoder {
    pub fn new(deflate: Option<DeflateParams>) -> Self {
        FrameEncoder {
            deflate: deflate.map(|params| DeflateState {
                compress: Compress::new(Compression::default(), false),
                no_context_takeover: params.server_no_context_takeover,
            }),
        }
    }

    /// Encodes one frame, choosing RSV1/compression when it helps (or at
    /// least doesn't hurt) for `TEXT`/`BINARY` opcodes; control frames are
    /// never compressed.
    pub fn encode(&mut self, opcode: Opcode, payload: &[u8]) -> Vec<u8> {
        let (rsv1, payload) = match opcode {
            Opcode::Text | Opcode::Binary if self.deflate.is_some() => {
                match self.compress_payload(payload) {
                    Some(compressed) if compressed.len() <= payload.len() => (true, compressed),
                    _ => (false, payload.to_vec()),
                }
            }
            _ => (false, payload.to_vec()),
        };

        let opcode_bits: u8 = match opcode {
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        };

        let mut out = Vec::with_capacity(payload.len() + 10);
        let byte0 = 0x80 | (if rsv1 { 0x40 } else { 0x00 }) | opcode_bits;
        out.push(byte0);

        let len = payload.len();
        if len < 126 {
            out.push(len as u8);
        } else if len <= 0xFFFF {
            out.push(126);
            let mut buf = [0u8; 2];
            BigEndian::write_u16(&mut buf, len as u16);
            out.extend_from_slice(&buf);
        } else {
            out.push(127);
            let mut buf = [0u8; 8];
            BigEndian::write_u64(&mut buf, len as u64);
            out.extend_from_slice(&buf);
        }
        out.extend_from_slice(&payload);
        out
    }

    fn compress_payload(&mut self, payload: &[u8]) -> Option<Vec<u8>> {
        let state = self.deflate.as_mut()?;
        let mut out = Vec::with_capacity(payload.len());
        let mut chunk = vec![0u8; 32 * 1024];
        let before_out = state.compress.total_out();
        let status = state
            .compress
            .compress(payload, &mut chunk, FlushCompress::Sync)
            .ok()?;
        let produced = (state.compress.total_out() - before_out) as usize;
        out.extend_from_slice(&chunk[..produced]);
        if status == Status::Ok || status == Status::StreamEnd || status == Status::BufError {
            if out.ends_with(&DEFLATE_TAIL) {
                out.truncate(out.len() - DEFLATE_TAIL.len());
            }
            if state.no_context_takeover {
                state.compress = Compress::new(Compression::default(), false);
            }
            Some(out)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
        let mask = [0x12, 0x34, 0x56, 0x78];
        let mut out = vec![0x80 | opcode];
        let len = payload.len();
        if len < 126 {
            out.push(0x80 | len as u8);
        } else {
            out.push(0x80 | 126);
            let mut buf = [0u8; 2];
            BigEndian::write_u16(&mut buf, len as u16);
            out.extend_from_slice(&buf);
        }
        out.extend_from_slice(&mask);
        for (i, b) in payload.iter().enumerate() {
            out.push(b ^ mask[i % 4]);
        }
        out
    }

    #[test]
    fn decodes_single_text_frame() {
        let mut decoder = FrameDecoder::new(None);
        let wire = mask_frame(0x1, b"hello");
        let frames = decoder.feed(&wire).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, Opcode::Text);
        assert_eq!(frames[0].payload, b"hello");
    }

    #[test]
    fn rejects_unmasked_frame() {
        let mut decoder = FrameDecoder::new(None);
        let wire = [0x81, 0x05, b'h', b'e', b'l', b'l', b'o'];
        let err = decoder.feed(&wire).unwrap_err();
        match err {
            FramingError::UnmaskedClientFrame => {}
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn assembles_fragmented_message() {
        let mut decoder = FrameDecoder::new(None);
        let mut first = mask_frame(0x1, b"hel");
        first[0] &= 0x7F; // clear FIN
        let mut second = mask_frame(0x0, b"lo");
        let mut wire = first;
        wire.extend_from_slice(&second);
        let frames = decoder.feed(&wire).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"hello");
        second.clear();
    }

    #[test]
    fn encode_is_never_masked() {
        let mut encoder = FrameEncoder::new(None);
        let frame = encoder.encode(Opcode::Text, b"hi");
        assert_eq!(frame[1] & 0x80, 0);
    }

    #[test]
    fn negotiates_deflate_window_bits() {
        let params = negotiate_deflate("permessage-deflate; client_max_window_bits=10").unwrap();
        assert_eq!(params.client_max_window_bits, 10);
    }
}
