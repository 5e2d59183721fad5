//! HTTP/1.x message parsing over a reassembled byte stream
//!
//! A message is read in two steps. [`parse_request_head`] and
//! [`parse_response_head`] parse the start line and headers off the front
//! of the buffered bytes and report how the body is framed. A
//! [`BodyDecoder`] then walks the body as it arrives, counting payload bytes
//! and handing the rest back to be discarded, so bodies are never retained.

use crate::error::{DecodeError, DecodeResult};
use ::http::{Method, StatusCode};
use std::collections::HashMap;

const MAX_HEADERS: usize = 96;

/// Longest chunk-size or trailer line accepted before the framing is
/// declared invalid
const MAX_FRAMING_LINE: usize = 8 * 1024;

/// Longest status line looked at when guessing whether a response body is
/// really the next response
const MAX_STATUS_LINE: usize = 1024;

/// Result of one parse attempt
#[derive(Debug)]
pub enum Parsed<T> {
    Complete { message: T, consumed: usize },
    /// More bytes are needed
    Partial,
}

/// Parsed HTTP request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub uri: String,
    /// Minor version of HTTP/1.x
    pub version: u8,
    /// Header names lowercased
    pub headers: HashMap<String, String>,
    /// Body size after removing transfer framing
    pub body_len: u64,
}

/// Parsed HTTP response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub version: u8,
    /// Header names lowercased
    pub headers: HashMap<String, String>,
    /// Body size after removing transfer framing
    pub body_len: u64,
}

impl HttpResponse {
    /// Body size once the request is known. Responses to HEAD never carry
    /// a body.
    pub fn resolve_body_len(&self, request: &HttpRequest) -> u64 {
        if request.method == Method::HEAD {
            0
        } else {
            self.body_len
        }
    }

    /// 1xx responses precede the final response to the same request
    pub fn is_interim(&self) -> bool {
        (100..200).contains(&self.status)
    }
}

/// How a message body is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// No body
    Empty,
    Length(u64),
    Chunked,
    /// Body runs until the connection closes
    UntilClose,
}

impl Framing {
    pub fn has_body(self) -> bool {
        !matches!(self, Framing::Empty | Framing::Length(0))
    }
}

/// A message head with the framing of the body that follows it
#[derive(Debug)]
pub struct Head<T> {
    pub message: T,
    pub framing: Framing,
}

fn header_map(headers: &[httparse::Header<'_>]) -> HashMap<String, String> {
    let mut map = HashMap::with_capacity(headers.len());
    for header in headers {
        let value = String::from_utf8_lossy(header.value).trim().to_string();
        map.entry(header.name.to_ascii_lowercase())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    map
}

fn framing(headers: &HashMap<String, String>) -> DecodeResult<Framing> {
    if let Some(te) = headers.get(::http::header::TRANSFER_ENCODING.as_str()) {
        let last = te.rsplit(',').next().unwrap_or("").trim();
        if last.eq_ignore_ascii_case("chunked") {
            return Ok(Framing::Chunked);
        }
    }
    match headers.get(::http::header::CONTENT_LENGTH.as_str()) {
        Some(value) => parse_content_length(value).map(Framing::Length),
        None => Ok(Framing::UntilClose),
    }
}

/// Repeated Content-Length headers are joined with ", "; they must agree
fn parse_content_length(value: &str) -> DecodeResult<u64> {
    let mut parsed = None;
    for part in value.split(',') {
        let len: u64 = part
            .trim()
            .parse()
            .map_err(|_| DecodeError::InvalidContentLength(value.to_string()))?;
        match parsed {
            Some(prev) if prev != len => {
                return Err(DecodeError::InvalidContentLength(value.to_string()))
            }
            _ => parsed = Some(len),
        }
    }
    parsed.ok_or_else(|| DecodeError::InvalidContentLength(value.to_string()))
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_chunk_size(line: &[u8]) -> DecodeResult<u64> {
    let size_text = line.split(|b| *b == b';').next().unwrap_or(line);
    let size_text = std::str::from_utf8(size_text)
        .map_err(|_| DecodeError::InvalidChunk("chunk size is not ASCII"))?
        .trim();
    u64::from_str_radix(size_text, 16)
        .map_err(|_| DecodeError::InvalidChunk("chunk size is not hexadecimal"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyState {
    /// Bytes left of a Content-Length body
    Length(u64),
    UntilClose,
    ChunkSize,
    /// Bytes left of the current chunk
    ChunkData(u64),
    ChunkDataEnd,
    Trailer,
    Done,
}

/// Incremental walk over one message body.
///
/// Only framing lines ever need to be buffered; payload bytes are counted
/// and reported as consumed as soon as they are seen.
#[derive(Debug, Clone)]
pub struct BodyDecoder {
    state: BodyState,
    decoded: u64,
}

impl BodyDecoder {
    pub fn new(framing: Framing) -> Self {
        let state = match framing {
            Framing::Empty | Framing::Length(0) => BodyState::Done,
            Framing::Length(len) => BodyState::Length(len),
            Framing::Chunked => BodyState::ChunkSize,
            Framing::UntilClose => BodyState::UntilClose,
        };
        Self { state, decoded: 0 }
    }

    /// Payload bytes seen so far
    pub fn decoded(&self) -> u64 {
        self.decoded
    }

    pub fn is_done(&self) -> bool {
        self.state == BodyState::Done
    }

    /// The stream has ended. Close-delimited bodies complete here; returns
    /// whether the body is complete.
    pub fn finish(&mut self) -> bool {
        if self.state == BodyState::UntilClose {
            self.state = BodyState::Done;
        }
        self.is_done()
    }

    /// Walk as much of the body as `buf` holds. Returns the number of bytes
    /// belonging to this body, which the caller may discard.
    pub fn feed(&mut self, buf: &[u8]) -> DecodeResult<usize> {
        let mut pos = 0;
        loop {
            let rest = &buf[pos..];
            match self.state {
                BodyState::Done => break,
                BodyState::UntilClose => {
                    self.decoded += rest.len() as u64;
                    pos = buf.len();
                    break;
                }
                BodyState::Length(remaining) | BodyState::ChunkData(remaining) => {
                    let n = remaining.min(rest.len() as u64);
                    self.decoded += n;
                    pos += n as usize;
                    let left = remaining - n;
                    self.state = match (self.state, left) {
                        (BodyState::Length(_), 0) => BodyState::Done,
                        (BodyState::Length(_), left) => BodyState::Length(left),
                        (_, 0) => BodyState::ChunkDataEnd,
                        (_, left) => BodyState::ChunkData(left),
                    };
                    if left > 0 {
                        break;
                    }
                }
                BodyState::ChunkSize => {
                    let Some(end) = find_crlf(rest) else {
                        if rest.len() > MAX_FRAMING_LINE {
                            return Err(DecodeError::InvalidChunk("chunk size line too long"));
                        }
                        break;
                    };
                    let size = parse_chunk_size(&rest[..end])?;
                    pos += end + 2;
                    self.state = if size == 0 {
                        BodyState::Trailer
                    } else {
                        BodyState::ChunkData(size)
                    };
                }
                BodyState::ChunkDataEnd => {
                    if rest.len() < 2 {
                        break;
                    }
                    if &rest[..2] != b"\r\n" {
                        return Err(DecodeError::InvalidChunk("missing CRLF after chunk data"));
                    }
                    pos += 2;
                    self.state = BodyState::ChunkSize;
                }
                BodyState::Trailer => {
                    let Some(end) = find_crlf(rest) else {
                        if rest.len() > MAX_FRAMING_LINE {
                            return Err(DecodeError::InvalidChunk("trailer line too long"));
                        }
                        break;
                    };
                    pos += end + 2;
                    if end == 0 {
                        self.state = BodyState::Done;
                    }
                }
            }
        }
        Ok(pos)
    }
}

/// Parse one request head from the front of `buf`. Requests without
/// framing headers have no body.
pub fn parse_request_head(buf: &[u8]) -> DecodeResult<Parsed<Head<HttpRequest>>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let consumed = match req.parse(buf)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(Parsed::Partial),
    };

    let method_text = req.method.unwrap_or_default();
    let method = Method::from_bytes(method_text.as_bytes())
        .map_err(|_| DecodeError::InvalidMethod(method_text.to_string()))?;
    let headers = header_map(req.headers);
    let framing = match framing(&headers)? {
        Framing::UntilClose => Framing::Empty,
        framing => framing,
    };

    Ok(Parsed::Complete {
        message: Head {
            message: HttpRequest {
                method,
                uri: req.path.unwrap_or_default().to_string(),
                version: req.version.unwrap_or(1),
                headers,
                body_len: 0,
            },
            framing,
        },
        consumed,
    })
}

/// Parse one response head from the front of `buf`.
///
/// 1xx, 204 and 304 responses have no body. Whether any other body is
/// present still depends on the request method.
pub fn parse_response_head(buf: &[u8]) -> DecodeResult<Parsed<Head<HttpResponse>>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    let consumed = match resp.parse(buf)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(Parsed::Partial),
    };

    let code = resp.code.unwrap_or_default();
    let status = StatusCode::from_u16(code).map_err(|_| DecodeError::InvalidStatus(code))?;
    let headers = header_map(resp.headers);
    let framing = if status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        Framing::Empty
    } else {
        framing(&headers)?
    };

    Ok(Parsed::Complete {
        message: Head {
            message: HttpResponse {
                status: code,
                reason: resp.reason.unwrap_or_default().to_string(),
                version: resp.version.unwrap_or(1),
                headers,
                body_len: 0,
            },
            framing,
        },
        consumed,
    })
}

/// Whether `line` is a complete HTTP/1.x status line
fn is_status_line(line: &[u8]) -> bool {
    let Some(rest) = line.strip_prefix(b"HTTP/1.") else {
        return false;
    };
    match rest {
        [minor, b' ', a, b, c, tail @ ..] => {
            matches!(minor, b'0' | b'1')
                && [a, b, c].iter().all(|d| d.is_ascii_digit())
                && (tail.is_empty() || tail[0] == b' ')
        }
        _ => false,
    }
}

/// Guess whether the bytes after a response head start the next response
/// rather than a body, for when the request method is not known.
///
/// `None` means more bytes are needed to tell.
pub fn starts_with_status_line(buf: &[u8], eof: bool) -> Option<bool> {
    const PREFIX: &[u8] = b"HTTP/1.";
    let seen = buf.len().min(PREFIX.len());
    if buf[..seen] != PREFIX[..seen] {
        return Some(false);
    }
    let window = &buf[..buf.len().min(MAX_STATUS_LINE)];
    match find_crlf(window) {
        Some(end) => Some(is_status_line(&window[..end])),
        None if eof || buf.len() >= MAX_STATUS_LINE => Some(false),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete<T>(parsed: Parsed<T>) -> (T, usize) {
        match parsed {
            Parsed::Complete { message, consumed } => (message, consumed),
            Parsed::Partial => panic!("expected a complete message"),
        }
    }

    /// Feed `body` to a decoder in pieces of `step` bytes, the way a stream
    /// worker does: unconsumed bytes are kept and extended.
    fn decode_in_steps(framing: Framing, body: &[u8], step: usize) -> (BodyDecoder, usize) {
        let mut decoder = BodyDecoder::new(framing);
        let mut pending = Vec::new();
        let mut consumed = 0;
        for piece in body.chunks(step) {
            pending.extend_from_slice(piece);
            let used = decoder.feed(&pending).unwrap();
            pending.drain(..used);
            consumed += used;
            if decoder.is_done() {
                break;
            }
        }
        (decoder, consumed)
    }

    #[test]
    fn test_request_head() {
        let raw = b"GET /a?b=1 HTTP/1.1\r\nHost: example\r\n\r\nGET /next";
        let (head, consumed) = complete(parse_request_head(raw).unwrap());
        assert_eq!(head.message.method, Method::GET);
        assert_eq!(head.message.uri, "/a?b=1");
        assert_eq!(head.message.version, 1);
        assert_eq!(
            head.message.headers.get("host").map(String::as_str),
            Some("example")
        );
        assert_eq!(head.framing, Framing::Empty);
        assert_eq!(&raw[consumed..], b"GET /next");
    }

    #[test]
    fn test_request_framing() {
        let raw = b"POST /u HTTP/1.1\r\nContent-Length: 5\r\n\r\nhel";
        let (head, consumed) = complete(parse_request_head(raw).unwrap());
        assert_eq!(head.framing, Framing::Length(5));
        assert_eq!(&raw[consumed..], b"hel");

        let raw = b"POST /u HTTP/1.1\r\nTransfer-Encoding: gzip, chunked\r\n\r\n";
        let (head, _) = complete(parse_request_head(raw).unwrap());
        assert_eq!(head.framing, Framing::Chunked);
    }

    #[test]
    fn test_partial_head() {
        assert!(matches!(
            parse_request_head(b"GET / HTTP/1.1\r\nHo").unwrap(),
            Parsed::Partial
        ));
        assert!(matches!(
            parse_response_head(b"HTTP/1.1 200").unwrap(),
            Parsed::Partial
        ));
    }

    #[test]
    fn test_malformed() {
        assert!(parse_request_head(b"\x00\x01garbage\r\n\r\n").is_err());
        assert!(matches!(
            parse_request_head(b"GET / HTTP/1.1\r\nContent-Length: x\r\n\r\n"),
            Err(DecodeError::InvalidContentLength(_))
        ));
        assert!(matches!(
            parse_request_head(b"GET / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n"),
            Err(DecodeError::InvalidContentLength(_))
        ));
    }

    #[test]
    fn test_response_head() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nbody";
        let (head, consumed) = complete(parse_response_head(raw).unwrap());
        assert_eq!(head.message.status, 200);
        assert_eq!(head.message.reason, "OK");
        assert_eq!(head.framing, Framing::Length(4));
        assert_eq!(&raw[consumed..], b"body");

        let (head, _) = complete(parse_response_head(b"HTTP/1.0 200 OK\r\n\r\n").unwrap());
        assert_eq!(head.message.version, 0);
        assert_eq!(head.framing, Framing::UntilClose);
    }

    #[test]
    fn test_response_without_body_status() {
        for status in ["204 No Content", "304 Not Modified", "100 Continue"] {
            let raw = format!("HTTP/1.1 {status}\r\nContent-Length: 10\r\n\r\n");
            let (head, consumed) = complete(parse_response_head(raw.as_bytes()).unwrap());
            assert_eq!(head.framing, Framing::Empty);
            assert!(!head.framing.has_body());
            assert_eq!(consumed, raw.len());
        }
    }

    #[test]
    fn test_resolve_body_len_for_head() {
        let (req, _) = complete(parse_request_head(b"HEAD / HTTP/1.1\r\n\r\n").unwrap());
        let (mut resp, _) = complete(
            parse_response_head(b"HTTP/1.1 200 OK\r\nContent-Length: 42\r\n\r\n").unwrap(),
        );
        resp.message.body_len = 42;
        assert_eq!(resp.message.resolve_body_len(&req.message), 0);
    }

    #[test]
    fn test_length_body_is_not_retained() {
        let body = b"0123456789NEXT";
        let (decoder, consumed) = decode_in_steps(Framing::Length(10), body, 3);
        assert!(decoder.is_done());
        assert_eq!(decoder.decoded(), 10);
        assert_eq!(consumed, 10);
    }

    #[test]
    fn test_chunked_body_in_pieces() {
        let body = b"4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\nX-Trailer: 1\r\n\r\nHTTP/1.1";
        for step in [1, 2, 7, body.len()] {
            let (decoder, consumed) = decode_in_steps(Framing::Chunked, body, step);
            assert!(decoder.is_done(), "step {step}");
            assert_eq!(decoder.decoded(), 9);
            assert_eq!(&body[consumed..], b"HTTP/1.1");
        }
    }

    #[test]
    fn test_chunked_body_errors() {
        assert!(BodyDecoder::new(Framing::Chunked).feed(b"zz\r\n").is_err());
        assert!(BodyDecoder::new(Framing::Chunked)
            .feed(b"3\r\nabcXX")
            .is_err());

        let long_line = vec![b'1'; MAX_FRAMING_LINE + 1];
        assert!(BodyDecoder::new(Framing::Chunked).feed(&long_line).is_err());
    }

    #[test]
    fn test_truncated_bodies_at_end_of_stream() {
        let mut decoder = BodyDecoder::new(Framing::Length(100));
        assert_eq!(decoder.feed(b"abc").unwrap(), 3);
        assert!(!decoder.finish());
        assert_eq!(decoder.decoded(), 3);

        let mut decoder = BodyDecoder::new(Framing::UntilClose);
        assert_eq!(decoder.feed(b"until").unwrap(), 5);
        assert_eq!(decoder.feed(b" close").unwrap(), 6);
        assert!(!decoder.is_done());
        assert!(decoder.finish());
        assert_eq!(decoder.decoded(), 11);
    }

    #[test]
    fn test_starts_with_status_line() {
        assert_eq!(
            starts_with_status_line(b"HTTP/1.1 404 Not Found\r\n", false),
            Some(true)
        );
        assert_eq!(starts_with_status_line(b"HTTP/1.0 200\r\n", false), Some(true));
        // A body that merely begins like a status line
        assert_eq!(
            starts_with_status_line(b"HTTP/1.1 is fun!!", false),
            None
        );
        assert_eq!(
            starts_with_status_line(b"HTTP/1.1 is fun!!\r\n", false),
            Some(false)
        );
        assert_eq!(starts_with_status_line(b"HTTP/1.1 is fun!!", true), Some(false));
        assert_eq!(starts_with_status_line(b"<html>", false), Some(false));
        assert_eq!(starts_with_status_line(b"HTT", false), None);
        assert_eq!(starts_with_status_line(b"", true), Some(false));
    }
}
