//! Half-stream workers
//!
//! Each direction of a classified TCP connection gets its own task. The task
//! receives reassembled byte chunks, parses HTTP message heads off the front
//! of its buffer, counts and discards the bodies that follow, and sends the
//! messages on, tagged with the client address and the capture time of the
//! chunk holding the message's first byte.
//!
//! The request worker of a connection reports each request method to the
//! response worker, which needs it to frame replies to HEAD.

use crate::error::{DecodeError, DecodeResult};
use crate::http::{
    parse_request_head, parse_response_head, starts_with_status_line, BodyDecoder, Framing, Head,
    HttpRequest, HttpResponse, Parsed,
};
use ::http::Method;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Largest message head buffered before the stream is declared malformed
const MAX_HEAD: usize = 64 * 1024;

/// Response bytes buffered while waiting for the request method before
/// falling back to guessing
const METHOD_WAIT_LIMIT: usize = 64 * 1024;

/// Client address and port pairing a request with its response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationKey(pub SocketAddr);

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which side of the exchange a half-stream carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to server
    Request,
    /// Server to client
    Response,
}

/// In-order bytes from the reassembler
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub data: Vec<u8>,
    pub ts: DateTime<Utc>,
}

/// A parsed message with its correlation key and capture time
#[derive(Debug, Clone)]
pub struct Tagged<T> {
    pub key: CorrelationKey,
    pub ts: DateTime<Utc>,
    pub message: T,
}

/// Request methods of one connection, in request order
pub type MethodSender = mpsc::UnboundedSender<Method>;
pub type MethodReceiver = mpsc::UnboundedReceiver<Method>;

/// Channel carrying request methods from a request worker to the response
/// worker of the same connection
pub fn method_channel() -> (MethodSender, MethodReceiver) {
    mpsc::unbounded_channel()
}

/// Buffered view of one half-stream
struct StreamBuffer {
    direction: Direction,
    key: CorrelationKey,
    rx: mpsc::Receiver<StreamChunk>,
    buf: Vec<u8>,
    /// Absolute stream offset of `buf[0]`
    base: u64,
    /// (absolute offset, capture time) of each chunk still overlapping `buf`
    marks: VecDeque<(u64, DateTime<Utc>)>,
    eof: bool,
}

impl StreamBuffer {
    fn new(direction: Direction, key: CorrelationKey, rx: mpsc::Receiver<StreamChunk>) -> Self {
        Self {
            direction,
            key,
            rx,
            buf: Vec::new(),
            base: 0,
            marks: VecDeque::new(),
            eof: false,
        }
    }

    /// Wait for the next chunk. Returns false once the sender is gone.
    async fn fill(&mut self) -> bool {
        match self.rx.recv().await {
            Some(chunk) => {
                if !chunk.data.is_empty() {
                    let offset = self.base + self.buf.len() as u64;
                    self.marks.push_back((offset, chunk.ts));
                    self.buf.extend_from_slice(&chunk.data);
                }
                true
            }
            None => {
                self.eof = true;
                false
            }
        }
    }

    /// Capture time of the byte at the front of the buffer
    fn front_ts(&self) -> Option<DateTime<Utc>> {
        self.marks
            .iter()
            .take_while(|(offset, _)| *offset <= self.base)
            .last()
            .map(|(_, ts)| *ts)
    }

    fn consume(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.buf.drain(..n);
        self.base += n as u64;
        // Keep the mark covering the new front
        while self.marks.len() > 1 && self.marks[1].0 <= self.base {
            self.marks.pop_front();
        }
        if self.buf.is_empty() {
            self.marks.clear();
        }
    }

    /// Drop blank lines between messages
    fn skip_separators(&mut self) {
        let n = self
            .buf
            .iter()
            .take_while(|b| **b == b'\r' || **b == b'\n')
            .count();
        self.consume(n);
    }

    /// Parse the next message head, waiting for bytes as needed. `None`
    /// once the stream ends between messages or inside a head.
    async fn next_head<T>(
        &mut self,
        parse: fn(&[u8]) -> DecodeResult<Parsed<Head<T>>>,
    ) -> DecodeResult<Option<(Head<T>, DateTime<Utc>)>> {
        loop {
            self.skip_separators();
            if !self.buf.is_empty() {
                match parse(&self.buf)? {
                    Parsed::Complete { message, consumed } => {
                        let ts = self.front_ts().unwrap_or_else(Utc::now);
                        self.consume(consumed);
                        return Ok(Some((message, ts)));
                    }
                    Parsed::Partial if self.buf.len() > MAX_HEAD => {
                        return Err(DecodeError::HeadTooLarge(MAX_HEAD));
                    }
                    Parsed::Partial => {}
                }
            }
            if !self.fill().await {
                if !self.buf.is_empty() {
                    debug!(
                        "{:?} {}: {} trailing bytes do not form a message",
                        self.direction,
                        self.key,
                        self.buf.len()
                    );
                }
                return Ok(None);
            }
        }
    }

    /// Count and discard body bytes as they arrive. Returns whether the body
    /// completed before the stream ended.
    async fn drain_body(&mut self, body: &mut BodyDecoder) -> DecodeResult<bool> {
        loop {
            let used = body.feed(&self.buf)?;
            self.consume(used);
            if body.is_done() {
                return Ok(true);
            }
            if !self.fill().await {
                return Ok(body.finish());
            }
        }
    }
}

/// Methods of the requests on the other half of the connection, consumed
/// one per final response
struct RequestMethods {
    rx: Option<MethodReceiver>,
    /// Final responses already framed without their method
    owed: usize,
}

impl RequestMethods {
    fn new(rx: Option<MethodReceiver>) -> Self {
        Self { rx, owed: 0 }
    }

    fn skip(&mut self) {
        if self.rx.is_some() {
            self.owed += 1;
        }
    }

    /// Method of the request answered by the current response. `None` once
    /// the request side has gone away.
    async fn next(&mut self) -> Option<Method> {
        loop {
            let rx = self.rx.as_mut()?;
            let received = rx.recv().await;
            match received {
                Some(_) if self.owed > 0 => self.owed -= 1,
                Some(method) => return Some(method),
                None => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }
}

/// Decide whether the response whose head was just parsed answers a HEAD
/// request.
///
/// Input keeps flowing while waiting for the request side. When it has
/// gone away, or too much input piles up, the bytes after the head decide:
/// a complete status line there means the response had no body.
async fn answers_head(stream: &mut StreamBuffer, methods: &mut RequestMethods) -> bool {
    loop {
        if methods.rx.is_none() || stream.buf.len() >= METHOD_WAIT_LIMIT {
            if let Some(next_response) = starts_with_status_line(&stream.buf, stream.eof) {
                return next_response;
            }
            stream.fill().await;
            continue;
        }
        tokio::select! {
            method = methods.next() => {
                if let Some(method) = method {
                    return method == Method::HEAD;
                }
            }
            _ = stream.fill(), if !stream.eof => {}
        }
    }
}

/// Parse requests from a client-to-server half-stream until it ends.
/// Each request method is reported on `methods` as soon as its head is read.
pub async fn run_request_worker(
    key: CorrelationKey,
    rx: mpsc::Receiver<StreamChunk>,
    tx: mpsc::Sender<Tagged<HttpRequest>>,
    methods: Option<MethodSender>,
) -> DecodeResult<usize> {
    let mut stream = StreamBuffer::new(Direction::Request, key, rx);
    let mut sent = 0;

    while let Some((head, ts)) = stream.next_head(parse_request_head).await? {
        let Head {
            mut message,
            framing,
        } = head;
        if let Some(methods) = &methods {
            // The response side may be gone already
            let _ = methods.send(message.method.clone());
        }

        let mut body = BodyDecoder::new(framing);
        if !stream.drain_body(&mut body).await? {
            debug!(
                "Request {}: stream ended {} bytes into a body",
                key,
                body.decoded()
            );
            break;
        }
        message.body_len = body.decoded();

        if tx.send(Tagged { key, ts, message }).await.is_err() {
            debug!("Request {}: receiver closed", key);
            break;
        }
        sent += 1;
    }

    debug!("Request {}: stream finished, {} messages", key, sent);
    Ok(sent)
}

/// Parse responses from a server-to-client half-stream until it ends.
///
/// Interim 1xx responses are dropped. A response cut short by the end of
/// the stream is still sent with the body bytes seen.
pub async fn run_response_worker(
    key: CorrelationKey,
    rx: mpsc::Receiver<StreamChunk>,
    tx: mpsc::Sender<Tagged<HttpResponse>>,
    methods: Option<MethodReceiver>,
) -> DecodeResult<usize> {
    let mut stream = StreamBuffer::new(Direction::Response, key, rx);
    let mut methods = RequestMethods::new(methods);
    let mut sent = 0;

    while let Some((head, ts)) = stream.next_head(parse_response_head).await? {
        let Head {
            mut message,
            mut framing,
        } = head;
        if !message.is_interim() {
            if !framing.has_body() {
                methods.skip();
            } else if answers_head(&mut stream, &mut methods).await {
                framing = Framing::Empty;
            }
        }

        let mut body = BodyDecoder::new(framing);
        let complete = stream.drain_body(&mut body).await?;
        message.body_len = body.decoded();

        if message.is_interim() {
            trace!("Response {}: skipping interim {}", key, message.status);
            continue;
        }
        if !complete {
            debug!(
                "Response {}: body cut short after {} bytes",
                key, message.body_len
            );
        }
        if tx.send(Tagged { key, ts, message }).await.is_err() {
            debug!("Response {}: receiver closed", key);
            break;
        }
        sent += 1;
        if !complete {
            break;
        }
    }

    debug!("Response {}: stream finished, {} messages", key, sent);
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn key() -> CorrelationKey {
        CorrelationKey("10.0.0.2:50000".parse().unwrap())
    }

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    async fn feed(chunks: Vec<(&'static [u8], i64)>) -> mpsc::Receiver<StreamChunk> {
        let (tx, rx) = mpsc::channel(chunks.len().max(1));
        for (data, ms) in chunks {
            tx.send(StreamChunk {
                data: data.to_vec(),
                ts: at(ms),
            })
            .await
            .unwrap();
        }
        rx
    }

    async fn responses(
        chunks: Vec<(&'static [u8], i64)>,
        methods: Option<MethodReceiver>,
    ) -> Vec<Tagged<HttpResponse>> {
        let rx = feed(chunks).await;
        let (tx, mut out) = mpsc::channel(16);
        run_response_worker(key(), rx, tx, methods).await.unwrap();
        let mut collected = Vec::new();
        while let Some(resp) = out.recv().await {
            collected.push(resp);
        }
        collected
    }

    #[tokio::test]
    async fn test_requests_timestamped_by_first_byte() {
        let rx = feed(vec![
            (b"GET /a HTTP/1.1\r\nHo", 0),
            (b"st: x\r\n\r\nGET /b HTTP/1.1\r\n", 10),
            (b"\r\n", 20),
            (b"POST /c HTTP/1.1\r\nContent-Length: 3\r\n\r\nab", 30),
            (b"c", 40),
        ])
        .await;
        let (tx, mut out) = mpsc::channel(16);
        let (methods_tx, mut methods_rx) = method_channel();

        let sent = run_request_worker(key(), rx, tx, Some(methods_tx))
            .await
            .unwrap();
        assert_eq!(sent, 3);

        let a = out.recv().await.unwrap();
        assert_eq!(a.message.uri, "/a");
        assert_eq!(a.ts, at(0));
        assert_eq!(a.key, key());

        let b = out.recv().await.unwrap();
        assert_eq!(b.message.uri, "/b");
        assert_eq!(b.ts, at(10));

        let c = out.recv().await.unwrap();
        assert_eq!(c.message.uri, "/c");
        assert_eq!(c.message.body_len, 3);
        assert_eq!(c.ts, at(30));
        assert!(out.recv().await.is_none());

        assert_eq!(methods_rx.recv().await, Some(Method::GET));
        assert_eq!(methods_rx.recv().await, Some(Method::GET));
        assert_eq!(methods_rx.recv().await, Some(Method::POST));
        assert_eq!(methods_rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_responses_close_delimited_and_interim() {
        let got = responses(
            vec![
                (b"HTTP/1.1 100 Continue\r\n\r\n", 0),
                (b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok", 5),
                (b"HTTP/1.0 200 OK\r\n\r\nuntil", 9),
                (b" close", 12),
            ],
            None,
        )
        .await;
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].ts, at(5));
        assert_eq!(got[0].message.body_len, 2);
        assert_eq!(got[1].ts, at(9));
        assert_eq!(got[1].message.body_len, 11);
    }

    #[tokio::test]
    async fn test_chunked_body_across_many_chunks() {
        let mut chunks: Vec<(&'static [u8], i64)> =
            vec![(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n", 0)];
        for i in 0..40 {
            chunks.push((b"10\r\n0123456789abcdef\r\n", i + 1));
        }
        chunks.push((b"0\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n", 50));

        let got = responses(chunks, None).await;
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].message.body_len, 40 * 16);
        assert_eq!(got[1].message.status, 204);
        assert_eq!(got[1].ts, at(50));
    }

    #[tokio::test]
    async fn test_head_response_framed_by_request_method() {
        let (methods_tx, methods_rx) = method_channel();
        methods_tx.send(Method::HEAD).unwrap();
        methods_tx.send(Method::GET).unwrap();
        drop(methods_tx);

        let got = responses(
            vec![
                (b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n", 0),
                (
                    b"HTTP/1.1 200 OK\r\nContent-Length: 17\r\n\r\nHTTP/1.1 is fun!!",
                    5,
                ),
            ],
            Some(methods_rx),
        )
        .await;
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].message.body_len, 0);
        assert_eq!(got[1].message.body_len, 17);
        assert_eq!(got[1].ts, at(5));
    }

    #[tokio::test]
    async fn test_method_consumed_by_bodiless_responses() {
        let (methods_tx, methods_rx) = method_channel();
        for method in [Method::GET, Method::GET, Method::HEAD] {
            methods_tx.send(method).unwrap();
        }
        drop(methods_tx);

        let got = responses(
            vec![
                (b"HTTP/1.1 100 Continue\r\n\r\n", 0),
                (b"HTTP/1.1 304 Not Modified\r\n\r\n", 1),
                (b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n", 2),
                (b"HTTP/1.1 200 OK\r\nContent-Length: 9\r\n\r\n", 3),
            ],
            Some(methods_rx),
        )
        .await;
        let statuses: Vec<u16> = got.iter().map(|r| r.message.status).collect();
        assert_eq!(statuses, vec![304, 200, 200]);
        assert_eq!(got[2].message.body_len, 0);
    }

    #[tokio::test]
    async fn test_body_resembling_status_line_without_method() {
        let got = responses(
            vec![(
                b"HTTP/1.1 200 OK\r\nContent-Length: 17\r\n\r\nHTTP/1.1 is fun!!HTTP/1.1 204 No Content\r\n\r\n",
                0,
            )],
            None,
        )
        .await;
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].message.body_len, 17);
        assert_eq!(got[1].message.status, 204);
    }

    #[tokio::test]
    async fn test_head_response_guessed_without_method() {
        let got = responses(
            vec![
                (b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n", 0),
                (b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n", 5),
            ],
            None,
        )
        .await;
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].message.body_len, 0);
        assert_eq!(got[1].message.status, 404);
    }

    #[tokio::test]
    async fn test_response_waits_for_request_side() {
        let (methods_tx, methods_rx) = method_channel();
        let pending = tokio::spawn(responses(
            vec![
                (b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n", 10),
                (b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello", 20),
            ],
            Some(methods_rx),
        ));

        let requests = feed(vec![(b"HEAD /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n", 0)]).await;
        let (tx, _out) = mpsc::channel(16);
        run_request_worker(key(), requests, tx, Some(methods_tx))
            .await
            .unwrap();

        let got = pending.await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].message.body_len, 0);
        assert_eq!(got[1].message.body_len, 5);
    }

    #[tokio::test]
    async fn test_truncated_message_is_dropped() {
        let rx = feed(vec![(b"GET /a HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc", 0)]).await;
        let (tx, mut out) = mpsc::channel(16);
        assert_eq!(run_request_worker(key(), rx, tx, None).await.unwrap(), 0);
        assert!(out.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_truncated_response_keeps_seen_bytes() {
        let got = responses(
            vec![(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n<html>", 0)],
            None,
        )
        .await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].message.body_len, 6);
    }

    #[tokio::test]
    async fn test_parse_error_ends_worker() {
        let rx = feed(vec![
            (b"GET /ok HTTP/1.1\r\n\r\n", 0),
            (b"\x00garbage\r\n\r\n", 1),
        ])
        .await;
        let (tx, mut out) = mpsc::channel(16);
        let result = run_request_worker(key(), rx, tx, None).await;
        assert!(matches!(result, Err(DecodeError::Http(_))));
        assert_eq!(out.recv().await.unwrap().message.uri, "/ok");
    }

    #[tokio::test]
    async fn test_oversized_head_ends_worker() {
        let (tx, rx) = mpsc::channel(4);
        let writer = tokio::spawn(async move {
            let line = vec![b'a'; 1024];
            let _ = tx
                .send(StreamChunk {
                    data: b"GET / HTTP/1.1\r\nX-Long: ".to_vec(),
                    ts: at(0),
                })
                .await;
            for _ in 0..(MAX_HEAD / line.len() + 2) {
                if tx
                    .send(StreamChunk {
                        data: line.clone(),
                        ts: at(1),
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        let (out_tx, _out) = mpsc::channel(4);
        let result = run_request_worker(key(), rx, out_tx, None).await;
        assert!(matches!(result, Err(DecodeError::HeadTooLarge(_))));
        writer.await.unwrap();
    }
}
