//! The packet-to-record pipeline
//!
//! ```text
//! pcap/pcapng ──▶ decode + classify + reassemble (blocking task)
//!             │ per classified half-stream
//!             ▼
//!          request / response workers (async tasks)
//!             │ Tagged<HttpRequest> / Tagged<HttpResponse>
//!             ▼
//!          conjoiner (async task) ──▶ PcapParser::parse
//! ```
//!
//! All stages communicate over bounded channels, so a slow consumer of
//! [`PcapParser`] applies backpressure all the way to packet decoding.

use crate::classify::ServerSet;
use crate::error::{CaptureError, CaptureResult};
use crate::packet::{capture_time, decode_frame, Flow};
use crate::reassembly::{Reassembler, ReassemblyLimits, StreamSink};
use crate::source::CaptureReader;
use crate::tracker::WorkerTracker;
use chrono::{DateTime, Utc};
use logprof_core::{normalize_uri, LogParser, ParseError, ParseResult, Record, UriOptions};
use logprof_correlate::{run_conjoiner, ConjoinStats, Conjoined};
use logprof_decode::{
    method_channel, run_request_worker, run_response_worker, CorrelationKey, Direction,
    HttpRequest, HttpResponse, MethodReceiver, StreamChunk, Tagged,
};
use std::collections::HashMap;
use std::io::Read;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pipeline tuning
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Capacity of every inter-stage channel
    pub channel_capacity: usize,
    /// Runtime worker threads
    pub worker_threads: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            worker_threads: 2,
        }
    }
}

/// Options for [`PcapParser`]
#[derive(Debug, Clone, Default)]
pub struct PcapOptions {
    /// Server addresses; empty matches any address on the port
    pub server_ips: Vec<String>,
    pub server_port: u16,
    pub uri: UriOptions,
    pub pipeline: PipelineConfig,
    pub reassembly: ReassemblyLimits,
}

/// Counters from the decode stage
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeStats {
    pub packets: u64,
    pub tcp_segments: u64,
    /// Segments of flows that do not involve the server
    pub ignored_segments: u64,
    /// Half-streams handed to a worker
    pub streams: u64,
}

/// Routes reassembled bytes to per-half-stream workers
struct Dispatcher {
    servers: ServerSet,
    handle: Handle,
    tracker: WorkerTracker,
    req_tx: mpsc::Sender<Tagged<HttpRequest>>,
    resp_tx: mpsc::Sender<Tagged<HttpResponse>>,
    capacity: usize,
    /// `None` marks flows whose worker has already gone away
    streams: HashMap<Flow, Option<mpsc::Sender<StreamChunk>>>,
    /// Method feeds of request workers whose response worker has not
    /// started yet
    methods: HashMap<CorrelationKey, MethodReceiver>,
    spawned: u64,
}

impl Dispatcher {
    fn spawn_worker(&mut self, flow: Flow) -> Option<mpsc::Sender<StreamChunk>> {
        let Some((direction, key)) = self.servers.classify(&flow) else {
            debug!("Ignoring unclassified flow {}", flow);
            return None;
        };

        let (tx, rx) = mpsc::channel(self.capacity);
        let guard = self.tracker.start();
        self.spawned += 1;
        debug!("{:?} worker started for {}", direction, flow);

        match direction {
            Direction::Request => {
                let out = self.req_tx.clone();
                let (methods_tx, methods_rx) = method_channel();
                self.methods.insert(key, methods_rx);
                self.handle.spawn(async move {
                    let _guard = guard;
                    if let Err(e) = run_request_worker(key, rx, out, Some(methods_tx)).await {
                        warn!("Request stream {} aborted: {}", flow, e);
                    }
                });
            }
            Direction::Response => {
                let out = self.resp_tx.clone();
                let methods = self.methods.remove(&key);
                self.handle.spawn(async move {
                    let _guard = guard;
                    if let Err(e) = run_response_worker(key, rx, out, methods).await {
                        warn!("Response stream {} aborted: {}", flow, e);
                    }
                });
            }
        }
        Some(tx)
    }
}

impl StreamSink for Dispatcher {
    fn on_data(&mut self, flow: Flow, data: Vec<u8>, ts: DateTime<Utc>) {
        if !self.streams.contains_key(&flow) {
            let tx = self.spawn_worker(flow);
            self.streams.insert(flow, tx);
        }
        let Some(slot) = self.streams.get_mut(&flow) else {
            return;
        };
        if let Some(tx) = slot {
            if tx.blocking_send(StreamChunk { data, ts }).is_err() {
                debug!("Worker for {} is gone, dropping its data", flow);
                *slot = None;
            }
        }
    }

    fn on_close(&mut self, flow: Flow) {
        // Dropping the sender ends the worker's input
        self.streams.remove(&flow);
        if let Some((Direction::Response, key)) = self.servers.classify(&flow) {
            self.methods.remove(&key);
        }
    }
}

fn run_decode_stage<R: Read>(
    mut reader: CaptureReader<R>,
    mut dispatcher: Dispatcher,
    limits: ReassemblyLimits,
) -> DecodeStats {
    let mut reassembler = Reassembler::with_limits(limits);
    let mut stats = DecodeStats::default();
    let mut last_ts = DateTime::<Utc>::default();

    loop {
        let frame = match reader.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!("Stopping capture read: {}", e);
                break;
            }
        };
        stats.packets += 1;
        let ts = capture_time(frame.timestamp);
        last_ts = ts;

        let Some(segment) = decode_frame(frame.datalink, frame.data) else {
            continue;
        };
        stats.tcp_segments += 1;
        if dispatcher.servers.classify(&segment.flow).is_none() {
            stats.ignored_segments += 1;
            continue;
        }
        reassembler.process(&segment, ts, &mut dispatcher);
    }

    reassembler.flush_all(last_ts, &mut dispatcher);
    dispatcher.streams.clear();
    dispatcher.methods.clear();
    stats.streams = dispatcher.spawned;

    let tracker = dispatcher.tracker.clone();
    debug!("Waiting for {} stream workers", tracker.active());
    dispatcher.handle.block_on(tracker.wait_idle());

    // Closes the conjoiner's inputs
    drop(dispatcher);
    stats
}

/// [`LogParser`] over a pcap capture.
///
/// Owns a multi-thread runtime running the pipeline. `parse` blocks on the
/// pipeline output and must not be called from inside an async context.
pub struct PcapParser {
    runtime: Option<Runtime>,
    rx: mpsc::Receiver<Conjoined>,
    uri: UriOptions,
    decode: Option<JoinHandle<DecodeStats>>,
    conjoin: Option<JoinHandle<ConjoinStats>>,
}

impl PcapParser {
    /// Start the pipeline. The capture header is read here, so a file that
    /// is neither pcap nor pcapng fails immediately.
    pub fn new(reader: Box<dyn Read + Send>, options: PcapOptions) -> CaptureResult<Self> {
        let reader = CaptureReader::new(reader)?;
        let format = reader.describe();
        let servers = ServerSet::parse(&options.server_ips, options.server_port)?;
        let capacity = options.pipeline.channel_capacity.max(1);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(options.pipeline.worker_threads.max(1))
            .thread_name("logprof-pcap")
            .enable_all()
            .build()?;

        let (req_tx, req_rx) = mpsc::channel(capacity);
        let (resp_tx, resp_rx) = mpsc::channel(capacity);
        let (out_tx, rx) = mpsc::channel(capacity);

        let conjoin = runtime.spawn(run_conjoiner(req_rx, resp_rx, out_tx));

        let dispatcher = Dispatcher {
            servers,
            handle: runtime.handle().clone(),
            tracker: WorkerTracker::new(),
            req_tx,
            resp_tx,
            capacity,
            streams: HashMap::new(),
            methods: HashMap::new(),
            spawned: 0,
        };
        let limits = options.reassembly.clone();
        let decode = runtime.spawn_blocking(move || run_decode_stage(reader, dispatcher, limits));

        info!(
            "Packet pipeline started ({}, server port {})",
            format, options.server_port
        );

        Ok(Self {
            runtime: Some(runtime),
            rx,
            uri: options.uri,
            decode: Some(decode),
            conjoin: Some(conjoin),
        })
    }

    fn to_record(&self, conjoined: Conjoined) -> ParseResult<Record> {
        let uri = normalize_uri(&conjoined.request.uri, &self.uri).ok_or(ParseError::Skip)?;
        Ok(Record::new(
            uri,
            conjoined.request.method.as_str(),
            conjoined.response.status,
            conjoined.latency_secs(),
            conjoined.response_body_len as f64,
        )
        .with_time(conjoined.request_ts.to_rfc3339())
        .with_request_body_bytes(conjoined.request.body_len as f64))
    }

    /// Join the stages once the output has closed
    fn finish(&mut self) -> CaptureResult<()> {
        let (Some(runtime), Some(decode), Some(conjoin)) =
            (&self.runtime, self.decode.take(), self.conjoin.take())
        else {
            return Ok(());
        };

        let (decode, conjoin) = runtime.block_on(async { (decode.await, conjoin.await) });
        let decode = decode.map_err(|e| CaptureError::Pipeline(format!("decode stage: {}", e)))?;
        let conjoin =
            conjoin.map_err(|e| CaptureError::Pipeline(format!("conjoiner: {}", e)))?;

        info!(
            "Capture finished: {} packets, {} TCP segments ({} ignored), {} streams",
            decode.packets, decode.tcp_segments, decode.ignored_segments, decode.streams
        );
        info!(
            "Conjoined {} of {} requests and {} responses ({} unmatched requests, {} unmatched responses)",
            conjoin.conjoined,
            conjoin.requests,
            conjoin.responses,
            conjoin.unmatched_requests,
            conjoin.unmatched_responses
        );
        Ok(())
    }
}

impl LogParser for PcapParser {
    fn parse(&mut self) -> ParseResult<Record> {
        match self.rx.blocking_recv() {
            Some(conjoined) => self.to_record(conjoined),
            None => {
                self.finish()?;
                Err(ParseError::Eof)
            }
        }
    }
}

impl Drop for PcapParser {
    fn drop(&mut self) {
        self.rx.close();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl From<CaptureError> for ParseError {
    fn from(e: CaptureError) -> Self {
        ParseError::Pipeline(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;
    use pcap_file::pcap::{PcapPacket, PcapWriter};
    use std::io::Cursor;
    use std::time::Duration;

    type Endpoint = ([u8; 4], u16);

    const CLIENT: Endpoint = ([10, 0, 0, 1], 50000);
    const OTHER_CLIENT: Endpoint = ([10, 0, 0, 3], 50001);
    const SERVER: Endpoint = ([10, 0, 0, 2], 80);

    const BASE_MS: u64 = 1_700_000_000_000;

    struct CaptureBuilder {
        writer: PcapWriter<Vec<u8>>,
    }

    impl CaptureBuilder {
        fn new() -> Self {
            Self {
                writer: PcapWriter::new(Vec::new()).unwrap(),
            }
        }

        fn segment(
            &mut self,
            ms: u64,
            from: Endpoint,
            to: Endpoint,
            seq: u32,
            syn: bool,
            payload: &[u8],
        ) -> &mut Self {
            let builder = PacketBuilder::ethernet2([0; 6], [0; 6])
                .ipv4(from.0, to.0, 64)
                .tcp(from.1, to.1, seq, 65535);
            let builder = if syn { builder.syn() } else { builder };
            let mut frame = Vec::with_capacity(builder.size(payload.len()));
            builder.write(&mut frame, payload).unwrap();

            let ts = Duration::from_millis(BASE_MS + ms);
            self.writer
                .write_packet(&PcapPacket::new(ts, frame.len() as u32, &frame))
                .unwrap();
            self
        }

        fn handshake(&mut self, client: Endpoint) -> &mut Self {
            self.segment(0, client, SERVER, 999, true, b"")
                .segment(1, SERVER, client, 4999, true, b"")
        }

        fn finish(self) -> Vec<u8> {
            self.writer.into_writer()
        }
    }

    fn to_pcapng(pcap: Vec<u8>) -> Vec<u8> {
        use pcap_file::pcap::PcapReader;
        use pcap_file::pcapng::blocks::enhanced_packet::EnhancedPacketBlock;
        use pcap_file::pcapng::blocks::interface_description::InterfaceDescriptionBlock;
        use pcap_file::pcapng::{Block, PcapNgWriter};

        let mut reader = PcapReader::new(Cursor::new(pcap)).unwrap();
        let mut writer = PcapNgWriter::new(Vec::new()).unwrap();
        writer
            .write_block(&Block::InterfaceDescription(InterfaceDescriptionBlock {
                linktype: reader.header().datalink,
                snaplen: 0xffff,
                options: vec![],
            }))
            .unwrap();
        while let Some(packet) = reader.next_packet() {
            let packet = packet.unwrap();
            writer
                .write_block(&Block::EnhancedPacket(EnhancedPacketBlock {
                    interface_id: 0,
                    timestamp: packet.timestamp,
                    original_len: packet.orig_len,
                    data: packet.data,
                    options: vec![],
                }))
                .unwrap();
        }
        writer.into_inner()
    }

    fn options() -> PcapOptions {
        PcapOptions {
            server_ips: vec!["10.0.0.2".to_string()],
            server_port: 80,
            ..Default::default()
        }
    }

    fn collect(capture: Vec<u8>, options: PcapOptions) -> Vec<Record> {
        let mut parser = PcapParser::new(Box::new(Cursor::new(capture)), options).unwrap();
        let mut records = Vec::new();
        loop {
            match parser.parse() {
                Ok(record) => records.push(record),
                Err(ParseError::Skip) => continue,
                Err(ParseError::Eof) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        records
    }

    #[test]
    fn test_single_transaction() {
        let mut capture = CaptureBuilder::new();
        capture
            .handshake(CLIENT)
            .segment(10, CLIENT, SERVER, 1000, false, b"GET /index.html?x=1 HTTP/1.1\r\nHost: a\r\n\r\n")
            .segment(
                60,
                SERVER,
                CLIENT,
                5000,
                false,
                b"HTTP/1.1 200 OK\r\nContent-Length: 12\r\n\r\nhello world!",
            );

        let records = collect(capture.finish(), options());
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.uri, "/index.html");
        assert_eq!(record.method, "GET");
        assert_eq!(record.status, 200);
        assert!((record.response_time - 0.050).abs() < 1e-6);
        assert_eq!(record.body_bytes, 12.0);
        assert!(record.time.starts_with("2023-11-14T22:13:20.010"));
    }

    #[test]
    fn test_orphan_response_yields_nothing() {
        let mut capture = CaptureBuilder::new();
        capture.segment(
            5,
            SERVER,
            CLIENT,
            5000,
            false,
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
        );
        assert!(collect(capture.finish(), options()).is_empty());
    }

    #[test]
    fn test_out_of_order_request_and_chunked_response() {
        let head = b"HTTP/1.1 201 Created\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n";
        let mut capture = CaptureBuilder::new();
        capture
            .handshake(CLIENT)
            // Second half of the request arrives first
            .segment(11, CLIENT, SERVER, 1000 + 14, false, b"HTTP/1.1\r\n\r\n")
            .segment(12, CLIENT, SERVER, 1000, false, b"POST /api/new ")
            .segment(20, SERVER, CLIENT, 5000, false, head)
            .segment(21, SERVER, CLIENT, 5000 + head.len() as u32, false, b"4\r\ndefg\r\n0\r\n\r\n");

        let records = collect(capture.finish(), options());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].uri, "/api/new");
        assert_eq!(records[0].method, "POST");
        assert_eq!(records[0].status, 201);
        assert_eq!(records[0].body_bytes, 7.0);
        assert!((records[0].response_time - 0.008).abs() < 1e-6);
    }

    #[test]
    fn test_keep_alive_and_unrelated_traffic() {
        let first = b"GET /a HTTP/1.1\r\n\r\n";
        let second = b"GET /b HTTP/1.1\r\n\r\n";
        let resp_a = b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\na";
        let resp_b = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";

        let mut capture = CaptureBuilder::new();
        capture
            .handshake(CLIENT)
            .handshake(OTHER_CLIENT)
            .segment(10, CLIENT, SERVER, 1000, false, first)
            .segment(20, SERVER, CLIENT, 5000, false, resp_a)
            .segment(30, CLIENT, SERVER, 1000 + first.len() as u32, false, second)
            .segment(40, SERVER, CLIENT, 5000 + resp_a.len() as u32, false, resp_b)
            .segment(50, OTHER_CLIENT, SERVER, 1000, false, b"DELETE /c HTTP/1.1\r\n\r\n")
            .segment(55, SERVER, OTHER_CLIENT, 5000, false, resp_b)
            // Traffic to a different server is ignored
            .segment(60, CLIENT, ([10, 0, 0, 9], 80), 1, false, b"GET /x HTTP/1.1\r\n\r\n");

        let mut pairs: Vec<_> = collect(capture.finish(), options())
            .into_iter()
            .map(|r| (r.method, r.uri, r.status))
            .collect();
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                ("DELETE".to_string(), "/c".to_string(), 404),
                ("GET".to_string(), "/a".to_string(), 200),
                ("GET".to_string(), "/b".to_string(), 404),
            ]
        );
    }

    #[test]
    fn test_query_string_kept() {
        let mut capture = CaptureBuilder::new();
        capture
            .handshake(CLIENT)
            .segment(10, CLIENT, SERVER, 1000, false, b"GET /s?q=rust HTTP/1.1\r\n\r\n")
            .segment(11, SERVER, CLIENT, 5000, false, b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");

        let mut opts = options();
        opts.uri.query_string = true;
        opts.uri.qs_ignore_values = true;
        let records = collect(capture.finish(), opts);
        assert_eq!(records[0].uri, "/s?q=xxx");
    }

    #[test]
    fn test_malformed_stream_is_isolated() {
        let mut capture = CaptureBuilder::new();
        capture
            .handshake(CLIENT)
            .handshake(OTHER_CLIENT)
            .segment(10, CLIENT, SERVER, 1000, false, b"\x00\x01garbage\r\n\r\n")
            .segment(12, SERVER, CLIENT, 5000, false, b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n")
            .segment(20, OTHER_CLIENT, SERVER, 1000, false, b"GET /ok HTTP/1.1\r\n\r\n")
            .segment(25, SERVER, OTHER_CLIENT, 5000, false, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");

        let records = collect(capture.finish(), options());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].uri, "/ok");
        assert_eq!(records[0].status, 200);
    }

    #[test]
    fn test_head_response_framed_by_request() {
        // The HEAD reply advertises a length but carries no body, so the
        // next response starts right after its head
        let head_resp = b"HTTP/1.1 200 OK\r\nContent-Length: 50\r\n\r\n";
        let head_req = b"HEAD /status HTTP/1.1\r\n\r\n";
        let get = b"GET /after HTTP/1.1\r\n\r\n";
        let mut capture = CaptureBuilder::new();
        capture
            .handshake(CLIENT)
            .segment(10, CLIENT, SERVER, 1000, false, head_req)
            .segment(20, SERVER, CLIENT, 5000, false, head_resp)
            .segment(30, CLIENT, SERVER, 1000 + head_req.len() as u32, false, get)
            .segment(
                40,
                SERVER,
                CLIENT,
                5000 + head_resp.len() as u32,
                false,
                b"HTTP/1.1 204 No Content\r\n\r\n",
            );

        let mut records = collect(capture.finish(), options());
        records.sort_by(|a, b| a.uri.cmp(&b.uri));
        let summary: Vec<_> = records
            .iter()
            .map(|r| (r.method.as_str(), r.uri.as_str(), r.status, r.body_bytes))
            .collect();
        assert_eq!(
            summary,
            vec![("GET", "/after", 204, 0.0), ("HEAD", "/status", 200, 0.0)]
        );
    }

    #[test]
    fn test_pcapng_capture() {
        let mut capture = CaptureBuilder::new();
        capture
            .handshake(CLIENT)
            .segment(10, CLIENT, SERVER, 1000, false, b"GET /ng HTTP/1.1\r\n\r\n")
            .segment(30, SERVER, CLIENT, 5000, false, b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");

        let records = collect(to_pcapng(capture.finish()), options());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].uri, "/ng");
        assert!((records[0].response_time - 0.020).abs() < 1e-6);
    }

    #[test]
    fn test_not_a_capture() {
        let result = PcapParser::new(Box::new(Cursor::new(b"plain text".to_vec())), options());
        assert!(matches!(result, Err(CaptureError::Pcap(_))));
    }

    #[test]
    fn test_invalid_server_address() {
        let capture = CaptureBuilder::new().finish();
        let mut opts = options();
        opts.server_ips = vec!["nope".to_string()];
        let result = PcapParser::new(Box::new(Cursor::new(capture)), opts);
        assert!(matches!(result, Err(CaptureError::InvalidServerAddress(_))));
    }
}
