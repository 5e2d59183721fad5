//! TCP stream reassembly
//!
//! Each flow direction tracks the next expected sequence number. Segments
//! ahead of it wait in an ordered buffer; overlapping and duplicate bytes are
//! trimmed, so the sink sees every stream byte once and in order. At end of
//! input, remaining buffered data is delivered across any gaps.
//!
//! State is bounded by [`ReassemblyLimits`]: a stream whose out-of-order
//! buffer grows too large skips its oldest hole, idle streams are closed,
//! and closed flows are forgotten after a linger period.

use crate::packet::{Flow, TcpSegment};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace};

/// Bounds on reassembly state
#[derive(Debug, Clone)]
pub struct ReassemblyLimits {
    /// Out-of-order bytes buffered per half-stream before a hole is skipped
    pub max_pending_bytes: usize,
    /// Capture time without segments after which a stream is closed
    pub idle_timeout: TimeDelta,
    /// How long a closed flow keeps ignoring late retransmissions
    pub closed_linger: TimeDelta,
}

impl Default for ReassemblyLimits {
    fn default() -> Self {
        Self {
            max_pending_bytes: 4 * 1024 * 1024,
            idle_timeout: TimeDelta::minutes(5),
            closed_linger: TimeDelta::minutes(2),
        }
    }
}

/// Capture seconds between sweeps for idle and lingering flows
const SWEEP_INTERVAL_SECS: i64 = 10;

/// Receiver of reassembled stream bytes
pub trait StreamSink {
    /// In-order bytes for `flow`, timestamped with the segment that made them
    /// available
    fn on_data(&mut self, flow: Flow, data: Vec<u8>, ts: DateTime<Utc>);

    /// No more data will arrive for `flow`
    fn on_close(&mut self, flow: Flow);
}

#[derive(Debug)]
struct HalfStream {
    next_seq: u32,
    /// Bytes delivered so far; offsets below are relative to stream start
    delivered: u64,
    pending: BTreeMap<u64, Vec<u8>>,
    pending_bytes: usize,
    /// Offset just past the last byte, once FIN was seen
    fin_at: Option<u64>,
    last_seen: DateTime<Utc>,
}

impl HalfStream {
    fn new(next_seq: u32, ts: DateTime<Utc>) -> Self {
        Self {
            next_seq,
            delivered: 0,
            pending: BTreeMap::new(),
            pending_bytes: 0,
            fin_at: None,
            last_seen: ts,
        }
    }

    /// Stream offset of `seq`, taking wraparound into account
    fn offset_of(&self, seq: u32) -> i64 {
        self.delivered as i64 + i64::from(seq.wrapping_sub(self.next_seq) as i32)
    }

    fn advance(&mut self, n: usize) {
        self.delivered += n as u64;
        self.next_seq = self.next_seq.wrapping_add(n as u32);
    }

    /// Take a segment and return whatever became contiguous
    fn accept(&mut self, seq: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        if payload.is_empty() {
            return out;
        }

        let offset = self.offset_of(seq);
        if offset > self.delivered as i64 {
            let entry = self.pending.entry(offset as u64).or_default();
            if entry.len() < payload.len() {
                self.pending_bytes += payload.len() - entry.len();
                *entry = payload.to_vec();
            }
            return out;
        }

        let skip = (self.delivered as i64 - offset) as usize;
        if skip < payload.len() {
            out.extend_from_slice(&payload[skip..]);
            self.advance(payload.len() - skip);
        }
        self.drain_pending(&mut out);
        out
    }

    fn drain_pending(&mut self, out: &mut Vec<u8>) {
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() > self.delivered {
                break;
            }
            let start = *entry.key();
            let data = entry.remove();
            self.pending_bytes -= data.len();
            let skip = (self.delivered - start) as usize;
            if skip < data.len() {
                out.extend_from_slice(&data[skip..]);
                self.advance(data.len() - skip);
            }
        }
    }

    /// Jump over the hole before the first buffered segment and deliver
    /// what becomes contiguous
    fn skip_hole(&mut self, out: &mut Vec<u8>) {
        if let Some((&start, _)) = self.pending.first_key_value() {
            if start > self.delivered {
                let gap = start - self.delivered;
                trace!("Skipping {} missing bytes", gap);
                self.delivered += gap;
                self.next_seq = self.next_seq.wrapping_add(gap as u32);
            }
            self.drain_pending(out);
        }
    }

    /// Deliver everything still buffered, skipping holes
    fn flush(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while !self.pending.is_empty() {
            self.skip_hole(&mut out);
        }
        out
    }

    fn finished(&self) -> bool {
        self.fin_at.is_some_and(|end| self.delivered >= end)
    }
}

/// Reassembler over all flows of a capture
#[derive(Debug, Default)]
pub struct Reassembler {
    limits: ReassemblyLimits,
    streams: HashMap<Flow, HalfStream>,
    /// Flows already closed, with their close time; late retransmissions
    /// are ignored until a new SYN or until the linger period ends
    closed: HashMap<Flow, DateTime<Utc>>,
    last_sweep: Option<DateTime<Utc>>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: ReassemblyLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    /// Number of half-streams currently open
    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }

    /// Number of closed flows still remembered
    pub fn closed_flows(&self) -> usize {
        self.closed.len()
    }

    pub fn process<S: StreamSink>(&mut self, seg: &TcpSegment<'_>, ts: DateTime<Utc>, sink: &mut S) {
        self.maybe_sweep(ts, sink);
        let flow = seg.flow;

        if seg.syn {
            // A new connection on a reused port starts over
            self.closed.remove(&flow);
            if self.streams.remove(&flow).is_some() {
                sink.on_close(flow);
            }
            let mut stream = HalfStream::new(seg.seq.wrapping_add(1), ts);
            let data = stream.accept(seg.seq.wrapping_add(1), seg.payload);
            self.streams.insert(flow, stream);
            if !data.is_empty() {
                sink.on_data(flow, data, ts);
            }
        } else {
            if self.closed.contains_key(&flow) {
                return;
            }
            if seg.payload.is_empty() && !seg.fin && !seg.rst && !self.streams.contains_key(&flow) {
                // Bare ACK on an unknown flow
                return;
            }
            let stream = self
                .streams
                .entry(flow)
                .or_insert_with(|| HalfStream::new(seg.seq, ts));
            stream.last_seen = ts;
            let mut data = stream.accept(seg.seq, seg.payload);
            while stream.pending_bytes > self.limits.max_pending_bytes {
                debug!(
                    "Stream {} buffers {} out-of-order bytes, skipping a hole",
                    flow, stream.pending_bytes
                );
                stream.skip_hole(&mut data);
            }
            if !data.is_empty() {
                sink.on_data(flow, data, ts);
            }
        }

        let Some(stream) = self.streams.get_mut(&flow) else {
            return;
        };

        if seg.rst {
            let data = stream.flush();
            if !data.is_empty() {
                sink.on_data(flow, data, ts);
            }
            self.close(flow, sink);
            return;
        }

        if seg.fin {
            let end = stream.offset_of(seg.seq) + seg.payload.len() as i64;
            stream.fin_at = Some(end.max(0) as u64);
        }
        if stream.finished() {
            self.close(flow, sink);
        }
    }

    fn close<S: StreamSink>(&mut self, flow: Flow, sink: &mut S) {
        if let Some(stream) = self.streams.remove(&flow) {
            debug!("Stream {} closed", flow);
            self.closed.insert(flow, stream.last_seen);
            sink.on_close(flow);
        }
    }

    /// Close idle streams and forget flows closed long enough ago
    fn maybe_sweep<S: StreamSink>(&mut self, now: DateTime<Utc>, sink: &mut S) {
        match self.last_sweep {
            Some(last) if now - last < TimeDelta::seconds(SWEEP_INTERVAL_SECS) => return,
            Some(_) => {}
            None => {
                self.last_sweep = Some(now);
                return;
            }
        }
        self.last_sweep = Some(now);

        let idle: Vec<Flow> = self
            .streams
            .iter()
            .filter(|(_, stream)| now - stream.last_seen >= self.limits.idle_timeout)
            .map(|(flow, _)| *flow)
            .collect();
        for flow in idle {
            debug!("Stream {} idle, closing", flow);
            if let Some(stream) = self.streams.get_mut(&flow) {
                let data = stream.flush();
                if !data.is_empty() {
                    sink.on_data(flow, data, now);
                }
            }
            self.close(flow, sink);
            // Later segments reopen the flow midstream
            self.closed.remove(&flow);
        }

        let linger = self.limits.closed_linger;
        self.closed.retain(|_, closed_at| now - *closed_at < linger);
    }

    /// Deliver all buffered data and close every open stream
    pub fn flush_all<S: StreamSink>(&mut self, ts: DateTime<Utc>, sink: &mut S) {
        let flows: Vec<Flow> = self.streams.keys().copied().collect();
        for flow in flows {
            if let Some(stream) = self.streams.get_mut(&flow) {
                let data = stream.flush();
                if !data.is_empty() {
                    sink.on_data(flow, data, ts);
                }
            }
            self.close(flow, sink);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect {
        data: HashMap<Flow, Vec<u8>>,
        closed: Vec<Flow>,
    }

    impl StreamSink for Collect {
        fn on_data(&mut self, flow: Flow, data: Vec<u8>, _ts: DateTime<Utc>) {
            self.data.entry(flow).or_default().extend(data);
        }

        fn on_close(&mut self, flow: Flow) {
            self.closed.push(flow);
        }
    }

    fn flow() -> Flow {
        Flow {
            src: "10.0.0.1:50000".parse().unwrap(),
            dst: "10.0.0.2:80".parse().unwrap(),
        }
    }

    fn seg(seq: u32, payload: &'static [u8]) -> TcpSegment<'static> {
        TcpSegment {
            flow: flow(),
            seq,
            syn: false,
            fin: false,
            rst: false,
            payload,
        }
    }

    fn syn(seq: u32) -> TcpSegment<'static> {
        TcpSegment {
            syn: true,
            ..seg(seq, b"")
        }
    }

    fn fin(seq: u32) -> TcpSegment<'static> {
        TcpSegment {
            fin: true,
            ..seg(seq, b"")
        }
    }

    fn run(segments: &[TcpSegment<'static>]) -> Collect {
        let mut reassembler = Reassembler::new();
        let mut sink = Collect::default();
        for s in segments {
            reassembler.process(s, Utc::now(), &mut sink);
        }
        reassembler.flush_all(Utc::now(), &mut sink);
        sink
    }

    fn bytes(sink: &Collect) -> &[u8] {
        sink.data.get(&flow()).map(Vec::as_slice).unwrap_or_default()
    }

    #[test]
    fn test_in_order() {
        let sink = run(&[syn(99), seg(100, b"hello "), seg(106, b"world"), fin(111)]);
        assert_eq!(bytes(&sink), b"hello world");
        assert_eq!(sink.closed, vec![flow()]);
    }

    #[test]
    fn test_out_of_order_and_duplicates() {
        let sink = run(&[
            syn(99),
            seg(106, b"world"),
            seg(100, b"hello "),
            seg(100, b"hello "),
            seg(103, b"lo wor"),
            seg(111, b"!"),
        ]);
        assert_eq!(bytes(&sink), b"hello world!");
    }

    #[test]
    fn test_sequence_wraparound() {
        let start = u32::MAX - 2;
        let sink = run(&[
            syn(start.wrapping_sub(1)),
            seg(start.wrapping_add(3), b"def"),
            seg(start, b"abc"),
        ]);
        assert_eq!(bytes(&sink), b"abcdef");
    }

    #[test]
    fn test_midstream_start() {
        let sink = run(&[seg(5000, b"GET /"), seg(5005, b" HTTP/1.1")]);
        assert_eq!(bytes(&sink), b"GET / HTTP/1.1");
    }

    #[test]
    fn test_flush_skips_gaps() {
        let sink = run(&[syn(0), seg(1, b"ab"), seg(10, b"xy")]);
        assert_eq!(bytes(&sink), b"abxy");
        assert_eq!(sink.closed, vec![flow()]);
    }

    #[test]
    fn test_fin_waits_for_missing_data() {
        let mut reassembler = Reassembler::new();
        let mut sink = Collect::default();
        let now = Utc::now();
        for s in [syn(0), seg(4, b"def"), fin(7)] {
            reassembler.process(&s, now, &mut sink);
        }
        assert!(sink.closed.is_empty());
        reassembler.process(&seg(1, b"abc"), now, &mut sink);
        assert_eq!(bytes(&sink), b"abcdef");
        assert_eq!(sink.closed, vec![flow()]);
        assert_eq!(reassembler.open_streams(), 0);

        // Late retransmission after close is ignored
        reassembler.process(&seg(1, b"abc"), now, &mut sink);
        assert_eq!(bytes(&sink), b"abcdef");
    }

    #[test]
    fn test_pending_bytes_are_bounded() {
        let mut reassembler = Reassembler::with_limits(ReassemblyLimits {
            max_pending_bytes: 4,
            ..ReassemblyLimits::default()
        });
        let mut sink = Collect::default();
        let now = Utc::now();
        for s in [syn(0), seg(1, b"ab"), seg(10, b"xyz")] {
            reassembler.process(&s, now, &mut sink);
        }
        assert_eq!(bytes(&sink), b"ab");

        // Buffering past the limit gives up on the hole at 3..10
        reassembler.process(&seg(20, b"12"), now, &mut sink);
        assert_eq!(bytes(&sink), b"abxyz");
        reassembler.process(&seg(13, b"uvwxyz!"), now, &mut sink);
        assert_eq!(bytes(&sink), b"abxyzuvwxyz!12");
        assert_eq!(reassembler.open_streams(), 1);
    }

    #[test]
    fn test_idle_streams_closed_and_closed_flows_forgotten() {
        let mut reassembler = Reassembler::new();
        let mut sink = Collect::default();
        let start = Utc::now();
        let other = Flow {
            src: "10.0.0.3:50001".parse().unwrap(),
            dst: "10.0.0.2:80".parse().unwrap(),
        };
        let other_seg = |seq| TcpSegment {
            flow: other,
            ..seg(seq, b"x")
        };

        for s in [syn(0), seg(1, b"abc"), fin(4)] {
            reassembler.process(&s, start, &mut sink);
        }
        reassembler.process(&other_seg(100), start, &mut sink);
        assert_eq!(reassembler.closed_flows(), 1);
        assert_eq!(reassembler.open_streams(), 1);

        // Retransmissions inside the linger period are ignored
        let soon = start + TimeDelta::seconds(30);
        reassembler.process(&seg(1, b"abc"), soon, &mut sink);
        assert_eq!(bytes(&sink), b"abc");

        let later = start + TimeDelta::minutes(10);
        reassembler.process(&seg(1, b"abc"), later, &mut sink);
        assert_eq!(sink.closed, vec![flow(), other]);
        assert_eq!(reassembler.closed_flows(), 0);
        assert_eq!(bytes(&sink), b"abcabc");
    }

    #[test]
    fn test_rst_closes() {
        let sink = run(&[
            syn(0),
            seg(1, b"a"),
            TcpSegment {
                rst: true,
                ..seg(2, b"")
            },
        ]);
        assert_eq!(bytes(&sink), b"a");
        assert_eq!(sink.closed.len(), 1);
    }
}
