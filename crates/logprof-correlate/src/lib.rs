//! Request/response correlation
//!
//! A single conjoiner task owns the pending tables. Requests and responses
//! arrive on separate queues from the half-stream workers; each is queued per
//! client address until its counterpart shows up, then the pair is emitted
//! with its latency and response body size.

use chrono::{DateTime, TimeDelta, Utc};
use logprof_decode::{CorrelationKey, HttpRequest, HttpResponse, Tagged};
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;
use tracing::debug;

/// A request paired with its response
#[derive(Debug, Clone)]
pub struct Conjoined {
    pub key: CorrelationKey,
    pub request: HttpRequest,
    pub response: HttpResponse,
    pub request_ts: DateTime<Utc>,
    pub response_ts: DateTime<Utc>,
    /// Response body size with transfer framing removed
    pub response_body_len: u64,
}

impl Conjoined {
    /// Absolute time between request and response capture
    pub fn latency(&self) -> TimeDelta {
        let delta = self.response_ts - self.request_ts;
        if delta < TimeDelta::zero() {
            -delta
        } else {
            delta
        }
    }

    /// Latency in fractional seconds
    pub fn latency_secs(&self) -> f64 {
        let latency = self.latency();
        match latency.num_nanoseconds() {
            Some(ns) => ns as f64 / 1e9,
            None => latency.num_milliseconds() as f64 / 1e3,
        }
    }
}

/// Counters reported when the conjoiner shuts down
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConjoinStats {
    pub requests: u64,
    pub responses: u64,
    pub conjoined: u64,
    /// Requests whose response never arrived
    pub unmatched_requests: u64,
    /// Responses whose request never arrived
    pub unmatched_responses: u64,
}

/// Per-key FIFO of messages waiting for a counterpart
struct Pending<T> {
    queues: HashMap<CorrelationKey, VecDeque<Tagged<T>>>,
}

impl<T> Pending<T> {
    fn new() -> Self {
        Self {
            queues: HashMap::new(),
        }
    }

    fn push(&mut self, msg: Tagged<T>) {
        self.queues.entry(msg.key).or_default().push_back(msg);
    }

    fn pop(&mut self, key: &CorrelationKey) -> Option<Tagged<T>> {
        let queue = self.queues.get_mut(key)?;
        let msg = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(key);
        }
        msg
    }

    fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }
}

struct Conjoiner {
    requests: Pending<HttpRequest>,
    responses: Pending<HttpResponse>,
    out: mpsc::Sender<Conjoined>,
    out_closed: bool,
    stats: ConjoinStats,
}

impl Conjoiner {
    async fn on_request(&mut self, req: Tagged<HttpRequest>) {
        self.stats.requests += 1;
        match self.responses.pop(&req.key) {
            Some(resp) => self.emit(req, resp).await,
            None => self.requests.push(req),
        }
    }

    async fn on_response(&mut self, resp: Tagged<HttpResponse>) {
        self.stats.responses += 1;
        match self.requests.pop(&resp.key) {
            Some(req) => self.emit(req, resp).await,
            None => self.responses.push(resp),
        }
    }

    async fn emit(&mut self, req: Tagged<HttpRequest>, resp: Tagged<HttpResponse>) {
        let response_body_len = resp.message.resolve_body_len(&req.message);

        let conjoined = Conjoined {
            key: resp.key,
            request: req.message,
            response: resp.message,
            request_ts: req.ts,
            response_ts: resp.ts,
            response_body_len,
        };
        debug!(
            "{}: {} {} -> {} in {:.6}s",
            conjoined.key,
            conjoined.request.method,
            conjoined.request.uri,
            conjoined.response.status,
            conjoined.latency_secs()
        );
        self.stats.conjoined += 1;

        if self.out_closed {
            return;
        }
        if self.out.send(conjoined).await.is_err() {
            debug!("Conjoiner output closed, draining remaining messages");
            self.out_closed = true;
        }
    }
}

/// Pair requests and responses until both inputs are closed.
///
/// Messages still unpaired at shutdown are dropped and counted. The output
/// queue closes when this returns.
pub async fn run_conjoiner(
    mut requests: mpsc::Receiver<Tagged<HttpRequest>>,
    mut responses: mpsc::Receiver<Tagged<HttpResponse>>,
    out: mpsc::Sender<Conjoined>,
) -> ConjoinStats {
    let mut conjoiner = Conjoiner {
        requests: Pending::new(),
        responses: Pending::new(),
        out,
        out_closed: false,
        stats: ConjoinStats::default(),
    };
    let mut requests_open = true;
    let mut responses_open = true;

    while requests_open || responses_open {
        tokio::select! {
            biased;
            msg = requests.recv(), if requests_open => match msg {
                Some(req) => conjoiner.on_request(req).await,
                None => requests_open = false,
            },
            msg = responses.recv(), if responses_open => match msg {
                Some(resp) => conjoiner.on_response(resp).await,
                None => responses_open = false,
            },
        }
    }

    let mut stats = conjoiner.stats;
    stats.unmatched_requests = conjoiner.requests.len() as u64;
    stats.unmatched_responses = conjoiner.responses.len() as u64;
    if stats.unmatched_requests > 0 || stats.unmatched_responses > 0 {
        debug!(
            "Dropping {} unmatched requests and {} unmatched responses",
            stats.unmatched_requests, stats.unmatched_responses
        );
    }
    stats
}
