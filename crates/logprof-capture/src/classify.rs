//! Deciding which side of a flow is the server

use crate::error::{CaptureError, CaptureResult};
use crate::packet::Flow;
use logprof_decode::{CorrelationKey, Direction};
use std::collections::HashSet;
use std::net::IpAddr;

/// The server endpoints being profiled
#[derive(Debug, Clone)]
pub struct ServerSet {
    addrs: HashSet<IpAddr>,
    port: u16,
}

impl ServerSet {
    pub fn new(addrs: impl IntoIterator<Item = IpAddr>, port: u16) -> Self {
        Self {
            addrs: addrs.into_iter().map(|a| a.to_canonical()).collect(),
            port,
        }
    }

    /// Parse textual addresses. An empty list matches any address on `port`.
    pub fn parse(addrs: &[String], port: u16) -> CaptureResult<Self> {
        let parsed = addrs
            .iter()
            .map(|s| {
                s.trim()
                    .parse::<IpAddr>()
                    .map_err(|_| CaptureError::InvalidServerAddress(s.clone()))
            })
            .collect::<CaptureResult<Vec<_>>>()?;
        Ok(Self::new(parsed, port))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn is_server(&self, addr: std::net::SocketAddr) -> bool {
        addr.port() == self.port
            && (self.addrs.is_empty() || self.addrs.contains(&addr.ip().to_canonical()))
    }

    /// Direction of `flow` and the client address keying it, or `None` when
    /// neither end is a profiled server
    pub fn classify(&self, flow: &Flow) -> Option<(Direction, CorrelationKey)> {
        if self.is_server(flow.src) {
            Some((Direction::Response, CorrelationKey(flow.dst)))
        } else if self.is_server(flow.dst) {
            Some((Direction::Request, CorrelationKey(flow.src)))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(src: &str, dst: &str) -> Flow {
        Flow {
            src: src.parse().unwrap(),
            dst: dst.parse().unwrap(),
        }
    }

    #[test]
    fn test_classify_directions() {
        let servers = ServerSet::parse(&["10.0.0.2".to_string()], 80).unwrap();

        let req = flow("10.0.0.1:50000", "10.0.0.2:80");
        let (dir, key) = servers.classify(&req).unwrap();
        assert_eq!(dir, Direction::Request);
        assert_eq!(key.0, req.src);

        let (dir, key) = servers.classify(&req.reversed()).unwrap();
        assert_eq!(dir, Direction::Response);
        assert_eq!(key.0, req.src);

        assert!(servers.classify(&flow("10.0.0.1:50000", "10.0.0.3:80")).is_none());
        assert!(servers.classify(&flow("10.0.0.1:50000", "10.0.0.2:8080")).is_none());
    }

    #[test]
    fn test_mapped_ipv4_matches() {
        let servers = ServerSet::parse(&["::ffff:10.0.0.2".to_string()], 80).unwrap();
        assert!(servers.classify(&flow("10.0.0.1:1", "10.0.0.2:80")).is_some());
    }

    #[test]
    fn test_empty_set_matches_port() {
        let servers = ServerSet::parse(&[], 8080).unwrap();
        assert!(servers.classify(&flow("1.2.3.4:1", "5.6.7.8:8080")).is_some());
        assert!(servers.classify(&flow("1.2.3.4:1", "5.6.7.8:80")).is_none());
    }

    #[test]
    fn test_invalid_address() {
        let err = ServerSet::parse(&["not-an-ip".to_string()], 80).unwrap_err();
        assert!(matches!(err, CaptureError::InvalidServerAddress(s) if s == "not-an-ip"));
    }
}
