//! The canonical per-request record

use serde::{Deserialize, Serialize};

/// One HTTP transaction extracted from any input format.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Record {
    /// Request URI after query-string handling
    pub uri: String,

    /// HTTP method
    pub method: String,

    /// Raw, format-dependent timestamp text
    pub time: String,

    /// Response time in seconds
    pub response_time: f64,

    /// Response body size in bytes
    pub body_bytes: f64,

    /// Request body size in bytes (0 when the source does not record it)
    #[serde(default)]
    pub request_body_bytes: f64,

    /// HTTP status code
    pub status: u16,
}

impl Record {
    pub fn new(
        uri: impl Into<String>,
        method: impl Into<String>,
        status: u16,
        response_time: f64,
        body_bytes: f64,
    ) -> Self {
        Self {
            uri: uri.into(),
            method: method.into(),
            status,
            response_time,
            body_bytes,
            ..Default::default()
        }
    }

    /// Set the raw timestamp text
    pub fn with_time(mut self, time: impl Into<String>) -> Self {
        self.time = time.into();
        self
    }

    /// Set the request body size
    pub fn with_request_body_bytes(mut self, bytes: f64) -> Self {
        self.request_body_bytes = bytes;
        self
    }
}
