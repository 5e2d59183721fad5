//! The format parser contract
//!
//! Every input format implements [`LogParser`]. A call to `parse` yields one
//! [`Record`], [`ParseError::Eof`] once input is exhausted, or
//! [`ParseError::Skip`] when the current unit should be ignored but the
//! stream can continue. Anything else is a hard error.

use crate::record::Record;
use crate::uri::{normalize_uri, UriOptions};
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, BufReader, Read};
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

/// Parser error type
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("end of input")]
    Eof,

    #[error("unparsable input unit skipped")]
    Skip,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON parse error at line {line}: {source}")]
    Json {
        line: u64,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid UTF-8 at line {line}")]
    Encoding { line: u64 },

    #[error("Invalid regular expression: {0}")]
    Regex(#[from] regex::Error),

    #[error("Invalid parser configuration: {0}")]
    Config(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),
}

impl ParseError {
    /// End of input reached
    pub fn is_eof(&self) -> bool {
        matches!(self, ParseError::Eof)
    }

    /// The current unit was skipped, parsing may continue
    pub fn is_skip(&self) -> bool {
        matches!(self, ParseError::Skip)
    }
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Single-operation parser contract shared by every input format
pub trait LogParser: Send {
    /// Produce the next record
    fn parse(&mut self) -> ParseResult<Record>;

    /// Bytes consumed from the underlying stream so far, when the format
    /// supports resuming from a persisted position
    fn read_bytes(&self) -> Option<u64> {
        None
    }

    /// Skip forward to a previously persisted byte offset
    fn seek(&mut self, offset: u64) -> ParseResult<()> {
        let _ = offset;
        Err(ParseError::Config(
            "this parser does not support seeking".to_string(),
        ))
    }
}

/// Unit of the raw response time values found in a log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    #[default]
    S,
    Ms,
    Us,
}

impl TimeUnit {
    /// Convert a raw value in this unit to seconds
    pub fn to_seconds(self, value: f64) -> f64 {
        match self {
            TimeUnit::S => value,
            TimeUnit::Ms => value / 1_000.0,
            TimeUnit::Us => value / 1_000_000.0,
        }
    }
}

impl FromStr for TimeUnit {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "s" | "sec" => Ok(TimeUnit::S),
            "ms" => Ok(TimeUnit::Ms),
            "us" | "µs" => Ok(TimeUnit::Us),
            other => Err(ParseError::Config(format!(
                "unknown response time unit: {}",
                other
            ))),
        }
    }
}

/// Options shared by the text parsers
#[derive(Debug, Clone, Default)]
pub struct ParserOptions {
    /// URI handling
    pub uri: UriOptions,

    /// Treat malformed structural input as a hard error instead of a skip
    pub strict: bool,

    /// Unit of raw response time values
    pub response_time_unit: TimeUnit,
}

/// Line-oriented reader that tracks how many bytes were consumed
pub(crate) struct LineReader {
    inner: BufReader<Box<dyn Read + Send>>,
    read_bytes: u64,
    line_no: u64,
    strict: bool,
    buf: Vec<u8>,
}

impl LineReader {
    pub(crate) fn new(reader: Box<dyn Read + Send>, strict: bool) -> Self {
        Self {
            inner: BufReader::new(reader),
            read_bytes: 0,
            line_no: 0,
            strict,
            buf: Vec::new(),
        }
    }

    /// Read the next line without its terminator. `None` at end of input.
    ///
    /// A line that is not valid UTF-8 is still counted in `read_bytes`; it
    /// yields [`ParseError::Skip`], or [`ParseError::Encoding`] when strict.
    pub(crate) fn next_line(&mut self) -> ParseResult<Option<&str>> {
        self.buf.clear();
        let n = self.inner.read_until(b'\n', &mut self.buf)?;
        if n == 0 {
            return Ok(None);
        }
        self.read_bytes += n as u64;
        self.line_no += 1;
        match std::str::from_utf8(&self.buf) {
            Ok(line) => Ok(Some(line.trim_end_matches(['\r', '\n']))),
            Err(_) if self.strict => Err(ParseError::Encoding { line: self.line_no }),
            Err(e) => {
                debug!("Skipping line {} with invalid UTF-8: {}", self.line_no, e);
                Err(ParseError::Skip)
            }
        }
    }

    pub(crate) fn read_bytes(&self) -> u64 {
        self.read_bytes
    }

    pub(crate) fn line_no(&self) -> u64 {
        self.line_no
    }

    /// Discard input up to `offset`
    pub(crate) fn seek(&mut self, offset: u64) -> io::Result<()> {
        if offset <= self.read_bytes {
            return Ok(());
        }
        let wanted = offset - self.read_bytes;
        let skipped = io::copy(&mut (&mut self.inner).take(wanted), &mut io::sink())?;
        self.read_bytes += skipped;
        Ok(())
    }
}

/// Raw field values pulled out of one log line
#[derive(Debug, Default)]
pub(crate) struct RawFields<'a> {
    pub uri: Option<&'a str>,
    pub method: Option<&'a str>,
    pub time: Option<&'a str>,
    pub response_time: Option<&'a str>,
    pub body_bytes: Option<&'a str>,
    pub status: Option<&'a str>,
}

/// Parse a numeric log field. `-` and empty values are absent.
pub(crate) fn parse_number(value: &str) -> Option<f64> {
    let value = value.trim();
    if value.is_empty() || value == "-" {
        return None;
    }
    value.parse().ok()
}

/// Turn raw field values into a record, skipping lines with missing or
/// unparsable required fields
pub(crate) fn build_record(fields: RawFields<'_>, options: &ParserOptions) -> ParseResult<Record> {
    let raw_uri = fields.uri.ok_or(ParseError::Skip)?;
    let uri = normalize_uri(raw_uri, &options.uri).ok_or(ParseError::Skip)?;

    let response_time = fields
        .response_time
        .and_then(parse_number)
        .map(|v| options.response_time_unit.to_seconds(v))
        .ok_or(ParseError::Skip)?;

    let body_bytes = match fields.body_bytes {
        Some(v) if v.trim() == "-" => 0.0,
        Some(v) => parse_number(v).ok_or(ParseError::Skip)?,
        None => 0.0,
    };

    let status = fields
        .status
        .and_then(|s| s.trim().parse::<u16>().ok())
        .ok_or(ParseError::Skip)?;

    Ok(Record {
        uri,
        method: fields.method.unwrap_or_default().to_string(),
        time: fields.time.unwrap_or_default().to_string(),
        response_time,
        body_bytes,
        request_body_bytes: 0.0,
        status,
    })
}
