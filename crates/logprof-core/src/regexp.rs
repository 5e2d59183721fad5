//! Regular-expression access log parser
//!
//! Each line is matched against a pattern with named capture groups. Lines
//! that do not match are skipped.

use crate::parser::{
    build_record, LineReader, LogParser, ParseError, ParseResult, ParserOptions, RawFields,
};
use crate::record::Record;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Combined log format extended with a trailing response time
pub const DEFAULT_PATTERN: &str = r#"^(?P<host>\S+)\s+\S+\s+(?P<user>\S+)\s+\[(?P<time>[^\]]+)\]\s+"(?P<method>\S*)\s?(?P<uri>[^"]*?)(?:\s+(?P<protocol>HTTP/[0-9.]+))?"\s+(?P<status>\d{3})\s+(?P<body_bytes>\S+)\s+"(?P<referer>[^"]*)"\s+"(?P<user_agent>[^"]*)"\s+(?P<response_time>\S+)(?:\s+(?P<upstream_response_time>\S+))?$"#;

static DEFAULT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(DEFAULT_PATTERN).expect("default pattern is valid"));

/// Capture group names holding each record field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegexpFields {
    pub uri: String,
    pub method: String,
    pub time: String,
    pub response_time: String,
    pub body_bytes: String,
    pub status: String,
}

impl Default for RegexpFields {
    fn default() -> Self {
        Self {
            uri: "uri".to_string(),
            method: "method".to_string(),
            time: "time".to_string(),
            response_time: "response_time".to_string(),
            body_bytes: "body_bytes".to_string(),
            status: "status".to_string(),
        }
    }
}

/// Regexp-line parser
pub struct RegexpParser {
    reader: LineReader,
    regex: Regex,
    fields: RegexpFields,
    options: ParserOptions,
}

impl RegexpParser {
    /// Create a parser. `pattern` of `None` selects the default pattern.
    pub fn new(
        reader: Box<dyn Read + Send>,
        pattern: Option<&str>,
        fields: RegexpFields,
        options: ParserOptions,
    ) -> ParseResult<Self> {
        let regex = match pattern {
            Some(p) => Regex::new(p)?,
            None => DEFAULT_REGEX.clone(),
        };

        let names: Vec<&str> = regex.capture_names().flatten().collect();
        for required in [&fields.uri, &fields.status, &fields.response_time] {
            if !names.contains(&required.as_str()) {
                return Err(ParseError::Config(format!(
                    "pattern has no capture group named {:?}",
                    required
                )));
            }
        }

        Ok(Self {
            reader: LineReader::new(reader, options.strict),
            regex,
            fields,
            options,
        })
    }
}

impl LogParser for RegexpParser {
    fn parse(&mut self) -> ParseResult<Record> {
        let line = match self.reader.next_line()? {
            Some(line) => line,
            None => return Err(ParseError::Eof),
        };

        let caps = self.regex.captures(line).ok_or(ParseError::Skip)?;
        let group = |name: &str| caps.name(name).map(|m| m.as_str());

        let fields = RawFields {
            uri: group(&self.fields.uri),
            method: group(&self.fields.method),
            time: group(&self.fields.time),
            response_time: group(&self.fields.response_time),
            body_bytes: group(&self.fields.body_bytes),
            status: group(&self.fields.status),
        };
        build_record(fields, &self.options)
    }

    fn read_bytes(&self) -> Option<u64> {
        Some(self.reader.read_bytes())
    }

    fn seek(&mut self, offset: u64) -> ParseResult<()> {
        self.reader.seek(offset)?;
        Ok(())
    }
}
