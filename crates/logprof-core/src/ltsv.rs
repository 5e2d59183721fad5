//! LTSV (labeled tab-separated values) access log parser

use crate::parser::{
    build_record, LineReader, LogParser, ParseError, ParseResult, ParserOptions, RawFields,
};
use crate::record::Record;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;

/// Labels holding each record field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LtsvLabels {
    pub uri: String,
    pub method: String,
    pub time: String,
    /// Upstream (application) response time, preferred when present
    pub apptime: String,
    /// Total request time, used when `apptime` is absent or `-`
    pub reqtime: String,
    pub size: String,
    pub status: String,
}

impl Default for LtsvLabels {
    fn default() -> Self {
        Self {
            uri: "uri".to_string(),
            method: "method".to_string(),
            time: "time".to_string(),
            apptime: "apptime".to_string(),
            reqtime: "reqtime".to_string(),
            size: "size".to_string(),
            status: "status".to_string(),
        }
    }
}

/// LTSV parser
pub struct LtsvParser {
    reader: LineReader,
    labels: LtsvLabels,
    options: ParserOptions,
}

impl LtsvParser {
    pub fn new(reader: Box<dyn Read + Send>, labels: LtsvLabels, options: ParserOptions) -> Self {
        Self {
            reader: LineReader::new(reader, options.strict),
            labels,
            options,
        }
    }
}

/// Split one LTSV line into its label/value pairs
fn split_line(line: &str) -> HashMap<&str, &str> {
    line.split('\t')
        .filter_map(|field| field.split_once(':'))
        .collect()
}

impl LogParser for LtsvParser {
    fn parse(&mut self) -> ParseResult<Record> {
        let line = match self.reader.next_line()? {
            Some(line) => line,
            None => return Err(ParseError::Eof),
        };
        if line.trim().is_empty() {
            return Err(ParseError::Skip);
        }

        let values = split_line(line);
        let labels = &self.labels;
        let response_time = values
            .get(labels.apptime.as_str())
            .filter(|v| v.trim() != "-")
            .or_else(|| values.get(labels.reqtime.as_str()))
            .copied();

        let fields = RawFields {
            uri: values.get(labels.uri.as_str()).copied(),
            method: values.get(labels.method.as_str()).copied(),
            time: values.get(labels.time.as_str()).copied(),
            response_time,
            body_bytes: values.get(labels.size.as_str()).copied(),
            status: values.get(labels.status.as_str()).copied(),
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
