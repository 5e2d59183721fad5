//! JSON-lines access log parser

use crate::parser::{
    build_record, LineReader, LogParser, ParseError, ParseResult, ParserOptions, RawFields,
};
use crate::record::Record;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Read;
use tracing::debug;

/// Keys holding each record field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonFields {
    pub uri: String,
    pub method: String,
    pub time: String,
    pub response_time: String,
    pub body_bytes: String,
    pub status: String,
}

impl Default for JsonFields {
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

/// JSON-lines parser
pub struct JsonParser {
    reader: LineReader,
    fields: JsonFields,
    options: ParserOptions,
}

impl JsonParser {
    pub fn new(reader: Box<dyn Read + Send>, fields: JsonFields, options: ParserOptions) -> Self {
        Self {
            reader: LineReader::new(reader, options.strict),
            fields,
            options,
        }
    }
}

/// Render a scalar JSON value as text; numbers keep their literal form
fn scalar_text(object: &Map<String, Value>, key: &str) -> Option<String> {
    match object.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

impl LogParser for JsonParser {
    fn parse(&mut self) -> ParseResult<Record> {
        let line = match self.reader.next_line()? {
            Some(line) => line,
            None => return Err(ParseError::Eof),
        };
        if line.trim().is_empty() {
            return Err(ParseError::Skip);
        }

        let object = match serde_json::from_str::<Map<String, Value>>(line) {
            Ok(object) => object,
            Err(source) if self.options.strict => {
                return Err(ParseError::Json {
                    line: self.reader.line_no(),
                    source,
                })
            }
            Err(e) => {
                debug!("Skipping malformed JSON line {}: {}", self.reader.line_no(), e);
                return Err(ParseError::Skip);
            }
        };

        let keys = &self.fields;
        let uri = scalar_text(&object, &keys.uri);
        let method = scalar_text(&object, &keys.method);
        let time = scalar_text(&object, &keys.time);
        let response_time = scalar_text(&object, &keys.response_time);
        let body_bytes = scalar_text(&object, &keys.body_bytes);
        let status = scalar_text(&object, &keys.status);

        let fields = RawFields {
            uri: uri.as_deref(),
            method: method.as_deref(),
            time: time.as_deref(),
            response_time: response_time.as_deref(),
            body_bytes: body_bytes.as_deref(),
            status: status.as_deref(),
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
