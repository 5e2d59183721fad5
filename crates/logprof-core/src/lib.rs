//! logprof Core - canonical records, the parser contract and text log parsers
//!
//! This crate provides the foundational types shared by every logprof crate:
//!
//! - **Record**: the normalized unit every format parser produces
//! - **LogParser**: the single-operation parser contract
//! - **Parsers**: LTSV, JSON-line and regexp-line implementations
//! - **Config**: TOML configuration discovery, overrides and validation

pub mod config;
pub mod json;
pub mod ltsv;
pub mod parser;
pub mod position;
pub mod record;
pub mod regexp;
pub mod uri;

// Re-export commonly used types
pub use config::{ConfigLoader, LogprofConfig};
pub use json::{JsonFields, JsonParser};
pub use ltsv::{LtsvLabels, LtsvParser};
pub use parser::{LogParser, ParseError, ParseResult, ParserOptions, TimeUnit};
pub use position::PositionFile;
pub use record::Record;
pub use regexp::{RegexpFields, RegexpParser};
pub use uri::{normalize_uri, UriOptions};

/// logprof version
pub const LOGPROF_VERSION: &str = env!("CARGO_PKG_VERSION");
