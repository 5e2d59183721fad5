//! HTTP message decoding for reassembled TCP streams
//!
//! - **http**: request/response head parsing and streaming body framing
//! - **stream**: per half-stream workers that turn byte chunks into
//!   timestamped, tagged messages

pub mod error;
pub mod http;
pub mod stream;

pub use error::{DecodeError, DecodeResult};
pub use http::{BodyDecoder, Framing, Head, HttpRequest, HttpResponse, Parsed};
pub use stream::{
    method_channel, run_request_worker, run_response_worker, CorrelationKey, Direction,
    MethodReceiver, MethodSender, StreamChunk, Tagged,
};
