use thiserror::Error;

/// HTTP decoding error type
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Malformed HTTP message: {0}")]
    Http(#[from] httparse::Error),

    #[error("Invalid method: {0:?}")]
    InvalidMethod(String),

    #[error("Invalid status code: {0}")]
    InvalidStatus(u16),

    #[error("Invalid Content-Length: {0:?}")]
    InvalidContentLength(String),

    #[error("Message head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("Invalid chunked encoding: {0}")]
    InvalidChunk(&'static str),
}

pub type DecodeResult<T> = Result<T, DecodeError>;
