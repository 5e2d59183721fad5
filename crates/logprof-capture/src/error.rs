use thiserror::Error;

/// Packet capture error type
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Pcap error: {0}")]
    Pcap(#[from] pcap_file::PcapError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid server address: {0:?}")]
    InvalidServerAddress(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),
}

pub type CaptureResult<T> = Result<T, CaptureError>;
